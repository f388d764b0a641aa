//! C5 IL rewriting (§4.5): turns a freshly compiled patch module into one whose baseline-shared
//! operands point at the baseline assembly and whose added-field accesses go through the
//! `FieldResolver`/`FieldHolder` runtime contract (§6).

pub mod emit;
pub mod layout;
pub mod plan;
pub mod sig;

pub use emit::{emit, refresh_call_graph, EmitResult};
pub use plan::{plan_rewrite, RewritePlan};
