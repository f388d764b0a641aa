//! Out-of-process hot-reload compile server (§1). `pipeline::AppState` owns the process-wide
//! state (§5) and implements `initialize`/`compile`/`clear`; `http` exposes it over the wire
//! shape fixed by §6. Everything else is the C1-C6 pipeline these two modules orchestrate.

pub mod baseline_index;
pub mod closure;
pub mod compiler;
pub mod config;
pub mod differ;
pub mod domain;
pub mod error;
pub mod hook_cache;
pub mod http;
pub mod pipeline;
pub mod project_dirs;
pub mod rewrite;
