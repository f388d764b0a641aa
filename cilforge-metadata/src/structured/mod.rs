//! A name-resolved view over [`raw`](crate::raw) metadata: types, methods and fields addressed by
//! signature string rather than table row index, plus a decoded instruction stream suitable for
//! structural comparison instead of byte-for-byte comparison.

pub mod body;
pub mod module;
pub mod names;

pub use body::*;
pub use module::*;
pub use names::*;
