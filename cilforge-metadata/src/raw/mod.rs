//! Byte-level ECMA-335 decoding: PE headers, the CLI header, metadata heaps/tables, and IL.

pub mod assembly;
pub mod heaps;
pub mod il;
pub mod indices;
pub mod pe;

pub use crate::utilities::FromByteStream;
