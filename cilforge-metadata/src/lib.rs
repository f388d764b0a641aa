//! Reader and structural model for Microsoft's CLI (ECMA-335) assembly format.
//!
//! `raw` is a faithful, allocation-light decoder for the on-disk PE/CLI layout: headers, metadata
//! heaps and tables, and method body IL. `structured` builds a friendlier, name-resolved view on
//! top of it (types, methods, fields, decoded instructions) for consumers that need to reason
//! about "what changed" rather than "which bytes are at this offset".

pub mod raw;
pub mod structured;
pub mod utilities;

pub use utilities::FromByteStream;
