//! Datastructures shared across the pipeline:
//!
//! - Source code representation and span annotations.
//! - The static opcode table.
//! - Number encoding for the binary emitter.

pub mod number;
pub mod opcode;
pub mod source;
pub mod span;

pub use source::Source;
pub use span::{Span, Spanned};
