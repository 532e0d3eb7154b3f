//! Shared scaffolding for the Kestrel runtime and its JIT tiers.
//!
//! This crate carries the pieces every other crate needs but none owns:
//! - Compile-pipeline configuration (`config::Flags`)
//! - The compile error taxonomy (`error`)
//! - The diagnostic trace capability (`trace`)
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod trace;

pub use config::Flags;
pub use error::{CompileError, CompileResult};
pub use trace::{BufferSink, TraceSink};
