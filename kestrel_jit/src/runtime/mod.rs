//! Runtime-facing model of functions and their compiled artifacts.
//!
//! These are the objects the tiering manager reads and mutates: the
//! function with its tier bits and lazy feedback vector, the bytecode OSR
//! marker, the per-function OSR code cache, and the baseline batch
//! compiler the manager hands warm functions to.

pub mod batch;
pub mod bytecode;
pub mod function;
pub mod osr_cache;

pub use batch::{BaselineBatchCompiler, BaselineCompiler, BatchStats};
pub use bytecode::{Bytecode, MAX_LOOP_NESTING_MARKER};
pub use function::{
    FeedbackVector, Function, SharedFunctionInfo, Tier, UnoptimizedFrame,
    DEFAULT_INTERRUPT_BUDGET,
};
pub use osr_cache::{OsrCacheEntry, OsrCodeCache};
