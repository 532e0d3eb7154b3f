//! Optimizing JIT core for Kestrel.
//!
//! Mid-tier compiler infrastructure for the Kestrel runtime:
//! - Basic-block SSA IR with explicit phis
//! - Single-pass "StraightForward" register allocation over the IR
//! - Graph-walking code-generation driver with deferred code and safepoints
//! - Tier promotion (interpreter → baseline → optimized) and OSR arming
#![deny(unsafe_op_in_unsafe_fn)]

pub mod codegen;
pub mod ir;
pub mod regalloc;
pub mod runtime;
pub mod tiering;
