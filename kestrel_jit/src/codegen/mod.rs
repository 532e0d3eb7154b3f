//! Code-generation driver.
//!
//! Consumes the allocated graph: walks blocks and nodes in program order,
//! emits edge moves (register merges, phis) ahead of each unconditional
//! control transfer, lowers nodes to a pseudo-op stream, and finishes with
//! the deferred-code tail and the safepoint table.

pub mod emit;
pub mod processor;
pub mod state;

pub use emit::{generate, CodeArtifact, MachineOp};
pub use processor::{GraphProcessor, NodeProcessor};
pub use state::{
    safepoint_index_for_stack_slot, CodeGenState, DeferredCode, DeferredLabels, Label,
    SafepointEntry, SafepointTableBuilder, FIXED_FRAME_SLOT_COUNT,
};
