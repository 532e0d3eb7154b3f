//! Bytecode metadata the tiering machinery reads and writes.
//!
//! The interpreter owns the instruction stream itself; the JIT only cares
//! about its length and the OSR loop-nesting marker stored in the header.
//! The marker is written by the tiering manager on the interpreter's own
//! thread and read by back-edge dispatch with relaxed loads.

use std::sync::atomic::{AtomicU8, Ordering};

/// Saturation ceiling for the OSR loop-nesting marker.
pub const MAX_LOOP_NESTING_MARKER: u8 = 6;

/// An immutable bytecode body plus its mutable OSR marker.
#[derive(Debug)]
pub struct Bytecode {
    length: u32,
    osr_loop_nesting_level: AtomicU8,
}

impl Bytecode {
    /// Bytecode of the given length with OSR disarmed.
    pub fn new(length: u32) -> Self {
        Bytecode {
            length,
            osr_loop_nesting_level: AtomicU8::new(0),
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> u32 {
        self.length
    }

    /// Whether the body is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Current OSR arming level. Back edges in loops nested at less than
    /// this depth trigger on-stack replacement.
    #[inline]
    pub fn osr_loop_nesting_level(&self) -> u8 {
        self.osr_loop_nesting_level.load(Ordering::Relaxed)
    }

    /// Store a new OSR arming level, clamped to the marker ceiling.
    #[inline]
    pub fn set_osr_loop_nesting_level(&self, level: u8) {
        self.osr_loop_nesting_level
            .store(level.min(MAX_LOOP_NESTING_MARKER), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_osr_level_starts_disarmed() {
        let bytecode = Bytecode::new(100);
        assert_eq!(bytecode.osr_loop_nesting_level(), 0);
        assert_eq!(bytecode.len(), 100);
    }

    #[test]
    fn test_osr_level_clamps_at_marker_ceiling() {
        let bytecode = Bytecode::new(10);
        bytecode.set_osr_loop_nesting_level(200);
        assert_eq!(bytecode.osr_loop_nesting_level(), MAX_LOOP_NESTING_MARKER);
    }
}
