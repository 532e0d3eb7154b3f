//! Compile-pipeline configuration.
//!
//! All tiering and allocation behavior is driven by a `Flags` value threaded
//! through the compile job. Nothing in the pipeline reads process-global
//! state; tests construct their own `Flags` and tweak individual knobs.

/// Tuning knobs and diagnostic switches for the JIT pipeline.
///
/// Threshold fields change *when* things happen; `trace_*` and
/// `code_comments` only affect diagnostic output. None of them alter
/// algorithmic invariants.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Allow on-stack replacement of interpreter loop frames.
    pub use_osr: bool,
    /// Arm OSR back-edges on every tick (testing/debugging).
    pub always_osr: bool,
    /// Batch baseline compile requests instead of compiling inline.
    pub baseline_batch_compilation: bool,
    /// Profiler ticks a function must accumulate before the optimizer
    /// considers it hot, independent of size.
    pub ticks_before_optimization: u32,
    /// Extra bytecode bytes tolerated per accumulated tick.
    pub bytecode_size_allowance_per_tick: u32,
    /// Functions below this bytecode size may be optimized eagerly when
    /// their inline caches have settled.
    pub max_bytecode_size_for_early_opt: u32,
    /// Number of physical registers handed to the register allocator.
    pub allocatable_registers: u8,
    /// Trace optimized-recompilation decisions.
    pub trace_opt: bool,
    /// Trace the reasons optimization was *not* attempted.
    pub trace_opt_verbose: bool,
    /// Trace OSR back-edge arming.
    pub trace_osr: bool,
    /// Trace the register allocator's per-node decisions.
    pub trace_regalloc: bool,
    /// Annotate emitted code with per-node comments.
    pub code_comments: bool,
    /// Emit a breakpoint at the start of every compiled function.
    pub break_on_entry: bool,
    /// Running under the test runner: functions manually pinned for
    /// optimization must not be optimized heuristically.
    pub testing_test_runner: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            use_osr: true,
            always_osr: false,
            baseline_batch_compilation: false,
            ticks_before_optimization: 8,
            bytecode_size_allowance_per_tick: 1200,
            max_bytecode_size_for_early_opt: 90,
            allocatable_registers: 13,
            trace_opt: false,
            trace_opt_verbose: false,
            trace_osr: false,
            trace_regalloc: false,
            code_comments: false,
            break_on_entry: false,
            testing_test_runner: false,
        }
    }
}

impl Flags {
    /// Ticks needed before a function of `bytecode_length` bytes is
    /// considered hot.
    #[inline]
    pub fn ticks_for_optimization(&self, bytecode_length: u32) -> u32 {
        self.ticks_before_optimization
            + bytecode_length / self.bytecode_size_allowance_per_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_flags() {
        let flags = Flags::default();
        assert!(flags.use_osr);
        assert!(!flags.always_osr);
        assert!(flags.allocatable_registers >= 2);
    }

    #[test]
    fn test_ticks_for_optimization_scales_with_size() {
        let mut flags = Flags::default();
        flags.ticks_before_optimization = 8;
        flags.bytecode_size_allowance_per_tick = 100;
        assert_eq!(flags.ticks_for_optimization(0), 8);
        assert_eq!(flags.ticks_for_optimization(1000), 18);
    }
}
