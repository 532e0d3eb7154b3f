//! The tiering manager.
//!
//! Runs on the executing thread whenever a function's interrupt budget
//! expires, and decides whether to push the function up a tier: allocate
//! its feedback vector, request baseline compilation, mark it for
//! concurrent optimized recompilation, or arm loop back-edges for
//! on-stack replacement.
//!
//! Everything here is advisory. Compile requests may fail quietly; the
//! function simply keeps executing at its current tier and will be
//! reconsidered on the next tick. The manager itself never blocks: with
//! batching enabled it only appends to the batch queue, and the optimized
//! compile is always requested as a concurrent job.

use std::fmt;
use std::sync::Arc;

use kestrel_core::{Flags, TraceSink};

use crate::runtime::batch::{BaselineBatchCompiler, BaselineCompiler};
use crate::runtime::bytecode::MAX_LOOP_NESTING_MARKER;
use crate::runtime::function::{Function, Tier, UnoptimizedFrame};

/// Bytecode bytes a function may have and still be OSR-armed while its
/// optimized compile is pending.
pub const OSR_BYTECODE_SIZE_ALLOWANCE_BASE: u64 = 119;
/// Additional allowance per accumulated profiler tick.
pub const OSR_BYTECODE_SIZE_ALLOWANCE_PER_TICK: u64 = 44;

// =============================================================================
// Optimization Reason
// =============================================================================

/// Why a function was (or was not) marked for optimized recompilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizationReason {
    /// Leave the function at its current tier.
    DoNotOptimize,
    /// The function is hot and its feedback has stabilized.
    HotAndStable,
    /// The function is tiny and its inline caches have settled.
    SmallFunction,
}

impl fmt::Display for OptimizationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            OptimizationReason::DoNotOptimize => "do not optimize",
            OptimizationReason::HotAndStable => "hot and stable",
            OptimizationReason::SmallFunction => "small function",
        };
        f.write_str(text)
    }
}

// =============================================================================
// Tiering Manager
// =============================================================================

/// Per-thread tier-up policy engine.
pub struct TieringManager<'a> {
    flags: &'a Flags,
    trace: Option<&'a dyn TraceSink>,
    baseline: Option<&'a dyn BaselineCompiler>,
    batch: Option<&'a BaselineBatchCompiler>,
    optimizer_enabled: bool,
    any_ic_changed: bool,
}

impl<'a> TieringManager<'a> {
    /// A manager with no compilers attached; ticks then only maintain
    /// feedback vectors and budgets.
    pub fn new(flags: &'a Flags) -> Self {
        TieringManager {
            flags,
            trace: None,
            baseline: None,
            batch: None,
            optimizer_enabled: true,
            any_ic_changed: false,
        }
    }

    /// Attach a diagnostic sink.
    pub fn with_trace(mut self, trace: &'a dyn TraceSink) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Attach the inline baseline compiler.
    pub fn with_baseline(mut self, baseline: &'a dyn BaselineCompiler) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Attach the baseline batch queue.
    pub fn with_batch(mut self, batch: &'a BaselineBatchCompiler) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Globally enable or disable the optimizing tier.
    pub fn set_optimizer_enabled(&mut self, enabled: bool) {
        self.optimizer_enabled = enabled;
    }

    /// The inline-cache system reports that some IC transitioned since the
    /// last tick; small functions wait for ICs to settle.
    pub fn notify_ic_changed(&mut self) {
        self.any_ic_changed = true;
    }

    /// Whether any IC changed this tick.
    pub fn any_ic_changed(&self) -> bool {
        self.any_ic_changed
    }

    // =========================================================================
    // Interrupt ticks
    // =========================================================================

    /// Handle an expired interrupt budget for `function`, whose frame is
    /// the current top frame (and is always unoptimized — ticks are only
    /// delivered from interpreter and baseline code).
    pub fn on_interrupt_tick(&mut self, function: &Arc<Function>, frame: &UnoptimizedFrame) {
        // Whether the function had a vector at this point is itself a tier
        // boundary: tiering beyond baseline starts only when a tick
        // arrives *with* a feedback vector already present.
        let had_feedback_vector = function.has_feedback_vector();
        if !had_feedback_vector {
            // A fresh vector starts with one invocation so inlining
            // heuristics see a nonzero count after OSR.
            function.ensure_feedback_vector().set_invocation_count(1);
        }
        function.reset_interrupt_budget();

        if let Some(baseline) = self.baseline {
            if function.active_tier() < Tier::Baseline {
                if self.flags.baseline_batch_compilation {
                    if let Some(batch) = self.batch {
                        batch.enqueue(Arc::clone(function));
                    }
                } else if baseline.compile_baseline(function).is_ok() {
                    function.set_has_baseline_code(true);
                }
            }
        }

        if !had_feedback_vector {
            return;
        }
        if !self.optimizer_enabled {
            return;
        }

        let mut scope = OnInterruptTickScope::new(self);
        function
            .feedback_vector()
            .expect("feedback vector ensured above")
            .saturating_increment_profiler_ticks();
        debug_assert!(frame.is_unoptimized());
        scope.manager().maybe_optimize_frame(function, frame);
    }

    fn maybe_optimize_frame(&mut self, function: &Function, frame: &UnoptimizedFrame) {
        if function.is_in_optimization_queue() {
            self.trace_verbose(|| {
                format!(
                    "[function {} is already in optimization queue]",
                    function.shared().name()
                )
            });
            return;
        }

        if self.flags.testing_test_runner
            && function.shared().heuristic_optimization_disallowed()
        {
            self.trace_verbose(|| {
                format!(
                    "[function {} has been marked manually for optimization]",
                    function.shared().name()
                )
            });
            return;
        }

        if function.shared().optimization_disabled() {
            return;
        }

        if frame.is_unoptimized() {
            if self.flags.always_osr {
                self.attempt_on_stack_replacement(frame, MAX_LOOP_NESTING_MARKER);
                // Fall through and do a regular optimized compile as well.
            } else if self.maybe_osr(function, frame) {
                return;
            }
        }

        let reason = self.should_optimize(function, frame);
        if reason != OptimizationReason::DoNotOptimize {
            self.optimize(function, reason);
        }
    }

    /// While an optimized compile is pending (or done), keep the loop
    /// back-edges armed for functions small enough to be worth replacing
    /// on stack. Returns true when the pending compile makes any further
    /// tier-up reasoning pointless.
    fn maybe_osr(&mut self, function: &Function, frame: &UnoptimizedFrame) -> bool {
        let ticks = function
            .feedback_vector()
            .map(|fv| fv.profiler_ticks())
            .unwrap_or(0);
        if function.is_marked_for_optimization() || function.has_available_optimized_code() {
            let allowance = OSR_BYTECODE_SIZE_ALLOWANCE_BASE
                + u64::from(ticks) * OSR_BYTECODE_SIZE_ALLOWANCE_PER_TICK;
            if u64::from(function.shared().bytecode().len()) <= allowance {
                self.attempt_on_stack_replacement(frame, 1);
            }
            return true;
        }
        false
    }

    // =========================================================================
    // OSR arming
    // =========================================================================

    /// Arm loop back-edges in the frame's bytecode so the next iteration
    /// of a loop nested at less than the new level triggers OSR.
    pub fn attempt_on_stack_replacement(&mut self, frame: &UnoptimizedFrame, levels: u8) {
        let function = frame.function();
        let shared = function.shared();
        if !self.flags.use_osr || !shared.is_user_function() {
            return;
        }
        if shared.optimization_disabled() {
            return;
        }

        if self.flags.trace_osr {
            self.trace(|| format!("[OSR - arming back edges in {}]", shared.name()));
        }

        debug_assert!(frame.is_unoptimized());
        let bytecode = shared.bytecode();
        let level = bytecode.osr_loop_nesting_level();
        bytecode.set_osr_loop_nesting_level(
            level
                .saturating_add(levels)
                .min(MAX_LOOP_NESTING_MARKER),
        );
    }

    // =========================================================================
    // Optimize decision
    // =========================================================================

    fn should_optimize(
        &mut self,
        function: &Function,
        frame: &UnoptimizedFrame,
    ) -> OptimizationReason {
        if function.active_tier() == Tier::Optimized {
            return OptimizationReason::DoNotOptimize;
        }

        let shared = function.shared();
        let bytecode = shared.bytecode();

        // A cached OSR entry means the loop is already compiled: once the
        // frame enters the cached loop's range, arm the bytecode so the
        // next back edge dispatches into it, and request a regular
        // optimized compile as well.
        if !shared.osr_cache().is_empty() && frame.is_unoptimized() {
            if let Some(entry) = shared.osr_cache().lookup(frame.bytecode_offset()) {
                bytecode.set_osr_loop_nesting_level(
                    entry.loop_depth.saturating_add(1).min(MAX_LOOP_NESTING_MARKER),
                );
                return OptimizationReason::HotAndStable;
            }
        }

        let ticks = function
            .feedback_vector()
            .map(|fv| fv.profiler_ticks())
            .unwrap_or(0);
        let ticks_for_optimization = self.flags.ticks_for_optimization(bytecode.len());
        if ticks >= ticks_for_optimization {
            return OptimizationReason::HotAndStable;
        }
        if !self.any_ic_changed && bytecode.len() < self.flags.max_bytecode_size_for_early_opt {
            // No IC transitioned since the last tick and the function is
            // tiny: optimistically optimize it now.
            return OptimizationReason::SmallFunction;
        }

        self.trace_verbose(|| {
            if self.any_ic_changed {
                format!(
                    "[not yet optimizing {}, not enough ticks: {}/{} and ICs changed]",
                    shared.name(),
                    ticks,
                    ticks_for_optimization
                )
            } else {
                format!(
                    "[not yet optimizing {}, not enough ticks: {}/{} and too large for small \
                     function optimization: {}/{}]",
                    shared.name(),
                    ticks,
                    ticks_for_optimization,
                    bytecode.len(),
                    self.flags.max_bytecode_size_for_early_opt
                )
            }
        });
        OptimizationReason::DoNotOptimize
    }

    fn optimize(&mut self, function: &Function, reason: OptimizationReason) {
        debug_assert_ne!(reason, OptimizationReason::DoNotOptimize);
        if self.flags.trace_opt {
            self.trace(|| {
                format!(
                    "[marking {} for optimized recompilation, reason: {}]",
                    function.shared().name(),
                    reason
                )
            });
        }
        function.mark_for_concurrent_optimization();
    }

    // =========================================================================
    // Tracing
    // =========================================================================

    fn trace(&self, text: impl FnOnce() -> String) {
        if let Some(sink) = self.trace {
            sink.line(&text());
        }
    }

    fn trace_verbose(&self, text: impl FnOnce() -> String) {
        if self.flags.trace_opt_verbose {
            self.trace(text);
        }
    }
}

/// Clears the per-tick IC-change flag when the tick's critical section
/// ends, however it ends.
struct OnInterruptTickScope<'m, 'a> {
    manager: &'m mut TieringManager<'a>,
}

impl<'m, 'a> OnInterruptTickScope<'m, 'a> {
    fn new(manager: &'m mut TieringManager<'a>) -> Self {
        OnInterruptTickScope { manager }
    }

    fn manager(&mut self) -> &mut TieringManager<'a> {
        self.manager
    }
}

impl Drop for OnInterruptTickScope<'_, '_> {
    fn drop(&mut self) {
        self.manager.any_ic_changed = false;
    }
}
