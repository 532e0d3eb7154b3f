//! Runtime function model: tiers, feedback vectors, interrupt budgets.
//!
//! `Function` is the mutable per-closure state the tiering manager drives:
//! which tier is active, whether an optimized compile is pending, and the
//! lazily allocated feedback vector. All mutation happens on the thread
//! running the function; counters use relaxed atomics so concurrent
//! readers (the profiler, the compiler dispatcher) see monotone values.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use super::bytecode::Bytecode;
use super::osr_cache::OsrCodeCache;

/// Interrupt budget installed after every tick.
pub const DEFAULT_INTERRUPT_BUDGET: i32 = 132 * 1024;

// =============================================================================
// Tier
// =============================================================================

/// Execution tiers, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Interpreting without a feedback vector.
    Interpreter,
    /// Interpreting and collecting feedback.
    InterpreterWithFeedback,
    /// Baseline-compiled native code.
    Baseline,
    /// Optimized native code.
    Optimized,
}

// =============================================================================
// Feedback Vector
// =============================================================================

/// Profiling state attached to a function once it gets warm.
#[derive(Debug, Default)]
pub struct FeedbackVector {
    profiler_ticks: AtomicU32,
    invocation_count: AtomicU32,
}

impl FeedbackVector {
    /// A zeroed vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interrupt-budget expirations observed.
    #[inline]
    pub fn profiler_ticks(&self) -> u32 {
        self.profiler_ticks.load(Ordering::Relaxed)
    }

    /// Bump the tick count, saturating.
    #[inline]
    pub fn saturating_increment_profiler_ticks(&self) {
        let ticks = self.profiler_ticks.load(Ordering::Relaxed);
        if ticks < u32::MAX {
            self.profiler_ticks.store(ticks + 1, Ordering::Relaxed);
        }
    }

    /// Number of invocations recorded.
    #[inline]
    pub fn invocation_count(&self) -> u32 {
        self.invocation_count.load(Ordering::Relaxed)
    }

    /// Overwrite the invocation count.
    #[inline]
    pub fn set_invocation_count(&self, count: u32) {
        self.invocation_count.store(count, Ordering::Relaxed);
    }
}

// =============================================================================
// Shared Function Info
// =============================================================================

/// Per-function immutable metadata shared by every closure instance.
#[derive(Debug)]
pub struct SharedFunctionInfo {
    name: String,
    bytecode: Arc<Bytecode>,
    is_user_function: bool,
    optimization_disabled: bool,
    heuristic_optimization_disallowed: bool,
    osr_cache: OsrCodeCache,
}

impl SharedFunctionInfo {
    /// Shared info for a user-defined function.
    pub fn new(name: impl Into<String>, bytecode: Arc<Bytecode>) -> Self {
        SharedFunctionInfo {
            name: name.into(),
            bytecode,
            is_user_function: true,
            optimization_disabled: false,
            heuristic_optimization_disallowed: false,
            osr_cache: OsrCodeCache::new(),
        }
    }

    /// Mark as runtime-internal (not user code).
    pub fn with_user_function(mut self, is_user: bool) -> Self {
        self.is_user_function = is_user;
        self
    }

    /// Exclude from optimized compilation.
    pub fn with_optimization_disabled(mut self, disabled: bool) -> Self {
        self.optimization_disabled = disabled;
        self
    }

    /// Test-runner pin: the function was manually queued, so heuristics
    /// must leave it alone.
    pub fn with_heuristic_optimization_disallowed(mut self, disallowed: bool) -> Self {
        self.heuristic_optimization_disallowed = disallowed;
        self
    }

    /// Function name for diagnostics.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The function's bytecode.
    #[inline]
    pub fn bytecode(&self) -> &Arc<Bytecode> {
        &self.bytecode
    }

    /// Whether this is user code (OSR only applies to user code).
    #[inline]
    pub fn is_user_function(&self) -> bool {
        self.is_user_function
    }

    /// Whether optimized compilation is disabled.
    #[inline]
    pub fn optimization_disabled(&self) -> bool {
        self.optimization_disabled
    }

    /// Whether heuristic optimization is disallowed under the test runner.
    #[inline]
    pub fn heuristic_optimization_disallowed(&self) -> bool {
        self.heuristic_optimization_disallowed
    }

    /// Cached optimized OSR loop entries.
    #[inline]
    pub fn osr_cache(&self) -> &OsrCodeCache {
        &self.osr_cache
    }
}

// =============================================================================
// Function
// =============================================================================

/// One runnable closure and its tiering state.
#[derive(Debug)]
pub struct Function {
    shared: Arc<SharedFunctionInfo>,
    feedback: OnceLock<FeedbackVector>,
    interrupt_budget: AtomicI32,
    marked_for_optimization: AtomicBool,
    in_optimization_queue: AtomicBool,
    has_baseline_code: AtomicBool,
    has_optimized_code: AtomicBool,
}

impl Function {
    /// A fresh function at the lowest tier.
    pub fn new(shared: Arc<SharedFunctionInfo>) -> Self {
        Function {
            shared,
            feedback: OnceLock::new(),
            interrupt_budget: AtomicI32::new(DEFAULT_INTERRUPT_BUDGET),
            marked_for_optimization: AtomicBool::new(false),
            in_optimization_queue: AtomicBool::new(false),
            has_baseline_code: AtomicBool::new(false),
            has_optimized_code: AtomicBool::new(false),
        }
    }

    /// Shared metadata.
    #[inline]
    pub fn shared(&self) -> &SharedFunctionInfo {
        &self.shared
    }

    /// Whether a feedback vector has been allocated.
    #[inline]
    pub fn has_feedback_vector(&self) -> bool {
        self.feedback.get().is_some()
    }

    /// The feedback vector, if allocated.
    #[inline]
    pub fn feedback_vector(&self) -> Option<&FeedbackVector> {
        self.feedback.get()
    }

    /// Allocate the feedback vector if missing.
    pub fn ensure_feedback_vector(&self) -> &FeedbackVector {
        self.feedback.get_or_init(FeedbackVector::new)
    }

    /// Refill the interrupt budget for the next tick.
    #[inline]
    pub fn reset_interrupt_budget(&self) {
        self.interrupt_budget
            .store(DEFAULT_INTERRUPT_BUDGET, Ordering::Relaxed);
    }

    /// Current interrupt budget.
    #[inline]
    pub fn interrupt_budget(&self) -> i32 {
        self.interrupt_budget.load(Ordering::Relaxed)
    }

    /// Burn `cost` units of budget; returns true when the budget expires
    /// and the caller should deliver an interrupt tick.
    #[inline]
    pub fn consume_interrupt_budget(&self, cost: i32) -> bool {
        self.interrupt_budget.fetch_sub(cost, Ordering::Relaxed) - cost <= 0
    }

    /// Request concurrent optimized recompilation.
    #[inline]
    pub fn mark_for_concurrent_optimization(&self) {
        self.marked_for_optimization.store(true, Ordering::Relaxed);
    }

    /// Whether an optimized compile has been requested.
    #[inline]
    pub fn is_marked_for_optimization(&self) -> bool {
        self.marked_for_optimization.load(Ordering::Relaxed)
    }

    /// Set by the compiler dispatcher once the job is picked up.
    #[inline]
    pub fn set_in_optimization_queue(&self, queued: bool) {
        self.in_optimization_queue.store(queued, Ordering::Relaxed);
    }

    /// Whether an optimize job is already in flight.
    #[inline]
    pub fn is_in_optimization_queue(&self) -> bool {
        self.in_optimization_queue.load(Ordering::Relaxed)
    }

    /// Install (or drop) baseline code.
    #[inline]
    pub fn set_has_baseline_code(&self, has: bool) {
        self.has_baseline_code.store(has, Ordering::Relaxed);
    }

    /// Install (or drop) optimized code.
    #[inline]
    pub fn set_has_optimized_code(&self, has: bool) {
        self.has_optimized_code.store(has, Ordering::Relaxed);
    }

    /// Whether optimized code is available to dispatch to.
    #[inline]
    pub fn has_available_optimized_code(&self) -> bool {
        self.has_optimized_code.load(Ordering::Relaxed)
    }

    /// The highest tier this function can currently execute at.
    pub fn active_tier(&self) -> Tier {
        if self.has_optimized_code.load(Ordering::Relaxed) {
            Tier::Optimized
        } else if self.has_baseline_code.load(Ordering::Relaxed) {
            Tier::Baseline
        } else if self.has_feedback_vector() {
            Tier::InterpreterWithFeedback
        } else {
            Tier::Interpreter
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// A running interpreter or baseline frame, as seen by the tiering manager.
#[derive(Debug, Clone)]
pub struct UnoptimizedFrame {
    function: Arc<Function>,
    bytecode_offset: u32,
}

impl UnoptimizedFrame {
    /// A frame executing `function` at `bytecode_offset`.
    pub fn new(function: Arc<Function>, bytecode_offset: u32) -> Self {
        UnoptimizedFrame {
            function,
            bytecode_offset,
        }
    }

    /// The frame's function.
    #[inline]
    pub fn function(&self) -> &Arc<Function> {
        &self.function
    }

    /// Current bytecode offset.
    #[inline]
    pub fn bytecode_offset(&self) -> u32 {
        self.bytecode_offset
    }

    /// Frames of this type never run optimized code.
    #[inline]
    pub fn is_unoptimized(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_function(length: u32) -> Function {
        let bytecode = Arc::new(Bytecode::new(length));
        Function::new(Arc::new(SharedFunctionInfo::new("f", bytecode)))
    }

    #[test]
    fn test_tier_progression() {
        let f = make_function(10);
        assert_eq!(f.active_tier(), Tier::Interpreter);
        f.ensure_feedback_vector();
        assert_eq!(f.active_tier(), Tier::InterpreterWithFeedback);
        f.set_has_baseline_code(true);
        assert_eq!(f.active_tier(), Tier::Baseline);
        f.set_has_optimized_code(true);
        assert_eq!(f.active_tier(), Tier::Optimized);
        assert!(Tier::Interpreter < Tier::Baseline);
    }

    #[test]
    fn test_feedback_vector_is_allocated_once() {
        let f = make_function(10);
        f.ensure_feedback_vector().set_invocation_count(1);
        f.ensure_feedback_vector();
        assert_eq!(f.feedback_vector().unwrap().invocation_count(), 1);
    }

    #[test]
    fn test_saturating_ticks() {
        let fv = FeedbackVector::new();
        fv.profiler_ticks.store(u32::MAX, Ordering::Relaxed);
        fv.saturating_increment_profiler_ticks();
        assert_eq!(fv.profiler_ticks(), u32::MAX);
    }

    #[test]
    fn test_interrupt_budget_expiry() {
        let f = make_function(10);
        f.reset_interrupt_budget();
        assert!(!f.consume_interrupt_budget(1));
        assert!(f.consume_interrupt_budget(DEFAULT_INTERRUPT_BUDGET));
        f.reset_interrupt_budget();
        assert_eq!(f.interrupt_budget(), DEFAULT_INTERRUPT_BUDGET);
    }
}
