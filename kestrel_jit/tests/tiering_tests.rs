//! Tiering-manager scenarios: small-function fast path, hot thresholds,
//! OSR arming while an optimized compile is pending, the OSR code cache,
//! and idempotence once a function is fully optimized.

use std::sync::Arc;

use kestrel_core::{BufferSink, CompileError, CompileResult, Flags};
use kestrel_jit::runtime::{
    BaselineBatchCompiler, BaselineCompiler, Bytecode, Function, OsrCacheEntry,
    SharedFunctionInfo, Tier, UnoptimizedFrame, MAX_LOOP_NESTING_MARKER,
};
use kestrel_jit::tiering::TieringManager;

struct OkCompiler;
impl BaselineCompiler for OkCompiler {
    fn compile_baseline(&self, _function: &Function) -> CompileResult<()> {
        Ok(())
    }
}

struct FailingCompiler;
impl BaselineCompiler for FailingCompiler {
    fn compile_baseline(&self, function: &Function) -> CompileResult<()> {
        Err(CompileError::CodegenFailed {
            message: format!("refusing {}", function.shared().name()),
        })
    }
}

fn small_function_flags() -> Flags {
    Flags {
        ticks_before_optimization: 8,
        bytecode_size_allowance_per_tick: 1200,
        max_bytecode_size_for_early_opt: 64,
        ..Flags::default()
    }
}

fn make_function(length: u32) -> Arc<Function> {
    let bytecode = Arc::new(Bytecode::new(length));
    Arc::new(Function::new(Arc::new(SharedFunctionInfo::new(
        "f", bytecode,
    ))))
}

fn make_function_with(shared: SharedFunctionInfo) -> Arc<Function> {
    Arc::new(Function::new(Arc::new(shared)))
}

fn tick_at(manager: &mut TieringManager<'_>, function: &Arc<Function>, offset: u32) {
    let frame = UnoptimizedFrame::new(Arc::clone(function), offset);
    manager.on_interrupt_tick(function, &frame);
}

fn tick(manager: &mut TieringManager<'_>, function: &Arc<Function>) {
    tick_at(manager, function, 0);
}

// =============================================================================
// Optimize decision (S1–S3)
// =============================================================================

#[test]
fn test_small_function_fast_path() {
    // 20 bytes, ICs settled, feedback present: the second tick marks it.
    let flags = small_function_flags();
    let mut manager = TieringManager::new(&flags);
    let f = make_function(20);

    tick(&mut manager, &f); // allocates feedback, no decision yet
    assert!(!f.is_marked_for_optimization());
    assert_eq!(f.active_tier(), Tier::InterpreterWithFeedback);

    tick(&mut manager, &f);
    assert!(f.is_marked_for_optimization());
}

#[test]
fn test_ic_churn_blocks_small_function() {
    let flags = small_function_flags();
    let mut manager = TieringManager::new(&flags);
    let f = make_function(20);
    tick(&mut manager, &f);

    manager.notify_ic_changed();
    tick(&mut manager, &f);
    assert!(!f.is_marked_for_optimization());

    // The flag cleared on scope exit, so the next tick succeeds.
    tick(&mut manager, &f);
    assert!(f.is_marked_for_optimization());
}

#[test]
fn test_hot_threshold_boundary() {
    // length 1000, allowance 100/tick, base 8: threshold is 18 ticks.
    let flags = Flags {
        ticks_before_optimization: 8,
        bytecode_size_allowance_per_tick: 100,
        max_bytecode_size_for_early_opt: 64,
        ..Flags::default()
    };
    let mut manager = TieringManager::new(&flags);
    let f = make_function(1000);

    // First tick allocates feedback; seventeen more reach ticks = 17.
    for _ in 0..18 {
        tick(&mut manager, &f);
    }
    assert_eq!(f.feedback_vector().unwrap().profiler_ticks(), 17);
    assert!(!f.is_marked_for_optimization());

    // Tick 18 crosses the threshold.
    tick(&mut manager, &f);
    assert_eq!(f.feedback_vector().unwrap().profiler_ticks(), 18);
    assert!(f.is_marked_for_optimization());
}

// =============================================================================
// OSR while an optimized compile is pending (S4, invariant 9)
// =============================================================================

fn run_pending_osr(bytecode_length: u32) -> u8 {
    let flags = Flags::default();
    let mut manager = TieringManager::new(&flags);
    let f = make_function(bytecode_length);
    f.mark_for_concurrent_optimization();

    // First tick allocates feedback; four more bring ticks to 4, so the
    // allowance ends at 119 + 4 * 44 = 295 bytes.
    for _ in 0..5 {
        tick(&mut manager, &f);
    }
    assert_eq!(f.feedback_vector().unwrap().profiler_ticks(), 4);
    f.shared().bytecode().osr_loop_nesting_level()
}

#[test]
fn test_osr_armed_at_allowance_boundary() {
    assert_eq!(run_pending_osr(295), 1);
}

#[test]
fn test_osr_not_armed_past_allowance() {
    assert_eq!(run_pending_osr(296), 0);
}

// =============================================================================
// OSR code cache
// =============================================================================

#[test]
fn test_osr_cache_hit_rearms_and_marks() {
    let flags = Flags::default();
    let shared = SharedFunctionInfo::new("cached", Arc::new(Bytecode::new(500)));
    shared.osr_cache().add_entry(OsrCacheEntry {
        jump_offset: 80,
        jump_target_offset: 20,
        loop_depth: 1,
    });
    let f = make_function_with(shared);
    let mut manager = TieringManager::new(&flags);

    tick_at(&mut manager, &f, 50); // allocates feedback only
    tick_at(&mut manager, &f, 50); // inside the cached loop range

    assert_eq!(f.shared().bytecode().osr_loop_nesting_level(), 2);
    assert!(f.is_marked_for_optimization());
}

#[test]
fn test_osr_cache_miss_outside_loop_range() {
    let flags = Flags {
        max_bytecode_size_for_early_opt: 64,
        ..Flags::default()
    };
    let shared = SharedFunctionInfo::new("cached", Arc::new(Bytecode::new(500)));
    shared.osr_cache().add_entry(OsrCacheEntry {
        jump_offset: 80,
        jump_target_offset: 20,
        loop_depth: 1,
    });
    let f = make_function_with(shared);
    let mut manager = TieringManager::new(&flags);

    tick_at(&mut manager, &f, 200);
    tick_at(&mut manager, &f, 200);

    // No rearming, and 500 bytes is too large for the small-function path.
    assert_eq!(f.shared().bytecode().osr_loop_nesting_level(), 0);
    assert!(!f.is_marked_for_optimization());
}

// =============================================================================
// always_osr and OSR gating
// =============================================================================

#[test]
fn test_always_osr_arms_to_ceiling() {
    let flags = Flags {
        always_osr: true,
        max_bytecode_size_for_early_opt: 64,
        ..Flags::default()
    };
    let mut manager = TieringManager::new(&flags);
    let f = make_function(20);

    tick(&mut manager, &f);
    tick(&mut manager, &f);

    assert_eq!(
        f.shared().bytecode().osr_loop_nesting_level(),
        MAX_LOOP_NESTING_MARKER
    );
    // always_osr falls through to a normal optimize decision too.
    assert!(f.is_marked_for_optimization());
}

#[test]
fn test_osr_skipped_for_non_user_functions() {
    let flags = Flags::default();
    let shared = SharedFunctionInfo::new("builtin", Arc::new(Bytecode::new(50)))
        .with_user_function(false);
    let f = make_function_with(shared);
    let mut manager = TieringManager::new(&flags);
    let frame = UnoptimizedFrame::new(Arc::clone(&f), 0);

    manager.attempt_on_stack_replacement(&frame, 3);
    assert_eq!(f.shared().bytecode().osr_loop_nesting_level(), 0);
}

#[test]
fn test_osr_skipped_when_optimization_disabled() {
    let flags = Flags::default();
    let shared = SharedFunctionInfo::new("pinned", Arc::new(Bytecode::new(50)))
        .with_optimization_disabled(true);
    let f = make_function_with(shared);
    let mut manager = TieringManager::new(&flags);
    let frame = UnoptimizedFrame::new(Arc::clone(&f), 0);

    manager.attempt_on_stack_replacement(&frame, 3);
    assert_eq!(f.shared().bytecode().osr_loop_nesting_level(), 0);
}

// =============================================================================
// Tiering idempotence (invariant 8) and gates
// =============================================================================

#[test]
fn test_ticks_on_optimized_function_are_bookkeeping_only() {
    let flags = Flags::default();
    let mut manager = TieringManager::new(&flags);
    // Large enough that the pending-OSR path cannot arm back edges.
    let f = make_function(100_000);
    f.ensure_feedback_vector();
    f.set_has_optimized_code(true);

    tick(&mut manager, &f);
    tick(&mut manager, &f);

    assert_eq!(f.feedback_vector().unwrap().profiler_ticks(), 2);
    assert!(!f.is_marked_for_optimization());
    assert_eq!(f.shared().bytecode().osr_loop_nesting_level(), 0);
}

#[test]
fn test_in_queue_function_not_remarked() {
    let flags = small_function_flags();
    let sink = BufferSink::new();
    let mut flags = flags;
    flags.trace_opt_verbose = true;
    let mut manager = TieringManager::new(&flags).with_trace(&sink);
    let f = make_function(20);
    f.ensure_feedback_vector();
    f.set_in_optimization_queue(true);

    tick(&mut manager, &f);

    assert!(!f.is_marked_for_optimization());
    assert!(sink.contains("already in optimization queue"));
}

#[test]
fn test_heuristic_optimization_disallowed_under_test_runner() {
    let mut flags = small_function_flags();
    flags.testing_test_runner = true;
    flags.trace_opt_verbose = true;
    let sink = BufferSink::new();
    let mut manager = TieringManager::new(&flags).with_trace(&sink);
    let shared = SharedFunctionInfo::new("pinned", Arc::new(Bytecode::new(20)))
        .with_heuristic_optimization_disallowed(true);
    let f = make_function_with(shared);
    f.ensure_feedback_vector();

    tick(&mut manager, &f);

    assert!(!f.is_marked_for_optimization());
    assert!(sink.contains("marked manually for optimization"));
}

#[test]
fn test_optimization_disabled_function_never_marked() {
    let flags = small_function_flags();
    let shared = SharedFunctionInfo::new("no_opt", Arc::new(Bytecode::new(20)))
        .with_optimization_disabled(true);
    let f = make_function_with(shared);
    let mut manager = TieringManager::new(&flags);

    tick(&mut manager, &f);
    tick(&mut manager, &f);

    assert!(!f.is_marked_for_optimization());
}

// =============================================================================
// Baseline tier-up
// =============================================================================

#[test]
fn test_inline_baseline_compile_on_tick() {
    let flags = Flags::default();
    let compiler = OkCompiler;
    let mut manager = TieringManager::new(&flags).with_baseline(&compiler);
    let f = make_function(100);

    tick(&mut manager, &f);
    assert_eq!(f.active_tier(), Tier::Baseline);
}

#[test]
fn test_failed_baseline_compile_is_swallowed() {
    let flags = Flags::default();
    let compiler = FailingCompiler;
    let mut manager = TieringManager::new(&flags).with_baseline(&compiler);
    let f = make_function(100);

    tick(&mut manager, &f);
    // Still interpreting, feedback allocated, no panic, nothing marked.
    assert_eq!(f.active_tier(), Tier::InterpreterWithFeedback);
    assert!(!f.is_marked_for_optimization());
}

#[test]
fn test_batched_baseline_compile_defers_to_flush() {
    let mut flags = Flags::default();
    flags.baseline_batch_compilation = true;
    let batch = BaselineBatchCompiler::new(Box::new(OkCompiler));
    let compiler = OkCompiler;
    let mut manager = TieringManager::new(&flags)
        .with_baseline(&compiler)
        .with_batch(&batch);
    let f = make_function(100);

    tick(&mut manager, &f);
    // Enqueued, not compiled: the tick must not block on compilation.
    assert_eq!(f.active_tier(), Tier::InterpreterWithFeedback);
    assert_eq!(batch.queued(), 1);

    batch.flush();
    assert_eq!(f.active_tier(), Tier::Baseline);
}

#[test]
fn test_trace_osr_lines() {
    let mut flags = Flags::default();
    flags.trace_osr = true;
    let sink = BufferSink::new();
    let mut manager = TieringManager::new(&flags).with_trace(&sink);
    let f = make_function(50);
    let frame = UnoptimizedFrame::new(Arc::clone(&f), 0);

    manager.attempt_on_stack_replacement(&frame, 1);
    assert!(sink.contains("OSR - arming back edges in f"));
    assert_eq!(f.shared().bytecode().osr_loop_nesting_level(), 1);
}
