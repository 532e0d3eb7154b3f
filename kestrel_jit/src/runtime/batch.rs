//! Baseline batch compilation.
//!
//! The tiering manager must not block inside an interrupt tick, so with
//! batching enabled it only appends functions here. The batch flushes once
//! the accumulated bytecode size crosses the budget (or when the embedder
//! flushes explicitly), compiling everything queued in one go. Duplicate
//! and already-compiled functions are dropped at enqueue time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use kestrel_core::CompileResult;

use super::function::{Function, Tier};

/// Accumulated-bytecode budget that triggers a flush.
pub const DEFAULT_BATCH_BYTE_BUDGET: usize = 4 * 1024;

/// The baseline (non-optimizing) compiler entry point.
pub trait BaselineCompiler {
    /// Compile `function` at the baseline tier. Failure is swallowed by
    /// callers; the function keeps running where it is.
    fn compile_baseline(&self, function: &Function) -> CompileResult<()>;
}

/// Counters for batch activity.
#[derive(Debug, Default)]
pub struct BatchStats {
    /// Requests accepted into the batch.
    pub enqueued: AtomicU64,
    /// Functions successfully compiled.
    pub compiled: AtomicU64,
    /// Compile attempts that failed.
    pub failed: AtomicU64,
    /// Requests dropped (duplicate or already compiled).
    pub dropped: AtomicU64,
}

impl BatchStats {
    /// Snapshot of (enqueued, compiled, failed, dropped).
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.enqueued.load(Ordering::Relaxed),
            self.compiled.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

struct BatchQueue {
    functions: Vec<Arc<Function>>,
    estimated_bytes: usize,
}

/// Collects warm functions and baseline-compiles them in batches.
pub struct BaselineBatchCompiler {
    compiler: Box<dyn BaselineCompiler + Send + Sync>,
    queue: Mutex<BatchQueue>,
    byte_budget: usize,
    stats: BatchStats,
}

impl BaselineBatchCompiler {
    /// A batch compiler flushing at the default byte budget.
    pub fn new(compiler: Box<dyn BaselineCompiler + Send + Sync>) -> Self {
        Self::with_byte_budget(compiler, DEFAULT_BATCH_BYTE_BUDGET)
    }

    /// A batch compiler flushing once `byte_budget` bytecode bytes are
    /// queued.
    pub fn with_byte_budget(
        compiler: Box<dyn BaselineCompiler + Send + Sync>,
        byte_budget: usize,
    ) -> Self {
        BaselineBatchCompiler {
            compiler,
            queue: Mutex::new(BatchQueue {
                functions: Vec::new(),
                estimated_bytes: 0,
            }),
            byte_budget,
            stats: BatchStats::default(),
        }
    }

    /// Queue a function for baseline compilation. Returns false if it was
    /// dropped as a duplicate or already compiled.
    pub fn enqueue(&self, function: Arc<Function>) -> bool {
        if function.active_tier() >= Tier::Baseline {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let should_flush = {
            let mut queue = self.queue.lock().unwrap();
            if queue
                .functions
                .iter()
                .any(|queued| Arc::ptr_eq(queued, &function))
            {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            queue.estimated_bytes += function.shared().bytecode().len() as usize;
            queue.functions.push(function);
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            queue.estimated_bytes >= self.byte_budget
        };
        if should_flush {
            self.flush();
        }
        true
    }

    /// Compile everything queued.
    pub fn flush(&self) {
        let functions = {
            let mut queue = self.queue.lock().unwrap();
            queue.estimated_bytes = 0;
            std::mem::take(&mut queue.functions)
        };
        for function in functions {
            match self.compiler.compile_baseline(&function) {
                Ok(()) => {
                    function.set_has_baseline_code(true);
                    self.stats.compiled.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Number of functions waiting in the batch.
    pub fn queued(&self) -> usize {
        self.queue.lock().unwrap().functions.len()
    }

    /// Batch counters.
    pub fn stats(&self) -> &BatchStats {
        &self.stats
    }
}
