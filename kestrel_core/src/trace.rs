//! Diagnostic trace capability.
//!
//! Tracing is a capability object handed to the tiering manager, register
//! allocator, and code generator. Callers that do not care pass `None`;
//! the pipeline never writes to stdout/stderr on its own.

use std::sync::Mutex;

/// A sink for diagnostic trace lines.
pub trait TraceSink {
    /// Record one line of diagnostic output.
    fn line(&self, text: &str);
}

/// A `TraceSink` that buffers lines in memory.
///
/// Used by tests to assert on diagnostic output; also handy for dumping a
/// compile job's trace after the fact.
#[derive(Debug, Default)]
pub struct BufferSink {
    lines: Mutex<Vec<String>>,
}

impl BufferSink {
    /// Create an empty buffer sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a snapshot of all recorded lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    /// Whether any recorded line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines.lock().unwrap().iter().any(|l| l.contains(needle))
    }

    /// Drop all recorded lines.
    pub fn clear(&self) {
        self.lines.lock().unwrap().clear();
    }
}

impl TraceSink for BufferSink {
    fn line(&self, text: &str) {
        self.lines.lock().unwrap().push(text.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_records_lines() {
        let sink = BufferSink::new();
        sink.line("marking f for recompilation");
        sink.line("arming back edges");
        assert_eq!(sink.lines().len(), 2);
        assert!(sink.contains("back edges"));
        assert!(!sink.contains("deopt"));
    }

    #[test]
    fn test_buffer_sink_clear() {
        let sink = BufferSink::new();
        sink.line("one");
        sink.clear();
        assert!(sink.lines().is_empty());
    }
}
