//! Code-generation state: labels, deferred code, and safepoints.

use kestrel_core::Flags;

use super::emit::MachineOp;

/// Frame slots below the spill area: return address, saved frame pointer,
/// callee function, and argument count.
pub const FIXED_FRAME_SLOT_COUNT: u32 = 4;

/// Safepoint tables index the fixed frame slots too.
#[inline]
pub fn safepoint_index_for_stack_slot(slot: u32) -> u32 {
    FIXED_FRAME_SLOT_COUNT + slot
}

// =============================================================================
// Labels
// =============================================================================

/// A position in the emitted stream, bound once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

// =============================================================================
// Safepoint Table
// =============================================================================

/// Handle to one safepoint under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafepointId(usize);

/// One safepoint: an emission position plus the tagged slots live there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafepointEntry {
    /// Index into the emitted op stream.
    pub position: usize,
    /// Safepoint-table indices of slots holding tagged values.
    pub tagged_slots: Vec<u32>,
}

/// Collects safepoints during emission.
#[derive(Debug, Default)]
pub struct SafepointTableBuilder {
    entries: Vec<SafepointEntry>,
}

impl SafepointTableBuilder {
    /// A builder with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a safepoint at the given emission position.
    pub fn define_safepoint(&mut self, position: usize) -> SafepointId {
        self.entries.push(SafepointEntry {
            position,
            tagged_slots: Vec::new(),
        });
        SafepointId(self.entries.len() - 1)
    }

    /// Mark a stack slot as holding a tagged value at this safepoint.
    pub fn define_tagged_stack_slot(&mut self, id: SafepointId, index: u32) {
        self.entries[id.0].tagged_slots.push(index);
    }

    /// All entries, in definition order.
    pub fn entries(&self) -> &[SafepointEntry] {
        &self.entries
    }
}

// =============================================================================
// Deferred Code
// =============================================================================

/// Labels wiring a deferred block back into the main stream.
#[derive(Debug, Clone, Copy)]
pub struct DeferredLabels {
    /// Entry of the deferred block.
    pub deferred_label: Label,
    /// Where the deferred block jumps back to.
    pub return_label: Label,
}

/// A block of code emitted after the main pass (slow paths, deopt shims).
pub trait DeferredCode {
    /// Emit the deferred block.
    fn generate(&mut self, state: &mut CodeGenState, labels: DeferredLabels);
}

struct DeferredEntry {
    code: Box<dyn DeferredCode>,
    labels: DeferredLabels,
}

// =============================================================================
// Code Gen State
// =============================================================================

/// Mutable state shared by everything that emits code for one compile job.
pub struct CodeGenState {
    flags: Flags,
    ops: Vec<MachineOp>,
    next_label: u32,
    vreg_slots: u32,
    deferred: Vec<DeferredEntry>,
    safepoints: SafepointTableBuilder,
}

impl CodeGenState {
    /// Fresh state for one compile job.
    pub fn new(flags: Flags, vreg_slots: u32) -> Self {
        CodeGenState {
            flags,
            ops: Vec::new(),
            next_label: 0,
            vreg_slots,
            deferred: Vec::new(),
            safepoints: SafepointTableBuilder::new(),
        }
    }

    /// The compile job's flags.
    #[inline]
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Number of spill slots in the frame.
    #[inline]
    pub fn vreg_slots(&self) -> u32 {
        self.vreg_slots
    }

    /// Spill slots plus the fixed frame.
    #[inline]
    pub fn stack_slot_count_with_fixed_frame(&self) -> u32 {
        self.vreg_slots + FIXED_FRAME_SLOT_COUNT
    }

    /// Append an op.
    #[inline]
    pub fn emit(&mut self, op: MachineOp) {
        self.ops.push(op);
    }

    /// Append a comment when `code_comments` is on.
    pub fn comment(&mut self, text: impl FnOnce() -> String) {
        if self.flags.code_comments {
            let text = text();
            self.ops.push(MachineOp::Comment(text));
        }
    }

    /// Current emission position.
    #[inline]
    pub fn position(&self) -> usize {
        self.ops.len()
    }

    /// Allocate an unbound label.
    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind a label at the current position.
    pub fn bind(&mut self, label: Label) {
        self.ops.push(MachineOp::Bind(label));
    }

    /// The safepoint table under construction.
    #[inline]
    pub fn safepoints_mut(&mut self) -> &mut SafepointTableBuilder {
        &mut self.safepoints
    }

    /// Queue a deferred block; returns the labels to branch through.
    pub fn push_deferred_code(&mut self, code: Box<dyn DeferredCode>) -> DeferredLabels {
        let labels = DeferredLabels {
            deferred_label: self.new_label(),
            return_label: self.new_label(),
        };
        self.deferred.push(DeferredEntry { code, labels });
        labels
    }

    /// Emit every queued deferred block after the main pass. A deferred
    /// block may queue further deferred blocks; they drain in FIFO order.
    pub fn emit_deferred_code(&mut self) {
        while !self.deferred.is_empty() {
            let mut entry = self.deferred.remove(0);
            self.comment(|| "-- Deferred block".to_string());
            self.bind(entry.labels.deferred_label);
            entry.code.generate(self, entry.labels);
            self.emit(MachineOp::Break);
        }
    }

    /// Tear down into the finished op stream and safepoint table.
    pub fn finish(self) -> (Vec<MachineOp>, SafepointTableBuilder) {
        debug_assert!(self.deferred.is_empty(), "deferred code not emitted");
        (self.ops, self.safepoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_are_unique() {
        let mut state = CodeGenState::new(Flags::default(), 0);
        let a = state.new_label();
        let b = state.new_label();
        assert_ne!(a, b);
    }

    #[test]
    fn test_safepoint_indices_offset_by_fixed_frame() {
        assert_eq!(safepoint_index_for_stack_slot(0), FIXED_FRAME_SLOT_COUNT);
        assert_eq!(safepoint_index_for_stack_slot(3), FIXED_FRAME_SLOT_COUNT + 3);
    }

    #[test]
    fn test_comments_gated_by_flag() {
        let mut flags = Flags::default();
        flags.code_comments = false;
        let mut state = CodeGenState::new(flags, 0);
        state.comment(|| "hidden".to_string());
        assert!(state.position() == 0);

        let mut flags = Flags::default();
        flags.code_comments = true;
        let mut state = CodeGenState::new(flags, 0);
        state.comment(|| "shown".to_string());
        assert_eq!(state.position(), 1);
    }

    #[test]
    fn test_deferred_code_runs_after_main_pass() {
        struct SlowPath;
        impl DeferredCode for SlowPath {
            fn generate(&mut self, state: &mut CodeGenState, labels: DeferredLabels) {
                state.emit(MachineOp::Jump {
                    label: labels.return_label,
                });
            }
        }

        let mut state = CodeGenState::new(Flags::default(), 0);
        let labels = state.push_deferred_code(Box::new(SlowPath));
        state.emit(MachineOp::Return);
        state.emit_deferred_code();
        let (ops, _) = state.finish();

        // Return first, then the bound deferred block, its jump back, and
        // the trailing trap.
        assert!(matches!(ops[0], MachineOp::Return));
        assert!(matches!(ops[1], MachineOp::Bind(l) if l == labels.deferred_label));
        assert!(matches!(ops[2], MachineOp::Jump { label } if label == labels.return_label));
        assert!(matches!(ops[3], MachineOp::Break));
    }
}
