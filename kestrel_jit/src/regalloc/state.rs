//! Register-allocation bookkeeping types.
//!
//! `LiveNodeInfo` tracks where a live value currently sits. A merge block's
//! `MergePointRegisterState` records, per physical register, what the block
//! expects to find there on entry: nothing, a single agreed-upon value, or
//! a `RegisterMerge` describing where the value lives on each incoming edge.

use crate::ir::node::NodeId;
use crate::ir::operand::{AllocatedOperand, Reg};

// =============================================================================
// Live Node Info
// =============================================================================

/// Current placement of one live value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveNodeInfo {
    /// The value.
    pub node: NodeId,
    /// Id of the value's last use.
    pub last_use: u32,
    /// Id of the value's next use after the current position.
    pub next_use: u32,
    /// Canonical register holding the value, if any.
    pub reg: Option<Reg>,
    /// Stack slot holding the value, if any.
    pub slot: Option<i32>,
}

impl LiveNodeInfo {
    /// The value's canonical location. A live value always has a register
    /// or a slot; anything else is an allocator bug.
    #[inline]
    pub fn allocation(&self) -> AllocatedOperand {
        if let Some(reg) = self.reg {
            return AllocatedOperand::Register(reg);
        }
        if let Some(slot) = self.slot {
            return AllocatedOperand::Slot(slot);
        }
        unreachable!("live value {} has neither register nor slot", self.node)
    }
}

// =============================================================================
// Register Merge
// =============================================================================

/// Per-register record at a merge point whose predecessors disagree.
///
/// `operand(p)` is where the representative value lives on predecessor
/// `p`'s exit; code generation materializes a move from there into the
/// register on that edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterMerge {
    /// The value the register holds after the merge.
    pub node: NodeId,
    operands: Box<[AllocatedOperand]>,
}

impl RegisterMerge {
    /// A merge record with every predecessor entry set to `fill`.
    pub fn new_filled(node: NodeId, predecessor_count: u32, fill: AllocatedOperand) -> Self {
        RegisterMerge {
            node,
            operands: vec![fill; predecessor_count as usize].into_boxed_slice(),
        }
    }

    /// Location of the value on predecessor `p`'s exit.
    #[inline]
    pub fn operand(&self, p: u32) -> AllocatedOperand {
        self.operands[p as usize]
    }

    /// Record the value's location on predecessor `p`'s exit.
    #[inline]
    pub fn set_operand(&mut self, p: u32, operand: AllocatedOperand) {
        self.operands[p as usize] = operand;
    }

    /// Number of predecessor entries.
    #[inline]
    pub fn predecessor_count(&self) -> u32 {
        self.operands.len() as u32
    }
}

// =============================================================================
// Register State
// =============================================================================

/// What a merge block expects in one physical register at entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RegisterState {
    /// No predecessor has reported yet.
    #[default]
    Uninitialized,
    /// All predecessors seen so far agree: this value (or nothing).
    Node(Option<NodeId>),
    /// Predecessors disagree; per-edge locations are recorded.
    Merge(RegisterMerge),
}

impl RegisterState {
    /// The value the register holds at block entry, if any.
    #[inline]
    pub fn node(&self) -> Option<NodeId> {
        match self {
            RegisterState::Uninitialized => None,
            RegisterState::Node(n) => *n,
            RegisterState::Merge(m) => Some(m.node),
        }
    }

    /// The merge record, if predecessors disagreed.
    #[inline]
    pub fn merge(&self) -> Option<&RegisterMerge> {
        match self {
            RegisterState::Merge(m) => Some(m),
            _ => None,
        }
    }
}

// =============================================================================
// Merge-Point Register State
// =============================================================================

/// Per-block register snapshot, filled in by the allocator when the first
/// predecessor's control node is processed.
#[derive(Debug, Clone, Default)]
pub struct MergePointRegisterState {
    registers: Vec<RegisterState>,
}

impl MergePointRegisterState {
    /// An empty (uninitialized) snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any predecessor has initialized the snapshot yet.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        !self.registers.is_empty()
    }

    /// Install the snapshot from the first predecessor.
    pub fn initialize(&mut self, registers: Vec<RegisterState>) {
        debug_assert!(!self.is_initialized());
        self.registers = registers;
    }

    /// Per-register entries.
    #[inline]
    pub fn registers(&self) -> &[RegisterState] {
        &self.registers
    }

    /// Mutable per-register entries.
    #[inline]
    pub fn registers_mut(&mut self) -> &mut [RegisterState] {
        &mut self.registers
    }
}
