//! IR nodes.
//!
//! Nodes live in the graph's arena and reference each other by `NodeId`.
//! A node is one tagged variant (`NodeKind`) plus the bookkeeping shared by
//! all kinds: inputs, live range, result operand, temporaries, and (for
//! control kinds) the next post-dominating hole.

use smallvec::SmallVec;
use std::fmt;

use super::operand::{AllocatedOperand, Operand, Policy, Reg, RegList};

/// Sentinel for "no next use".
pub const INVALID_ID: u32 = u32::MAX;

// =============================================================================
// Ids
// =============================================================================

/// Identifies a node in the graph arena.
///
/// Ids assigned by the graph builder are monotone in program order; nodes
/// synthesized later (gap moves) take ids past the original range and are
/// excluded from liveness reasoning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    /// Raw id value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Arena index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identifies a basic block, in reverse-post-order position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Arena index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

// =============================================================================
// Live Range
// =============================================================================

/// First-definition and last-use ids of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LiveRange {
    /// Id of the defining node.
    pub start: u32,
    /// Id of the last use (equal to `start` if never used).
    pub end: u32,
}

// =============================================================================
// Node Properties
// =============================================================================

/// Allocation-relevant properties of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeProperties {
    /// The node calls out and clobbers every allocatable register.
    pub is_call: bool,
    /// The node may deoptimize; all live registers must be recoverable
    /// from the frame.
    pub can_deopt: bool,
}

// =============================================================================
// Node Kind
// =============================================================================

/// Arithmetic/logic operations carried by `NodeKind::Binary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    BitAnd,
    BitOr,
}

/// The tagged node variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An incoming value (argument or frame slot), defined at entry.
    InitialValue {
        /// Fixed frame slot holding the value; negative for arguments.
        slot: i32,
    },
    /// A materialized constant.
    Constant {
        /// Tagged immediate payload.
        value: i64,
    },
    /// SSA merge value; inputs are indexed by predecessor position.
    Phi,
    /// A two-input operation.
    Binary {
        /// The operation.
        op: BinOp,
    },
    /// A call into the runtime; clobbers all registers.
    Call,
    /// A synthetic move resolving mismatched locations. Inserted by the
    /// register allocator, never by the builder.
    GapMove {
        /// Where the value currently lives.
        source: AllocatedOperand,
        /// Where the consumer expects it.
        target: AllocatedOperand,
    },
    /// Unconditional forward jump.
    Jump {
        /// Target block.
        target: BlockId,
    },
    /// Loop back-edge; terminates post-dominating hole chains.
    JumpLoop {
        /// The loop header.
        target: BlockId,
    },
    /// Two-way conditional control transfer.
    Branch {
        /// Taken successor.
        if_true: BlockId,
        /// Not-taken successor.
        if_false: BlockId,
    },
    /// Function exit.
    Return,
}

impl NodeKind {
    /// Whether this kind produces a value.
    #[inline]
    pub const fn is_value(&self) -> bool {
        matches!(
            self,
            NodeKind::InitialValue { .. }
                | NodeKind::Constant { .. }
                | NodeKind::Phi
                | NodeKind::Binary { .. }
                | NodeKind::Call
        )
    }

    /// Whether this kind is a control node.
    #[inline]
    pub const fn is_control(&self) -> bool {
        matches!(
            self,
            NodeKind::Jump { .. }
                | NodeKind::JumpLoop { .. }
                | NodeKind::Branch { .. }
                | NodeKind::Return
        )
    }

    /// Whether this kind is an unconditional control transfer with a target.
    #[inline]
    pub const fn is_unconditional_control(&self) -> bool {
        matches!(self, NodeKind::Jump { .. } | NodeKind::JumpLoop { .. })
    }

    /// Whether this kind is a conditional control transfer.
    #[inline]
    pub const fn is_conditional_control(&self) -> bool {
        matches!(self, NodeKind::Branch { .. })
    }

    /// Whether this kind terminates forward control flow.
    #[inline]
    pub const fn is_terminator(&self) -> bool {
        matches!(self, NodeKind::Return | NodeKind::JumpLoop { .. })
    }

    /// Whether this is a synthetic gap move.
    #[inline]
    pub const fn is_gap_move(&self) -> bool {
        matches!(self, NodeKind::GapMove { .. })
    }

    /// Target of an unconditional control transfer.
    #[inline]
    pub fn unconditional_target(&self) -> Option<BlockId> {
        match self {
            NodeKind::Jump { target } | NodeKind::JumpLoop { target } => Some(*target),
            _ => None,
        }
    }
}

// =============================================================================
// Input
// =============================================================================

/// A use edge: which node is consumed, where the consumer wants it, and the
/// id of the consuming value's next use after this one.
#[derive(Debug, Clone, Copy)]
pub struct Input {
    /// The consumed value.
    pub node: NodeId,
    /// Requested (then assigned) location.
    pub operand: Operand,
    /// Id of the next use of `node` after this one, or `INVALID_ID`.
    pub next_use_id: u32,
}

impl Input {
    /// A fresh use edge with the given placement policy.
    #[inline]
    pub fn new(node: NodeId, policy: Policy) -> Self {
        Input {
            node,
            operand: Operand::Unallocated(policy),
            next_use_id: INVALID_ID,
        }
    }

    /// The register assigned to this input. Panics if unallocated or in a
    /// slot; valid only after allocation.
    #[inline]
    pub fn assigned_register(&self) -> Reg {
        self.operand
            .assigned_register()
            .expect("input not assigned to a register")
    }

    /// Replace the operand with an already-known location so the allocator
    /// does not move the value redundantly.
    #[inline]
    pub fn inject_allocated(&mut self, location: AllocatedOperand) {
        self.operand = Operand::Allocated(location);
    }
}

// =============================================================================
// Node
// =============================================================================

/// One IR instruction in the graph arena.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    inputs: SmallVec<[Input; 2]>,
    properties: NodeProperties,
    live_range: LiveRange,
    /// Id of the first use, or `INVALID_ID` if the value is never used.
    first_use: u32,
    /// Result location; meaningful only for value kinds.
    result: Operand,
    /// Spill slot assigned when the value was pushed to the stack.
    spill: Option<i32>,
    /// How many scratch registers the node needs.
    num_temporaries: u8,
    /// Scratch registers handed out by the allocator.
    temporaries: RegList,
    /// For forward control nodes: the next unconditional control transfer
    /// every execution path must cross.
    next_post_dominating_hole: Option<NodeId>,
}

impl Node {
    /// Create a node. Result policy applies to value kinds only.
    pub fn new(id: NodeId, kind: NodeKind, inputs: SmallVec<[Input; 2]>, result: Policy) -> Self {
        let properties = match kind {
            NodeKind::Call => NodeProperties {
                is_call: true,
                can_deopt: true,
            },
            _ => NodeProperties::default(),
        };
        Node {
            id,
            kind,
            inputs,
            properties,
            live_range: LiveRange {
                start: id.raw(),
                end: id.raw(),
            },
            first_use: INVALID_ID,
            result: Operand::Unallocated(result),
            spill: None,
            num_temporaries: 0,
            temporaries: RegList::EMPTY,
            next_post_dominating_hole: None,
        }
    }

    /// Node id.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Node kind.
    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Use edges.
    #[inline]
    pub fn inputs(&self) -> &[Input] {
        &self.inputs
    }

    /// Mutable use edges.
    #[inline]
    pub fn inputs_mut(&mut self) -> &mut [Input] {
        &mut self.inputs
    }

    /// The `i`-th use edge.
    #[inline]
    pub fn input(&self, i: usize) -> &Input {
        &self.inputs[i]
    }

    /// Append a use edge (loop-phi back-edge wiring).
    #[inline]
    pub(crate) fn add_input(&mut self, input: Input) {
        self.inputs.push(input);
    }

    /// Allocation-relevant properties.
    #[inline]
    pub fn properties(&self) -> NodeProperties {
        self.properties
    }

    /// Override the default properties (testing and builder use).
    #[inline]
    pub fn set_properties(&mut self, properties: NodeProperties) {
        self.properties = properties;
    }

    /// Definition/last-use range.
    #[inline]
    pub fn live_range(&self) -> LiveRange {
        self.live_range
    }

    /// Extend the live range to a new last use.
    #[inline]
    pub fn record_use(&mut self, use_id: u32) {
        debug_assert!(use_id >= self.live_range.end);
        if self.first_use == INVALID_ID {
            self.first_use = use_id;
        }
        self.live_range.end = use_id;
    }

    /// Id of the first use, or `INVALID_ID` if unused.
    #[inline]
    pub fn first_use(&self) -> u32 {
        self.first_use
    }

    /// Result operand.
    #[inline]
    pub fn result(&self) -> Operand {
        self.result
    }

    /// Assign the result location.
    #[inline]
    pub fn set_result_location(&mut self, location: AllocatedOperand) {
        self.result = Operand::Allocated(location);
    }

    /// Spill slot, if the value was spilled.
    #[inline]
    pub fn spill_slot(&self) -> Option<i32> {
        self.spill
    }

    /// Whether a spill slot was assigned.
    #[inline]
    pub fn is_spilled(&self) -> bool {
        self.spill.is_some()
    }

    /// Record the spill slot the value was pushed to.
    #[inline]
    pub fn set_spill_slot(&mut self, slot: i32) {
        self.spill = Some(slot);
    }

    /// Scratch registers requested.
    #[inline]
    pub fn num_temporaries_needed(&self) -> u8 {
        self.num_temporaries
    }

    /// Request `n` scratch registers.
    #[inline]
    pub fn set_num_temporaries_needed(&mut self, n: u8) {
        self.num_temporaries = n;
    }

    /// Scratch registers assigned by the allocator.
    #[inline]
    pub fn temporaries(&self) -> RegList {
        self.temporaries
    }

    /// Hand the node its scratch registers.
    #[inline]
    pub fn assign_temporaries(&mut self, regs: RegList) {
        self.temporaries = regs;
    }

    /// Next post-dominating hole (control nodes only).
    #[inline]
    pub fn next_post_dominating_hole(&self) -> Option<NodeId> {
        self.next_post_dominating_hole
    }

    /// Set the next post-dominating hole.
    #[inline]
    pub fn set_next_post_dominating_hole(&mut self, hole: Option<NodeId>) {
        debug_assert!(self.kind.is_control());
        self.next_post_dominating_hole = hole;
    }
}
