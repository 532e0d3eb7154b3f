//! Graph construction.
//!
//! The builder assigns node ids monotonically in program order, maintains
//! per-value use chains (live range end plus per-input next-use links), and
//! wires predecessor bookkeeping so merge blocks know how many edges enter
//! them and in which order.
//!
//! Blocks are reserved up front (so forward branches can name them) and
//! must be entered in reservation order; that is what keeps ids monotone
//! across blocks.
//!
//! CFG shape requirements, matching what the allocator expects:
//! - every `jump`/`jump_loop` target carries a merge-point register
//!   snapshot, as does every non-fallthrough `branch` target;
//! - blocks with phis are entered only by unconditional edges (conditional
//!   predecessors must be split through an empty block);
//! - a loop phi's back-edge input is attached with `bind_loop_phi` and
//!   resolved when the back edge is sealed;
//! - a value flowing into a phi along predecessor `j` must not have other
//!   uses after predecessor `j`'s control node (uses are recorded in
//!   ascending id order);
//! - a value live across a loop back edge must flow through a loop phi;
//!   linear live ranges cannot express loop-carried liveness directly.

use rustc_hash::FxHashMap;
use smallvec::{smallvec, SmallVec};

use super::graph::Graph;
use super::node::{BinOp, BlockId, Input, Node, NodeId, NodeKind};
use super::operand::{Policy, Reg};

/// Incremental graph builder.
pub struct GraphBuilder {
    graph: Graph,
    current: Option<BlockId>,
    next_to_enter: u32,
    /// Predecessor blocks of each block, in edge order.
    predecessors: Vec<Vec<BlockId>>,
    /// For each live value: the (owner node, input index) of its latest
    /// use, so a newer use can backpatch that input's next-use link.
    last_use_slot: FxHashMap<NodeId, (NodeId, usize)>,
    /// Loop-phi inputs waiting for the back edge to be sealed.
    pending_loop_inputs: Vec<(NodeId, NodeId)>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// A fresh builder.
    pub fn new() -> Self {
        GraphBuilder {
            graph: Graph::new(),
            current: None,
            next_to_enter: 0,
            predecessors: Vec::new(),
            last_use_slot: FxHashMap::default(),
            pending_loop_inputs: Vec::new(),
        }
    }

    /// Reserve a block id for later entry.
    pub fn reserve_block(&mut self) -> BlockId {
        self.predecessors.push(Vec::new());
        self.graph.add_block()
    }

    /// Start filling a reserved block. Blocks must be entered in
    /// reservation order.
    pub fn enter_block(&mut self, block: BlockId) {
        assert!(self.current.is_none(), "previous block not sealed");
        assert_eq!(block.0, self.next_to_enter, "blocks must be entered in order");
        self.next_to_enter += 1;
        self.current = Some(block);
    }

    // =========================================================================
    // Value nodes
    // =========================================================================

    /// An incoming value loaded from a fixed frame slot (negative index
    /// for arguments).
    pub fn initial_value(&mut self, slot: i32) -> NodeId {
        assert!(slot < 0, "initial values name incoming-argument slots");
        self.add_value(NodeKind::InitialValue { slot }, smallvec![], Policy::FixedSlot(slot))
    }

    /// A materialized constant.
    pub fn constant(&mut self, value: i64) -> NodeId {
        self.add_value(NodeKind::Constant { value }, smallvec![], Policy::MustHaveRegister)
    }

    /// A two-input operation. Both inputs must reach registers.
    pub fn binary(&mut self, op: BinOp, lhs: NodeId, rhs: NodeId, result: Policy) -> NodeId {
        let id = self.graph.next_node_id();
        let inputs = self.make_inputs(
            &[
                (lhs, Policy::MustHaveRegister, id),
                (rhs, Policy::MustHaveRegister, id),
            ],
            id,
            0,
        );
        self.add_value(NodeKind::Binary { op }, inputs, result)
    }

    /// A runtime call. Clobbers all registers; arguments may come from
    /// anywhere; the result lands in the call-return register.
    pub fn call(&mut self, args: &[NodeId]) -> NodeId {
        let id = self.graph.next_node_id();
        let specs: Vec<_> = args
            .iter()
            .map(|&a| (a, Policy::RegisterOrSlot, id))
            .collect();
        let inputs = self.make_inputs(&specs, id, 0);
        self.add_value(NodeKind::Call, inputs, Policy::FixedRegister(Reg::new(0)))
    }

    /// A phi at the entry of the current (merge) block, with one input per
    /// already-sealed predecessor, in predecessor order.
    pub fn phi(&mut self, inputs: &[NodeId]) -> NodeId {
        let block = self.current.expect("no current block");
        assert!(
            self.graph.block(block).nodes().is_empty(),
            "phis must precede body nodes"
        );
        let id = self.graph.next_node_id();
        let specs: Vec<_> = inputs
            .iter()
            .enumerate()
            .map(|(j, &value)| {
                let pred = self.predecessors[block.index()]
                    .get(j)
                    .copied()
                    .expect("phi input without a sealed predecessor");
                let use_position = self.graph.node(self.graph.block(pred).control()).id();
                (value, Policy::RegisterOrSlot, use_position)
            })
            .collect();
        let edges = self.make_inputs(&specs, id, 0);
        let node = Node::new(id, NodeKind::Phi, edges, Policy::RegisterOrSlot);
        self.graph.add_node(node);
        self.graph.block_mut(block).add_phi(id);
        id
    }

    /// Attach a loop phi's back-edge input. The use is recorded when the
    /// enclosing `jump_loop` seals the back edge.
    pub fn bind_loop_phi(&mut self, phi: NodeId, value: NodeId) {
        debug_assert!(matches!(self.graph.node(phi).kind(), NodeKind::Phi));
        self.pending_loop_inputs.push((phi, value));
    }

    /// Request scratch registers for a node.
    pub fn set_temporaries_needed(&mut self, node: NodeId, count: u8) {
        self.graph.node_mut(node).set_num_temporaries_needed(count);
    }

    /// Mark a node as able to deoptimize.
    pub fn mark_can_deopt(&mut self, node: NodeId) {
        let mut props = self.graph.node(node).properties();
        props.can_deopt = true;
        self.graph.node_mut(node).set_properties(props);
    }

    // =========================================================================
    // Control nodes
    // =========================================================================

    /// Seal the current block with an unconditional jump.
    pub fn jump(&mut self, target: BlockId) {
        let control = self.control_node(NodeKind::Jump { target }, smallvec![]);
        self.seal_with_edge(control, target);
    }

    /// Seal the current block with a loop back-edge.
    pub fn jump_loop(&mut self, target: BlockId) {
        let control_id = self.graph.next_node_id();
        // Resolve pending loop-phi inputs; the back edge is their use site.
        let pending = std::mem::take(&mut self.pending_loop_inputs);
        for (phi, value) in pending {
            // The appended input lands at the phi's current input count.
            let slot = self.graph.node(phi).inputs().len();
            let inputs =
                self.make_inputs(&[(value, Policy::RegisterOrSlot, control_id)], phi, slot);
            self.graph.node_mut(phi).add_input(inputs[0]);
        }
        let control = self.control_node(NodeKind::JumpLoop { target }, smallvec![]);
        debug_assert_eq!(control, control_id);
        self.seal_with_edge(control, target);
    }

    /// Seal the current block with a conditional branch.
    pub fn branch(&mut self, condition: NodeId, if_true: BlockId, if_false: BlockId) {
        let id = self.graph.next_node_id();
        let inputs = self.make_inputs(&[(condition, Policy::MustHaveRegister, id)], id, 0);
        let control = self.control_node(NodeKind::Branch { if_true, if_false }, inputs);
        let block = self.current.take().expect("no current block");
        self.graph.block_mut(block).seal(control);
        for target in [if_true, if_false] {
            self.predecessors[target.index()].push(block);
            self.graph.block_mut(target).record_predecessor();
            // Fallthrough successors are entered linearly; everything else
            // needs a snapshot to restore registers from.
            if target.0 != block.0 + 1 {
                self.graph.block_mut(target).ensure_state();
            }
        }
    }

    /// Seal the current block with a return of `value` in the return
    /// register.
    pub fn ret(&mut self, value: NodeId) {
        let id = self.graph.next_node_id();
        let inputs = self.make_inputs(&[(value, Policy::FixedRegister(Reg::new(0)), id)], id, 0);
        let control = self.control_node(NodeKind::Return, inputs);
        let block = self.current.take().expect("no current block");
        self.graph.block_mut(block).seal(control);
    }

    /// Seal the current block with a value-less return.
    pub fn ret_void(&mut self) {
        let control = self.control_node(NodeKind::Return, smallvec![]);
        let block = self.current.take().expect("no current block");
        self.graph.block_mut(block).seal(control);
    }

    /// Finish construction.
    pub fn build(mut self) -> Graph {
        assert!(self.current.is_none(), "last block not sealed");
        assert!(self.pending_loop_inputs.is_empty(), "unbound loop phi inputs");
        // Empty blocks forward their predecessors' merges to their jump
        // target instead of owning a snapshot.
        for block in self.graph.block_ids().collect::<Vec<_>>() {
            if self.graph.is_empty_block(block) {
                self.graph.block_mut(block).take_state();
            }
        }
        #[cfg(debug_assertions)]
        for block in self.graph.block_ids() {
            for &phi in self.graph.block(block).phis() {
                debug_assert_eq!(
                    self.graph.node(phi).inputs().len() as u32,
                    self.graph.block(block).predecessor_count(),
                    "phi input count must match predecessor count"
                );
            }
        }
        self.graph
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn add_value(
        &mut self,
        kind: NodeKind,
        inputs: SmallVec<[Input; 2]>,
        result: Policy,
    ) -> NodeId {
        let block = self.current.expect("no current block");
        let id = self.graph.next_node_id();
        let node = Node::new(id, kind, inputs, result);
        self.graph.add_node(node);
        self.graph.block_mut(block).push_node(id);
        id
    }

    fn control_node(&mut self, kind: NodeKind, inputs: SmallVec<[Input; 2]>) -> NodeId {
        let id = self.graph.next_node_id();
        let node = Node::new(id, kind, inputs, Policy::RegisterOrSlot);
        self.graph.add_node(node)
    }

    fn seal_with_edge(&mut self, control: NodeId, target: BlockId) {
        let block = self.current.take().expect("no current block");
        self.graph.block_mut(block).seal(control);
        self.predecessors[target.index()].push(block);
        let pred_id = self.graph.block_mut(target).record_predecessor();
        self.graph.block_mut(block).set_predecessor_id(pred_id);
        self.graph.block_mut(target).ensure_state();
    }

    /// Build `owner`'s use edges from `(value, policy, use position)`
    /// specs, numbering slots from `base_slot`. For phis the owner is the
    /// phi while each use position is a predecessor's control node.
    ///
    /// Updates every value's live range and backpatches its previous use's
    /// next-use link — in the arena, or in the edges built so far when the
    /// previous use belongs to the node still being assembled.
    fn make_inputs(
        &mut self,
        specs: &[(NodeId, Policy, NodeId)],
        owner: NodeId,
        base_slot: usize,
    ) -> SmallVec<[Input; 2]> {
        let mut inputs: SmallVec<[Input; 2]> = SmallVec::new();
        for (i, &(value, policy, use_position)) in specs.iter().enumerate() {
            self.graph.node_mut(value).record_use(use_position.raw());
            if let Some(&(prev_owner, prev_slot)) = self.last_use_slot.get(&value) {
                if prev_owner == self.graph.next_node_id() {
                    // Previous use is an earlier input of this same node.
                    inputs[prev_slot - base_slot].next_use_id = use_position.raw();
                } else {
                    self.graph.node_mut(prev_owner).inputs_mut()[prev_slot].next_use_id =
                        use_position.raw();
                }
            }
            self.last_use_slot.insert(value, (owner, base_slot + i));
            inputs.push(Input::new(value, policy));
        }
        inputs
    }
}
