//! Lowering the allocated graph to a pseudo-op stream.
//!
//! Instruction selection and encoding belong to the back-end; this pass
//! walks the allocated graph and produces `MachineOp`s — typed, position-
//! stable ops a back-end (or a test) can consume directly. Its real job is
//! everything around the per-node lowering: frame setup, register-merge and
//! phi gap moves on block edges, spill stores after definitions, call
//! safepoints, and the deferred-code tail.

use kestrel_core::Flags;

use crate::ir::graph::Graph;
use crate::ir::node::{BinOp, BlockId, NodeId, NodeKind};
use crate::ir::operand::AllocatedOperand;
use crate::regalloc::hole::is_fallthrough;

use super::processor::{GraphProcessor, NodeProcessor};
use super::state::{
    safepoint_index_for_stack_slot, CodeGenState, Label, SafepointEntry,
};

// =============================================================================
// Machine Ops
// =============================================================================

/// One pseudo-instruction in the emitted stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineOp {
    /// Debug trap.
    Break,
    /// Frame prologue: push fixed slots, reserve and zero `stack_slots`.
    EnterFrame {
        /// Spill slots to reserve.
        stack_slots: u32,
    },
    /// Emission-order comment.
    Comment(String),
    /// Bind a label at this position.
    Bind(Label),
    /// Move between two allocated locations (slot-to-slot goes through the
    /// scratch register).
    Move {
        /// Source location.
        source: AllocatedOperand,
        /// Destination location.
        target: AllocatedOperand,
    },
    /// Materialize a constant.
    LoadImmediate {
        /// Destination location.
        target: AllocatedOperand,
        /// Tagged immediate.
        value: i64,
    },
    /// Two-operand arithmetic.
    Binary {
        /// The operation.
        op: BinOp,
        /// Left operand.
        lhs: AllocatedOperand,
        /// Right operand.
        rhs: AllocatedOperand,
        /// Destination.
        target: AllocatedOperand,
    },
    /// Call into the runtime.
    CallRuntime {
        /// Argument locations.
        args: Vec<AllocatedOperand>,
        /// Result location.
        target: AllocatedOperand,
    },
    /// Unconditional branch.
    Jump {
        /// Branch target.
        label: Label,
    },
    /// Conditional branch.
    Branch {
        /// Condition location.
        condition: AllocatedOperand,
        /// Taken target.
        if_true: Label,
        /// Not-taken target.
        if_false: Label,
    },
    /// Function epilogue and return.
    Return,
}

/// The finished output of one code-generation pass.
#[derive(Debug)]
pub struct CodeArtifact {
    /// The emitted op stream.
    pub ops: Vec<MachineOp>,
    /// Safepoints, in emission order.
    pub safepoints: Vec<SafepointEntry>,
    /// Spill slots used by the frame.
    pub stack_slots: u32,
}

/// Lower an allocated graph to a `CodeArtifact`.
pub fn generate(graph: &Graph, flags: &Flags) -> CodeArtifact {
    let state = CodeGenState::new(flags.clone(), graph.stack_slots());
    let mut driver = GraphProcessor::new(CodeGeneratingProcessor {
        state,
        block_labels: Vec::new(),
        current_block: BlockId(0),
    });
    driver.process_graph(graph);
    let processor = driver.into_inner();
    let stack_slots = processor.state.vreg_slots();
    let (ops, safepoints) = processor.state.finish();
    CodeArtifact {
        ops,
        safepoints: safepoints.entries().to_vec(),
        stack_slots,
    }
}

// =============================================================================
// Code Generating Processor
// =============================================================================

struct CodeGeneratingProcessor {
    state: CodeGenState,
    block_labels: Vec<Label>,
    current_block: BlockId,
}

impl CodeGeneratingProcessor {
    fn block_label(&self, block: BlockId) -> Label {
        self.block_labels[block.index()]
    }

    /// Emit the register-merge and phi moves this edge owes its target.
    fn emit_edge_moves(&mut self, graph: &Graph, target: BlockId) {
        let Some(state) = graph.block(target).state() else {
            self.state
                .comment(|| "--   target has no state, must be a fallthrough".to_string());
            return;
        };
        let predecessor_id = graph.block(self.current_block).predecessor_id();

        self.state.comment(|| "--   register merge gap moves:".to_string());
        for (index, entry) in state.registers().iter().enumerate() {
            if let Some(merge) = entry.merge() {
                let source = merge.operand(predecessor_id);
                let target_op =
                    AllocatedOperand::Register(crate::ir::operand::Reg::new(index as u8));
                if source != target_op {
                    self.state
                        .comment(|| format!("--   * {source} → {target_op}"));
                    self.state.emit(MachineOp::Move {
                        source,
                        target: target_op,
                    });
                }
            }
        }

        if graph.block(target).has_phi() {
            self.state.comment(|| "--   phi gap moves:".to_string());
            for &phi in graph.block(target).phis() {
                let source = graph
                    .node(phi)
                    .input(predecessor_id as usize)
                    .operand
                    .allocated()
                    .expect("phi inputs are injected by the allocator");
                let target_op = graph
                    .node(phi)
                    .result()
                    .allocated()
                    .expect("phi results are allocated");
                if source != target_op {
                    self.state
                        .comment(|| format!("--   * {source} → {target_op} ({phi})"));
                    self.state.emit(MachineOp::Move {
                        source,
                        target: target_op,
                    });
                }
            }
        }
    }

    fn lower(&mut self, graph: &Graph, node: NodeId) {
        match graph.node(node).kind() {
            // Already sitting in its incoming frame slot.
            NodeKind::InitialValue { .. } => {}
            // Phi moves are emitted on the predecessor edges.
            NodeKind::Phi => {}
            NodeKind::Constant { value } => {
                let target = graph.node(node).result().allocated().expect("allocated");
                self.state.emit(MachineOp::LoadImmediate { target, value });
            }
            NodeKind::GapMove { source, target } => {
                self.state.emit(MachineOp::Move { source, target });
            }
            NodeKind::Binary { op } => {
                let n = graph.node(node);
                self.state.emit(MachineOp::Binary {
                    op,
                    lhs: n.input(0).operand.allocated().expect("allocated"),
                    rhs: n.input(1).operand.allocated().expect("allocated"),
                    target: n.result().allocated().expect("allocated"),
                });
            }
            NodeKind::Call => {
                let n = graph.node(node);
                let args = n
                    .inputs()
                    .iter()
                    .map(|i| i.operand.allocated().expect("allocated"))
                    .collect();
                let target = n.result().allocated().expect("allocated");
                self.state.emit(MachineOp::CallRuntime { args, target });
                // Placeholder safepoint: every frame slot is tagged.
                let position = self.state.position();
                let slots = self.state.vreg_slots();
                let safepoint = self.state.safepoints_mut().define_safepoint(position);
                for slot in 0..slots {
                    self.state
                        .safepoints_mut()
                        .define_tagged_stack_slot(safepoint, safepoint_index_for_stack_slot(slot));
                }
            }
            NodeKind::Jump { target } => {
                // Fallthrough jumps need no branch.
                if !is_fallthrough(graph, node, target) {
                    let label = self.block_label(target);
                    self.state.emit(MachineOp::Jump { label });
                }
            }
            NodeKind::JumpLoop { target } => {
                let label = self.block_label(target);
                self.state.emit(MachineOp::Jump { label });
            }
            NodeKind::Branch { if_true, if_false } => {
                let condition = graph
                    .node(node)
                    .input(0)
                    .operand
                    .allocated()
                    .expect("allocated");
                self.state.emit(MachineOp::Branch {
                    condition,
                    if_true: self.block_label(if_true),
                    if_false: self.block_label(if_false),
                });
            }
            NodeKind::Return => {
                self.state.emit(MachineOp::Return);
            }
        }
    }
}

impl NodeProcessor for CodeGeneratingProcessor {
    fn pre_process_graph(&mut self, graph: &Graph) {
        if self.state.flags().break_on_entry {
            self.state.emit(MachineOp::Break);
        }
        self.state.emit(MachineOp::EnterFrame {
            stack_slots: graph.stack_slots(),
        });

        // One placeholder safepoint covering the whole frame, defined up
        // front; real per-site safepoint data arrives with deopt support.
        let position = self.state.position();
        let slots = self.state.vreg_slots();
        let safepoint = self.state.safepoints_mut().define_safepoint(position);
        for slot in 0..slots {
            self.state
                .safepoints_mut()
                .define_tagged_stack_slot(safepoint, safepoint_index_for_stack_slot(slot));
        }

        self.block_labels = (0..graph.num_blocks())
            .map(|_| self.state.new_label())
            .collect();
    }

    fn post_process_graph(&mut self, _graph: &Graph) {
        self.state.emit_deferred_code();
    }

    fn pre_process_block(&mut self, _graph: &Graph, block: BlockId) {
        self.current_block = block;
        self.state.comment(|| format!("-- Block {block}"));
        let label = self.block_label(block);
        self.state.bind(label);
    }

    fn process(&mut self, graph: &Graph, node: NodeId) {
        self.state
            .comment(|| format!("--   {}: {}", node, kind_name(&graph.node(node).kind())));

        // Emit phi and register-merge moves before leaving the block.
        if let Some(target) = graph.node(node).kind().unconditional_target() {
            self.emit_edge_moves(graph, target);
        }

        self.lower(graph, node);

        // Store freshly defined values that the allocator decided to keep
        // on the stack as well.
        let n = graph.node(node);
        if n.kind().is_value() && n.is_spilled() {
            let source = n.result().allocated().expect("allocated");
            if let Some(slot) = n.spill_slot() {
                if source != AllocatedOperand::Slot(slot) {
                    self.state.comment(|| "--   spill:".to_string());
                    self.state.emit(MachineOp::Move {
                        source,
                        target: AllocatedOperand::Slot(slot),
                    });
                }
            }
        }
    }
}

fn kind_name(kind: &NodeKind) -> &'static str {
    match kind {
        NodeKind::InitialValue { .. } => "InitialValue",
        NodeKind::Constant { .. } => "Constant",
        NodeKind::Phi => "Phi",
        NodeKind::Binary { .. } => "Binary",
        NodeKind::Call => "Call",
        NodeKind::GapMove { .. } => "GapMove",
        NodeKind::Jump { .. } => "Jump",
        NodeKind::JumpLoop { .. } => "JumpLoop",
        NodeKind::Branch { .. } => "Branch",
        NodeKind::Return => "Return",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::node::BinOp;
    use crate::ir::operand::Policy;
    use crate::regalloc::StraightForwardAllocator;

    fn lower_straight_line(flags: &Flags) -> CodeArtifact {
        let mut b = GraphBuilder::new();
        let b0 = b.reserve_block();
        let b1 = b.reserve_block();
        b.enter_block(b0);
        let v0 = b.constant(1);
        let v1 = b.binary(BinOp::Add, v0, v0, Policy::MustHaveRegister);
        b.jump(b1);
        b.enter_block(b1);
        b.ret(v1);
        let mut graph = b.build();
        StraightForwardAllocator::new(flags, None).allocate(&mut graph);
        generate(&graph, flags)
    }

    #[test]
    fn test_frame_setup_and_return() {
        let flags = Flags::default();
        let artifact = lower_straight_line(&flags);

        assert!(matches!(artifact.ops[0], MachineOp::EnterFrame { stack_slots: 0 }));
        assert!(matches!(artifact.ops.last(), Some(MachineOp::Return)));
        assert_eq!(artifact.stack_slots, 0);
        // The up-front placeholder safepoint exists even with no slots.
        assert_eq!(artifact.safepoints.len(), 1);
        assert!(artifact.safepoints[0].tagged_slots.is_empty());
    }

    #[test]
    fn test_break_on_entry() {
        let mut flags = Flags::default();
        flags.break_on_entry = true;
        let artifact = lower_straight_line(&flags);
        assert!(matches!(artifact.ops[0], MachineOp::Break));
    }

    #[test]
    fn test_fallthrough_jump_emits_no_branch() {
        let flags = Flags::default();
        let artifact = lower_straight_line(&flags);
        // b0's jump to b1 is a fallthrough: ids are contiguous, so no Jump
        // op may appear.
        assert!(!artifact.ops.iter().any(|op| matches!(op, MachineOp::Jump { .. })));
    }

    #[test]
    fn test_code_comments() {
        let mut flags = Flags::default();
        flags.code_comments = true;
        let artifact = lower_straight_line(&flags);
        assert!(artifact
            .ops
            .iter()
            .any(|op| matches!(op, MachineOp::Comment(c) if c.contains("Block b0"))));
        assert!(artifact
            .ops
            .iter()
            .any(|op| matches!(op, MachineOp::Comment(c) if c.contains("Constant"))));
    }

    #[test]
    fn test_call_defines_safepoint() {
        let flags = Flags::default();
        let mut b = GraphBuilder::new();
        let b0 = b.reserve_block();
        b.enter_block(b0);
        let v0 = b.constant(7);
        let c = b.call(&[v0]);
        b.ret(c);
        let mut graph = b.build();
        StraightForwardAllocator::new(&flags, None).allocate(&mut graph);
        let artifact = generate(&graph, &flags);

        // Preamble safepoint plus one at the call.
        assert_eq!(artifact.safepoints.len(), 2);
        let call_safepoint = &artifact.safepoints[1];
        for (i, index) in call_safepoint.tagged_slots.iter().enumerate() {
            assert_eq!(*index, safepoint_index_for_stack_slot(i as u32));
        }
    }
}
