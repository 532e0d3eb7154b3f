//! Post-dominating hole analysis.
//!
//! Control flow which interrupts linear block-to-block fallthrough is a
//! control-flow "hole": a non-fallthrough jump, a branch merge point, or a
//! terminator. For each forward control node we compute the next hole that
//! every concrete execution must cross on its way to an exit — the
//! transitive closure of the post-dominator tree, cut off at holes.
//!
//! Fallthrough jumps are transparent: they point at the nearest hole in
//! their own `next_post_dominating_hole` field rather than being holes
//! themselves. Since we only care about forward control, loop back-edges
//! are treated like returns and terminate every chain.

use crate::ir::graph::Graph;
use crate::ir::node::{BlockId, NodeId, NodeKind};

/// A jump is a fallthrough of its block when its target starts at the very
/// next id; no machine branch is needed there.
pub fn is_fallthrough(graph: &Graph, control: NodeId, target: BlockId) -> bool {
    graph.node(control).id().raw() + 1 == graph.first_id(target)
}

/// The nearest hole at or after `node`.
///
/// Conditional control nodes do not cause holes themselves, and neither do
/// fallthrough jumps; both defer to their own next post-dominating hole.
pub fn nearest_post_dominating_hole(graph: &Graph, node: NodeId) -> NodeId {
    match graph.node(node).kind() {
        NodeKind::Branch { .. } => graph
            .node(node)
            .next_post_dominating_hole()
            .expect("branch holes are computed before their predecessors"),
        NodeKind::Jump { target } if is_fallthrough(graph, node, target) => graph
            .node(node)
            .next_post_dominating_hole()
            .expect("fallthrough jump holes are computed before their predecessors"),
        _ => node,
    }
}

/// Compute `next_post_dominating_hole` for every forward control node.
///
/// Walks blocks in reverse program order so every successor's chain exists
/// before its predecessors ask for it. Returns and loop back-edges are left
/// without a hole; they terminate chains.
pub fn compute_post_dominating_holes(graph: &mut Graph) {
    for block in graph.block_ids().rev() {
        let control = graph.block(block).control();
        match graph.node(control).kind() {
            NodeKind::Jump { target } => {
                let target_control = graph.block(target).control();
                let hole = nearest_post_dominating_hole(graph, target_control);
                graph.node_mut(control).set_next_post_dominating_hole(Some(hole));
            }
            NodeKind::Branch { if_true, if_false } => {
                let mut first =
                    nearest_post_dominating_hole(graph, graph.block(if_true).control());
                let mut second =
                    nearest_post_dominating_hole(graph, graph.block(if_false).control());

                // Walk both chains in lock step, always advancing the side
                // that is higher in the program, until they meet at the
                // merge or the advancing side runs into a terminator — in
                // which case the other side's current node is the hole.
                while first != second {
                    if first > second {
                        std::mem::swap(&mut first, &mut second);
                    }
                    if graph.node(first).kind().is_terminator() {
                        first = second;
                        break;
                    }
                    first = graph
                        .node(first)
                        .next_post_dominating_hole()
                        .expect("forward hole chain ends in a terminator");
                }
                graph.node_mut(control).set_next_post_dominating_hole(Some(first));
            }
            // Return and JumpLoop terminate chains.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::builder::GraphBuilder;
    use crate::ir::node::BinOp;
    use crate::ir::operand::Policy;

    #[test]
    fn test_straight_line_jump_points_at_return() {
        let mut b = GraphBuilder::new();
        let b0 = b.reserve_block();
        let b1 = b.reserve_block();
        b.enter_block(b0);
        let v = b.constant(1);
        b.jump(b1);
        b.enter_block(b1);
        b.ret(v);
        let mut graph = b.build();

        compute_post_dominating_holes(&mut graph);

        let jump = graph.block(b0).control();
        let ret = graph.block(b1).control();
        assert_eq!(graph.node(jump).next_post_dominating_hole(), Some(ret));
        assert_eq!(graph.node(ret).next_post_dominating_hole(), None);
    }

    #[test]
    fn test_diamond_branch_hole_is_merge_jump_chain() {
        // b0: branch -> b1 (fallthrough) / b2; both jump to b3 (return).
        let mut b = GraphBuilder::new();
        let b0 = b.reserve_block();
        let b1 = b.reserve_block();
        let b2 = b.reserve_block();
        let b3 = b.reserve_block();

        b.enter_block(b0);
        let c = b.constant(0);
        b.branch(c, b1, b2);

        b.enter_block(b1);
        let x = b.binary(BinOp::Add, c, c, Policy::MustHaveRegister);
        b.jump(b3);

        b.enter_block(b2);
        let y = b.binary(BinOp::Sub, c, c, Policy::MustHaveRegister);
        b.jump(b3);

        b.enter_block(b3);
        let p = b.phi(&[x, y]);
        b.ret(p);

        let mut graph = b.build();
        compute_post_dominating_holes(&mut graph);

        let branch = graph.block(b0).control();
        let jump_left = graph.block(b1).control();
        let jump_right = graph.block(b2).control();
        let ret = graph.block(b3).control();

        // The left jump crosses b2, so it is a hole; the right jump falls
        // through into b3 and defers to the return.
        assert_eq!(graph.node(branch).next_post_dominating_hole(), Some(ret));
        assert_eq!(graph.node(jump_left).next_post_dominating_hole(), Some(ret));
        assert_eq!(graph.node(jump_right).next_post_dominating_hole(), Some(ret));
        assert!(!is_fallthrough(&graph, jump_left, b3));
        assert!(is_fallthrough(&graph, jump_right, b3));
    }

    #[test]
    fn test_branch_over_loop_terminates_at_other_side() {
        // b0: branch -> b1 (loop) / b2 (exit). The loop side never reaches
        // a merge, so the branch's hole is the exit side's chain.
        let mut b = GraphBuilder::new();
        let b0 = b.reserve_block();
        let b1 = b.reserve_block();
        let b2 = b.reserve_block();

        b.enter_block(b0);
        let c = b.constant(0);
        b.branch(c, b1, b2);

        b.enter_block(b1);
        let p = b.phi(&[c]);
        b.bind_loop_phi(p, p);
        b.jump_loop(b1);

        b.enter_block(b2);
        b.ret(c);

        let mut graph = b.build();
        compute_post_dominating_holes(&mut graph);

        let branch = graph.block(b0).control();
        let ret = graph.block(b2).control();
        assert_eq!(graph.node(branch).next_post_dominating_hole(), Some(ret));
    }

    #[test]
    fn test_hole_ids_increase() {
        let mut b = GraphBuilder::new();
        let b0 = b.reserve_block();
        let b1 = b.reserve_block();
        let b2 = b.reserve_block();
        b.enter_block(b0);
        let c = b.constant(0);
        b.branch(c, b1, b2);
        b.enter_block(b1);
        b.jump(b2);
        b.enter_block(b2);
        b.ret(c);
        let mut graph = b.build();
        compute_post_dominating_holes(&mut graph);

        for block in graph.block_ids() {
            let control = graph.block(block).control();
            if let Some(hole) = graph.node(control).next_post_dominating_hole() {
                assert!(hole.raw() > control.raw());
            }
        }
    }
}
