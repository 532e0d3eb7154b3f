//! Graph-walking driver for code-generation-style passes.
//!
//! A `GraphProcessor` visits every block in program order and every node
//! within it (phis, body nodes, then the control node), dispatching to a
//! `NodeProcessor`. Passes implement only the hooks they care about.

use crate::ir::graph::Graph;
use crate::ir::node::{BlockId, NodeId};

/// Hooks invoked by `GraphProcessor`.
pub trait NodeProcessor {
    /// Called once before any block.
    fn pre_process_graph(&mut self, _graph: &Graph) {}

    /// Called once after the last block.
    fn post_process_graph(&mut self, _graph: &Graph) {}

    /// Called before each block's nodes.
    fn pre_process_block(&mut self, _graph: &Graph, _block: BlockId) {}

    /// Called for every phi, body node, and control node, in order.
    fn process(&mut self, graph: &Graph, node: NodeId);
}

/// Drives a `NodeProcessor` over a graph.
pub struct GraphProcessor<P> {
    processor: P,
}

impl<P: NodeProcessor> GraphProcessor<P> {
    /// Wrap a processor.
    pub fn new(processor: P) -> Self {
        GraphProcessor { processor }
    }

    /// Walk the whole graph.
    pub fn process_graph(&mut self, graph: &Graph) {
        self.processor.pre_process_graph(graph);
        for block in graph.block_ids() {
            self.processor.pre_process_block(graph, block);
            for &phi in graph.block(block).phis() {
                self.processor.process(graph, phi);
            }
            for &node in graph.block(block).nodes() {
                self.processor.process(graph, node);
            }
            self.processor.process(graph, graph.block(block).control());
        }
        self.processor.post_process_graph(graph);
    }

    /// Recover the processor after the walk.
    pub fn into_inner(self) -> P {
        self.processor
    }
}
