/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A self-contained, serializable snapshot of a compilation input.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{MetaAccessProvider, MethodInfo, Node, ScheduledGraph};
use crate::result::Assumption;
use crate::value::Kind;
use crate::{Block, MethodId};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct BlockData {
    succs: Vec<Block>,
    preds: Vec<Block>,
    probability: f64,
    is_exception_entry: bool,
    nodes: Vec<Node>,
}

/// A copy of a `ScheduledGraph` together with the metadata of every
/// method it calls.
#[derive(Clone, Serialize, Deserialize)]
pub struct SerializableGraph {
    method: MethodId,
    entry_block: Block,
    blocks: Vec<BlockData>,
    num_nodes: usize,
    parameter_kinds: Vec<Kind>,
    return_kind: Kind,
    entry_bci: Option<i32>,
    assumptions: Vec<Assumption>,
    methods: Vec<(MethodId, MethodInfo)>,
}

impl SerializableGraph {
    /// Creates a new `SerializableGraph` from an arbitrary graph and the
    /// metadata of the methods it references.
    pub fn new(graph: &impl ScheduledGraph, methods: Vec<(MethodId, MethodInfo)>) -> Self {
        Self {
            method: graph.method(),
            entry_block: graph.entry_block(),
            blocks: (0..graph.num_blocks())
                .map(|i| {
                    let block = Block::new(i);
                    BlockData {
                        succs: graph.block_succs(block).to_vec(),
                        preds: graph.block_preds(block).to_vec(),
                        probability: graph.block_probability(block),
                        is_exception_entry: graph.is_exception_entry(block),
                        nodes: graph.block_nodes(block).to_vec(),
                    }
                })
                .collect(),
            num_nodes: graph.num_nodes(),
            parameter_kinds: graph.parameter_kinds().to_vec(),
            return_kind: graph.return_kind(),
            entry_bci: graph.entry_bci(),
            assumptions: graph.assumptions(),
            methods,
        }
    }
}

impl ScheduledGraph for SerializableGraph {
    fn method(&self) -> MethodId {
        self.method
    }

    fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    fn entry_block(&self) -> Block {
        self.entry_block
    }

    fn block_succs(&self, block: Block) -> &[Block] {
        &self.blocks[block.index()].succs[..]
    }

    fn block_preds(&self, block: Block) -> &[Block] {
        &self.blocks[block.index()].preds[..]
    }

    fn block_nodes(&self, block: Block) -> &[Node] {
        &self.blocks[block.index()].nodes[..]
    }

    fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    fn block_probability(&self, block: Block) -> f64 {
        self.blocks[block.index()].probability
    }

    fn is_exception_entry(&self, block: Block) -> bool {
        self.blocks[block.index()].is_exception_entry
    }

    fn parameter_kinds(&self) -> &[Kind] {
        &self.parameter_kinds[..]
    }

    fn return_kind(&self) -> Kind {
        self.return_kind
    }

    fn entry_bci(&self) -> Option<i32> {
        self.entry_bci
    }

    fn assumptions(&self) -> Vec<Assumption> {
        self.assumptions.clone()
    }
}

impl MetaAccessProvider for SerializableGraph {
    fn method(&self, id: MethodId) -> Option<MethodInfo> {
        self.methods
            .iter()
            .find(|(m, _)| *m == id)
            .map(|(_, info)| info.clone())
    }
}

impl fmt::Debug for SerializableGraph {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{\n")?;
        write!(f, "  method: {:?} entry: {}\n", self.method, self.entry_block)?;
        write!(
            f,
            "  signature: {:?} -> {:?}\n",
            self.parameter_kinds, self.return_kind
        )?;
        if let Some(bci) = self.entry_bci {
            write!(f, "  entry bci: {}\n", bci)?;
        }
        for (id, info) in &self.methods {
            write!(f, "  callee {:?}: {}\n", id, info.name)?;
        }
        for (i, block) in self.blocks.iter().enumerate() {
            let succs = block.succs.iter().map(|b| b.index()).collect::<Vec<_>>();
            let preds = block.preds.iter().map(|b| b.index()).collect::<Vec<_>>();
            let handler = if block.is_exception_entry { " (handler)" } else { "" };
            write!(
                f,
                "  block{}{}: # succs:{:?} preds:{:?} p={}\n",
                i, handler, succs, preds, block.probability
            )?;
            for node in &block.nodes {
                write!(f, "    {} {}: {:?}\n", node.id, node.kind.type_char(), node.op)?;
            }
        }
        write!(f, "}}\n")?;
        Ok(())
    }
}
