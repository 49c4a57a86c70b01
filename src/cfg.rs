/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The control-flow graph of the method being compiled, with dominance
//! and natural-loop information.

use crate::bitvec::BitVec;
use crate::graph::ScheduledGraph;
use crate::domtree::DominatorTree;
use crate::{postorder, Block};
use smallvec::SmallVec;

define_index!(LoopIndex);

#[derive(Clone, Debug)]
pub struct BlockData {
    pub preds: SmallVec<[Block; 4]>,
    pub succs: SmallVec<[Block; 2]>,
    /// Relative execution frequency.
    pub probability: f64,
    pub is_exception_entry: bool,
    pub reachable: bool,
    /// Immediate dominator; invalid for the entry and unreachable blocks.
    pub dominator: Block,
    pub dominator_depth: u32,
    pub dominated: SmallVec<[Block; 4]>,
    /// Innermost loop containing the block.
    pub loop_index: Option<LoopIndex>,
    pub loop_depth: u32,
    pub is_loop_header: bool,
    /// Source of a back edge.
    pub is_loop_end: bool,
    /// Code for this block should start at an aligned address.
    pub align: bool,
    /// Position in the allocation order; -1 until ordered.
    pub linear_scan_number: i32,
    /// Created to split a critical edge.
    pub is_edge_split: bool,
}

impl BlockData {
    fn new(probability: f64) -> Self {
        BlockData {
            preds: SmallVec::new(),
            succs: SmallVec::new(),
            probability,
            is_exception_entry: false,
            reachable: false,
            dominator: Block::invalid(),
            dominator_depth: 0,
            dominated: SmallVec::new(),
            loop_index: None,
            loop_depth: 0,
            is_loop_header: false,
            is_loop_end: false,
            align: false,
            linear_scan_number: -1,
            is_edge_split: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Loop {
    pub header: Block,
    /// All blocks of the loop including nested loops, ascending.
    pub blocks: Vec<Block>,
    /// Sources of the back edges.
    pub ends: Vec<Block>,
    pub parent: Option<LoopIndex>,
    /// 1 for outermost loops.
    pub depth: u32,
}

#[derive(Clone, Debug)]
pub struct ControlFlowGraph {
    blocks: Vec<BlockData>,
    loops: Vec<Loop>,
    entry: Block,
    postorder: Vec<Block>,
}

impl ControlFlowGraph {
    /// Builds the graph from explicit edge lists. `preds` fixes the
    /// predecessor order that phi inputs refer to.
    pub fn new(
        entry: Block,
        preds: Vec<SmallVec<[Block; 4]>>,
        succs: Vec<SmallVec<[Block; 2]>>,
        probabilities: Vec<f64>,
    ) -> Self {
        debug_assert_eq!(preds.len(), succs.len());
        let blocks = preds
            .into_iter()
            .zip(succs)
            .zip(probabilities)
            .map(|((preds, succs), probability)| {
                let mut data = BlockData::new(probability);
                data.preds = preds;
                data.succs = succs;
                data
            })
            .collect();
        let mut cfg = ControlFlowGraph {
            blocks,
            loops: vec![],
            entry,
            postorder: vec![],
        };
        cfg.compute();
        cfg
    }

    pub fn from_graph<G: ScheduledGraph>(graph: &G) -> Self {
        let n = graph.num_blocks();
        let block_ids = (0..n).map(Block::new);
        let mut cfg = ControlFlowGraph::new(
            graph.entry_block(),
            block_ids
                .clone()
                .map(|b| graph.block_preds(b).iter().copied().collect())
                .collect(),
            block_ids
                .clone()
                .map(|b| graph.block_succs(b).iter().copied().collect())
                .collect(),
            block_ids.clone().map(|b| graph.block_probability(b)).collect(),
        );
        for b in block_ids {
            cfg.blocks[b.index()].is_exception_entry = graph.is_exception_entry(b);
        }
        cfg
    }

    /// Recomputes reachability, dominance and loops after edges changed.
    pub fn compute(&mut self) {
        let n = self.blocks.len();
        let blocks = &self.blocks;
        self.postorder = postorder::calculate(n, self.entry, |b| &blocks[b.index()].succs[..]);
        let domtree = DominatorTree::new(
            n,
            |b| &blocks[b.index()].preds[..],
            &self.postorder,
            self.entry,
        );
        for data in self.blocks.iter_mut() {
            data.reachable = false;
            data.dominator = Block::invalid();
            data.dominator_depth = 0;
            data.dominated.clear();
            data.loop_index = None;
            data.loop_depth = 0;
            data.is_loop_header = false;
            data.is_loop_end = false;
        }
        for &b in &self.postorder {
            self.blocks[b.index()].reachable = true;
        }
        // Dominated children in reverse postorder, so that walks visit
        // definitions before uses.
        for &b in self.postorder.iter().rev() {
            let dom = domtree.idom(b);
            self.blocks[b.index()].dominator = dom;
            self.blocks[b.index()].dominator_depth = domtree.depth(b);
            if dom.is_valid() {
                self.blocks[dom.index()].dominated.push(b);
            }
        }
        self.compute_loops();
    }

    fn compute_loops(&mut self) {
        self.loops.clear();
        let n = self.blocks.len();
        let mut bodies: Vec<BitVec> = vec![];
        for &header in self.postorder.iter().rev() {
            let ends: Vec<Block> = self.blocks[header.index()]
                .preds
                .iter()
                .copied()
                .filter(|&p| self.blocks[p.index()].reachable && self.dominates(header, p))
                .collect();
            if ends.is_empty() {
                continue;
            }
            let mut body = BitVec::with_capacity(n);
            body.set(header.index(), true);
            let mut worklist: Vec<Block> = vec![];
            for &end in &ends {
                if !body.get(end.index()) {
                    body.set(end.index(), true);
                    worklist.push(end);
                }
            }
            while let Some(b) = worklist.pop() {
                for &p in &self.blocks[b.index()].preds {
                    if self.blocks[p.index()].reachable && !body.get(p.index()) {
                        body.set(p.index(), true);
                        worklist.push(p);
                    }
                }
            }
            self.blocks[header.index()].is_loop_header = true;
            for &end in &ends {
                self.blocks[end.index()].is_loop_end = true;
            }
            self.loops.push(Loop {
                header,
                blocks: body.iter().map(Block::new).collect(),
                ends,
                parent: None,
                depth: 0,
            });
            bodies.push(body);
        }

        // The parent of a loop is the smallest other loop containing its
        // header.
        for i in 0..self.loops.len() {
            let header = self.loops[i].header;
            let parent = (0..self.loops.len())
                .filter(|&j| j != i && bodies[j].get(header.index()))
                .min_by_key(|&j| self.loops[j].blocks.len());
            self.loops[i].parent = parent.map(LoopIndex::new);
        }
        for i in 0..self.loops.len() {
            let mut depth = 1;
            let mut p = self.loops[i].parent;
            while let Some(parent) = p {
                depth += 1;
                p = self.loops[parent.index()].parent;
            }
            self.loops[i].depth = depth;
        }
        for i in 0..self.loops.len() {
            for bi in 0..self.loops[i].blocks.len() {
                let b = self.loops[i].blocks[bi];
                let depth = self.loops[i].depth;
                let data = &mut self.blocks[b.index()];
                if depth > data.loop_depth {
                    data.loop_depth = depth;
                    data.loop_index = Some(LoopIndex::new(i));
                }
            }
        }
    }

    /// Inserts a block on every edge from a block with several
    /// successors to a block with several predecessors. The new block
    /// takes the edge's place in both edge lists. Returns the new blocks.
    pub fn split_critical_edges(&mut self) -> Vec<Block> {
        let mut created = vec![];
        for pred_index in 0..self.blocks.len() {
            if self.blocks[pred_index].succs.len() < 2 {
                continue;
            }
            for si in 0..self.blocks[pred_index].succs.len() {
                let succ = self.blocks[pred_index].succs[si];
                if self.blocks[succ.index()].preds.len() < 2 {
                    continue;
                }
                let pred = Block::new(pred_index);
                let new_block = Block::new(self.blocks.len());
                let probability = self.blocks[pred_index]
                    .probability
                    .min(self.blocks[succ.index()].probability);
                let mut data = BlockData::new(probability);
                data.preds.push(pred);
                data.succs.push(succ);
                data.is_edge_split = true;
                self.blocks.push(data);
                self.blocks[pred_index].succs[si] = new_block;
                // Replace only the first remaining occurrence so that
                // duplicate edges split into distinct blocks.
                let preds = &mut self.blocks[succ.index()].preds;
                if let Some(pos) = preds.iter().position(|&p| p == pred) {
                    preds[pos] = new_block;
                }
                trace!("cfg: split edge {} -> {} with {}", pred, succ, new_block);
                created.push(new_block);
            }
        }
        if !created.is_empty() {
            self.compute();
        }
        created
    }

    /// Drops edges from unreachable blocks. Phi inputs index the
    /// original predecessor lists, so this runs after LIR construction.
    pub fn prune_unreachable_preds(&mut self) {
        let reachable: Vec<bool> = self.blocks.iter().map(|b| b.reachable).collect();
        for data in self.blocks.iter_mut() {
            if data.reachable {
                data.preds.retain(|p| reachable[p.index()]);
            } else {
                data.preds.clear();
                data.succs.clear();
            }
        }
    }

    pub fn entry(&self) -> Block {
        self.entry
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, b: Block) -> &BlockData {
        &self.blocks[b.index()]
    }

    pub fn block_mut(&mut self, b: Block) -> &mut BlockData {
        &mut self.blocks[b.index()]
    }

    pub fn blocks(&self) -> impl Iterator<Item = Block> {
        (0..self.blocks.len()).map(Block::new)
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn loop_at(&self, index: LoopIndex) -> &Loop {
        &self.loops[index.index()]
    }

    pub fn postorder(&self) -> &[Block] {
        &self.postorder
    }

    /// Reachable blocks in reverse postorder.
    pub fn reverse_postorder(&self) -> impl Iterator<Item = Block> + '_ {
        self.postorder.iter().rev().copied()
    }

    pub fn num_reachable(&self) -> usize {
        self.postorder.len()
    }

    pub fn dominates(&self, a: Block, mut b: Block) -> bool {
        let depth = self.blocks[a.index()].dominator_depth;
        while self.blocks[b.index()].dominator_depth > depth {
            b = self.blocks[b.index()].dominator;
        }
        a == b
    }

    /// Whether `block` belongs to `lp` or one of its nested loops.
    pub fn loop_contains(&self, lp: LoopIndex, block: Block) -> bool {
        let mut cur = self.blocks[block.index()].loop_index;
        while let Some(l) = cur {
            if l == lp {
                return true;
            }
            cur = self.loops[l.index()].parent;
        }
        false
    }
}
