/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Immediate dominators by the iterative algorithm of Cooper, Harvey
//! and Kennedy ("A Simple, Fast Dominance Algorithm"), over blocks
//! numbered in reverse postorder.

use crate::Block;

/// Dominator tree of the blocks reachable from the entry.
#[derive(Clone, Debug)]
pub struct DominatorTree {
    idom: Vec<Block>,
    depth: Vec<u32>,
}

impl DominatorTree {
    /// `postorder` lists the reachable blocks, `entry` last.
    pub fn new<'a, PredFn: Fn(Block) -> &'a [Block]>(
        num_blocks: usize,
        preds: PredFn,
        postorder: &[Block],
        entry: Block,
    ) -> Self {
        let rpo: Vec<Block> = postorder.iter().rev().copied().collect();
        let mut number = vec![None; num_blocks];
        for (i, &b) in rpo.iter().enumerate() {
            number[b.index()] = Some(i as u32);
        }

        // Indexed by rpo number; the entry points to itself while the
        // fixpoint runs.
        let mut idom: Vec<Option<u32>> = vec![None; rpo.len()];
        idom[0] = Some(0);
        debug_assert_eq!(rpo.first(), Some(&entry));

        let mut changed = true;
        let mut iterations = 0;
        while changed {
            changed = false;
            iterations += 1;
            for (i, &b) in rpo.iter().enumerate().skip(1) {
                let mut new_idom: Option<u32> = None;
                for &p in preds(b) {
                    let p = match number[p.index()] {
                        Some(p) if idom[p as usize].is_some() => p,
                        _ => continue,
                    };
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, cur, p),
                    });
                }
                if new_idom.is_some() && new_idom != idom[i] {
                    idom[i] = new_idom;
                    changed = true;
                }
            }
        }
        trace!("domtree: {} blocks, {} iterations", rpo.len(), iterations);

        let mut tree = DominatorTree {
            idom: vec![Block::invalid(); num_blocks],
            depth: vec![0; num_blocks],
        };
        // Parents precede children in reverse postorder.
        for (i, &b) in rpo.iter().enumerate().skip(1) {
            if let Some(parent) = idom[i] {
                let parent_block = rpo[parent as usize];
                tree.idom[b.index()] = parent_block;
                tree.depth[b.index()] = tree.depth[parent_block.index()] + 1;
            }
        }
        tree
    }

    /// Immediate dominator; invalid for the entry and unreachable blocks.
    pub fn idom(&self, block: Block) -> Block {
        self.idom[block.index()]
    }

    /// Distance from the entry in the tree.
    pub fn depth(&self, block: Block) -> u32 {
        self.depth[block.index()]
    }
}

fn intersect(idom: &[Option<u32>], mut a: u32, mut b: u32) -> u32 {
    while a != b {
        while a > b {
            a = idom[a as usize].unwrap_or(0);
        }
        while b > a {
            b = idom[b as usize].unwrap_or(0);
        }
    }
    a
}
