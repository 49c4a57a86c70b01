/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Postorder computation over block successors.

use crate::bitvec::BitVec;
use crate::Block;
use smallvec::SmallVec;

/// Blocks reachable from `entry`, in postorder. Unreachable blocks are
/// omitted. Successors are visited in list order, so the first
/// successor's subtree finishes first.
pub fn calculate<'a, SuccFn: Fn(Block) -> &'a [Block]>(
    num_blocks: usize,
    entry: Block,
    succ_blocks: SuccFn,
) -> Vec<Block> {
    let mut visited = BitVec::with_capacity(num_blocks);
    // Each entry is a block on the DFS path and the index of its next
    // successor to visit.
    let mut path: SmallVec<[(Block, usize); 32]> = SmallVec::new();
    let mut out = Vec::with_capacity(num_blocks);

    visited.set(entry.index(), true);
    path.push((entry, 0));
    while let Some(top) = path.last_mut() {
        let (block, next) = *top;
        match succ_blocks(block).get(next) {
            Some(&succ) => {
                top.1 += 1;
                if !visited.get(succ.index()) {
                    visited.set(succ.index(), true);
                    path.push((succ, 0));
                }
            }
            None => {
                out.push(block);
                path.pop();
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_postorder() {
        let succs: Vec<Vec<Block>> = vec![
            vec![Block::new(1), Block::new(2)],
            vec![Block::new(3)],
            vec![Block::new(3)],
            vec![],
            vec![Block::new(3)],
        ];
        let po = calculate(5, Block::new(0), |b| &succs[b.index()][..]);
        assert_eq!(
            po,
            vec![Block::new(3), Block::new(1), Block::new(2), Block::new(0)]
        );
    }
}
