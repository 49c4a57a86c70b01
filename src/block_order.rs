/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Block orderings for register allocation and for code emission, and
//! elision of empty blocks once allocation is done.
//!
//! Both orders start from a worklist prioritized by loop depth, then
//! probability, then discovery order, and greedily extend a path along
//! the most likely successor.

use crate::bitvec::BitVec;
use crate::cfg::{ControlFlowGraph, LoopIndex};
use crate::lir::{Lir, LirOp};
use crate::Block;

/// A merge block is deferred while its unscheduled predecessors are
/// more likely than this fraction of the merge itself.
const UNSCHEDULED_MERGE_SHARE: f64 = 0.05;

struct Worklist {
    entries: Vec<(Block, u64)>,
    next_seq: u64,
}

impl Worklist {
    fn new() -> Self {
        Worklist {
            entries: vec![],
            next_seq: 0,
        }
    }

    fn add(&mut self, block: Block) {
        self.entries.push((block, self.next_seq));
        self.next_seq += 1;
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes the most important entry accepted by `filter`: deepest
    /// loop first, then most probable, then first discovered.
    fn poll_where<F: Fn(Block) -> bool>(&mut self, cfg: &ControlFlowGraph, filter: F) -> Option<Block> {
        let mut best: Option<usize> = None;
        for (i, &(block, seq)) in self.entries.iter().enumerate() {
            if !filter(block) {
                continue;
            }
            let better = match best {
                None => true,
                Some(j) => {
                    let (other, other_seq) = self.entries[j];
                    let (a, b) = (cfg.block(block), cfg.block(other));
                    if a.loop_depth != b.loop_depth {
                        a.loop_depth > b.loop_depth
                    } else if a.probability != b.probability {
                        a.probability > b.probability
                    } else {
                        seq < other_seq
                    }
                }
            };
            if better {
                best = Some(i);
            }
        }
        best.map(|i| self.entries.remove(i).0)
    }
}

fn enqueue_successors(cfg: &ControlFlowGraph, block: Block, worklist: &mut Worklist, visited: &mut BitVec) {
    for &succ in &cfg.block(block).succs {
        if !visited.get(succ.index()) {
            visited.set(succ.index(), true);
            worklist.add(succ);
        }
    }
}

/// The most probable unvisited successor that does not decrease the
/// loop depth and stays inside `within`, if given. Marks it visited.
fn find_and_mark_most_likely_successor(
    cfg: &ControlFlowGraph,
    block: Block,
    within: Option<LoopIndex>,
    visited: &mut BitVec,
) -> Option<Block> {
    let depth = cfg.block(block).loop_depth;
    let mut result: Option<Block> = None;
    for &succ in &cfg.block(block).succs {
        if visited.get(succ.index()) || cfg.block(succ).loop_depth < depth {
            continue;
        }
        if let Some(lp) = within {
            if !cfg.loop_contains(lp, succ) {
                continue;
            }
        }
        if result.map_or(true, |r| cfg.block(succ).probability > cfg.block(r).probability) {
            result = Some(succ);
        }
    }
    if let Some(r) = result {
        visited.set(r.index(), true);
    }
    result
}

/// Loops whose header is scheduled but whose body is not complete,
/// innermost last.
struct OpenLoops {
    stack: Vec<LoopIndex>,
    scheduled: Vec<usize>,
}

impl OpenLoops {
    fn new(cfg: &ControlFlowGraph) -> Self {
        OpenLoops {
            stack: vec![],
            scheduled: vec![0; cfg.loops().len()],
        }
    }

    fn innermost(&self) -> Option<LoopIndex> {
        self.stack.last().copied()
    }

    fn block_scheduled(&mut self, cfg: &ControlFlowGraph, block: Block) {
        let data = cfg.block(block);
        if data.is_loop_header {
            if let Some(lp) = data.loop_index {
                self.stack.push(lp);
            }
        }
        let mut lp = data.loop_index;
        while let Some(l) = lp {
            self.scheduled[l.index()] += 1;
            lp = cfg.loop_at(l).parent;
        }
        while let Some(&top) = self.stack.last() {
            if self.scheduled[top.index()] < cfg.loop_at(top).blocks.len() {
                break;
            }
            self.stack.pop();
        }
    }
}

/// Computes the register-allocation order and numbers the blocks.
///
/// Loop bodies are contiguous and follow their header; inner loops are
/// closed before their enclosing loop continues.
pub fn compute_linear_scan_order(cfg: &mut ControlFlowGraph) -> Vec<Block> {
    let mut order = Vec::with_capacity(cfg.num_reachable());
    let mut visited = BitVec::with_capacity(cfg.num_blocks());
    let mut worklist = Worklist::new();
    let mut open = OpenLoops::new(cfg);
    for b in cfg.blocks() {
        cfg.block_mut(b).linear_scan_number = -1;
    }

    let start = cfg.entry();
    visited.set(start.index(), true);
    worklist.add(start);
    while !worklist.is_empty() {
        let mut next = match open.innermost() {
            Some(lp) => {
                let in_loop = worklist.poll_where(cfg, |b| cfg.loop_contains(lp, b));
                match in_loop {
                    Some(b) => Some(b),
                    None => worklist.poll_where(cfg, |_| true),
                }
            }
            None => worklist.poll_where(cfg, |_| true),
        };
        while let Some(block) = next {
            next = add_path_to_linear_scan_order(cfg, block, &mut order, &mut worklist, &mut visited, &mut open);
        }
    }
    trace!("linear scan order: {:?}", order);
    order
}

fn add_path_to_linear_scan_order(
    cfg: &mut ControlFlowGraph,
    block: Block,
    order: &mut Vec<Block>,
    worklist: &mut Worklist,
    visited: &mut BitVec,
    open: &mut OpenLoops,
) -> Option<Block> {
    cfg.block_mut(block).linear_scan_number = order.len() as i32;
    order.push(block);
    open.block_scheduled(cfg, block);

    let cfg_ro: &ControlFlowGraph = cfg;
    let most_likely = find_and_mark_most_likely_successor(cfg_ro, block, open.innermost(), visited);
    enqueue_successors(cfg_ro, block, worklist, visited);
    let succ = most_likely?;
    let data = cfg_ro.block(succ);
    if !data.is_loop_header && data.preds.len() > 1 {
        // A merge: wait until more of its predecessors are placed if the
        // unplaced ones carry a significant share of its frequency.
        let unscheduled: f64 = data
            .preds
            .iter()
            .map(|&p| cfg_ro.block(p))
            .filter(|p| p.reachable && p.linear_scan_number == -1)
            .map(|p| p.probability)
            .sum();
        if unscheduled > data.probability * UNSCHEDULED_MERGE_SHARE {
            visited.set(succ.index(), false);
            return None;
        }
    }
    Some(succ)
}

/// A loop header placed after its only loop end, so that the back edge
/// becomes the conditional branch.
fn skip_loop_header(cfg: &ControlFlowGraph, block: Block) -> bool {
    let data = cfg.block(block);
    data.is_loop_header
        && !data.is_loop_end
        && cfg
            .loops()
            .iter()
            .any(|l| l.header == block && l.ends.len() == 1)
}

/// Computes the code emission order and sets block alignment.
pub fn compute_code_emitting_order(cfg: &mut ControlFlowGraph) -> Vec<Block> {
    let mut order = Vec::with_capacity(cfg.num_reachable());
    let mut visited = BitVec::with_capacity(cfg.num_blocks());
    let mut worklist = Worklist::new();
    for b in cfg.blocks() {
        cfg.block_mut(b).align = false;
    }

    let start = cfg.entry();
    visited.set(start.index(), true);
    worklist.add(start);
    while let Some(first) = worklist.poll_where(cfg, |_| true) {
        let mut next = Some(first);
        while let Some(block) = next {
            next = add_path_to_code_emitting_order(cfg, block, &mut order, &mut worklist, &mut visited);
        }
    }
    debug_assert_eq!(order.len(), cfg.num_reachable());
    trace!("code emitting order: {:?}", order);
    order
}

fn add_path_to_code_emitting_order(
    cfg: &mut ControlFlowGraph,
    block: Block,
    order: &mut Vec<Block>,
    worklist: &mut Worklist,
    visited: &mut BitVec,
) -> Option<Block> {
    if !skip_loop_header(cfg, block) {
        if cfg.block(block).is_loop_header {
            cfg.block_mut(block).align = true;
        }
        order.push(block);
    }

    // The only loop end of a skipped header: place the header right
    // after it and align the targets of the backward jump.
    let rotated: Vec<Block> = cfg
        .loops()
        .iter()
        .filter(|l| l.ends.len() == 1 && l.ends[0] == block)
        .map(|l| l.header)
        .filter(|&h| skip_loop_header(cfg, h))
        .collect();
    for header in rotated {
        order.push(header);
        let depth = cfg.block(block).loop_depth;
        let succs = cfg.block(header).succs.clone();
        for succ in succs {
            if cfg.block(succ).loop_depth == depth {
                cfg.block_mut(succ).align = true;
            }
        }
    }

    let cfg_ro: &ControlFlowGraph = cfg;
    let most_likely = find_and_mark_most_likely_successor(cfg_ro, block, None, visited);
    enqueue_successors(cfg_ro, block, worklist, visited);
    most_likely
}

/// Removes blocks consisting of only a label and a jump, splicing their
/// predecessors to their successor. Returns the number of removed
/// blocks.
pub fn delete_empty_blocks(lir: &mut Lir) -> usize {
    let mut removed = 0;
    let candidates: Vec<Block> = lir.code_emitting_order().to_vec();
    for block in candidates {
        if !can_delete_block(lir, block) {
            continue;
        }
        let succ = lir.cfg().block(block).succs[0];
        let preds = lir.cfg().block(block).preds.clone();
        if preds.iter().any(|&p| lir.cfg().block(p).succs.contains(&succ)) {
            // Splicing would give a predecessor two edges to `succ`.
            continue;
        }
        trace!("removing empty block {} (successor {})", block, succ);

        for &pred in &preds {
            for succ_slot in lir.cfg_mut().block_mut(pred).succs.iter_mut() {
                if *succ_slot == block {
                    *succ_slot = succ;
                }
            }
            if let Some(last) = lir.block_ops_mut(pred).last_mut() {
                last.op.replace_target(block, succ);
            }
        }

        let align = lir.cfg().block(block).align;
        let cfg = lir.cfg_mut();
        let succ_data = cfg.block_mut(succ);
        if let Some(pos) = succ_data.preds.iter().position(|&p| p == block) {
            succ_data.preds.remove(pos);
            for (i, &pred) in preds.iter().enumerate() {
                succ_data.preds.insert(pos + i, pred);
            }
        }
        succ_data.align |= align;
        let data = cfg.block_mut(block);
        data.preds.clear();
        data.succs.clear();
        data.reachable = false;

        lir.remove_from_orders(block);
        removed += 1;
    }
    removed
}

fn can_delete_block(lir: &Lir, block: Block) -> bool {
    let data = lir.cfg().block(block);
    if data.succs.len() != 1
        || data.succs[0] == block
        || data.preds.is_empty()
        || data.is_exception_entry
        || !lir.has_block_ops(block)
    {
        return false;
    }
    let ops = lir.block_ops(block);
    ops.len() == 2
        && matches!(ops[0].op, LirOp::Label { .. })
        && matches!(ops[1].op, LirOp::Jump { .. })
        && !ops[1].has_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::cfg_from_succs;
    use crate::lir::LirInstruction;
    use crate::value::Value;

    fn b(i: usize) -> Block {
        Block::new(i)
    }

    fn assert_permutation(cfg: &ControlFlowGraph, order: &[Block]) {
        assert_eq!(order[0], cfg.entry());
        let mut seen = vec![false; cfg.num_blocks()];
        for &block in order {
            assert!(!seen[block.index()], "{} placed twice", block);
            seen[block.index()] = true;
        }
        for block in cfg.blocks() {
            assert_eq!(seen[block.index()], cfg.block(block).reachable);
        }
    }

    /// 0 -> 1; 1 -> 2 | 5; 2 -> 3 | 4; 3 -> 1; 4 -> 1; 5 exit.
    fn loop_with_diamond() -> ControlFlowGraph {
        cfg_from_succs(
            &[&[1], &[2, 5], &[3, 4], &[1], &[1], &[]],
            &[1.0, 10.0, 9.0, 6.0, 3.0, 1.0],
        )
    }

    #[test]
    fn linear_scan_order_keeps_loops_contiguous() {
        let mut cfg = loop_with_diamond();
        let order = compute_linear_scan_order(&mut cfg);
        assert_permutation(&cfg, &order);
        assert_eq!(order, vec![b(0), b(1), b(2), b(3), b(4), b(5)]);
        for (i, &block) in order.iter().enumerate() {
            assert_eq!(cfg.block(block).linear_scan_number, i as i32);
        }
    }

    #[test]
    fn nested_loop_closes_first() {
        // 0 -> 1; 1 (outer) -> 2 | 6; 2 (inner) -> 3; 3 -> 2 | 4;
        // 4 -> 5 | 1 (low prob exit chain); 5 -> 1; 6 exit.
        let mut cfg = cfg_from_succs(
            &[&[1], &[2, 6], &[3], &[2, 4], &[5, 1], &[1], &[]],
            &[1.0, 10.0, 100.0, 100.0, 10.0, 5.0, 1.0],
        );
        let order = compute_linear_scan_order(&mut cfg);
        assert_permutation(&cfg, &order);
        let pos = |x: usize| order.iter().position(|&o| o == b(x)).unwrap();
        // Inner loop {2, 3} contiguous and before the rest of the outer
        // loop; outer loop {1..5} contiguous.
        assert_eq!(pos(3), pos(2) + 1);
        assert!(pos(4) > pos(3) && pos(5) > pos(3));
        assert!(pos(6) > pos(5) && pos(6) > pos(4));
        assert_eq!(pos(1), 1);
    }

    #[test]
    fn equal_probabilities_follow_discovery_order() {
        // Diamond with equal branches: the first successor is followed.
        let mut cfg = cfg_from_succs(&[&[1, 2], &[3], &[3], &[]], &[1.0, 0.5, 0.5, 1.0]);
        let order = compute_linear_scan_order(&mut cfg);
        assert_eq!(order, vec![b(0), b(1), b(2), b(3)]);
        let mut cfg2 = cfg_from_succs(&[&[1, 2], &[3], &[3], &[]], &[1.0, 0.5, 0.5, 1.0]);
        let order2 = compute_code_emitting_order(&mut cfg2);
        assert_permutation(&cfg2, &order2);
        assert_eq!(order2[1], b(1));
    }

    #[test]
    fn emission_order_rotates_single_end_loops() {
        let mut cfg = cfg_from_succs(&[&[1], &[2, 3], &[1], &[]], &[1.0, 10.0, 9.0, 1.0]);
        let order = compute_code_emitting_order(&mut cfg);
        assert_permutation(&cfg, &order);
        // The header follows its loop end.
        assert_eq!(order, vec![b(0), b(2), b(1), b(3)]);
        assert!(cfg.block(b(2)).align);
        assert!(!cfg.block(b(1)).align);
    }

    #[test]
    fn emission_order_aligns_unrotated_headers() {
        let mut cfg = loop_with_diamond();
        let order = compute_code_emitting_order(&mut cfg);
        assert_permutation(&cfg, &order);
        // Two loop ends: no rotation.
        assert_eq!(order[1], b(1));
        assert!(cfg.block(b(1)).align);
    }

    fn lir_with_empty_blocks(succs: &[&[usize]]) -> Lir {
        let n = succs.len();
        let mut cfg = cfg_from_succs(succs, &vec![1.0; n]);
        let order = compute_code_emitting_order(&mut cfg);
        let mut lir = Lir::new(cfg);
        for block in lir.cfg().blocks().collect::<Vec<_>>() {
            let data = lir.cfg().block(block);
            let mut ops = vec![LirInstruction::label(block)];
            match data.succs.len() {
                0 => ops.push(LirInstruction::new(
                    LirOp::Return,
                    smallvec::smallvec![Value::Illegal],
                    None,
                )),
                1 => ops.push(LirInstruction::jump(data.succs[0])),
                _ => {
                    ops.push(LirInstruction::new(
                        LirOp::TableSwitch {
                            low: 0,
                            targets: data.succs[..data.succs.len() - 1].to_vec(),
                            default: data.succs[data.succs.len() - 1],
                        },
                        smallvec::smallvec![Value::Illegal, Value::Illegal, Value::Illegal],
                        None,
                    ))
                }
            }
            lir.set_block_ops(block, ops);
        }
        lir.set_linear_scan_order(order.clone());
        lir.set_code_emitting_order(order);
        lir
    }

    #[test]
    fn empty_blocks_are_spliced() {
        // 0 -> 1 | 2; 1 -> 3; 2 -> 3; 3 exit. Block 1 and 2 are empty but
        // removing both would give 0 two edges to 3.
        let mut lir = lir_with_empty_blocks(&[&[1, 2], &[3], &[3], &[]]);
        let removed = delete_empty_blocks(&mut lir);
        assert_eq!(removed, 1);
        let cfg = lir.cfg();
        assert_eq!(cfg.block(b(0)).succs.as_slice(), &[b(3), b(2)]);
        assert_eq!(cfg.block(b(3)).preds.as_slice(), &[b(0), b(2)]);
        match &lir.block_ops(b(0))[1].op {
            LirOp::TableSwitch { targets, default, .. } => {
                assert_eq!(targets, &vec![b(3)]);
                assert_eq!(*default, b(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(lir.code_emitting_order().len(), 3);

        // Idempotent.
        assert_eq!(delete_empty_blocks(&mut lir), 0);
    }

    #[test]
    fn chain_of_empty_blocks() {
        // 0 -> 1 -> 2 -> 3 with 1 and 2 empty.
        let mut lir = lir_with_empty_blocks(&[&[1], &[2], &[3], &[]]);
        // The entry has no predecessors and is kept; so is the exit.
        assert_eq!(delete_empty_blocks(&mut lir), 2);
        assert_eq!(lir.cfg().block(b(0)).succs.as_slice(), &[b(3)]);
        assert_eq!(lir.cfg().block(b(3)).preds.as_slice(), &[b(0)]);
        assert_eq!(lir.block_ops(b(0))[1].op, LirOp::Jump { target: b(3) });
        assert_eq!(lir.code_emitting_order(), &[b(0), b(3)]);
    }
}
