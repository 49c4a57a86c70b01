/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Constant-load placement.
//!
//! A variable defined once by a constant move and used in several
//! blocks can be cheaper to rematerialize close to its uses than to
//! keep live from the definition. For each candidate the blocks on the
//! dominator-tree paths from the definition to the uses are marked and
//! a bottom-up pass picks, per subtree, either one load at the subtree
//! root or the loads chosen by its children, whichever is expected to
//! execute less often.

use crate::constant::Constant;
use crate::lir::{Lir, LirInsertionBuffer, LirInstruction, OperandMode};
use crate::value::{Value, Variable};
use crate::{Block, FxHashMap, FxHashSet, Stats};
use smallvec::SmallVec;

/// A place in a block's instruction list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct InstPos {
    block: Block,
    index: usize,
}

/// The single definition of a candidate and all instructions reading
/// it.
#[derive(Clone, Debug)]
struct DefUseTree {
    variable: Variable,
    def: InstPos,
    constant: Constant,
    usages: SmallVec<[InstPos; 4]>,
}

/// Per-variable scan result.
#[derive(Clone, Debug)]
enum Candidate {
    Tree(DefUseTree),
    /// Defined by something other than a single constant load, or
    /// read by a frame state.
    Disqualified,
}

/// The cheapest placement found for a marked subtree.
#[derive(Clone, Debug, Default)]
struct Solution {
    cost: f64,
    blocks: SmallVec<[Block; 4]>,
}

impl Solution {
    fn single(block: Block, probability: f64) -> Self {
        let mut blocks = SmallVec::new();
        blocks.push(block);
        Solution {
            cost: probability,
            blocks,
        }
    }

    fn materializations(&self) -> usize {
        self.blocks.len()
    }
}

/// The dominator subtree spanned by one candidate's usages.
struct ConstantTree<'a> {
    lir: &'a Lir,
    marked: FxHashSet<Block>,
    /// Number of direct usages per block.
    usages: FxHashMap<Block, usize>,
}

impl<'a> ConstantTree<'a> {
    /// Marks every block from each usage up to `tree.def.block`.
    /// Returns `None` if some usage is not dominated by the definition.
    fn build(lir: &'a Lir, tree: &DefUseTree) -> Option<Self> {
        let cfg = lir.cfg();
        let root = tree.def.block;
        let mut marked = FxHashSet::default();
        let mut usages = FxHashMap::default();
        marked.insert(root);
        for usage in &tree.usages {
            if !cfg.dominates(root, usage.block) {
                return None;
            }
            *usages.entry(usage.block).or_insert(0) += 1;
            let mut block = usage.block;
            while marked.insert(block) {
                block = cfg.block(block).dominator;
            }
        }
        Some(ConstantTree {
            lir,
            marked,
            usages,
        })
    }

    fn solve(&self, block: Block) -> Solution {
        let probability = self.lir.cfg().block(block).probability;
        if self.usages.contains_key(&block) {
            return Solution::single(block, probability);
        }
        let mut children = Solution::default();
        for &child in &self.lir.cfg().block(block).dominated {
            if !self.marked.contains(&child) {
                continue;
            }
            let sub = self.solve(child);
            children.cost += sub.cost;
            children.blocks.extend(sub.blocks);
        }
        if probability < children.cost
            || (probability == children.cost && children.materializations() > 1)
        {
            Solution::single(block, probability)
        } else {
            children
        }
    }
}

/// Scans `lir` for candidates in allocation order.
fn collect(lir: &Lir) -> Vec<DefUseTree> {
    let mut candidates: FxHashMap<Variable, Candidate> = FxHashMap::default();
    let mut order: Vec<Variable> = vec![];
    for &block in lir.linear_scan_order() {
        for (index, inst) in lir.block_ops(block).iter().enumerate() {
            let pos = InstPos { block, index };
            let constant_def = if inst.is_constant_load() {
                match (inst.move_result(), inst.move_input()) {
                    (Value::Variable(v), Value::Constant(c)) => Some((*v, c.clone())),
                    _ => None,
                }
            } else {
                None
            };
            inst.for_each_operand(|value, mode, _| {
                let v = match value.as_variable() {
                    Some(v) => v,
                    None => return,
                };
                match mode {
                    OperandMode::Def => match &constant_def {
                        Some((def, constant)) if *def == v && !candidates.contains_key(&v) => {
                            candidates.insert(
                                v,
                                Candidate::Tree(DefUseTree {
                                    variable: v,
                                    def: pos,
                                    constant: constant.clone(),
                                    usages: SmallVec::new(),
                                }),
                            );
                            order.push(v);
                        }
                        _ => {
                            candidates.insert(v, Candidate::Disqualified);
                        }
                    },
                    OperandMode::Use | OperandMode::Alive => {
                        if let Some(Candidate::Tree(tree)) = candidates.get_mut(&v) {
                            if tree.usages.last() != Some(&pos) {
                                tree.usages.push(pos);
                            }
                        }
                    }
                    OperandMode::Temp => {}
                }
            });
            inst.for_each_state_value(|value, _| {
                if let Some(v) = value.as_variable() {
                    candidates.insert(v, Candidate::Disqualified);
                }
            });
        }
    }
    order
        .into_iter()
        .filter_map(|v| match candidates.remove(&v) {
            Some(Candidate::Tree(tree)) => Some(tree),
            _ => None,
        })
        .collect()
}

/// Moves constant loads closer to their usages where that lowers the
/// expected number of executed loads. Must run before register
/// allocation, on a `Lir` with its allocation order.
pub fn optimize(lir: &mut Lir, stats: &mut Stats) {
    let trees = collect(lir);
    stats.constants_seen += trees.len();

    let mut buffers: FxHashMap<Block, LirInsertionBuffer> = FxHashMap::default();
    let mut rewrites: Vec<(InstPos, Variable, Variable)> = vec![];
    for tree in &trees {
        if tree.usages.len() < 2 {
            continue;
        }
        if tree.usages.iter().any(|u| u.block == tree.def.block) {
            trace!("{}: used in its defining block", tree.variable);
            continue;
        }
        let constant_tree = match ConstantTree::build(lir, tree) {
            Some(t) => t,
            None => continue,
        };
        let solution = constant_tree.solve(tree.def.block);
        if solution.materializations() == 1 && solution.blocks[0] == tree.def.block {
            trace!("{}: definition block is already the best place", tree.variable);
            continue;
        }
        trace!(
            "{}: {} loads at cost {} in {:?}",
            tree.variable,
            solution.materializations(),
            solution.cost,
            solution.blocks
        );

        let mut fresh: FxHashMap<Block, Variable> = FxHashMap::default();
        for &block in &solution.blocks {
            let v = lir.new_variable(tree.variable.kind);
            fresh.insert(block, v);
            let index = lir.block_start_index(block);
            buffers.entry(block).or_default().append(
                index,
                LirInstruction::mov(Value::Variable(v), Value::Constant(tree.constant.clone())),
            );
        }
        for usage in &tree.usages {
            let mut block = usage.block;
            let v = loop {
                if let Some(&v) = fresh.get(&block) {
                    break v;
                }
                debug_assert_ne!(block, tree.def.block);
                block = lir.cfg().block(block).dominator;
            };
            rewrites.push((*usage, tree.variable, v));
        }
        buffers.entry(tree.def.block).or_default().delete(tree.def.index);

        stats.constants_optimized += 1;
        stats.constant_materializations += solution.materializations();
    }

    for (pos, from, to) in rewrites {
        let inst = &mut lir.block_ops_mut(pos.block)[pos.index];
        inst.for_each_operand_mut(|value, mode, _| {
            if matches!(mode, OperandMode::Use | OperandMode::Alive)
                && value.as_variable() == Some(from)
            {
                *value = Value::Variable(to);
            }
        });
    }
    for (block, buffer) in buffers {
        buffer.apply(lir.block_ops_mut(block));
    }

    log::debug!(
        "constant loads: {} candidates, {} optimized, {} materializations",
        stats.constants_seen,
        stats.constants_optimized,
        stats.constant_materializations
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::cfg_from_succs;
    use crate::graph::BinaryOp;
    use crate::lir::LirOp;
    use crate::value::Kind;
    use smallvec::smallvec;

    fn int(x: i32) -> Value {
        Value::Constant(Constant::Int(x))
    }

    fn add(dst: Variable, x: Variable, y: Variable) -> LirInstruction {
        LirInstruction::new(
            LirOp::Binary { op: BinaryOp::Add },
            smallvec![dst.into(), x.into(), y.into()],
            None,
        )
    }

    fn label(b: usize) -> LirInstruction {
        LirInstruction::label(Block::new(b))
    }

    fn jump(b: usize) -> LirInstruction {
        LirInstruction::jump(Block::new(b))
    }

    fn branch(x: Variable, t: usize, f: usize) -> LirInstruction {
        LirInstruction::new(
            LirOp::CompareBranch {
                condition: crate::graph::Condition::Eq,
                kind: Kind::Int,
                true_target: Block::new(t),
                false_target: Block::new(f),
                true_probability: 0.5,
            },
            smallvec![x.into(), int(0)],
            None,
        )
    }

    fn ret() -> LirInstruction {
        LirInstruction::new(LirOp::Return, smallvec![Value::Illegal], None)
    }

    fn finish(mut lir: Lir) -> Lir {
        let order = crate::block_order::compute_linear_scan_order(lir.cfg_mut());
        lir.set_linear_scan_order(order);
        lir
    }

    fn loads_of(lir: &Lir, block: usize) -> Vec<Variable> {
        lir.block_ops(Block::new(block))
            .iter()
            .filter(|i| i.is_constant_load())
            .filter_map(|i| i.move_result().as_variable())
            .collect()
    }

    /// 0 (1.0) -> 1 (0.1) | 2 (0.1) -> 3; `c` is loaded in 0 and read
    /// in 1 and 2.
    fn sibling_uses(p: f64) -> (Lir, Variable) {
        let mut lir = Lir::new(cfg_from_succs(
            &[&[1, 2], &[3], &[3], &[]],
            &[1.0, p, p, 1.0],
        ));
        let x = lir.new_variable(Kind::Int);
        let c = lir.new_variable(Kind::Int);
        let (a, b) = (lir.new_variable(Kind::Int), lir.new_variable(Kind::Int));
        lir.set_block_ops(
            Block::new(0),
            vec![
                label(0),
                LirInstruction::mov(x.into(), int(1)),
                LirInstruction::mov(c.into(), int(42)),
                branch(x, 1, 2),
            ],
        );
        lir.set_block_ops(Block::new(1), vec![label(1), add(a, x, c), jump(3)]);
        lir.set_block_ops(Block::new(2), vec![label(2), add(b, x, c), jump(3)]);
        lir.set_block_ops(Block::new(3), vec![label(3), ret()]);
        (finish(lir), c)
    }

    #[test]
    fn load_moves_into_rare_siblings() {
        let (mut lir, c) = sibling_uses(0.1);
        let mut stats = Stats::default();
        optimize(&mut lir, &mut stats);

        assert_eq!(stats.constants_optimized, 1);
        assert_eq!(stats.constant_materializations, 2);
        assert_eq!(loads_of(&lir, 0).len(), 1);
        assert!(!loads_of(&lir, 0).contains(&c));
        for b in 1..3 {
            let loads = loads_of(&lir, b);
            assert_eq!(loads.len(), 1);
            let ops = lir.block_ops(Block::new(b));
            // The load follows the label and feeds the add.
            assert_eq!(ops[1].move_result(), &Value::Variable(loads[0]));
            assert_eq!(ops[2].operands[2], Value::Variable(loads[0]));
        }
    }

    #[test]
    fn frequent_siblings_keep_the_load() {
        let (mut lir, c) = sibling_uses(0.5);
        let mut stats = Stats::default();
        optimize(&mut lir, &mut stats);

        assert_eq!(stats.constants_optimized, 0);
        assert!(loads_of(&lir, 0).contains(&c));
        assert!(loads_of(&lir, 1).is_empty());
    }

    #[test]
    fn use_in_defining_block_skips() {
        let mut lir = Lir::new(cfg_from_succs(&[&[1], &[]], &[1.0, 0.1]));
        let c = lir.new_variable(Kind::Int);
        let (a, b) = (lir.new_variable(Kind::Int), lir.new_variable(Kind::Int));
        lir.set_block_ops(
            Block::new(0),
            vec![
                label(0),
                LirInstruction::mov(c.into(), int(7)),
                add(a, c, c),
                jump(1),
            ],
        );
        lir.set_block_ops(Block::new(1), vec![label(1), add(b, c, c), ret()]);
        let mut lir = finish(lir);
        let mut stats = Stats::default();
        optimize(&mut lir, &mut stats);
        assert_eq!(stats.constants_seen, 1);
        assert_eq!(stats.constants_optimized, 0);
        assert_eq!(loads_of(&lir, 0), vec![c]);
    }

    #[test]
    fn redefinition_disqualifies() {
        let (mut lir, c) = sibling_uses(0.1);
        let ops = lir.block_ops_mut(Block::new(1));
        ops.insert(1, LirInstruction::mov(c.into(), int(3)));
        let mut stats = Stats::default();
        optimize(&mut lir, &mut stats);
        assert_eq!(stats.constants_optimized, 0);
        assert!(loads_of(&lir, 0).contains(&c));
    }
}
