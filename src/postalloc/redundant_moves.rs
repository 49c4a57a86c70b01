/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Redundant-move elimination.

use crate::constant::Constant;
use crate::lir::{Lir, LirInsertionBuffer, LirInstruction, LirOp, OperandMode};
use crate::moves::Location;
use crate::target::TargetDescription;
use crate::value::Kind;
use crate::{FxHashMap, Stats};
use smallvec::{smallvec, SmallVec};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RedundantMoveState {
    /// Holds the same bits as another location.
    Copy(Location, Kind),
    /// Holds a known constant.
    Constant(Constant),
    None,
}

#[derive(Clone, Debug, Default)]
pub struct RedundantMoveEliminator {
    allocs: FxHashMap<Location, RedundantMoveState>,
    reverse_allocs: FxHashMap<Location, SmallVec<[Location; 4]>>,
}

#[derive(Copy, Clone, Debug)]
pub struct RedundantMoveAction {
    pub elide: bool,
}

/// The source of a move, as far as the tracker can tell.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MoveSource {
    Location(Location),
    Constant(Constant),
    /// Anything else, e.g. an incoming stack argument.
    Unknown,
}

impl RedundantMoveEliminator {
    pub fn process_move(&mut self, from: MoveSource, to: Location, kind: Kind) -> RedundantMoveAction {
        let to_state = self
            .allocs
            .get(&to)
            .copied()
            .unwrap_or(RedundantMoveState::None);
        let from_loc = match from {
            MoveSource::Location(l) => Some(l),
            _ => None,
        };
        let from_state = from_loc
            .and_then(|l| self.allocs.get(&l).copied())
            .unwrap_or(RedundantMoveState::None);

        trace!(
            "     -> redundant move tracker: from {:?} to {:?} kind {:?}",
            from,
            to,
            kind
        );
        trace!(
            "       -> from_state {:?} to_state {:?}",
            from_state,
            to_state
        );

        if from_loc == Some(to) {
            return RedundantMoveAction { elide: true };
        }

        let elide = match (from, from_state, to_state) {
            (MoveSource::Location(f), _, RedundantMoveState::Copy(orig, k)) if orig == f && k == kind => {
                true
            }
            (_, RedundantMoveState::Copy(copy, k), _) if copy == to && k == kind => true,
            (MoveSource::Constant(c), _, RedundantMoveState::Constant(existing)) if c == existing => true,
            _ => false,
        };
        trace!("      -> elide {}", elide);

        // Invalidate all existing copies of `to` if `to` actually changed value.
        if !elide {
            self.clear_alloc(to);
        }

        match from {
            // Don't track stack-to-stack copies.
            MoveSource::Location(f) if !(f.is_stack() && to.is_stack()) => {
                if !elide {
                    self.allocs.insert(to, RedundantMoveState::Copy(f, kind));
                    self.reverse_allocs
                        .entry(f)
                        .or_insert_with(|| smallvec![])
                        .push(to);
                }
            }
            MoveSource::Constant(c) => {
                self.allocs.insert(to, RedundantMoveState::Constant(c));
            }
            _ => {}
        }

        RedundantMoveAction { elide }
    }

    pub fn clear(&mut self) {
        trace!("   redundant move eliminator cleared");
        self.allocs.clear();
        self.reverse_allocs.clear();
    }

    pub fn clear_alloc(&mut self, alloc: Location) {
        trace!("   redundant move eliminator: clear {:?}", alloc);
        if let Some(existing_copies) = self.reverse_allocs.get_mut(&alloc) {
            for to_inval in existing_copies.drain(..) {
                trace!("     -> clear existing copy: {:?}", to_inval);
                self.allocs.remove(&to_inval);
            }
        }
        if let Some(RedundantMoveState::Copy(orig, _)) = self.allocs.remove(&alloc) {
            if let Some(copies) = self.reverse_allocs.get_mut(&orig) {
                copies.retain(|c| *c != alloc);
            }
        }
    }

    /// Forgets everything an instruction other than a move writes.
    fn clobber(&mut self, inst: &LirInstruction, target: &TargetDescription) {
        inst.for_each_operand(|value, mode, _| {
            if matches!(mode, OperandMode::Def | OperandMode::Temp) {
                if let Some(loc) = Location::from_value(value) {
                    self.clear_alloc(loc);
                }
            }
        });
        if inst.destroys_caller_saved() {
            for &reg in &target.register_config.caller_saved {
                self.clear_alloc(Location::Reg(reg));
            }
        }
    }
}

fn source_of(inst: &LirInstruction) -> MoveSource {
    let input = inst.move_input();
    match Location::from_value(input) {
        Some(l) => MoveSource::Location(l),
        None => match input.as_constant() {
            Some(c) => MoveSource::Constant(*c),
            None => MoveSource::Unknown,
        },
    }
}

/// Deletes moves whose destination already holds the moved value.
/// Knowledge is local to a block. Returns the number of deleted moves.
pub fn eliminate(lir: &mut Lir, target: &TargetDescription, stats: &mut Stats) -> usize {
    let mut removed = 0;
    let mut tracker = RedundantMoveEliminator::default();
    let blocks: Vec<_> = lir.linear_scan_order().to_vec();
    for block in blocks {
        tracker.clear();
        let mut buffer = LirInsertionBuffer::new();
        for (index, inst) in lir.block_ops(block).iter().enumerate() {
            match &inst.op {
                LirOp::Move => {
                    let to = match Location::from_value(inst.move_result()) {
                        Some(to) => to,
                        None => {
                            tracker.clobber(inst, target);
                            continue;
                        }
                    };
                    let kind = inst.move_result().kind();
                    if tracker.process_move(source_of(inst), to, kind).elide {
                        trace!("{}: redundant move {}", block, inst);
                        buffer.delete(index);
                        removed += 1;
                    }
                }
                _ => tracker.clobber(inst, target),
            }
        }
        buffer.apply(lir.block_ops_mut(block));
    }
    stats.redundant_moves_removed += removed;
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::cfg_from_succs;
    use crate::result::CallTarget;
    use crate::target::amd64::*;
    use crate::value::{Value, VirtualStackSlot};
    use crate::{Block, MethodId};

    fn reg(target: &TargetDescription, r: crate::target::Register) -> Value {
        Value::Register(target.arch.register_value(r, Kind::Long))
    }

    fn slot(id: u32) -> Value {
        Value::VirtualStackSlot(VirtualStackSlot { id, kind: Kind::Long })
    }

    fn run(ops: Vec<LirInstruction>) -> (Lir, usize) {
        let mut lir = Lir::new(cfg_from_succs(&[&[]], &[1.0]));
        let mut all = vec![LirInstruction::label(Block::new(0))];
        all.extend(ops);
        all.push(LirInstruction::new(LirOp::Return, smallvec![Value::Illegal], None));
        lir.set_block_ops(Block::new(0), all);
        lir.set_linear_scan_order(vec![Block::new(0)]);
        let mut stats = Stats::default();
        let target = TargetDescription::amd64();
        let removed = eliminate(&mut lir, &target, &mut stats);
        assert_eq!(stats.redundant_moves_removed, removed);
        (lir, removed)
    }

    #[test]
    fn reload_after_spill_is_removed() {
        let t = TargetDescription::amd64();
        let (lir, removed) = run(vec![
            LirInstruction::mov(slot(0), reg(&t, RBX)),
            LirInstruction::mov(reg(&t, RBX), slot(0)),
        ]);
        assert_eq!(removed, 1);
        assert_eq!(lir.block_ops(Block::new(0)).len(), 3);
    }

    #[test]
    fn overwritten_source_keeps_move() {
        let t = TargetDescription::amd64();
        let (_, removed) = run(vec![
            LirInstruction::mov(reg(&t, RCX), reg(&t, RBX)),
            LirInstruction::mov(reg(&t, RBX), Value::Constant(Constant::Long(3))),
            LirInstruction::mov(reg(&t, RCX), reg(&t, RBX)),
        ]);
        assert_eq!(removed, 0);
    }

    #[test]
    fn repeated_constant_is_removed() {
        let t = TargetDescription::amd64();
        let (_, removed) = run(vec![
            LirInstruction::mov(reg(&t, RCX), Value::Constant(Constant::Long(3))),
            LirInstruction::mov(reg(&t, RCX), Value::Constant(Constant::Long(3))),
        ]);
        assert_eq!(removed, 1);
    }

    #[test]
    fn call_clobbers_copies() {
        let t = TargetDescription::amd64();
        let call = LirInstruction::new(
            LirOp::Call {
                target: CallTarget::Method(MethodId::new(0)),
            },
            smallvec![Value::Illegal],
            None,
        );
        let (_, removed) = run(vec![
            LirInstruction::mov(reg(&t, RCX), reg(&t, RBX)),
            call,
            LirInstruction::mov(reg(&t, RCX), reg(&t, RBX)),
        ]);
        assert_eq!(removed, 0);
    }
}
