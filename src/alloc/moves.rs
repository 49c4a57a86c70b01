/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Data-flow resolution and location assignment.

use super::data_structures::*;
use crate::lir::{LirInsertionBuffer, LirInstruction, OperandMode};
use crate::moves::{Location, ParallelMoves};
use crate::target::RegisterCategory;
use crate::value::{Kind, Value};
use crate::Block;
use std::collections::BTreeMap;

/// Moves at one insertion point happen in this order: edge moves
/// entering the block, moves between split pieces, edge moves leaving
/// the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum MovePhase {
    BlockEntry,
    Split,
    BlockExit,
}

/// Where a group of parallel moves goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct InsertPoint {
    block: Block,
    index: usize,
    phase: MovePhase,
}

/// Parallel moves per insertion point, in insertion order.
pub(crate) type PendingMoves = BTreeMap<InsertPoint, Vec<(Location, Location, Kind)>>;

impl<'a> LinearScan<'a> {
    fn piece_location(&self, piece: IntervalIndex) -> Location {
        let it = &self.intervals[piece];
        match it.location {
            IntervalLocation::Reg(reg) => Location::Reg(reg),
            IntervalLocation::Stack => {
                let var = match it.variable() {
                    Some(v) => v,
                    None => unreachable!("fixed interval on the stack"),
                };
                match self.spill_slots[var.index()] {
                    Some(slot) => Location::Stack(slot.id),
                    None => panic!("{} spilled without a slot", var),
                }
            }
            IntervalLocation::Unassigned => panic!("unassigned interval {}", it),
        }
    }

    /// Collects the moves connecting split pieces and the moves needed
    /// on every control-flow edge.
    pub(crate) fn resolve_data_flow(&mut self) -> PendingMoves {
        let mut pending = PendingMoves::new();

        for i in 0..self.split_moves.len() {
            let SplitMove { pos, variable } = self.split_moves[i];
            let op_id = pos + 1;
            let block = self.block_at(op_id);
            let index = ((op_id - self.block_from[block.index()]) / 2) as usize;
            let index = index.max(self.lir.block_start_index(block));
            let from = self.child_at(variable, pos - 1, false);
            let to = self.child_at(variable, pos, false);
            debug_assert_ne!(from, to, "no split of {} at {}", variable, pos);
            let (src, dst) = (self.piece_location(from), self.piece_location(to));
            if src != dst {
                trace!("split move at {}: {} {:?} -> {:?}", pos, variable, src, dst);
                let point = InsertPoint {
                    block,
                    index,
                    phase: MovePhase::Split,
                };
                pending
                    .entry(point)
                    .or_default()
                    .push((src, dst, variable.kind));
            }
        }

        for oi in 0..self.order.len() {
            let from = self.order[oi];
            let succs = self.lir.cfg().block(from).succs.clone();
            for &succ in &succs {
                let throw_pos = self
                    .lir
                    .block_ops(from)
                    .iter()
                    .find(|inst| {
                        inst.state
                            .as_ref()
                            .map_or(false, |s| s.exception_edge == Some(succ))
                    })
                    .map(|inst| inst.id as u32);
                let src_pos = throw_pos.unwrap_or(self.block_to[from.index()] - 1);
                let dst_pos = self.block_from[succ.index()];

                let point = if succs.len() == 1 {
                    InsertPoint {
                        block: from,
                        index: self.lir.block_ops(from).len() - 1,
                        phase: MovePhase::BlockExit,
                    }
                } else {
                    debug_assert_eq!(self.lir.cfg().block(succ).preds.len(), 1, "critical edge");
                    InsertPoint {
                        block: succ,
                        index: self.lir.block_start_index(succ),
                        phase: MovePhase::BlockEntry,
                    }
                };

                for var in self.live_in[succ.index()].iter() {
                    let var = self.lir.variable(var);
                    let src = self.location_at(var, src_pos, throw_pos.is_some());
                    let dst = self.location_at(var, dst_pos, false);
                    if src != dst {
                        trace!("edge {} -> {}: {} {:?} -> {:?}", from, succ, var, src, dst);
                        pending.entry(point).or_default().push((src, dst, var.kind));
                    }
                }
            }
        }
        pending
    }

    /// Sequentializes each group of parallel moves into instructions.
    fn materialize_moves(&mut self, pending: PendingMoves) -> Vec<LirInsertionBuffer> {
        let mut buffers = vec![LirInsertionBuffer::new(); self.lir.cfg().num_blocks()];
        let arch = &self.target.arch;
        for (point, moves) in pending {
            for &category in RegisterCategory::ALL.iter() {
                let mut parallel = ParallelMoves::new();
                for &(src, dst, kind) in &moves {
                    if kind.category() == category {
                        parallel.add(src, dst, kind);
                    }
                }
                if parallel.is_empty() {
                    continue;
                }
                let scratch = Location::Reg(self.target.register_config.scratch(category));
                for (src, dst, kind) in parallel.resolve().with_scratch(scratch) {
                    let inst = LirInstruction::mov(dst.to_value(kind, arch), src.to_value(kind, arch));
                    buffers[point.block.index()].append(point.index, inst);
                    match point.phase {
                        MovePhase::Split => self.stats.split_moves += 1,
                        _ => self.stats.resolution_moves += 1,
                    }
                }
            }
        }
        buffers
    }

    /// Rewrites every operand and frame-state value to its allocated
    /// location, fills in reference maps, drops moves that became
    /// no-ops and inserts the resolution moves.
    pub(crate) fn assign_locations(&mut self, pending: PendingMoves) {
        let mut buffers = self.materialize_moves(pending);
        let arch = &self.target.arch;

        for oi in 0..self.order.len() {
            let block = self.order[oi];
            let mut ops = core::mem::take(self.lir.block_ops_mut(block));
            let buffer = &mut buffers[block.index()];
            for (index, inst) in ops.iter_mut().enumerate() {
                let id = inst.id as u32;
                if inst.has_state() {
                    let map = self.reference_map_at(inst, id);
                    if let Some(state) = &mut inst.state {
                        state.set_reference_map(map);
                    }
                }
                inst.for_each_operand_mut(|value, mode, _| {
                    if let Value::Variable(v) = *value {
                        let input = matches!(mode, OperandMode::Use | OperandMode::Alive);
                        *value = self.location_at(v, id, input).to_value(v.kind, arch);
                    }
                });
                inst.for_each_state_value_mut(|value, _| {
                    if let Value::Variable(v) = *value {
                        *value = self.location_at(v, id, true).to_value(v.kind, arch);
                    }
                });
                if inst.is_move() && inst.move_result() == inst.move_input() {
                    buffer.delete(index);
                    self.stats.self_moves_removed += 1;
                }
            }
            core::mem::take(buffer).apply(&mut ops);
            *self.lir.block_ops_mut(block) = ops;
        }

        for index in self.intervals.indices() {
            let it = &self.intervals[index];
            if let (false, Some(reg)) = (it.is_fixed(), it.reg()) {
                if self.target.register_config.is_callee_saved(reg) {
                    self.frame.use_callee_saved(reg);
                }
            }
        }
    }
}
