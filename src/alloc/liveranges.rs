/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Instruction numbering, liveness and interval construction.

use super::data_structures::*;
use crate::bitvec::BitVec;
use crate::lir::{LirOp, OperandFlags, OperandMode};
use crate::target::{Register, RegisterCategory};
use crate::value::{Kind, Value, Variable};
use crate::{Block, FxHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;

/// Something an operand names that gets an interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Target {
    Var(Variable),
    Reg(Register),
}

/// The facts about one instruction that interval construction needs,
/// gathered up front so the LIR is not borrowed while intervals change.
struct InstFacts {
    id: u32,
    operands: SmallVec<[(Target, OperandMode, OperandFlags); 8]>,
    state_vars: SmallVec<[Variable; 8]>,
    destroys_caller_saved: bool,
    is_exception_object: bool,
    /// Def and the operand it should share a location with.
    hint: Option<(Target, Target)>,
}

fn target_of(value: &Value) -> Option<Target> {
    match value {
        Value::Variable(v) => Some(Target::Var(*v)),
        Value::Register(r) => Some(Target::Reg(r.reg)),
        _ => None,
    }
}

pub(crate) fn register_priority(flags: OperandFlags) -> RegisterPriority {
    if !flags.contains(OperandFlags::REG) {
        RegisterPriority::None
    } else if flags.contains(OperandFlags::STACK) {
        RegisterPriority::ShouldHaveRegister
    } else {
        RegisterPriority::MustHaveRegister
    }
}

impl<'a> LinearScan<'a> {
    /// Gives instruction `k` of the allocation order the id `2k`.
    pub(crate) fn number_instructions(&mut self) {
        let mut id = 0u32;
        for i in 0..self.order.len() {
            let block = self.order[i];
            self.block_from[block.index()] = id;
            self.block_begins.push(id);
            for inst in self.lir.block_ops_mut(block).iter_mut() {
                inst.id = id as i32;
                id += 2;
            }
            self.block_to[block.index()] = id;
        }
        trace!("numbered {} instructions", id / 2);
    }

    pub(crate) fn is_allocatable(&self, reg: Register) -> bool {
        self.target
            .register_config
            .allocatable(reg.category())
            .any(|r| r == reg)
    }

    pub(crate) fn compute_liveness(&mut self) {
        let num_blocks = self.lir.cfg().num_blocks();
        let mut gen = vec![BitVec::new(); num_blocks];
        let mut kill = vec![BitVec::new(); num_blocks];

        for &block in &self.order {
            let (g, k) = (&mut gen[block.index()], &mut kill[block.index()]);
            for inst in self.lir.block_ops(block) {
                inst.for_each_operand(|value, mode, _| {
                    if let (Value::Variable(v), OperandMode::Use | OperandMode::Alive) = (value, mode) {
                        if !k.get(v.index()) {
                            g.set(v.index(), true);
                        }
                    }
                });
                inst.for_each_state_value(|value, _| {
                    if let Value::Variable(v) = value {
                        if !k.get(v.index()) {
                            g.set(v.index(), true);
                        }
                    }
                });
                inst.for_each_operand(|value, mode, _| {
                    if let (Value::Variable(v), OperandMode::Temp | OperandMode::Def) = (value, mode) {
                        k.set(v.index(), true);
                    }
                });
            }
        }

        // Worklist over blocks, seeded in reverse allocation order;
        // sets only grow.
        let mut workqueue: VecDeque<Block> = self.order.iter().rev().copied().collect();
        let mut workqueue_set: FxHashSet<Block> = workqueue.iter().copied().collect();
        while let Some(block) = workqueue.pop_front() {
            workqueue_set.remove(&block);
            self.stats.livein_iterations += 1;

            let mut out = BitVec::new();
            for &succ in &self.lir.cfg().block(block).succs {
                out.union_with(&self.live_in[succ.index()]);
            }
            self.live_out[block.index()].union_with(&out);

            let mut live = out;
            live.subtract(&kill[block.index()]);
            live.union_with(&gen[block.index()]);
            if self.live_in[block.index()].union_with(&live) {
                for &pred in &self.lir.cfg().block(block).preds {
                    if workqueue_set.insert(pred) {
                        workqueue.push_back(pred);
                    }
                }
            }
        }

        let entry = self.lir.cfg().entry();
        assert!(
            self.live_in[entry.index()].is_empty(),
            "variables live into the entry block: {:?}",
            self.live_in[entry.index()]
        );
    }

    fn interval_for(&mut self, target: Target) -> Option<IntervalIndex> {
        match target {
            Target::Var(v) => {
                let existing = self.var_intervals[v.index()];
                if existing.is_valid() {
                    return Some(existing);
                }
                let index = IntervalIndex::new(self.intervals.len());
                self.intervals
                    .push(Interval::new(IntervalOperand::Variable(v), v.kind, index));
                self.var_intervals[v.index()] = index;
                Some(index)
            }
            Target::Reg(reg) => {
                if !self.is_allocatable(reg) {
                    return None;
                }
                if let Some(existing) = self.fixed_intervals[reg.index()] {
                    return Some(existing);
                }
                let kind = match reg.category() {
                    RegisterCategory::Cpu => Kind::Long,
                    RegisterCategory::Fpu => Kind::Double,
                };
                let index = IntervalIndex::new(self.intervals.len());
                self.intervals
                    .push(Interval::new(IntervalOperand::Fixed(reg), kind, index));
                self.fixed_intervals[reg.index()] = Some(index);
                Some(index)
            }
        }
    }

    fn gather_facts(&self, block: Block) -> Vec<InstFacts> {
        self.lir
            .block_ops(block)
            .iter()
            .map(|inst| {
                let mut operands = SmallVec::new();
                inst.for_each_operand(|value, mode, flags| {
                    if let Some(t) = target_of(value) {
                        operands.push((t, mode, flags));
                    }
                });
                let mut state_vars = SmallVec::new();
                inst.for_each_state_value(|value, _| {
                    if let Value::Variable(v) = value {
                        state_vars.push(*v);
                    }
                });
                let hint = inst.register_hint().and_then(|(out, input)| {
                    Some((target_of(out)?, target_of(input)?))
                });
                InstFacts {
                    id: inst.id as u32,
                    operands,
                    state_vars,
                    destroys_caller_saved: inst.destroys_caller_saved(),
                    is_exception_object: inst.op == LirOp::ExceptionObject,
                    hint,
                }
            })
            .collect()
    }

    /// Builds intervals walking blocks and instructions backwards, so
    /// ranges are only ever prepended.
    pub(crate) fn build_intervals(&mut self) {
        let caller_saved: SmallVec<[Register; 32]> = RegisterCategory::ALL
            .iter()
            .flat_map(|&cat| self.target.register_config.allocatable(cat))
            .filter(|&r| self.target.register_config.is_caller_saved(r))
            .collect();

        for i in (0..self.order.len()).rev() {
            let block = self.order[i];
            let block_from = self.block_from[block.index()];
            let block_to = self.block_to[block.index()];

            let live_out: SmallVec<[usize; 16]> = self.live_out[block.index()].iter().collect();
            for var in live_out {
                let var = self.lir.variable(var);
                if let Some(it) = self.interval_for(Target::Var(var)) {
                    self.intervals[it].add_range(block_from, block_to);
                }
            }

            for facts in self.gather_facts(block).into_iter().rev() {
                let id = facts.id;
                if facts.destroys_caller_saved {
                    for &reg in &caller_saved {
                        if let Some(it) = self.interval_for(Target::Reg(reg)) {
                            self.intervals[it].add_range(id, id + 1);
                        }
                    }
                }

                for &(target, mode, flags) in &facts.operands {
                    if mode != OperandMode::Def {
                        continue;
                    }
                    let it = match self.interval_for(target) {
                        Some(it) => it,
                        None => continue,
                    };
                    if facts.is_exception_object && matches!(target, Target::Reg(_)) {
                        // The delivered exception occupies its register
                        // from the handler's entry on.
                        self.intervals[it].add_range(block_from, id + 1);
                    } else {
                        self.intervals[it].add_def(id);
                    }
                    if let Target::Var(_) = target {
                        self.intervals[it].add_use_pos(id, register_priority(flags));
                    }
                }

                for &(target, mode, flags) in &facts.operands {
                    let (range_to, priority) = match mode {
                        OperandMode::Temp => (id + 1, RegisterPriority::MustHaveRegister),
                        OperandMode::Alive => (id + 1, register_priority(flags)),
                        OperandMode::Use => (id, register_priority(flags)),
                        OperandMode::Def => continue,
                    };
                    let it = match self.interval_for(target) {
                        Some(it) => it,
                        None => continue,
                    };
                    let range_from = if mode == OperandMode::Temp { id } else { block_from };
                    self.intervals[it].add_range(range_from, range_to);
                    if let Target::Var(_) = target {
                        self.intervals[it].add_use_pos(id, priority);
                    }
                }

                for &var in &facts.state_vars {
                    if let Some(it) = self.interval_for(Target::Var(var)) {
                        self.intervals[it].add_range(block_from, id + 1);
                        self.intervals[it].add_use_pos(id, RegisterPriority::None);
                    }
                }

                if let Some((out, input)) = facts.hint {
                    self.add_hint(out, input);
                }
            }
        }

        for index in self.intervals.indices() {
            let it = &self.intervals[index];
            if it.is_empty() {
                continue;
            }
            if it.is_fixed() {
                self.inactive.push(index);
            } else {
                self.unhandled.push(index);
            }
        }
        let intervals = &self.intervals;
        self.unhandled
            .sort_by_key(|&i| core::cmp::Reverse((intervals[i].from(), i)));
        self.stats.intervals += self.unhandled.len();

        if trace_enabled!() {
            for it in self.intervals.iter() {
                trace!("interval {}", it);
            }
        }
    }

    /// The defined operand prefers the location of the input, and an
    /// input without a hint of its own prefers the defined operand's.
    fn add_hint(&mut self, out: Target, input: Target) {
        let (out_it, in_it) = match (self.interval_for(out), self.interval_for(input)) {
            (Some(o), Some(i)) => (o, i),
            _ => return,
        };
        if out_it == in_it {
            return;
        }
        if matches!(out, Target::Var(_)) {
            self.intervals[out_it].hint = Some(in_it);
        }
        if matches!(input, Target::Var(_)) && self.intervals[in_it].hint.is_none() {
            self.intervals[in_it].hint = Some(out_it);
        }
    }
}
