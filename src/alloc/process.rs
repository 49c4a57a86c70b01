/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The main allocation walk: intervals are visited in order of their
//! start; each gets a free register, a register taken from intervals
//! that need it later, or a stack slot.

use super::data_structures::*;
use crate::target::Register;
use crate::CompileError;
use core::cmp::Reverse;
use smallvec::{smallvec, SmallVec};

type RegPositions = SmallVec<[u32; 16]>;

impl<'a> LinearScan<'a> {
    pub(crate) fn walk(&mut self) -> Result<(), CompileError> {
        while let Some(current) = self.unhandled.pop() {
            let position = self.intervals[current].from();
            self.walk_to(position);
            trace!("walk: {}", self.intervals[current]);

            if !self.alloc_free_reg(current) {
                self.alloc_blocked_reg(current, position)?;
            }
            if self.intervals[current].reg().is_some() {
                self.active.push(current);
            }
        }
        Ok(())
    }

    /// Retires intervals that ended before `position` and moves the
    /// rest between the active and inactive sets.
    fn walk_to(&mut self, position: u32) {
        let mut i = 0;
        while i < self.active.len() {
            let it = &self.intervals[self.active[i]];
            if it.to() <= position {
                self.active.swap_remove(i);
            } else if !it.covers(position) {
                let index = self.active.swap_remove(i);
                self.inactive.push(index);
            } else {
                i += 1;
            }
        }
        let mut i = 0;
        while i < self.inactive.len() {
            let it = &self.intervals[self.inactive[i]];
            if it.to() <= position {
                self.inactive.swap_remove(i);
            } else if it.covers(position) {
                let index = self.inactive.swap_remove(i);
                self.active.push(index);
            } else {
                i += 1;
            }
        }
    }

    fn candidate_registers(&self, current: IntervalIndex) -> SmallVec<[Register; 16]> {
        let category = self.intervals[current].kind.category();
        self.target.register_config.allocatable(category).collect()
    }

    /// The register the hint interval holds around the start of
    /// `current`, if any.
    fn hint_register(&self, current: IntervalIndex) -> Option<Register> {
        let hint = self.intervals[current].hint?;
        let from = self.intervals[current].from();
        let h = &self.intervals[hint];
        if h.is_fixed() {
            return h.reg();
        }
        let root = h.parent;
        let mut pieces = core::iter::once(root).chain(self.intervals[root].children.iter().copied());
        let first = pieces.next()?;
        let mut best = first;
        for piece in pieces {
            if piece != current && self.intervals[piece].from() <= from {
                best = piece;
            }
        }
        self.intervals[best].reg()
    }

    fn alloc_free_reg(&mut self, current: IntervalIndex) -> bool {
        let regs = self.candidate_registers(current);
        let mut free_until: RegPositions = smallvec![u32::MAX; regs.len()];
        let slot_of = |reg: Register| regs.iter().position(|&r| r == reg);

        let cur = &self.intervals[current];
        for &a in &self.active {
            if let Some(i) = self.intervals[a].reg().and_then(slot_of) {
                free_until[i] = 0;
            }
        }
        for &ia in &self.inactive {
            let it = &self.intervals[ia];
            if let Some(i) = it.reg().and_then(slot_of) {
                if let Some(pos) = it.next_intersection(cur, cur.from()) {
                    free_until[i] = free_until[i].min(pos);
                }
            }
        }

        let (from, end) = (cur.from(), cur.to());
        let hinted = self
            .hint_register(current)
            .and_then(slot_of)
            .filter(|&i| free_until[i] >= end);
        let chosen = hinted.or_else(|| {
            (0..regs.len()).max_by_key(|&i| (free_until[i], Reverse(i)))
        });
        let i = match chosen {
            Some(i) if free_until[i] > from + 1 => i,
            _ => return false,
        };

        let reg = regs[i];
        trace!(" -> {} free until {}", reg, free_until[i]);
        self.intervals[current].location = IntervalLocation::Reg(reg);
        if free_until[i] < end {
            self.split_when_partial(current, free_until[i]);
        }
        true
    }

    fn alloc_blocked_reg(&mut self, current: IntervalIndex, position: u32) -> Result<(), CompileError> {
        let regs = self.candidate_registers(current);
        let mut use_pos: RegPositions = smallvec![u32::MAX; regs.len()];
        let mut block_pos: RegPositions = smallvec![u32::MAX; regs.len()];
        let slot_of = |reg: Register| regs.iter().position(|&r| r == reg);

        let cur = &self.intervals[current];
        for &a in &self.active {
            let it = &self.intervals[a];
            if let Some(i) = it.reg().and_then(slot_of) {
                if it.is_fixed() {
                    use_pos[i] = 0;
                    block_pos[i] = 0;
                } else {
                    let next = it.next_usage(RegisterPriority::ShouldHaveRegister, position);
                    use_pos[i] = use_pos[i].min(next);
                }
            }
        }
        for &ia in &self.inactive {
            let it = &self.intervals[ia];
            let i = match it.reg().and_then(slot_of) {
                Some(i) => i,
                None => continue,
            };
            if let Some(pos) = it.next_intersection(cur, position) {
                if it.is_fixed() {
                    block_pos[i] = block_pos[i].min(pos);
                    use_pos[i] = use_pos[i].min(pos);
                } else {
                    let next = it.next_usage(RegisterPriority::ShouldHaveRegister, position);
                    use_pos[i] = use_pos[i].min(next);
                }
            }
        }

        let from = cur.from();
        let first_must = cur.next_usage(RegisterPriority::MustHaveRegister, from);
        let first_should = cur.next_usage(RegisterPriority::ShouldHaveRegister, from);
        let chosen = (0..regs.len())
            .filter(|&i| block_pos[i] > from + 1)
            .max_by_key(|&i| (use_pos[i], Reverse(i)));

        match chosen {
            Some(i) if use_pos[i] > first_should => {
                let reg = regs[i];
                trace!(" -> {} taken, occupants next used at {}", reg, use_pos[i]);
                self.intervals[current].location = IntervalLocation::Reg(reg);
                if block_pos[i] < self.intervals[current].to() {
                    self.split_when_partial(current, block_pos[i]);
                }
                self.split_and_spill_intersecting(current, reg, position);
                Ok(())
            }
            _ => {
                if first_must <= from + 1 {
                    let variable = match self.intervals[current].variable() {
                        Some(v) => v,
                        None => unreachable!("fixed intervals are never allocated"),
                    };
                    log::info!("allocator: no register for {} at {}", variable, from);
                    return Err(CompileError::AllocatorExhausted {
                        variable,
                        block: self.block_at(from),
                        position: from,
                    });
                }
                trace!(" -> spilled, first register use at {}", first_should);
                self.split_and_spill(current, position);
                Ok(())
            }
        }
    }

    /// Moves a split position to a point between instructions, or to a
    /// block start where edge resolution connects the pieces.
    pub(crate) fn normalize_split_pos(&self, pos: u32) -> u32 {
        if self.is_block_begin(pos) {
            pos
        } else if pos % 2 == 0 {
            pos - 1
        } else if self.is_block_begin(pos + 1) {
            pos + 1
        } else {
            pos
        }
    }

    /// Picks a split position in `[min, max]`: the start of the least
    /// deeply nested block in that span, else as late as possible.
    fn find_optimal_split_pos(&self, min: u32, max: u32) -> u32 {
        if min >= max {
            return max;
        }
        let lo = self.block_begins.partition_point(|&b| b <= min);
        let hi = self.block_begins.partition_point(|&b| b <= max);
        let cfg = self.lir.cfg();
        let mut best: Option<(u32, u32)> = None;
        for (k, &begin) in self.block_begins[lo..hi].iter().enumerate() {
            let depth = cfg.block(self.order[lo + k]).loop_depth;
            match best {
                Some((d, _)) if d < depth => {}
                _ => best = Some((depth, begin)),
            }
        }
        best.map_or(max, |(_, begin)| begin)
    }

    pub(crate) fn add_to_unhandled(&mut self, index: IntervalIndex) {
        let key = (self.intervals[index].from(), index);
        let intervals = &self.intervals;
        let at = self
            .unhandled
            .partition_point(|&i| (intervals[i].from(), i) > key);
        self.unhandled.insert(at, index);
    }

    /// Splits `index` at `pos`, records the connecting move and
    /// returns the new child.
    pub(crate) fn split_interval(&mut self, index: IntervalIndex, pos: u32) -> IntervalIndex {
        let child_index = IntervalIndex::new(self.intervals.len());
        let child = self.intervals[index].split(pos, child_index);
        let root = child.parent;
        let child_from = child.from();
        self.intervals.push(child);

        let intervals = &self.intervals;
        let at = intervals[root]
            .children
            .partition_point(|&c| intervals[c].from() < child_from);
        self.intervals[root].children.insert(at, child_index);
        self.stats.interval_splits += 1;

        let connected = self.intervals[index].to() == pos && child_from == pos;
        if let (true, false, Some(variable)) =
            (connected, self.is_block_begin(pos), self.intervals[index].variable())
        {
            self.split_moves.push(SplitMove { pos, variable });
        }
        trace!(
            "split at {}: {} | {}",
            pos,
            self.intervals[index],
            self.intervals[child_index]
        );
        child_index
    }

    /// Splits off the part of `index` from a position in `[min, max]`
    /// and queues it.
    fn split_before_usage(&mut self, index: IntervalIndex, min: u32, max: u32) {
        let pos = self.normalize_split_pos(self.find_optimal_split_pos(min, max));
        let it = &self.intervals[index];
        if pos <= it.from() || pos >= it.to() {
            return;
        }
        let child = self.split_interval(index, pos);
        self.add_to_unhandled(child);
    }

    /// `index` holds its register only until `available_until`.
    fn split_when_partial(&mut self, index: IntervalIndex, available_until: u32) {
        let it = &self.intervals[index];
        let min = it
            .previous_usage(RegisterPriority::ShouldHaveRegister, available_until)
            .unwrap_or(0)
            .max(it.from() + 1);
        self.split_before_usage(index, min, available_until);
    }

    fn spill(&mut self, index: IntervalIndex) {
        self.intervals[index].location = IntervalLocation::Stack;
        self.stats.spilled_intervals += 1;
        trace!(" spilled {}", self.intervals[index]);
    }

    /// Sends the part of `index` around `position` to the stack; the
    /// part from its next must-have use on is queued again.
    fn split_and_spill(&mut self, index: IntervalIndex, position: u32) {
        let it = &self.intervals[index];
        let min = position + 1;
        let max = it
            .next_usage(RegisterPriority::MustHaveRegister, min)
            .min(it.to());
        self.split_before_usage(index, min, max);
        self.split_for_spilling(index, position);
    }

    fn split_for_spilling(&mut self, index: IntervalIndex, position: u32) {
        let it = &self.intervals[index];
        let mut prev = it.previous_usage(RegisterPriority::ShouldHaveRegister, position);
        if prev == Some(position) {
            prev = it.previous_usage(RegisterPriority::MustHaveRegister, position);
        }
        let from = it.from();
        let min = prev.map_or(from, |p| (p + 1).max(from));
        if min <= from {
            self.spill(index);
            return;
        }
        let pos = self.normalize_split_pos(self.find_optimal_split_pos(min, position));
        if pos >= self.intervals[index].to() {
            // Already ends before the register is needed.
            return;
        }
        let spilled = self.split_interval(index, pos);
        self.spill(spilled);
    }

    /// Evicts the intervals holding `reg` that conflict with `current`.
    fn split_and_spill_intersecting(&mut self, current: IntervalIndex, reg: Register, position: u32) {
        let holds = |it: &Interval| !it.is_fixed() && it.reg() == Some(reg);

        let evicted: SmallVec<[IntervalIndex; 4]> = self
            .active
            .iter()
            .copied()
            .filter(|&a| holds(&self.intervals[a]))
            .collect();
        self.active.retain(|a| !evicted.contains(a));
        for it in evicted {
            self.split_and_spill(it, position);
        }

        let cur = &self.intervals[current];
        let evicted: SmallVec<[IntervalIndex; 4]> = self
            .inactive
            .iter()
            .copied()
            .filter(|&ia| {
                let it = &self.intervals[ia];
                holds(it) && it.next_intersection(cur, position).is_some()
            })
            .collect();
        self.inactive.retain(|ia| !evicted.contains(ia));
        for it in evicted {
            // Inactive here, so the register is only needed again once
            // the rest is reallocated.
            self.split_before_usage(it, position + 1, position + 1);
        }
    }
}
