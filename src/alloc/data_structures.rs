/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Data structures for the linear-scan allocator.

use crate::bitvec::BitVec;
use crate::frame_map::FrameMapBuilder;
use crate::lir::Lir;
use crate::moves::Location;
use crate::target::{Register, TargetDescription};
use crate::value::{Kind, Variable, VirtualStackSlot};
use crate::{Block, CompilerOptions, Stats};
use core::fmt;
use smallvec::SmallVec;

define_index!(IntervalIndex, Intervals, Interval);

/// A range from `from` (inclusive) to `to` (exclusive), in instruction
/// ids. Instruction `k` of the allocation order has id `2k`; odd ids
/// are the points between instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodeRange {
    pub from: u32,
    pub to: u32,
}

impl CodeRange {
    #[inline(always)]
    pub fn contains_point(&self, pos: u32) -> bool {
        pos >= self.from && pos < self.to
    }
    #[inline(always)]
    pub fn overlaps(&self, other: &Self) -> bool {
        other.to > self.from && other.from < self.to
    }
}

/// How badly a use wants a register.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegisterPriority {
    /// Frame-state uses and anything a stack slot serves as well.
    None,
    /// A register is preferred but a stack slot is acceptable.
    ShouldHaveRegister,
    /// The operand only accepts a register.
    MustHaveRegister,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsePos {
    pub pos: u32,
    pub priority: RegisterPriority,
}

/// What an interval holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalOperand {
    Variable(Variable),
    /// A physical register referenced directly by instructions.
    Fixed(Register),
}

/// Where an interval lives once allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntervalLocation {
    Unassigned,
    Reg(Register),
    /// The variable's spill slot, chosen once all intervals are walked.
    Stack,
}

/// The live range of a variable or fixed register. Splitting produces
/// children that share the root's operand; each child has one location.
#[derive(Clone, Debug)]
pub struct Interval {
    pub operand: IntervalOperand,
    pub kind: Kind,
    /// Sorted, disjoint and non-adjacent.
    pub ranges: SmallVec<[CodeRange; 4]>,
    /// Sorted by position.
    pub uses: SmallVec<[UsePos; 4]>,
    pub location: IntervalLocation,
    /// The unsplit interval; itself for roots.
    pub parent: IntervalIndex,
    /// Split children in position order; only filled in roots.
    pub children: SmallVec<[IntervalIndex; 2]>,
    /// Interval whose register this one should prefer.
    pub hint: Option<IntervalIndex>,
}

impl Interval {
    pub fn new(operand: IntervalOperand, kind: Kind, index: IntervalIndex) -> Self {
        let location = match operand {
            IntervalOperand::Fixed(reg) => IntervalLocation::Reg(reg),
            IntervalOperand::Variable(_) => IntervalLocation::Unassigned,
        };
        Interval {
            operand,
            kind,
            ranges: SmallVec::new(),
            uses: SmallVec::new(),
            location,
            parent: index,
            children: SmallVec::new(),
            hint: None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        matches!(self.operand, IntervalOperand::Fixed(_))
    }

    pub fn variable(&self) -> Option<Variable> {
        match self.operand {
            IntervalOperand::Variable(v) => Some(v),
            IntervalOperand::Fixed(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn from(&self) -> u32 {
        self.ranges.first().map_or(u32::MAX, |r| r.from)
    }

    pub fn to(&self) -> u32 {
        self.ranges.last().map_or(0, |r| r.to)
    }

    pub fn reg(&self) -> Option<Register> {
        match self.location {
            IntervalLocation::Reg(reg) => Some(reg),
            _ => None,
        }
    }

    pub fn covers(&self, pos: u32) -> bool {
        self.ranges.iter().any(|r| r.contains_point(pos))
    }

    /// Adds `[from, to)` while building backwards: ranges arrive in
    /// descending order and merge with the first range if they touch.
    pub fn add_range(&mut self, from: u32, to: u32) {
        debug_assert!(from < to);
        match self.ranges.first_mut() {
            Some(first) if first.from <= to => {
                first.from = first.from.min(from);
                first.to = first.to.max(to);
            }
            _ => self.ranges.insert(0, CodeRange { from, to }),
        }
    }

    /// A definition at `pos` starts the live range there.
    pub fn add_def(&mut self, pos: u32) {
        match self.ranges.first_mut() {
            Some(first) if first.from <= pos => {
                first.from = pos;
            }
            _ => {
                // Dead definition: keep the location reserved for the
                // instruction itself.
                self.ranges.insert(0, CodeRange { from: pos, to: pos + 1 });
            }
        }
    }

    pub fn add_use_pos(&mut self, pos: u32, priority: RegisterPriority) {
        // Uses arrive in descending order; a duplicate position keeps
        // the strongest priority.
        match self.uses.first_mut() {
            Some(first) if first.pos == pos => {
                first.priority = first.priority.max(priority);
            }
            _ => self.uses.insert(0, UsePos { pos, priority }),
        }
    }

    /// First position at or after `from` where both intervals are
    /// live.
    pub fn next_intersection(&self, other: &Interval, from: u32) -> Option<u32> {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a, b) = (self.ranges[i], other.ranges[j]);
            if a.to <= from {
                i += 1;
                continue;
            }
            if b.to <= from {
                j += 1;
                continue;
            }
            if a.overlaps(&b) {
                let start = a.from.max(b.from).max(from);
                if start < a.to.min(b.to) {
                    return Some(start);
                }
            }
            if a.to <= b.to {
                i += 1;
            } else {
                j += 1;
            }
        }
        None
    }

    /// First use at or after `from` with at least `priority`.
    pub fn next_usage(&self, priority: RegisterPriority, from: u32) -> u32 {
        self.uses
            .iter()
            .find(|u| u.pos >= from && u.priority >= priority)
            .map_or(u32::MAX, |u| u.pos)
    }

    /// Last use at or before `pos` with at least `priority`.
    pub fn previous_usage(&self, priority: RegisterPriority, pos: u32) -> Option<u32> {
        self.uses
            .iter()
            .take_while(|u| u.pos <= pos)
            .filter(|u| u.priority >= priority)
            .last()
            .map(|u| u.pos)
    }

    /// Splits at `pos`: this interval keeps everything before `pos`,
    /// the returned child everything from `pos` on.
    pub fn split(&mut self, pos: u32, child_index: IntervalIndex) -> Interval {
        debug_assert!(pos > self.from() && pos < self.to());
        let mut child = Interval::new(self.operand, self.kind, child_index);
        child.parent = self.parent;
        child.hint = self.hint;

        let cut = self.ranges.iter().position(|r| r.to > pos).unwrap_or(self.ranges.len());
        let mut tail: SmallVec<[CodeRange; 4]> = self.ranges.drain(cut..).collect();
        if let Some(first) = tail.first_mut() {
            if first.from < pos {
                self.ranges.push(CodeRange { from: first.from, to: pos });
                first.from = pos;
            }
        }
        child.ranges = tail;

        let use_cut = self.uses.iter().position(|u| u.pos >= pos).unwrap_or(self.uses.len());
        child.uses = self.uses.drain(use_cut..).collect();
        child
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.operand {
            IntervalOperand::Variable(v) => write!(f, "{}", v)?,
            IntervalOperand::Fixed(r) => write!(f, "fixed({})", r)?,
        }
        match self.location {
            IntervalLocation::Unassigned => {}
            IntervalLocation::Reg(r) => write!(f, " @{}", r)?,
            IntervalLocation::Stack => write!(f, " @stack")?,
        }
        for r in &self.ranges {
            write!(f, " [{}, {})", r.from, r.to)?;
        }
        write!(f, " uses")?;
        for u in &self.uses {
            write!(f, " {}:{:?}", u.pos, u.priority)?;
        }
        Ok(())
    }
}

/// A move connecting the two pieces of `variable` that meet at the odd
/// position `pos`, inserted before the instruction following it. The
/// pieces are looked up at resolution time, since either side may be
/// split again after the move is recorded.
#[derive(Clone, Copy, Debug)]
pub struct SplitMove {
    pub pos: u32,
    pub variable: Variable,
}

pub struct LinearScan<'a> {
    pub(crate) lir: &'a mut Lir,
    pub(crate) target: &'a TargetDescription,
    pub(crate) frame: &'a mut FrameMapBuilder,
    pub(crate) options: &'a CompilerOptions,
    pub(crate) stats: &'a mut Stats,

    /// Blocks in allocation order.
    pub(crate) order: Vec<Block>,
    /// Id of each block's label, indexed by block.
    pub(crate) block_from: Vec<u32>,
    /// One past the id of each block's last instruction.
    pub(crate) block_to: Vec<u32>,
    /// Label ids in allocation order, for position lookups.
    pub(crate) block_begins: Vec<u32>,

    pub(crate) live_in: Vec<BitVec>,
    pub(crate) live_out: Vec<BitVec>,

    pub(crate) intervals: Intervals,
    /// Root interval per variable; invalid when the variable is unused.
    pub(crate) var_intervals: Vec<IntervalIndex>,
    /// Interval per register index for allocatable registers that
    /// instructions reference directly.
    pub(crate) fixed_intervals: Vec<Option<IntervalIndex>>,

    /// Sorted by descending start so the next interval pops off the end.
    pub(crate) unhandled: Vec<IntervalIndex>,
    pub(crate) active: Vec<IntervalIndex>,
    pub(crate) inactive: Vec<IntervalIndex>,

    pub(crate) split_moves: Vec<SplitMove>,
    /// Slot per variable, filled once all intervals are walked.
    pub(crate) spill_slots: Vec<Option<VirtualStackSlot>>,
}

impl<'a> LinearScan<'a> {
    pub(crate) fn new(
        lir: &'a mut Lir,
        target: &'a TargetDescription,
        frame: &'a mut FrameMapBuilder,
        options: &'a CompilerOptions,
        stats: &'a mut Stats,
    ) -> Self {
        let num_blocks = lir.cfg().num_blocks();
        let num_vars = lir.num_variables();
        let order = lir.linear_scan_order().to_vec();
        LinearScan {
            lir,
            target,
            frame,
            options,
            stats,
            order,
            block_from: vec![0; num_blocks],
            block_to: vec![0; num_blocks],
            block_begins: vec![],
            live_in: vec![BitVec::new(); num_blocks],
            live_out: vec![BitVec::new(); num_blocks],
            intervals: Intervals::with_capacity(num_vars + 16),
            var_intervals: vec![IntervalIndex::invalid(); num_vars],
            fixed_intervals: vec![None; Register::NUM_INDICES],
            unhandled: vec![],
            active: vec![],
            inactive: vec![],
            split_moves: vec![],
            spill_slots: vec![None; num_vars],
        }
    }

    pub(crate) fn is_block_begin(&self, pos: u32) -> bool {
        self.block_begins.binary_search(&pos).is_ok()
    }

    /// The block containing instruction id `pos`.
    pub(crate) fn block_at(&self, pos: u32) -> Block {
        let i = self.block_begins.partition_point(|&begin| begin <= pos);
        debug_assert!(i > 0);
        self.order[i - 1]
    }

    /// The piece of `var` holding it at `pos`. Inputs may read a piece
    /// ending exactly at `pos`.
    pub(crate) fn child_at(&self, var: Variable, pos: u32, input: bool) -> IntervalIndex {
        let root = self.var_intervals[var.index()];
        debug_assert!(root.is_valid(), "no interval for {}", var);
        let end_slack = u32::from(input);
        let pieces = core::iter::once(root).chain(self.intervals[root].children.iter().copied());
        for piece in pieces {
            let it = &self.intervals[piece];
            if it.from() <= pos && pos < it.to() + end_slack {
                return piece;
            }
        }
        panic!("{} has no location at {}", var, pos)
    }

    /// Allocated location of `var` at `pos` as a register or spill slot.
    pub(crate) fn location_at(&self, var: Variable, pos: u32, input: bool) -> Location {
        let piece = self.child_at(var, pos, input);
        match self.intervals[piece].location {
            IntervalLocation::Reg(reg) => Location::Reg(reg),
            IntervalLocation::Stack => match self.spill_slots[var.index()] {
                Some(slot) => Location::Stack(slot.id),
                None => panic!("{} spilled without a slot", var),
            },
            IntervalLocation::Unassigned => panic!("{} unassigned at {}", var, pos),
        }
    }
}

/// A piece of an interval held in a register, as reported to the
/// checker.
#[derive(Clone, Debug)]
pub struct AllocatedRange {
    /// `None` for fixed register uses.
    pub variable: Option<Variable>,
    pub register: Register,
    pub ranges: SmallVec<[CodeRange; 4]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interval(ranges: &[(u32, u32)]) -> Interval {
        let mut it = Interval::new(
            IntervalOperand::Variable(Variable::new(0, Kind::Int)),
            Kind::Int,
            IntervalIndex::new(0),
        );
        for &(from, to) in ranges.iter().rev() {
            it.add_range(from, to);
        }
        it
    }

    #[test]
    fn backward_range_building() {
        let mut it = interval(&[(10, 20)]);
        it.add_range(4, 10);
        assert_eq!(it.ranges.as_slice(), &[CodeRange { from: 4, to: 20 }]);
        it.add_range(0, 2);
        assert_eq!(it.ranges.len(), 2);
        it.add_def(0);
        assert_eq!(it.from(), 0);
        let mut dead = interval(&[]);
        dead.add_def(8);
        assert_eq!(dead.ranges.as_slice(), &[CodeRange { from: 8, to: 9 }]);
    }

    #[test]
    fn intersections() {
        let a = interval(&[(0, 4), (10, 20)]);
        let b = interval(&[(4, 8), (16, 30)]);
        assert_eq!(a.next_intersection(&b, 0), Some(16));
        assert_eq!(b.next_intersection(&a, 17), Some(17));
        let c = interval(&[(4, 10)]);
        assert_eq!(a.next_intersection(&c, 0), None);
    }

    #[test]
    fn split_divides_ranges_and_uses() {
        let mut it = interval(&[(0, 8), (12, 20)]);
        it.add_use_pos(18, RegisterPriority::MustHaveRegister);
        it.add_use_pos(6, RegisterPriority::ShouldHaveRegister);
        it.add_use_pos(2, RegisterPriority::MustHaveRegister);
        let child = it.split(5, IntervalIndex::new(1));
        assert_eq!(it.ranges.as_slice(), &[CodeRange { from: 0, to: 5 }]);
        assert_eq!(
            child.ranges.as_slice(),
            &[CodeRange { from: 5, to: 8 }, CodeRange { from: 12, to: 20 }]
        );
        assert_eq!(it.uses.len(), 1);
        assert_eq!(child.next_usage(RegisterPriority::MustHaveRegister, 0), 18);
        assert_eq!(child.previous_usage(RegisterPriority::ShouldHaveRegister, 17), Some(6));
        assert_eq!(child.parent, IntervalIndex::new(0));

        // Splitting inside a hole leaves no range at the split point.
        let mut holey = interval(&[(0, 4), (10, 20)]);
        let tail = holey.split(7, IntervalIndex::new(1));
        assert_eq!(holey.to(), 4);
        assert_eq!(tail.from(), 10);
    }
}
