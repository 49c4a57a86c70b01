/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Spill slot allocation.

use super::data_structures::*;
use crate::value::{Kind, Variable, VirtualStackSlot};
use core::iter;
use smallvec::SmallVec;

define_index!(SpillSlot, SpillSlots, SpillSlotData);

/// A frame slot and the code ranges during which some variable lives
/// in it.
#[derive(Clone, Debug)]
pub struct SpillSlotData {
    pub slot: VirtualStackSlot,
    /// Sorted by start.
    pub ranges: Vec<CodeRange>,
}

impl SpillSlotData {
    fn can_fit(&self, ranges: &[CodeRange]) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < ranges.len() {
            if self.ranges[i].overlaps(&ranges[j]) {
                return false;
            }
            if self.ranges[i].to <= ranges[j].to {
                i += 1;
            } else {
                j += 1;
            }
        }
        true
    }

    fn add(&mut self, ranges: &[CodeRange]) {
        self.ranges.extend_from_slice(ranges);
        self.ranges.sort_unstable_by_key(|r| r.from);
    }
}

/// How many slots of a kind to probe before taking a fresh one.
const MAX_PROBES: usize = 10;

impl<'a> LinearScan<'a> {
    /// Ranges during which `var` lives on the stack.
    fn stack_ranges(&self, root: IntervalIndex) -> SmallVec<[CodeRange; 4]> {
        let mut ranges: SmallVec<[CodeRange; 4]> = iter::once(root)
            .chain(self.intervals[root].children.iter().copied())
            .map(|piece| &self.intervals[piece])
            .filter(|it| it.location == IntervalLocation::Stack)
            .flat_map(|it| it.ranges.iter().copied())
            .collect();
        ranges.sort_unstable_by_key(|r| r.from);
        ranges
    }

    /// Gives every spilled variable a slot. Variables whose stack
    /// lifetimes are disjoint share one when slot sharing is enabled.
    pub(crate) fn allocate_spill_slots(&mut self) {
        let mut spilled: Vec<(Variable, SmallVec<[CodeRange; 4]>)> = vec![];
        for &root in &self.var_intervals {
            if root.is_invalid() {
                continue;
            }
            let ranges = self.stack_ranges(root);
            if let (false, Some(var)) = (ranges.is_empty(), self.intervals[root].variable()) {
                spilled.push((var, ranges));
            }
        }
        spilled.sort_by_key(|(var, ranges)| (ranges[0].from, var.index()));

        let mut slots = SpillSlots::default();
        let mut slots_by_kind: Vec<Vec<SpillSlot>> = vec![vec![]; Kind::COUNT];
        for (var, ranges) in spilled {
            let candidates = &slots_by_kind[var.kind as usize];
            let reused = if self.options.stack_slot_sharing {
                candidates
                    .iter()
                    .rev()
                    .take(MAX_PROBES)
                    .copied()
                    .find(|&s| slots[s].can_fit(&ranges))
            } else {
                None
            };
            let slot = match reused {
                Some(s) => {
                    trace!("{} shares {}", var, slots[s].slot);
                    self.stats.shared_spill_slots += 1;
                    s
                }
                None => {
                    let slot = self.frame.allocate_spill_slot(var.kind);
                    self.stats.spill_slots += 1;
                    let s = slots.push(SpillSlotData {
                        slot,
                        ranges: vec![],
                    });
                    slots_by_kind[var.kind as usize].push(s);
                    s
                }
            };
            slots[slot].add(&ranges);
            self.spill_slots[var.index()] = Some(slots[slot].slot);
        }
        log::debug!(
            "alloc: {} spill slots, {} shared",
            slots.len(),
            self.stats.shared_spill_slots
        );
    }
}
