/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Reference map computation.

use super::data_structures::*;
use crate::lir::{LirInstruction, OperandMode, ReferenceMap};
use crate::value::{Kind, Value, VirtualStackSlot};
use core::iter;
use smallvec::SmallVec;

impl<'a> LinearScan<'a> {
    /// Registers and slots holding references that are live across the
    /// instruction at `id`. References the instruction itself defines
    /// are not yet valid there, and references it only reads are dead
    /// once it executes.
    pub(crate) fn reference_map_at(&self, inst: &LirInstruction, id: u32) -> ReferenceMap {
        let mut defined: SmallVec<[usize; 2]> = SmallVec::new();
        inst.for_each_operand(|value, mode, _| {
            if let (Value::Variable(v), OperandMode::Def) = (value, mode) {
                defined.push(v.index());
            }
        });

        let mut map = ReferenceMap::default();
        for (var, &root) in self.var_intervals.iter().enumerate() {
            if root.is_invalid() || self.intervals[root].kind != Kind::Object || defined.contains(&var) {
                continue;
            }
            let piece = iter::once(root)
                .chain(self.intervals[root].children.iter().copied())
                .find(|&p| self.intervals[p].covers(id));
            let piece = match piece {
                Some(p) => p,
                None => continue,
            };
            match self.intervals[piece].location {
                IntervalLocation::Reg(reg) => map.registers.push(reg),
                IntervalLocation::Stack => {
                    if let Some(slot) = self.spill_slots[var] {
                        let slot = VirtualStackSlot {
                            id: slot.id,
                            kind: Kind::Object,
                        };
                        if !map.slots.contains(&Value::VirtualStackSlot(slot)) {
                            map.slots.push(Value::VirtualStackSlot(slot));
                        }
                    }
                }
                IntervalLocation::Unassigned => {}
            }
        }
        map.registers.sort();
        trace!("reference map at {}: {:?}", id, map);
        map
    }

    /// Every piece that ended up in a register, for the checker.
    pub(crate) fn allocated_ranges(&self) -> Vec<AllocatedRange> {
        self.intervals
            .iter()
            .filter(|it| !it.is_empty())
            .filter_map(|it| {
                Some(AllocatedRange {
                    variable: it.variable(),
                    register: it.reg()?,
                    ranges: it.ranges.clone(),
                })
            })
            .collect()
    }
}
