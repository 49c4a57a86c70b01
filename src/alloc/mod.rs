/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Linear-scan register allocation over the LIR.
//!
//! Instructions are numbered along the allocation order and every
//! variable gets a live interval: a sorted list of ranges plus the
//! positions where it is used. The walk visits intervals by start
//! position and keeps the set of intervals currently holding each
//! register. When no register is free, the one whose occupants are
//! needed furthest in the future is taken and the occupants are split
//! and partly spilled. Pieces of split intervals are then connected
//! by moves, within blocks at the split position and across blocks on
//! every control-flow edge, and finally all operands are rewritten.

use crate::frame_map::FrameMapBuilder;
use crate::lir::Lir;
use crate::target::TargetDescription;
use crate::{CompileError, CompilerOptions, Stats};

pub(crate) mod data_structures;
pub use data_structures::AllocatedRange;
use data_structures::LinearScan;
pub(crate) mod liveranges;
pub(crate) mod moves;
pub(crate) mod process;
pub(crate) mod spill;
pub(crate) mod stackmap;

#[cfg(test)]
mod tests;

impl<'a> LinearScan<'a> {
    pub(crate) fn init(&mut self) {
        self.number_instructions();
        self.compute_liveness();
        self.build_intervals();
    }

    pub(crate) fn run(&mut self) -> Result<(), CompileError> {
        self.walk()?;
        self.allocate_spill_slots();
        let pending = self.resolve_data_flow();
        self.assign_locations(pending);
        Ok(())
    }
}

/// Allocates registers and stack slots for every variable of `lir`,
/// which must already have its allocation order. Returns the register
/// assignments for verification.
pub fn allocate(
    lir: &mut Lir,
    target: &TargetDescription,
    frame: &mut FrameMapBuilder,
    options: &CompilerOptions,
    stats: &mut Stats,
) -> Result<Vec<AllocatedRange>, CompileError> {
    let mut ls = LinearScan::new(lir, target, frame, options, stats);
    ls.init();
    ls.run()?;
    log::debug!(
        "alloc: {} intervals, {} splits, {} spilled",
        ls.stats.intervals,
        ls.stats.interval_splits,
        ls.stats.spilled_intervals
    );
    Ok(ls.allocated_ranges())
}
