/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Peephole passes over allocated LIR.

use crate::block_order::delete_empty_blocks;
use crate::lir::Lir;
use crate::target::TargetDescription;
use crate::{CompilerOptions, Stats};

pub(crate) mod null_check;
pub(crate) mod redundant_moves;

pub use null_check::fold as fold_null_checks;
pub use redundant_moves::eliminate as eliminate_redundant_moves;

/// Runs the enabled passes. Empty blocks are deleted last since the
/// other passes can empty a block out.
pub fn optimize(lir: &mut Lir, target: &TargetDescription, options: &CompilerOptions, stats: &mut Stats) {
    if options.redundant_move_elimination {
        eliminate_redundant_moves(lir, target, stats);
    }
    if options.null_check_folding {
        fold_null_checks(lir, options.implicit_null_check_limit, stats);
    }
    if options.control_flow_optimization {
        stats.empty_blocks_deleted += delete_empty_blocks(lir);
    }
    log::debug!(
        "post-allocation: {} moves removed, {} null checks folded, {} empty blocks deleted",
        stats.redundant_moves_removed,
        stats.null_checks_folded,
        stats.empty_blocks_deleted
    );
}
