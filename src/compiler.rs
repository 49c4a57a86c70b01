/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The phase pipeline from a scheduled graph to a compilation result.

use crate::alloc::allocate;
use crate::asm::emit_code;
use crate::block_order::{compute_code_emitting_order, compute_linear_scan_order};
use crate::checker::verify_allocation;
use crate::graph::{MetaAccessProvider, ScheduledGraph};
use crate::lir::build_lir;
use crate::target::TargetDescription;
use crate::{constopt, postalloc};
use crate::{CompilationOutput, CompileError, CompilerOptions, Stats};

pub(crate) fn run<G: ScheduledGraph>(
    graph: &G,
    meta: &dyn MetaAccessProvider,
    target: &TargetDescription,
    options: &CompilerOptions,
) -> Result<CompilationOutput, CompileError> {
    let method = graph.method();
    let name = match meta.method(method) {
        Some(info) => info.name,
        None => format!("method{}", method.index()),
    };
    log::debug!("compiling {}", name);

    let mut stats = Stats::default();
    let (mut lir, mut frame) = build_lir(graph, meta, target, options).map_err(|e| {
        log::info!("{}: {}", name, e);
        e
    })?;

    let linear_scan_order = compute_linear_scan_order(lir.cfg_mut());
    lir.set_linear_scan_order(linear_scan_order);
    let code_emitting_order = compute_code_emitting_order(lir.cfg_mut());
    lir.set_code_emitting_order(code_emitting_order);

    stats.blocks = lir.cfg().num_reachable();
    stats.split_edges = lir.cfg().num_blocks() - graph.num_blocks();
    stats.instructions = lir
        .linear_scan_order()
        .iter()
        .map(|&b| lir.block_ops(b).len())
        .sum();
    log::debug!(
        "{}: {} blocks, {} instructions",
        name,
        stats.blocks,
        stats.instructions
    );

    if options.constant_load_optimization {
        constopt::optimize(&mut lir, &mut stats);
    }
    stats.variables = lir.num_variables();

    let allocated = allocate(&mut lir, target, &mut frame, options, &mut stats)?;
    if options.verify_allocation {
        if let Err(errors) = verify_allocation(&lir, &allocated, target) {
            panic!("{}: allocation failed verification: {:?}", name, errors.errors);
        }
    }

    postalloc::optimize(&mut lir, target, options, &mut stats);

    let frame_map = frame.finish(&target.arch, options.max_frame_size)?;
    let mut result = emit_code(&lir, &frame_map, target, options, &name, &mut stats)?;
    result.set_assumptions(graph.assumptions());

    if options.verbose_log {
        log::info!("{}: {:?}", name, stats);
    }
    Ok(CompilationOutput { result, stats })
}
