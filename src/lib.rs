/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Code generation back end of a just-in-time compiler.
//!
//! A scheduled graph is lowered into LIR, the blocks are ordered for
//! register allocation and for emission, a linear-scan allocator assigns
//! registers and stack slots, peephole passes clean up the allocated
//! code, and the assembler produces machine code together with the
//! metadata a runtime needs to install it: infopoints with debug info,
//! data patches, exception handlers, marks and the data section.

#![allow(dead_code)]

macro_rules! trace {
    ($($tt:tt)*) => {
        if cfg!(feature = "trace-log") {
            ::log::trace!($($tt)*);
        }
    };
}

macro_rules! trace_enabled {
    () => {
        cfg!(feature = "trace-log") && ::log::log_enabled!(::log::Level::Trace)
    };
}

#[macro_use]
mod index;
pub use index::{Block, MethodId, NodeId, TypeId};

pub mod alloc;
pub mod asm;
pub mod bitvec;
pub mod block_order;
pub mod cfg;
pub mod checker;
mod compiler;
pub mod constant;
pub mod constopt;
pub mod data_section;
pub(crate) mod domtree;
pub mod frame_map;
pub mod graph;
pub mod lir;
pub mod moves;
pub mod postalloc;
pub(crate) mod postorder;
pub mod result;
pub mod target;
pub mod value;

#[cfg(feature = "enable-serde")]
pub mod serialize;


use graph::{MetaAccessProvider, ScheduledGraph};
use result::CompilationResult;
use target::TargetDescription;
use value::Variable;

pub type FxHashMap<K, V> = hashbrown::HashMap<K, V, rustc_hash::FxBuildHasher>;
pub type FxHashSet<V> = hashbrown::HashSet<V, rustc_hash::FxBuildHasher>;

/// An error that prevents compilation.
#[derive(Clone, Debug, PartialEq)]
pub enum CompileError {
    /// The graph cannot be compiled under the current constraints. The
    /// caller should fall back to interpretation.
    Bailout { reason: String },
    /// No register or stack slot could be found for a variable.
    AllocatorExhausted {
        variable: Variable,
        block: Block,
        position: u32,
    },
    /// The assembler has no encoding for an operand combination.
    Encoding { op: &'static str, operands: String },
    /// The laid out frame exceeds `CompilerOptions::max_frame_size`.
    FrameTooLarge { frame_size: u32, limit: u32 },
}

impl CompileError {
    pub fn bailout(reason: impl Into<String>) -> Self {
        CompileError::Bailout {
            reason: reason.into(),
        }
    }

    pub fn is_bailout(&self) -> bool {
        matches!(self, CompileError::Bailout { .. })
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for CompileError {}

pub type Result<T> = core::result::Result<T, CompileError>;

/// Options for compilation.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct CompilerOptions {
    /// Move constant loads to the blocks that use them.
    pub constant_load_optimization: bool,
    /// Remove moves whose destination already holds the value.
    pub redundant_move_elimination: bool,
    /// Fold explicit null checks into a following memory access.
    pub null_check_folding: bool,
    /// Delete blocks that only jump to their successor.
    pub control_flow_optimization: bool,
    /// Let spill slots of disjoint intervals share a stack slot.
    pub stack_slot_sharing: bool,
    /// Run the allocation checker and panic on errors.
    pub verify_allocation: bool,
    /// Annotate the code with a comment per block.
    pub block_comments: bool,
    /// Largest frame, in bytes, before compilation is rejected.
    pub max_frame_size: u32,
    /// Largest field offset for which a fault on access can stand in
    /// for an explicit null check.
    pub implicit_null_check_limit: u32,
    /// Bytes reserved at the bottom of the frame for the runtime.
    pub custom_stack_area_size: u32,
    /// Add extra verbosity to debug logs.
    pub verbose_log: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        CompilerOptions {
            constant_load_optimization: true,
            redundant_move_elimination: true,
            null_check_folding: true,
            control_flow_optimization: true,
            stack_slot_sharing: true,
            verify_allocation: false,
            block_comments: false,
            max_frame_size: 1 << 20,
            implicit_null_check_limit: 4096,
            custom_stack_area_size: 0,
            verbose_log: false,
        }
    }
}

/// Counters collected by the compilation phases.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Stats {
    pub blocks: usize,
    pub split_edges: usize,
    pub instructions: usize,
    pub variables: usize,
    pub livein_iterations: usize,
    pub intervals: usize,
    pub interval_splits: usize,
    pub spilled_intervals: usize,
    pub spill_slots: usize,
    pub shared_spill_slots: usize,
    pub split_moves: usize,
    pub resolution_moves: usize,
    pub self_moves_removed: usize,
    pub empty_blocks_deleted: usize,
    pub constants_seen: usize,
    pub constants_optimized: usize,
    pub constant_materializations: usize,
    pub redundant_moves_removed: usize,
    pub null_checks_folded: usize,
    pub code_bytes: usize,
    pub data_bytes: usize,
    pub infopoints: usize,
}

/// The product of a successful compilation.
#[derive(Clone, Debug)]
pub struct CompilationOutput {
    pub result: CompilationResult,
    pub stats: Stats,
}

/// Receives finished compilation results, for example to copy them into
/// a code cache.
pub trait CodeInstaller {
    /// A handle to the installed code.
    type InstalledCode;

    fn install(
        &mut self,
        method: MethodId,
        result: &CompilationResult,
    ) -> Result<Self::InstalledCode>;
}

/// Compiles `graph` for `target`.
pub fn compile<G: ScheduledGraph>(
    graph: &G,
    meta: &dyn MetaAccessProvider,
    target: &TargetDescription,
    options: &CompilerOptions,
) -> Result<CompilationOutput> {
    compiler::run(graph, meta, target, options)
}

/// Compiles `graph` and hands the result to `installer`.
pub fn compile_and_install<G: ScheduledGraph, I: CodeInstaller>(
    graph: &G,
    meta: &dyn MetaAccessProvider,
    target: &TargetDescription,
    options: &CompilerOptions,
    installer: &mut I,
) -> Result<(I::InstalledCode, Stats)> {
    let output = compile(graph, meta, target, options)?;
    let installed = installer.install(graph.method(), &output.result)?;
    Ok((installed, output.stats))
}
