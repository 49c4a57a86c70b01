/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The low-level IR: one instruction list per block over the value
//! model, plus the two block orders computed for it.

pub mod builder;
pub mod frame_state;
pub mod inst;

pub use builder::build_lir;
pub use frame_state::{BytecodeFrame, DebugInfo, LirFrameState, ReferenceMap};
pub use inst::{LirInstruction, LirOp, OperandFlags, OperandMode, OperandShape, OperandSlot};

use crate::cfg::ControlFlowGraph;
use crate::value::{Kind, Variable};
use crate::Block;
use core::fmt;

/// The instruction lists of one compilation unit.
#[derive(Clone, Debug)]
pub struct Lir {
    cfg: ControlFlowGraph,
    block_ops: Vec<Option<Vec<LirInstruction>>>,
    linear_scan_order: Vec<Block>,
    code_emitting_order: Vec<Block>,
    variable_kinds: Vec<Kind>,
}

impl Lir {
    pub fn new(cfg: ControlFlowGraph) -> Self {
        let n = cfg.num_blocks();
        Lir {
            cfg,
            block_ops: vec![None; n],
            linear_scan_order: vec![],
            code_emitting_order: vec![],
            variable_kinds: vec![],
        }
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        &self.cfg
    }

    pub fn cfg_mut(&mut self) -> &mut ControlFlowGraph {
        &mut self.cfg
    }

    /// Assigns the instruction list of `block`. Each block is assigned
    /// exactly once.
    pub fn set_block_ops(&mut self, block: Block, ops: Vec<LirInstruction>) {
        let slot = &mut self.block_ops[block.index()];
        assert!(slot.is_none(), "instructions of {} assigned twice", block);
        debug_assert!(
            matches!(ops.first().map(|i| &i.op), Some(LirOp::Label { block: b }) if *b == block),
            "{} must start with its label",
            block
        );
        *slot = Some(ops);
    }

    pub fn has_block_ops(&self, block: Block) -> bool {
        self.block_ops[block.index()].is_some()
    }

    pub fn block_ops(&self, block: Block) -> &[LirInstruction] {
        match &self.block_ops[block.index()] {
            Some(ops) => ops,
            None => panic!("no instructions for {}", block),
        }
    }

    pub fn block_ops_mut(&mut self, block: Block) -> &mut Vec<LirInstruction> {
        match &mut self.block_ops[block.index()] {
            Some(ops) => ops,
            None => panic!("no instructions for {}", block),
        }
    }

    /// A fresh variable.
    pub fn new_variable(&mut self, kind: Kind) -> Variable {
        debug_assert!(kind != Kind::Illegal);
        let v = Variable::new(self.variable_kinds.len(), kind);
        self.variable_kinds.push(kind);
        v
    }

    pub fn num_variables(&self) -> usize {
        self.variable_kinds.len()
    }

    pub fn variable(&self, index: usize) -> Variable {
        Variable::new(index, self.variable_kinds[index])
    }

    pub fn set_linear_scan_order(&mut self, order: Vec<Block>) {
        self.linear_scan_order = order;
    }

    /// Blocks in register-allocation order.
    pub fn linear_scan_order(&self) -> &[Block] {
        &self.linear_scan_order
    }

    pub fn set_code_emitting_order(&mut self, order: Vec<Block>) {
        self.code_emitting_order = order;
    }

    /// Blocks in the order their code is laid out.
    pub fn code_emitting_order(&self) -> &[Block] {
        &self.code_emitting_order
    }

    /// Drops `block` from both orders.
    pub(crate) fn remove_from_orders(&mut self, block: Block) {
        self.linear_scan_order.retain(|&b| b != block);
        self.code_emitting_order.retain(|&b| b != block);
    }

    /// Index of the first instruction after the label and a leading
    /// exception-object instruction.
    pub fn block_start_index(&self, block: Block) -> usize {
        let ops = self.block_ops(block);
        match ops.get(1) {
            Some(inst) if inst.op == LirOp::ExceptionObject => 2,
            _ => 1,
        }
    }
}

impl fmt::Display for Lir {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let order: Vec<Block> = if self.linear_scan_order.is_empty() {
            self.cfg.reverse_postorder().collect()
        } else {
            self.linear_scan_order.clone()
        };
        for block in order {
            let data = self.cfg.block(block);
            write!(f, "{} preds [", block)?;
            for (i, p) in data.preds.iter().enumerate() {
                write!(f, "{}{}", if i == 0 { "" } else { ", " }, p)?;
            }
            writeln!(f, "] depth {} prob {}", data.loop_depth, data.probability)?;
            if let Some(ops) = &self.block_ops[block.index()] {
                for inst in ops {
                    writeln!(f, "  {}", inst)?;
                }
            }
        }
        Ok(())
    }
}

/// Pending edits to one block's instruction list, applied in a single
/// rebuild. Indices refer to the list as it was before any edit.
#[derive(Clone, Debug, Default)]
pub struct LirInsertionBuffer {
    /// Instructions to insert before the given index, in append order.
    inserts: Vec<(usize, LirInstruction)>,
    deletes: Vec<usize>,
}

impl LirInsertionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.deletes.is_empty()
    }

    /// Queues `inst` for insertion before the instruction currently at
    /// `index`. Instructions queued at the same index keep their order.
    pub fn append(&mut self, index: usize, inst: LirInstruction) {
        self.inserts.push((index, inst));
    }

    pub fn delete(&mut self, index: usize) {
        self.deletes.push(index);
    }

    pub fn num_inserts(&self) -> usize {
        self.inserts.len()
    }

    /// Rebuilds `ops` with all queued edits.
    pub fn apply(mut self, ops: &mut Vec<LirInstruction>) {
        if self.is_empty() {
            return;
        }
        let old = core::mem::take(ops);
        ops.reserve(old.len() + self.inserts.len());
        self.inserts.sort_by_key(|&(index, _)| index);
        self.deletes.sort_unstable();
        let mut inserts = self.inserts.into_iter().peekable();
        let mut deletes = self.deletes.into_iter().peekable();
        for (i, inst) in old.into_iter().enumerate() {
            while let Some((_, new)) = inserts.next_if(|&(index, _)| index <= i) {
                ops.push(new);
            }
            let mut deleted = false;
            while deletes.next_if(|&d| d <= i).is_some() {
                deleted = true;
            }
            if !deleted {
                ops.push(inst);
            }
        }
        ops.extend(inserts.map(|(_, new)| new));
    }
}
