/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Lowering of a scheduled graph into LIR.
//!
//! Every value-producing node gets one variable up front, so phi moves
//! emitted at the end of a predecessor can refer to values of blocks
//! that are lowered later. Critical edges are split before lowering;
//! phi moves then always live in a block with a single successor.

use super::{BytecodeFrame, Lir, LirFrameState, LirInstruction, LirOp};
use crate::cfg::ControlFlowGraph;
use crate::constant::Constant;
use crate::frame_map::FrameMapBuilder;
use crate::graph::{FrameStateNode, MetaAccessProvider, Node, NodeOp, ScheduledGraph};
use crate::result::CallTarget;
use crate::target::{CallType, TargetDescription};
use crate::value::{CompositeValue, Kind, Value, Variable};
use crate::{Block, CompileError, CompilerOptions, NodeId};
use smallvec::{smallvec, SmallVec};

/// Builds the LIR for `graph`. Returns the LIR and the frame map
/// builder holding the lock slots and outgoing area it reserved.
///
/// Unsupported input is reported as a `Bailout`. A graph that breaks
/// the `ScheduledGraph` contract is a bug in the caller and panics
/// instead: a block with several successors that does not end in a
/// branch, or a phi without an input for one of its predecessors.
pub fn build_lir<G: ScheduledGraph>(
    graph: &G,
    meta: &dyn MetaAccessProvider,
    target: &TargetDescription,
    options: &CompilerOptions,
) -> Result<(Lir, FrameMapBuilder), CompileError> {
    if let Some(bci) = graph.entry_bci() {
        return Err(CompileError::bailout(format!(
            "on-stack replacement entry at bci {} is not supported",
            bci
        )));
    }
    let mut cfg = ControlFlowGraph::from_graph(graph);
    let entry = cfg.entry();
    if !cfg.block(entry).preds.is_empty() {
        return Err(CompileError::bailout(format!(
            "entry block {} has predecessors",
            entry
        )));
    }
    for block in cfg.blocks() {
        let data = cfg.block(block);
        if data.reachable && data.is_exception_entry && data.preds.len() != 1 {
            return Err(CompileError::bailout(format!(
                "exception handler {} has {} predecessors",
                block,
                data.preds.len()
            )));
        }
    }
    let split = cfg.split_critical_edges();
    log::debug!(
        "lir: {} blocks ({} for split edges), {} nodes",
        cfg.num_blocks(),
        split.len(),
        graph.num_nodes()
    );

    let mut builder = LirBuilder {
        graph,
        meta,
        target,
        lir: Lir::new(cfg),
        frame: FrameMapBuilder::new(&target.arch, options),
        node_values: vec![None; graph.num_nodes()],
        constants: vec![None; graph.num_nodes()],
        parameters: vec![],
    };
    builder.assign_node_variables();
    let order: Vec<Block> = builder.lir.cfg().reverse_postorder().collect();
    for block in order {
        builder.lower_block(block)?;
    }
    builder.lir.cfg_mut().prune_unreachable_preds();
    if trace_enabled!() {
        trace!("lir after construction:\n{}", builder.lir);
    }
    Ok((builder.lir, builder.frame))
}

struct LirBuilder<'a, G: ScheduledGraph> {
    graph: &'a G,
    meta: &'a dyn MetaAccessProvider,
    target: &'a TargetDescription,
    lir: Lir,
    frame: FrameMapBuilder,
    node_values: Vec<Option<Variable>>,
    constants: Vec<Option<Constant>>,
    /// Incoming parameter locations.
    parameters: Vec<Value>,
}

fn produces_value(node: &Node) -> bool {
    node.kind != Kind::Illegal
        && matches!(
            node.op,
            NodeOp::Parameter(_)
                | NodeOp::Constant(_)
                | NodeOp::Binary(..)
                | NodeOp::Phi(_)
                | NodeOp::Invoke { .. }
                | NodeOp::LoadField { .. }
                | NodeOp::ExceptionObject
        )
}

impl<'a, G: ScheduledGraph> LirBuilder<'a, G> {
    fn assign_node_variables(&mut self) {
        for b in 0..self.graph.num_blocks() {
            let block = Block::new(b);
            if !self.lir.cfg().block(block).reachable {
                continue;
            }
            for node in self.graph.block_nodes(block) {
                if let NodeOp::Constant(c) = &node.op {
                    self.constants[node.id.index()] = Some(*c);
                }
                if produces_value(node) {
                    let var = self.lir.new_variable(node.kind);
                    self.node_values[node.id.index()] = Some(var);
                }
            }
        }
        let cc = self.target.register_config.calling_convention(
            CallType::JavaCallee,
            self.graph.parameter_kinds(),
            self.graph.return_kind(),
            &self.target.arch,
        );
        self.parameters = cc.arguments;
    }

    /// The variable holding a node's value.
    fn operand(&self, node: NodeId) -> Value {
        match self.node_values.get(node.index()).copied().flatten() {
            Some(var) => Value::Variable(var),
            None => panic!("node {} is used as a value but produces none", node),
        }
    }

    /// A node's value as recorded in frame states: constants directly.
    fn state_value(&self, node: NodeId) -> Value {
        match self.constants.get(node.index()).copied().flatten() {
            Some(c) => Value::Constant(c),
            None => self.operand(node),
        }
    }

    fn result(&self, node: &Node) -> Value {
        self.operand(node.id)
    }

    fn lower_block(&mut self, block: Block) -> Result<(), CompileError> {
        let mut ops = vec![LirInstruction::label(block)];
        let is_split = block.index() >= self.graph.num_blocks();
        if !is_split {
            let graph = self.graph;
            for node in graph.block_nodes(block) {
                self.lower_node(block, node, &mut ops)?;
            }
        }
        let ends = ops.last().map_or(false, |inst| inst.op.is_block_end());
        if !ends {
            let succs = &self.lir.cfg().block(block).succs;
            match succs.len() {
                1 => {
                    let succ = succs[0];
                    self.end_with_jump(block, succ, &mut ops);
                }
                n => panic!("block {} with {} successors does not end in a branch", block, n),
            }
        }
        self.lir.set_block_ops(block, ops);
        Ok(())
    }

    fn end_with_jump(&mut self, block: Block, succ: Block, ops: &mut Vec<LirInstruction>) {
        self.phi_moves(block, succ, ops);
        ops.push(LirInstruction::jump(succ));
    }

    /// Moves into the phi variables of `succ` for the edge from `pred`.
    /// Inputs that are themselves phis of `succ` are read into
    /// temporaries first so the moves behave as one parallel copy.
    fn phi_moves(&mut self, pred: Block, succ: Block, ops: &mut Vec<LirInstruction>) {
        if succ.index() >= self.graph.num_blocks() {
            return;
        }
        let position = match self.lir.cfg().block(succ).preds.iter().position(|&p| p == pred) {
            Some(p) => p,
            None => panic!("{} is not a predecessor of {}", pred, succ),
        };
        let graph = self.graph;
        let mut phis: SmallVec<[(Value, Value); 4]> = smallvec![];
        for node in graph.block_nodes(succ) {
            if let NodeOp::Phi(inputs) = &node.op {
                let input = match inputs.get(position) {
                    Some(&input) => input,
                    None => panic!("phi {} has no input for predecessor {}", node.id, position),
                };
                phis.push((self.result(node), self.state_value(input)));
            }
        }
        let is_phi = |v: &Value| phis.iter().any(|(dest, _)| dest == v);
        let mut moves: SmallVec<[(Value, Value); 4]> = smallvec![];
        for (dest, src) in phis.iter() {
            if dest == src {
                continue;
            }
            let src = if is_phi(src) {
                let temp = self.lir.new_variable(src.kind());
                ops.push(LirInstruction::mov(temp.into(), src.clone()));
                Value::Variable(temp)
            } else {
                src.clone()
            };
            moves.push((dest.clone(), src));
        }
        for (dest, src) in moves {
            ops.push(LirInstruction::mov(dest, src));
        }
    }

    fn lower_node(&mut self, block: Block, node: &Node, ops: &mut Vec<LirInstruction>) -> Result<(), CompileError> {
        let target: &'a TargetDescription = self.target;
        let arch = &target.arch;
        let config = &target.register_config;
        match &node.op {
            NodeOp::Parameter(index) => {
                let location = match self.parameters.get(*index as usize) {
                    Some(l) => l.clone(),
                    None => panic!("parameter {} out of range", index),
                };
                ops.push(LirInstruction::mov(self.result(node), location));
            }
            NodeOp::Constant(c) => {
                if produces_value(node) {
                    ops.push(LirInstruction::mov(self.result(node), Value::Constant(*c)));
                }
            }
            NodeOp::Binary(op, x, y) => {
                ops.push(LirInstruction::new(
                    LirOp::Binary { op: *op },
                    smallvec![self.result(node), self.operand(*x), self.operand(*y)],
                    None,
                ));
            }
            NodeOp::Phi(_) => {}
            NodeOp::If {
                condition,
                x,
                y,
                true_probability,
            } => {
                let succs = &self.lir.cfg().block(block).succs;
                assert_eq!(succs.len(), 2, "if in {} needs two successors", block);
                let x = self.operand(*x);
                ops.push(LirInstruction::new(
                    LirOp::CompareBranch {
                        condition: *condition,
                        kind: x.kind(),
                        true_target: succs[0],
                        false_target: succs[1],
                        true_probability: *true_probability,
                    },
                    smallvec![x, self.operand(*y)],
                    None,
                ));
            }
            NodeOp::Goto => {
                let succs = &self.lir.cfg().block(block).succs;
                assert_eq!(succs.len(), 1, "goto in {} needs one successor", block);
                let succ = succs[0];
                self.end_with_jump(block, succ, ops);
            }
            NodeOp::Return(value) => {
                let operand = match value {
                    Some(v) => {
                        let v = self.operand(*v);
                        let kind = v.kind();
                        let reg = Value::Register(arch.register_value(config.return_register(kind), kind));
                        ops.push(LirInstruction::mov(reg.clone(), v));
                        reg
                    }
                    None => Value::Illegal,
                };
                ops.push(LirInstruction::new(LirOp::Return, smallvec![operand], None));
            }
            NodeOp::Invoke {
                target,
                arguments,
                state,
                exception_edge,
            } => {
                let method = self.meta.method(*target).ok_or_else(|| {
                    CompileError::bailout(format!("unresolved method {:?} at bci {}", target, state.bci))
                })?;
                let args: SmallVec<[Value; 4]> = arguments.iter().map(|&a| self.operand(a)).collect();
                let kinds: Vec<Kind> = args.iter().map(Value::kind).collect();
                let cc = config.calling_convention(CallType::JavaCall, &kinds, method.return_kind, arch);
                self.frame.reserve_outgoing(cc.stack_size);
                for (location, arg) in cc.arguments.iter().zip(args) {
                    ops.push(LirInstruction::mov(location.clone(), arg));
                }
                let handler = if *exception_edge {
                    let succs = &self.lir.cfg().block(block).succs;
                    assert_eq!(succs.len(), 2, "invoke in {} needs normal and exception successors", block);
                    Some(succs[1])
                } else {
                    None
                };
                let mut operands: SmallVec<[Value; 4]> = smallvec![cc.return_location.clone()];
                operands.extend(cc.arguments.iter().cloned());
                let state = self.frame_state(state, handler);
                ops.push(LirInstruction::new(
                    LirOp::Call {
                        target: CallTarget::Method(*target),
                    },
                    operands,
                    Some(state),
                ));
                if produces_value(node) && !cc.return_location.is_illegal() {
                    ops.push(LirInstruction::mov(self.result(node), cc.return_location));
                }
                if handler.is_some() {
                    let normal = self.lir.cfg().block(block).succs[0];
                    self.end_with_jump(block, normal, ops);
                }
            }
            NodeOp::LoadField { object, offset, state } => {
                let state = state.as_ref().map(|s| self.frame_state(s, None));
                ops.push(LirInstruction::new(
                    LirOp::Load { kind: node.kind },
                    smallvec![self.result(node), Value::address(self.operand(*object), *offset)],
                    state,
                ));
            }
            NodeOp::StoreField {
                object,
                offset,
                value,
                state,
            } => {
                let value = self.operand(*value);
                let state = state.as_ref().map(|s| self.frame_state(s, None));
                ops.push(LirInstruction::new(
                    LirOp::Store { kind: value.kind() },
                    smallvec![Value::address(self.operand(*object), *offset), value],
                    state,
                ));
            }
            NodeOp::NullCheck { object, state } => {
                let state = self.frame_state(state, None);
                ops.push(LirInstruction::new(
                    LirOp::NullCheck,
                    smallvec![self.operand(*object)],
                    Some(state),
                ));
            }
            NodeOp::Safepoint(state) => {
                let state = self.frame_state(state, None);
                ops.push(LirInstruction::new(LirOp::Safepoint, smallvec![], Some(state)));
            }
            NodeOp::Deoptimize { reason, state } => {
                let state = self.frame_state(state, None);
                ops.push(LirInstruction::new(
                    LirOp::Deoptimize { reason: *reason },
                    smallvec![],
                    Some(state),
                ));
            }
            NodeOp::ExceptionObject => {
                assert_eq!(ops.len(), 1, "exception object must start block {}", block);
                let reg = Value::Register(arch.register_value(config.exception_register, Kind::Object));
                ops.push(LirInstruction::new(LirOp::ExceptionObject, smallvec![reg.clone()], None));
                if produces_value(node) {
                    ops.push(LirInstruction::mov(self.result(node), reg));
                }
            }
            NodeOp::MemoryBarrier(barriers) => {
                let required = arch.required_barriers(*barriers);
                if target.is_mp && !required.is_empty() {
                    ops.push(LirInstruction::new(LirOp::Membar { barriers: required }, smallvec![], None));
                }
            }
            NodeOp::Switch { value, low } => {
                let succs = &self.lir.cfg().block(block).succs;
                assert!(!succs.is_empty(), "switch in {} without successors", block);
                let (targets, default) = succs.split_at(succs.len() - 1);
                let op = LirOp::TableSwitch {
                    low: *low,
                    targets: targets.to_vec(),
                    default: default[0],
                };
                let index = self.operand(*value);
                let t0 = self.lir.new_variable(Kind::Long);
                let t1 = self.lir.new_variable(Kind::Long);
                ops.push(LirInstruction::new(op, smallvec![index, t0.into(), t1.into()], None));
            }
        }
        Ok(())
    }

    fn frame_state(&mut self, state: &FrameStateNode, exception_edge: Option<Block>) -> LirFrameState {
        let (frame, _) = self.bytecode_frame(state);
        LirFrameState::new(frame, exception_edge)
    }

    /// Converts a frame and its callers. Returns the frame and the lock
    /// depth reached after its locks; lock slots are shared by depth.
    fn bytecode_frame(&mut self, state: &FrameStateNode) -> (BytecodeFrame, usize) {
        let (caller, base) = match &state.outer {
            Some(outer) => {
                let (frame, depth) = self.bytecode_frame(outer);
                (Some(Box::new(frame)), depth)
            }
            None => (None, 0),
        };
        let mut values = Vec::with_capacity(state.locals.len() + state.stack.len() + state.locks.len());
        for local in &state.locals {
            values.push(match local {
                Some(n) => self.state_value(*n),
                None => Value::Illegal,
            });
        }
        for &n in &state.stack {
            values.push(self.state_value(n));
        }
        for (i, &owner) in state.locks.iter().enumerate() {
            let slot = self.frame.lock_slot(base + i);
            values.push(Value::Composite(Box::new(CompositeValue::Lock {
                owner: self.state_value(owner),
                slot: Value::VirtualStackSlot(slot),
            })));
        }
        let frame = BytecodeFrame::new(
            caller,
            state.method,
            state.bci,
            state.rethrow_exception,
            state.during_call,
            values,
            state.locals.len() as u32,
            state.stack.len() as u32,
            state.locks.len() as u32,
        );
        (frame, base + state.locks.len())
    }
}
