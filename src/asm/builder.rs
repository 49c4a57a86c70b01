/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Emission of allocated LIR into a `CompilationResult`.
//!
//! Every encoding step is paired with the metadata it needs, recorded
//! at the buffer position before the instruction's bytes: infopoints
//! with debug information for calls, safepoints and implicit
//! exceptions, data patches for constants, marks for the entry points
//! and stubs the installer has to find. Constants that cannot be
//! encoded as immediates go to the data section through a rip-relative
//! placeholder that is patched once the section layout is final.

use super::amd64::{is_cpu, Address, AluOp, Assembler, OperandSize, SseOp, COND_ABOVE};
use super::buffer::{FixupKind, Label};
use super::EncodingError;
use crate::constant::Constant;
use crate::data_section::{align_up, Data, DataSection, DataSectionReference};
use crate::frame_map::FrameMap;
use crate::graph::{BinaryOp, Condition};
use crate::lir::{Lir, LirFrameState, LirInstruction, LirOp};
use crate::result::{CallTarget, CodeAnnotation, CompilationResult, InfopointReason, MarkId, RuntimeCall};
use crate::target::{Register, RegisterCategory, TargetDescription};
use crate::value::{CompositeValue, Kind, Value};
use crate::{Block, CompileError, CompilerOptions, FxHashMap, Stats};

/// Patched into inlined object references until installation.
const OBJECT_PLACEHOLDER: u64 = 0xdead_dead_dead_dead;

/// A rip-relative displacement waiting for the data section layout.
#[derive(Clone, Copy, Debug)]
struct DataFixup {
    disp_at: u32,
    reference: DataSectionReference,
}

pub struct CompilationResultBuilder<'a> {
    asm: Assembler,
    result: CompilationResult,
    target: &'a TargetDescription,
    frame_map: &'a FrameMap,
    options: &'a CompilerOptions,
    data: DataSection,
    data_refs: FxHashMap<Constant, DataSectionReference>,
    data_fixups: Vec<DataFixup>,
    block_labels: Vec<Label>,
    /// Return addresses of calls with an exception edge, with the
    /// handler block.
    pending_handlers: Vec<(u32, Block)>,
    epilogue_recorded: bool,
}

impl<'a> CompilationResultBuilder<'a> {
    pub fn new(
        name: &str,
        num_blocks: usize,
        target: &'a TargetDescription,
        frame_map: &'a FrameMap,
        options: &'a CompilerOptions,
    ) -> Self {
        let mut asm = Assembler::new();
        let block_labels = (0..num_blocks).map(|_| asm.buf.new_label()).collect();
        CompilationResultBuilder {
            asm,
            result: CompilationResult::new(name),
            target,
            frame_map,
            options,
            data: DataSection::new(target.arch.byte_order, target.arch.word_size),
            data_refs: FxHashMap::default(),
            data_fixups: vec![],
            block_labels,
            pending_handlers: vec![],
            epilogue_recorded: false,
        }
    }

    fn rsp(&self) -> Register {
        self.target.register_config.stack_pointer
    }

    fn scratch(&self, category: RegisterCategory) -> Register {
        self.target.register_config.scratch(category)
    }

    fn label(&self, block: Block) -> Label {
        self.block_labels[block.index()]
    }

    fn stack_address(&self, value: &Value) -> Address {
        Address::base(self.rsp(), self.frame_map.offset_of(value))
    }

    fn debug_info(&self, state: Option<&LirFrameState>) -> Option<crate::lir::DebugInfo> {
        state.map(|s| s.debug_info(self.frame_map))
    }

    /// The data section item holding `constant`, inserted on first use.
    fn data_reference(&mut self, constant: Constant) -> DataSectionReference {
        if let Some(&reference) = self.data_refs.get(&constant) {
            return reference;
        }
        let reference = self
            .data
            .insert_data(Data::primitive(constant, self.target.arch.word_size));
        self.data_refs.insert(constant, reference);
        reference
    }

    /// Records a reference from the instruction at `start` to the data
    /// section copy of `constant`; `disp_at` is its displacement field.
    fn record_section_reference(&mut self, start: u32, disp_at: Option<u32>, constant: Constant) {
        let disp_at = match disp_at {
            Some(at) => at,
            None => panic!("data reference at {} without a rip-relative operand", start),
        };
        let reference = self.data_reference(constant);
        let alignment = self.data.data(reference).alignment();
        trace!("emit: data reference to {} at {}", constant, start);
        self.result.record_data_patch(start, constant, alignment, false);
        self.data_fixups.push(DataFixup { disp_at, reference });
    }

    fn record_implicit_exception(&mut self, state: Option<&LirFrameState>) {
        if state.is_some() {
            let pc = self.asm.position();
            let info = self.debug_info(state);
            self.result
                .record_infopoint(pc, info, InfopointReason::ImplicitException);
        }
    }

    /// A direct call to `target`. The displacement is word aligned on
    /// multiprocessors so that it can be patched atomically.
    fn direct_call(&mut self, target: CallTarget, state: Option<&LirFrameState>) {
        if self.target.is_mp {
            self.asm.align_field(1, 4);
        }
        let pc = self.asm.position();
        let size = self.asm.call();
        let info = self.debug_info(state);
        self.result.record_call(pc, size, target, info, true);
        if let Some(handler) = state.and_then(|s| s.exception_edge) {
            self.pending_handlers.push((pc + size, handler));
        }
    }

    fn enter(&mut self) {
        self.result
            .record_mark(self.asm.position(), MarkId::VERIFIED_ENTRY, &[]);
        let rsp = self.rsp();
        let frame_size = self.frame_map.frame_size();
        if frame_size > 0 {
            self.asm
                .alu_ri(AluOp::Sub, OperandSize::Qword, rsp, frame_size as i32);
        }
        let frame_map = self.frame_map;
        for &(reg, offset) in frame_map.callee_saved() {
            self.asm
                .store(OperandSize::Qword, &Address::base(rsp, offset as i32), reg);
        }
        self.result
            .record_mark(self.asm.position(), MarkId::FRAME_COMPLETE, &[]);
    }

    fn leave(&mut self) {
        let rsp = self.rsp();
        let frame_map = self.frame_map;
        let callee_saved = frame_map.callee_saved();
        if !callee_saved.is_empty() && !self.epilogue_recorded {
            self.result
                .set_register_restore_epilogue_offset(self.asm.position());
            self.epilogue_recorded = true;
        }
        for &(reg, offset) in callee_saved {
            self.asm
                .load(OperandSize::Qword, reg, &Address::base(rsp, offset as i32));
        }
        let frame_size = self.frame_map.frame_size();
        if frame_size > 0 {
            self.asm
                .alu_ri(AluOp::Add, OperandSize::Qword, rsp, frame_size as i32);
        }
    }

    /// Emits the blocks of `lir` in code emission order.
    pub fn emit_lir(&mut self, lir: &Lir) -> Result<(), CompileError> {
        self.enter();
        let order = lir.code_emitting_order();
        for (i, &block) in order.iter().enumerate() {
            if lir.cfg().block(block).align {
                self.asm.buf.align(16);
            }
            self.asm.buf.bind(self.label(block));
            if self.options.block_comments {
                self.result.add_annotation(CodeAnnotation::Comment {
                    position: self.asm.position(),
                    text: format!("block {}", block),
                });
            }
            let next = order.get(i + 1).copied();
            for inst in lir.block_ops(block) {
                if self.options.block_comments && !matches!(inst.op, LirOp::Label { .. }) {
                    self.result.add_annotation(CodeAnnotation::Comment {
                        position: self.asm.position(),
                        text: inst.to_string(),
                    });
                }
                self.emit_instruction(inst, next)?;
            }
        }
        Ok(())
    }

    /// Exception handler and deoptimization handler entry points.
    fn emit_stubs(&mut self) {
        self.result
            .record_mark(self.asm.position(), MarkId::EXCEPTION_HANDLER_ENTRY, &[]);
        self.direct_call(CallTarget::Runtime(RuntimeCall::HandleException), None);
        self.asm.ud2();
        self.result
            .record_mark(self.asm.position(), MarkId::DEOPT_HANDLER_ENTRY, &[]);
        self.direct_call(CallTarget::Runtime(RuntimeCall::Deoptimize), None);
        self.asm.ud2();
    }

    fn emit_instruction(&mut self, inst: &LirInstruction, next: Option<Block>) -> Result<(), CompileError> {
        match &inst.op {
            LirOp::Label { .. } | LirOp::ExceptionObject => {}
            LirOp::Jump { target } => {
                if Some(*target) != next {
                    self.asm.jmp(self.label(*target));
                }
            }
            LirOp::CompareBranch {
                condition,
                kind,
                true_target,
                false_target,
                ..
            } => {
                self.emit_compare(inst, *kind)?;
                self.emit_branch(*condition, kind.is_float(), *true_target, *false_target, next);
            }
            LirOp::Move => self.emit_move(inst, inst.move_result(), inst.move_input())?,
            LirOp::Binary { op } => self.emit_binary(inst, *op)?,
            LirOp::Load { kind } => {
                let dst = register(inst, &inst.operands[0])?;
                let addr = address(inst, &inst.operands[1])?;
                self.record_implicit_exception(inst.state.as_deref());
                if kind.is_float() {
                    self.asm.movs_load(*kind, dst, &addr);
                } else {
                    self.asm.load(OperandSize::of(*kind), dst, &addr);
                }
            }
            LirOp::Store { kind } => self.emit_store(inst, *kind)?,
            LirOp::NullCheck => {
                let reg = register(inst, &inst.operands[0])?;
                self.record_implicit_exception(inst.state.as_deref());
                self.asm.test_m(&Address::base(reg, 0));
            }
            LirOp::Call { target } => self.direct_call(*target, inst.state.as_deref()),
            LirOp::Return => {
                self.leave();
                self.asm.ret();
            }
            LirOp::Safepoint => {
                let pc = self.asm.position();
                self.result.record_mark(pc, MarkId::POLL_NEAR, &[]);
                let info = self.debug_info(inst.state.as_deref());
                self.result
                    .record_infopoint(pc, info, InfopointReason::Safepoint);
                // The installer points the displacement at the polling page.
                self.asm.test_m(&Address::RipRelative);
            }
            LirOp::Deoptimize { reason } => {
                // The runtime reads the reason from the scratch register.
                let scratch = self.scratch(RegisterCategory::Cpu);
                self.asm
                    .mov_ri(OperandSize::Dword, scratch, *reason as i64);
                self.direct_call(CallTarget::Runtime(RuntimeCall::Deoptimize), inst.state.as_deref());
                self.asm.ud2();
            }
            LirOp::Membar { barriers } => {
                if barriers.contains(crate::target::MemoryBarriers::STORE_LOAD) {
                    self.asm.lock_add_rsp(self.rsp());
                }
            }
            LirOp::TableSwitch {
                low,
                targets,
                default,
            } => self.emit_table_switch(inst, *low, targets, *default)?,
        }
        Ok(())
    }

    fn emit_branch(
        &mut self,
        condition: Condition,
        float: bool,
        true_target: Block,
        false_target: Block,
        next: Option<Block>,
    ) {
        // Negating a float condition changes how unordered operands
        // branch, so only integer branches are inverted.
        if Some(true_target) == next && !float {
            self.asm
                .jcc(condition.negate(), false, self.label(false_target));
            return;
        }
        self.asm.jcc(condition, float, self.label(true_target));
        if Some(false_target) != next {
            self.asm.jmp(self.label(false_target));
        }
    }

    fn emit_compare(&mut self, inst: &LirInstruction, kind: Kind) -> Result<(), CompileError> {
        let x = register(inst, &inst.operands[0])?;
        let y = &inst.operands[1];
        let start = self.asm.position();
        if kind.is_float() {
            match y {
                Value::Register(r) => self.asm.ucomis_rr(kind, x, r.reg),
                Value::Constant(c) => {
                    let at = self.asm.ucomis_rm(kind, x, &Address::RipRelative);
                    self.record_section_reference(start, at, *c);
                }
                v if v.is_stack() => {
                    self.asm.ucomis_rm(kind, x, &self.stack_address(v));
                }
                _ => return Err(unsupported(inst).into()),
            }
            return Ok(());
        }
        let size = alu_size(kind);
        match y {
            Value::Register(r) => self.asm.alu_rr(AluOp::Cmp, size, x, r.reg),
            Value::Constant(c) if c.fits_imm32() => {
                self.asm.alu_ri(AluOp::Cmp, size, x, imm32(c));
            }
            Value::Constant(c) => {
                let at = self.asm.alu_rm(AluOp::Cmp, size, x, &Address::RipRelative);
                self.record_section_reference(start, at, *c);
            }
            v if v.is_stack() => {
                self.asm.alu_rm(AluOp::Cmp, size, x, &self.stack_address(v));
            }
            _ => return Err(unsupported(inst).into()),
        }
        Ok(())
    }

    fn emit_move(&mut self, inst: &LirInstruction, result: &Value, input: &Value) -> Result<(), CompileError> {
        let kind = result.kind();
        match (result, input) {
            (Value::Register(dst), Value::Register(src)) => {
                if dst.reg == src.reg {
                    return Ok(());
                }
                match (is_cpu(dst.reg), is_cpu(src.reg)) {
                    (true, true) => self.asm.mov_rr(alu_size(kind), dst.reg, src.reg),
                    (false, false) => self.asm.movap_rr(kind, dst.reg, src.reg),
                    _ => return Err(unsupported(inst).into()),
                }
            }
            (Value::Register(dst), src) if src.is_stack() => {
                let addr = self.stack_address(src);
                if is_cpu(dst.reg) {
                    self.asm.load(slot_size(kind), dst.reg, &addr);
                } else {
                    self.asm.movs_load(kind, dst.reg, &addr);
                }
            }
            (dst, Value::Register(src)) if dst.is_stack() => {
                let addr = self.stack_address(dst);
                if is_cpu(src.reg) {
                    self.asm.store(slot_size(kind), &addr, src.reg);
                } else {
                    self.asm.movs_store(kind, &addr, src.reg);
                }
            }
            (dst, src) if dst.is_stack() && src.is_stack() => {
                // push computes its address before adjusting rsp and pop
                // after, so both offsets stay valid.
                let from = self.stack_address(src);
                let to = self.stack_address(dst);
                self.asm.push_m(&from);
                self.asm.pop_m(&to);
            }
            (Value::Register(dst), Value::Constant(c)) => self.const_to_reg(inst, dst.reg, kind, *c)?,
            (dst, Value::Constant(c)) if dst.is_stack() => {
                let addr = self.stack_address(dst);
                self.const_to_stack(&addr, *c);
            }
            _ => return Err(unsupported(inst).into()),
        }
        Ok(())
    }

    fn const_to_reg(&mut self, inst: &LirInstruction, dst: Register, kind: Kind, c: Constant) -> Result<(), CompileError> {
        let start = self.asm.position();
        match c {
            Constant::Int(_) | Constant::Long(_) | Constant::Null if is_cpu(dst) => {
                let value = c.as_long().unwrap_or(0);
                self.asm.mov_ri(OperandSize::of(c.kind()), dst, value);
            }
            Constant::Object(_) if is_cpu(dst) => {
                if self.target.inline_objects {
                    self.result.record_data_patch(start, c, 0, true);
                    self.asm.mov_ri64(dst, OBJECT_PLACEHOLDER);
                } else {
                    let at = self.asm.load(OperandSize::Qword, dst, &Address::RipRelative);
                    self.record_section_reference(start, at, c);
                }
            }
            Constant::Float(_) | Constant::Double(_) if !is_cpu(dst) => {
                if c.is_default() {
                    self.asm.xorp_zero(kind, dst);
                } else {
                    let at = self.asm.movs_load(kind, dst, &Address::RipRelative);
                    self.record_section_reference(start, at, c);
                }
            }
            _ => return Err(unsupported(inst).into()),
        }
        Ok(())
    }

    fn const_to_stack(&mut self, addr: &Address, c: Constant) {
        match c {
            Constant::Int(v) => self.asm.store_imm(OperandSize::Dword, addr, v),
            Constant::Float(bits) => self.asm.store_imm(OperandSize::Dword, addr, bits as i32),
            Constant::Long(_) | Constant::Null if c.fits_imm32() => {
                self.asm.store_imm(OperandSize::Qword, addr, imm32(&c));
            }
            Constant::Double(bits) if bits as i64 >= i32::MIN as i64 && bits as i64 <= i32::MAX as i64 => {
                self.asm.store_imm(OperandSize::Qword, addr, bits as i64 as i32);
            }
            _ => {
                // Memory to memory through the data section; the
                // scratch register may be holding part of a move cycle.
                let start = self.asm.position();
                let at = self.asm.push_m(&Address::RipRelative);
                self.record_section_reference(start, at, c);
                self.asm.pop_m(addr);
            }
        }
    }

    fn emit_binary(&mut self, inst: &LirInstruction, op: BinaryOp) -> Result<(), CompileError> {
        let dst = register(inst, &inst.operands[0])?;
        let x = register(inst, &inst.operands[1])?;
        let y = &inst.operands[2];
        let kind = inst.operands[0].kind();
        if kind.is_float() {
            let sse = match op {
                BinaryOp::Add => SseOp::Add,
                BinaryOp::Sub => SseOp::Sub,
                BinaryOp::Mul => SseOp::Mul,
                _ => return Err(unsupported(inst).into()),
            };
            if dst != x {
                self.asm.movap_rr(kind, dst, x);
            }
            let start = self.asm.position();
            match y {
                Value::Register(r) => self.asm.sse_rr(sse, kind, dst, r.reg),
                Value::Constant(c) => {
                    let at = self.asm.sse_rm(sse, kind, dst, &Address::RipRelative);
                    self.record_section_reference(start, at, *c);
                }
                v if v.is_stack() => {
                    self.asm.sse_rm(sse, kind, dst, &self.stack_address(v));
                }
                _ => return Err(unsupported(inst).into()),
            }
            return Ok(());
        }

        let size = alu_size(kind);
        if op == BinaryOp::Mul {
            if let Value::Constant(c) = y {
                if c.fits_imm32() {
                    self.asm.imul_rri(size, dst, x, imm32(c));
                    return Ok(());
                }
            }
        }
        if dst != x {
            self.asm.mov_rr(size, dst, x);
        }
        let start = self.asm.position();
        let alu = match op {
            BinaryOp::Add => AluOp::Add,
            BinaryOp::Sub => AluOp::Sub,
            BinaryOp::And => AluOp::And,
            BinaryOp::Or => AluOp::Or,
            BinaryOp::Xor => AluOp::Xor,
            BinaryOp::Mul => {
                match y {
                    Value::Register(r) => self.asm.imul_rr(size, dst, r.reg),
                    Value::Constant(c) => {
                        let at = self.asm.imul_rm(size, dst, &Address::RipRelative);
                        self.record_section_reference(start, at, *c);
                    }
                    v if v.is_stack() => {
                        self.asm.imul_rm(size, dst, &self.stack_address(v));
                    }
                    _ => return Err(unsupported(inst).into()),
                }
                return Ok(());
            }
        };
        match y {
            Value::Register(r) => self.asm.alu_rr(alu, size, dst, r.reg),
            Value::Constant(c) if c.fits_imm32() => self.asm.alu_ri(alu, size, dst, imm32(c)),
            Value::Constant(c) => {
                let at = self.asm.alu_rm(alu, size, dst, &Address::RipRelative);
                self.record_section_reference(start, at, *c);
            }
            v if v.is_stack() => {
                self.asm.alu_rm(alu, size, dst, &self.stack_address(v));
            }
            _ => return Err(unsupported(inst).into()),
        }
        Ok(())
    }

    fn emit_store(&mut self, inst: &LirInstruction, kind: Kind) -> Result<(), CompileError> {
        let addr = address(inst, &inst.operands[0])?;
        let state = inst.state.as_deref();
        match &inst.operands[1] {
            Value::Register(r) => {
                self.record_implicit_exception(state);
                if kind.is_float() {
                    self.asm.movs_store(kind, &addr, r.reg);
                } else {
                    self.asm.store(OperandSize::of(kind), &addr, r.reg);
                }
            }
            Value::Constant(c) => {
                let size = OperandSize::of(kind);
                let inline = match *c {
                    Constant::Float(bits) => Some(bits as i32),
                    Constant::Double(bits) if bits == 0 => Some(0),
                    _ if c.fits_imm32() => Some(imm32(c)),
                    _ => None,
                };
                match inline {
                    Some(imm) => {
                        self.record_implicit_exception(state);
                        self.asm.store_imm(size, &addr, imm);
                    }
                    None => {
                        let scratch = self.scratch(RegisterCategory::Cpu);
                        self.const_to_reg(inst, scratch, Kind::Long, to_bits(*c))?;
                        self.record_implicit_exception(state);
                        self.asm.store(OperandSize::Qword, &addr, scratch);
                    }
                }
            }
            _ => return Err(unsupported(inst).into()),
        }
        Ok(())
    }

    fn emit_table_switch(
        &mut self,
        inst: &LirInstruction,
        low: i32,
        targets: &[Block],
        default: Block,
    ) -> Result<(), CompileError> {
        let index = register(inst, &inst.operands[0])?;
        let offset = register(inst, &inst.operands[1])?;
        let base = register(inst, &inst.operands[2])?;
        if targets.is_empty() {
            self.asm.jmp(self.label(default));
            return Ok(());
        }
        self.asm.mov_rr(OperandSize::Dword, offset, index);
        if low != 0 {
            self.asm.alu_ri(AluOp::Sub, OperandSize::Dword, offset, low);
        }
        self.asm
            .alu_ri(AluOp::Cmp, OperandSize::Dword, offset, targets.len() as i32 - 1);
        self.asm.jcc_code(COND_ABOVE, self.label(default));

        let table = self.asm.buf.new_label();
        if let Some(at) = self.asm.lea(base, &Address::RipRelative) {
            self.asm.buf.fixup_at(at, table, FixupKind::Rel32);
        }
        self.asm.movsxd(
            offset,
            &Address::Base {
                base,
                index: Some((offset, 4)),
                disp: 0,
            },
        );
        self.asm.alu_rr(AluOp::Add, OperandSize::Qword, offset, base);
        self.asm.jmp_r(offset);

        self.asm.buf.align(4);
        self.asm.buf.bind(table);
        let table_pos = self.asm.position();
        for &target in targets {
            self.asm
                .buf
                .emit_label_ref(self.label(target), FixupKind::Offset32 { base: table_pos });
        }
        self.result.add_annotation(CodeAnnotation::JumpTable {
            position: table_pos,
            low,
            high: low + targets.len() as i32 - 1,
            entry_size: 4,
        });
        Ok(())
    }

    /// Lays out the data section behind the code, patches every data
    /// reference and hands out the finished result.
    pub fn finish(mut self, stats: &mut Stats) -> CompilationResult {
        self.emit_stubs();
        let code_size = self.asm.position();

        self.data.finalize_layout();
        let data_offset = align_up(code_size, self.data.section_alignment());
        for fixup in &self.data_fixups {
            let target = data_offset + self.data.offset(fixup.reference);
            let disp = target as i64 - (fixup.disp_at as i64 + 4);
            self.asm.buf.patch_i32(fixup.disp_at, disp as i32);
        }
        let mut bytes = vec![0; self.data.section_size() as usize];
        self.data.build_data_section(&mut bytes, |offset, constant| {
            trace!("data section: {} at {} needs patching", constant, offset);
        });

        for &(pc, handler) in &self.pending_handlers {
            let handler_pos = match self.asm.buf.label_position(self.block_labels[handler.index()]) {
                Some(pos) => pos,
                None => panic!("exception handler {} was not emitted", handler),
            };
            self.result.record_exception_handler(pc, handler_pos);
        }

        let code = self.asm.buf.finish();
        stats.code_bytes = code.len();
        stats.data_bytes = bytes.len();
        stats.infopoints = self.result.infopoints().len();
        log::debug!(
            "emit: {} code bytes, {} data bytes, {} infopoints",
            code.len(),
            bytes.len(),
            self.result.infopoints().len()
        );
        self.result.set_target_code(code);
        self.result
            .set_data_section(bytes, self.data.section_alignment(), data_offset);
        self.result.finalize_frame(
            self.frame_map.total_frame_size(),
            self.frame_map.custom_area_offset(),
        );
        self.result
    }
}

/// Emits `lir`, which must be fully allocated, into a fresh result.
pub fn emit_code(
    lir: &Lir,
    frame_map: &FrameMap,
    target: &TargetDescription,
    options: &CompilerOptions,
    name: &str,
    stats: &mut Stats,
) -> Result<CompilationResult, CompileError> {
    let mut builder = CompilationResultBuilder::new(name, lir.cfg().num_blocks(), target, frame_map, options);
    builder.emit_lir(lir)?;
    Ok(builder.finish(stats))
}

fn unsupported(inst: &LirInstruction) -> EncodingError {
    let operands: Vec<String> = inst.operands.iter().map(|v| v.to_string()).collect();
    EncodingError {
        op: inst.op.name(),
        operands: operands.join(", "),
    }
}

fn register(inst: &LirInstruction, value: &Value) -> Result<Register, EncodingError> {
    value.as_register().ok_or_else(|| unsupported(inst))
}

fn address(inst: &LirInstruction, value: &Value) -> Result<Address, EncodingError> {
    match value {
        Value::Composite(composite) => match &**composite {
            CompositeValue::Address {
                base,
                index,
                scale,
                displacement,
            } => {
                let base = register(inst, base)?;
                let index = match index {
                    Value::Illegal => None,
                    other => Some((register(inst, other)?, *scale)),
                };
                Ok(Address::Base {
                    base,
                    index,
                    disp: *displacement,
                })
            }
            CompositeValue::Lock { .. } => Err(unsupported(inst)),
        },
        _ => Err(unsupported(inst)),
    }
}

/// Register operations on narrow kinds use 32-bit forms.
fn alu_size(kind: Kind) -> OperandSize {
    if kind.is_wide() {
        OperandSize::Qword
    } else {
        OperandSize::Dword
    }
}

/// Stack slots are word sized; narrow values are spilled as 32 bits.
fn slot_size(kind: Kind) -> OperandSize {
    alu_size(kind)
}

fn imm32(c: &Constant) -> i32 {
    c.as_long().unwrap_or(0) as i32
}

/// Integer view of a constant for materialization in a CPU register.
fn to_bits(c: Constant) -> Constant {
    match c {
        Constant::Float(bits) => Constant::Int(bits as i32),
        Constant::Double(bits) => Constant::Long(bits as i64),
        other => other,
    }
}
