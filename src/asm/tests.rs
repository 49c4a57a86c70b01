/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

use super::emit_code;
use crate::cfg::tests::cfg_from_succs;
use crate::constant::Constant;
use crate::frame_map::FrameMapBuilder;
use crate::graph::{BinaryOp, Condition};
use crate::lir::{BytecodeFrame, Lir, LirFrameState, LirInstruction, LirOp, ReferenceMap};
use crate::result::{CallTarget, CodeAnnotation, CompilationResult, InfopointReason, MarkId};
use crate::target::amd64::*;
use crate::target::{Register, TargetDescription};
use crate::value::{Kind, Value, VirtualStackSlot};
use crate::{Block, CompileError, CompilerOptions, MethodId, Stats};
use smallvec::smallvec;

fn reg(r: Register, kind: Kind) -> Value {
    Value::Register(TargetDescription::amd64().arch.register_value(r, kind))
}

fn ret() -> LirInstruction {
    LirInstruction::new(LirOp::Return, smallvec![Value::Illegal], None)
}

fn state(exception_edge: Option<Block>) -> LirFrameState {
    let frame = BytecodeFrame::new(None, MethodId::new(0), 4, false, exception_edge.is_some(), vec![], 0, 0, 0);
    let mut state = LirFrameState::new(frame, exception_edge);
    state.set_reference_map(ReferenceMap::default());
    state
}

/// Builds a LIR from successor lists and per-block instructions (labels
/// are added), emitted in block order.
fn lir(succs: &[&[usize]], blocks: Vec<Vec<LirInstruction>>) -> Lir {
    let probabilities = vec![1.0; succs.len()];
    let mut lir = Lir::new(cfg_from_succs(succs, &probabilities));
    for (b, ops) in blocks.into_iter().enumerate() {
        let block = Block::new(b);
        let mut all = vec![LirInstruction::label(block)];
        all.extend(ops);
        lir.set_block_ops(block, all);
    }
    let order: Vec<Block> = (0..succs.len()).map(Block::new).collect();
    lir.set_linear_scan_order(order.clone());
    lir.set_code_emitting_order(order);
    lir
}

fn emit_with(lir: &Lir, configure: impl FnOnce(&mut FrameMapBuilder)) -> Result<CompilationResult, CompileError> {
    let target = TargetDescription::amd64();
    let options = CompilerOptions::default();
    let mut frame = FrameMapBuilder::new(&target.arch, &options);
    configure(&mut frame);
    let frame = frame.finish(&target.arch, options.max_frame_size)?;
    let mut stats = Stats::default();
    emit_code(lir, &frame, &target, &options, "test", &mut stats)
}

fn emit(lir: &Lir) -> CompilationResult {
    emit_with(lir, |_| {}).unwrap()
}

fn i32_at(code: &[u8], at: usize) -> i32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&code[at..at + 4]);
    i32::from_le_bytes(bytes)
}

#[test]
fn straight_line_return() {
    let result = emit(&lir(
        &[&[]],
        vec![vec![LirInstruction::mov(reg(RAX, Kind::Int), Value::Constant(Constant::Int(7))), ret()]],
    ));
    let code = result.target_code();
    assert_eq!(
        &code[..14],
        &[0x48, 0x83, 0xec, 0x08, 0xb8, 7, 0, 0, 0, 0x48, 0x83, 0xc4, 0x08, 0xc3]
    );
    let marks: Vec<(u32, MarkId)> = result.marks().iter().map(|m| (m.pc_offset, m.id)).collect();
    assert_eq!(marks[0], (0, MarkId::VERIFIED_ENTRY));
    assert_eq!(marks[1], (4, MarkId::FRAME_COMPLETE));
    assert_eq!(marks[2].1, MarkId::EXCEPTION_HANDLER_ENTRY);
    assert_eq!(marks[3].1, MarkId::DEOPT_HANDLER_ENTRY);
    assert_eq!(result.frame_size(), 16);
    assert_eq!(result.register_restore_epilogue_offset(), -1);

    // Stub calls have their displacement 4-byte aligned.
    let calls: Vec<u32> = result
        .infopoints()
        .iter()
        .filter(|i| i.call.is_some())
        .map(|i| i.pc_offset)
        .collect();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|pc| (pc + 1) % 4 == 0));
}

#[test]
fn float_constants_share_a_data_section_entry() {
    let c = Value::Constant(Constant::double(1.5));
    let result = emit(&lir(
        &[&[]],
        vec![vec![
            LirInstruction::mov(reg(xmm(0), Kind::Double), c.clone()),
            LirInstruction::mov(reg(xmm(1), Kind::Double), c),
            ret(),
        ]],
    ));
    assert_eq!(result.data_patches().len(), 2);
    assert!(result.data_patches().iter().all(|p| !p.inlined && p.alignment == 8));
    assert_eq!(result.data_section(), &1.5f64.to_bits().to_le_bytes());
    assert_eq!(result.data_section_offset() % 8, 0);
    assert!(result.data_section_offset() as usize >= result.target_code_size());

    // movsd xmm0, [rip + disp]: the displacement ends at 12.
    let code = result.target_code();
    assert_eq!(&code[4..8], &[0xf2, 0x0f, 0x10, 0x05]);
    assert_eq!(12 + i32_at(code, 8), result.data_section_offset() as i32);
}

#[test]
fn zero_double_is_materialized_without_data() {
    let result = emit(&lir(
        &[&[]],
        vec![vec![
            LirInstruction::mov(reg(xmm(2), Kind::Double), Value::Constant(Constant::double(0.0))),
            ret(),
        ]],
    ));
    assert!(result.data_section().is_empty());
    assert_eq!(&result.target_code()[4..8], &[0x66, 0x0f, 0x57, 0xd2]);
}

#[test]
fn inlined_object_constant_records_patch() {
    let result = emit(&lir(
        &[&[]],
        vec![vec![
            LirInstruction::mov(reg(RBX, Kind::Object), Value::Constant(Constant::Object(3))),
            ret(),
        ]],
    ));
    let patch = &result.data_patches()[0];
    assert!(patch.inlined);
    assert_eq!(patch.pc_offset, 4);
    assert_eq!(patch.constant, Constant::Object(3));
    assert_eq!(&result.target_code()[4..6], &[0x48, 0xbb]);
}

#[test]
fn call_with_exception_edge() {
    let call = LirInstruction::new(
        LirOp::Call {
            target: CallTarget::Method(MethodId::new(9)),
        },
        smallvec![Value::Illegal],
        Some(state(Some(Block::new(2)))),
    );
    let exception = LirInstruction::new(LirOp::ExceptionObject, smallvec![reg(RAX, Kind::Object)], None);
    let result = emit(&lir(
        &[&[1, 2], &[], &[]],
        vec![vec![call, LirInstruction::jump(Block::new(1))], vec![ret()], vec![exception, ret()]],
    ));
    let call = &result.infopoints()[0];
    assert_eq!(call.reason, InfopointReason::Call);
    assert!(call.debug_info.is_some());
    let site = call.call.as_ref().unwrap();
    assert_eq!(site.target, CallTarget::Method(MethodId::new(9)));
    assert_eq!(site.size, 5);

    let handler = result.exception_handlers()[0];
    assert_eq!(handler.pc_offset, call.pc_offset + 5);
    let code = result.target_code();
    // The jump to the next block is elided: the epilogue follows the call.
    assert_eq!(&code[handler.pc_offset as usize..][..5], &[0x48, 0x83, 0xc4, 0x08, 0xc3]);
    assert_eq!(&code[handler.handler_pos as usize..][..5], &[0x48, 0x83, 0xc4, 0x08, 0xc3]);
    assert_eq!(handler.handler_pos, handler.pc_offset + 5);
}

#[test]
fn branch_is_inverted_when_true_target_falls_through() {
    let branch = LirInstruction::new(
        LirOp::CompareBranch {
            condition: Condition::Lt,
            kind: Kind::Int,
            true_target: Block::new(1),
            false_target: Block::new(2),
            true_probability: 0.5,
        },
        smallvec![reg(RAX, Kind::Int), Value::Constant(Constant::Int(3))],
        None,
    );
    let result = emit(&lir(&[&[1, 2], &[], &[]], vec![vec![branch], vec![ret()], vec![ret()]]));
    let code = result.target_code();
    assert_eq!(&code[4..9], &[0x83, 0xf8, 0x03, 0x0f, 0x8d]);
    // Block 1 is five bytes long; block 2 follows it.
    assert_eq!(i32_at(code, 9), 5);
}

#[test]
fn table_switch_emits_relative_table() {
    let switch = LirInstruction::new(
        LirOp::TableSwitch {
            low: 1,
            targets: vec![Block::new(1), Block::new(2)],
            default: Block::new(3),
        },
        smallvec![reg(RDI, Kind::Int), reg(RAX, Kind::Long), reg(RCX, Kind::Long)],
        None,
    );
    let result = emit(&lir(
        &[&[1, 2, 3], &[], &[], &[]],
        vec![vec![switch], vec![ret()], vec![ret()], vec![ret()]],
    ));
    let table = result
        .annotations()
        .iter()
        .find_map(|a| match a {
            CodeAnnotation::JumpTable {
                position,
                low,
                high,
                entry_size,
            } => Some((*position, *low, *high, *entry_size)),
            _ => None,
        })
        .unwrap();
    let (position, low, high, entry_size) = table;
    assert_eq!((low, high, entry_size), (1, 2, 4));
    assert_eq!(position % 4, 0);
    let code = result.target_code();
    // Blocks 1 and 2 directly follow the two table entries.
    assert_eq!(i32_at(code, position as usize), 8);
    assert_eq!(i32_at(code, position as usize + 4), 13);
}

#[test]
fn null_check_and_safepoint_metadata() {
    let result = emit(&lir(
        &[&[]],
        vec![vec![
            LirInstruction::new(LirOp::NullCheck, smallvec![reg(RSI, Kind::Object)], Some(state(None))),
            LirInstruction::new(LirOp::Safepoint, smallvec![], Some(state(None))),
            ret(),
        ]],
    ));
    let points: Vec<(u32, InfopointReason)> = result
        .infopoints()
        .iter()
        .map(|i| (i.pc_offset, i.reason))
        .collect();
    assert_eq!(points[0], (4, InfopointReason::ImplicitException));
    assert_eq!(points[1], (6, InfopointReason::Safepoint));
    assert!(result
        .marks()
        .iter()
        .any(|m| m.id == MarkId::POLL_NEAR && m.pc_offset == 6));
    assert!(result
        .infopoints()
        .windows(2)
        .all(|w| w[0].pc_offset <= w[1].pc_offset));
}

#[test]
fn callee_saved_registers_are_restored() {
    let result = emit_with(&lir(&[&[]], vec![vec![ret()]]), |frame| frame.use_callee_saved(RBX)).unwrap();
    let code = result.target_code();
    assert_eq!(&code[4..8], &[0x48, 0x89, 0x1c, 0x24]);
    assert_eq!(result.register_restore_epilogue_offset(), 8);
    assert_eq!(&code[8..12], &[0x48, 0x8b, 0x1c, 0x24]);
}

#[test]
fn stack_to_stack_move_goes_through_memory() {
    let slot = |id| Value::VirtualStackSlot(VirtualStackSlot { id, kind: Kind::Long });
    let result = emit_with(&lir(&[&[]], vec![vec![LirInstruction::mov(slot(1), slot(0)), ret()]]), |frame| {
        frame.allocate_spill_slot(Kind::Long);
        frame.allocate_spill_slot(Kind::Long);
    })
    .unwrap();
    let code = result.target_code();
    assert_eq!(&code[..4], &[0x48, 0x83, 0xec, 0x18]);
    assert_eq!(&code[4..11], &[0xff, 0x34, 0x24, 0x8f, 0x44, 0x24, 0x08]);
}

#[test]
fn unsupported_float_operation() {
    let and = LirInstruction::new(
        LirOp::Binary { op: BinaryOp::And },
        smallvec![reg(xmm(0), Kind::Double), reg(xmm(0), Kind::Double), reg(xmm(1), Kind::Double)],
        None,
    );
    match emit_with(&lir(&[&[]], vec![vec![and, ret()]]), |_| {}) {
        Err(CompileError::Encoding { op, .. }) => assert_eq!(op, "binary"),
        other => panic!("expected an encoding error, got {:?}", other.map(|r| r.target_code_size())),
    }
}
