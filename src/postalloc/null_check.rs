/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Folding of explicit null checks into the memory access that follows
//! them. A load or store through the checked register at a small
//! displacement faults on null by itself; it takes over the check's
//! frame state and becomes an implicit exception point.

use crate::lir::{Lir, LirInsertionBuffer, LirInstruction, LirOp};
use crate::value::{CompositeValue, Value};
use crate::Stats;

/// The address operand of a memory access, if `inst` is one.
fn address_of(inst: &LirInstruction) -> Option<&CompositeValue> {
    let address = match inst.op {
        LirOp::Load { .. } => &inst.operands[1],
        LirOp::Store { .. } => &inst.operands[0],
        _ => return None,
    };
    match address {
        Value::Composite(c) => Some(c),
        _ => None,
    }
}

/// Whether `access` faults exactly when the value checked by `check`
/// is null.
fn can_fold(check: &LirInstruction, access: &LirInstruction, limit: u32) -> bool {
    if access.has_state() {
        return false;
    }
    let checked = match check.operands[0].as_register() {
        Some(reg) => reg,
        None => return false,
    };
    match address_of(access) {
        Some(CompositeValue::Address {
            base,
            index,
            displacement,
            ..
        }) => {
            base.as_register() == Some(checked)
                && index.is_illegal()
                && *displacement >= 0
                && (*displacement as u32) < limit
        }
        _ => false,
    }
}

/// Folds every null check immediately followed by a suitable memory
/// access. Returns the number of folded checks.
pub fn fold(lir: &mut Lir, limit: u32, stats: &mut Stats) -> usize {
    let mut folded = 0;
    let blocks: Vec<_> = lir.linear_scan_order().to_vec();
    for block in blocks {
        let mut buffer = LirInsertionBuffer::new();
        let ops = lir.block_ops_mut(block);
        for index in 1..ops.len() {
            if ops[index - 1].op != LirOp::NullCheck || !can_fold(&ops[index - 1], &ops[index], limit) {
                continue;
            }
            trace!("{}: folding null check into {}", block, ops[index]);
            let state = ops[index - 1].state.take();
            ops[index].state = state;
            buffer.delete(index - 1);
            folded += 1;
        }
        buffer.apply(ops);
    }
    stats.null_checks_folded += folded;
    folded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::tests::cfg_from_succs;
    use crate::lir::{BytecodeFrame, LirFrameState};
    use crate::target::amd64::*;
    use crate::target::TargetDescription;
    use crate::value::Kind;
    use crate::{Block, MethodId};
    use smallvec::smallvec;

    fn state() -> LirFrameState {
        LirFrameState::new(
            BytecodeFrame::new(None, MethodId::new(0), 5, false, false, vec![], 0, 0, 0),
            None,
        )
    }

    fn block_with(ops: Vec<LirInstruction>) -> Lir {
        let mut lir = Lir::new(cfg_from_succs(&[&[]], &[1.0]));
        let mut all = vec![LirInstruction::label(Block::new(0))];
        all.extend(ops);
        all.push(LirInstruction::new(LirOp::Return, smallvec![Value::Illegal], None));
        lir.set_block_ops(Block::new(0), all);
        lir.set_linear_scan_order(vec![Block::new(0)]);
        lir
    }

    fn check_then_load(displacement: i32) -> Lir {
        let t = TargetDescription::amd64();
        let object = Value::Register(t.arch.register_value(RSI, Kind::Object));
        let result = Value::Register(t.arch.register_value(RAX, Kind::Int));
        block_with(vec![
            LirInstruction::new(LirOp::NullCheck, smallvec![object.clone()], Some(state())),
            LirInstruction::new(
                LirOp::Load { kind: Kind::Int },
                smallvec![result, Value::address(object, displacement)],
                None,
            ),
        ])
    }

    #[test]
    fn check_folds_into_load() {
        let mut lir = check_then_load(12);
        let mut stats = Stats::default();
        assert_eq!(fold(&mut lir, 4096, &mut stats), 1);
        assert_eq!(stats.null_checks_folded, 1);
        let ops = lir.block_ops(Block::new(0));
        assert_eq!(ops.len(), 3);
        assert!(matches!(ops[1].op, LirOp::Load { .. }));
        assert_eq!(ops[1].state.as_ref().map(|s| s.top_frame.bci), Some(5));
    }

    #[test]
    fn far_displacement_keeps_check() {
        let mut lir = check_then_load(8192);
        let mut stats = Stats::default();
        assert_eq!(fold(&mut lir, 4096, &mut stats), 0);
        assert_eq!(lir.block_ops(Block::new(0))[1].op, LirOp::NullCheck);
    }
}
