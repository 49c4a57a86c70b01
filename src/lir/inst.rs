/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! LIR instructions and their operand declarations.
//!
//! Every instruction variant declares its operand slots statically as
//! an `OperandShape` (mode plus allowed value flags per slot). The
//! generic visitors below walk that declaration, descending into
//! composite values, so passes never need per-variant operand code.

use super::frame_state::LirFrameState;
use crate::graph::{BinaryOp, Condition};
use crate::result::CallTarget;
use crate::target::MemoryBarriers;
use crate::value::{CompositeValue, Kind, Value};
use crate::Block;
use core::fmt;
use core::ops::BitOr;
use smallvec::SmallVec;

/// How an instruction accesses an operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OperandMode {
    /// Read at the start of the instruction; the location may be
    /// reused by outputs.
    Use,
    /// Read, and must stay intact for the whole instruction.
    Alive,
    /// Clobbered scratch; neither live in nor live out.
    Temp,
    /// Written.
    Def,
}

/// Value variants an operand slot accepts.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperandFlags(u8);

impl OperandFlags {
    pub const REG: OperandFlags = OperandFlags(1);
    pub const STACK: OperandFlags = OperandFlags(2);
    pub const CONST: OperandFlags = OperandFlags(4);
    pub const COMPOSITE: OperandFlags = OperandFlags(8);
    pub const ILLEGAL: OperandFlags = OperandFlags(16);
    /// The allocator should try to give this operand the location of a
    /// related operand.
    pub const HINT: OperandFlags = OperandFlags(32);
    pub const UNINITIALIZED: OperandFlags = OperandFlags(64);
    pub const NONE: OperandFlags = OperandFlags(0);

    pub const fn union(self, other: OperandFlags) -> OperandFlags {
        OperandFlags(self.0 | other.0)
    }

    pub const fn contains(self, other: OperandFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags a slot of the given mode may declare.
    pub const fn allowed_for(mode: OperandMode) -> OperandFlags {
        match mode {
            OperandMode::Use | OperandMode::Alive => OperandFlags(0x7f),
            OperandMode::Temp => OperandFlags(1 | 4 | 8 | 16 | 32),
            OperandMode::Def => OperandFlags(1 | 2 | 8 | 16 | 32),
        }
    }

    /// Whether `value` is an acceptable operand for these flags.
    /// Variables are acceptable wherever a register or stack slot is.
    pub fn accepts(self, value: &Value) -> bool {
        match value {
            Value::Illegal => self.contains(Self::ILLEGAL),
            Value::Variable(_) => self.contains(Self::REG) || self.contains(Self::STACK),
            Value::Register(_) => self.contains(Self::REG),
            Value::StackSlot(_) | Value::VirtualStackSlot(_) => self.contains(Self::STACK),
            Value::Constant(_) => self.contains(Self::CONST),
            Value::Composite(_) => self.contains(Self::COMPOSITE),
        }
    }
}

impl BitOr for OperandFlags {
    type Output = OperandFlags;
    fn bitor(self, rhs: OperandFlags) -> OperandFlags {
        self.union(rhs)
    }
}

impl fmt::Debug for OperandFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [&str; 7] = ["REG", "STACK", "CONST", "COMPOSITE", "ILLEGAL", "HINT", "UNINIT"];
        let names: Vec<&str> = (0..7)
            .filter(|i| self.0 & (1 << i) != 0)
            .map(|i| NAMES[i])
            .collect();
        write!(f, "{{{}}}", names.join("|"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperandSlot {
    pub mode: OperandMode,
    pub flags: OperandFlags,
}

const fn slot(mode: OperandMode, flags: OperandFlags) -> OperandSlot {
    OperandSlot { mode, flags }
}

use OperandFlags as F;
use OperandMode as M;

const REG_STACK: OperandFlags = F::REG.union(F::STACK);
const REG_STACK_CONST: OperandFlags = REG_STACK.union(F::CONST);

/// The static operand declaration of one instruction variant: fixed
/// slots followed by any number of `rest` slots.
#[derive(Clone, Copy, Debug)]
pub struct OperandShape {
    pub fixed: &'static [OperandSlot],
    pub rest: Option<OperandSlot>,
}

impl OperandShape {
    pub fn slot(&self, index: usize) -> OperandSlot {
        match self.fixed.get(index) {
            Some(s) => *s,
            None => match self.rest {
                Some(s) => s,
                None => panic!("operand index {} out of range", index),
            },
        }
    }

    fn is_valid(&self) -> bool {
        self.fixed
            .iter()
            .chain(self.rest.iter())
            .all(|s| OperandFlags::allowed_for(s.mode).contains(s.flags))
    }
}

const NO_OPERANDS: OperandShape = OperandShape {
    fixed: &[],
    rest: None,
};

/// Flags of the components of composite values.
fn component_flags(composite: &CompositeValue, index: usize) -> OperandFlags {
    match composite {
        CompositeValue::Address { .. } => F::REG | F::ILLEGAL,
        CompositeValue::Lock { .. } if index == 0 => REG_STACK_CONST | F::ILLEGAL,
        CompositeValue::Lock { .. } => F::STACK,
    }
}

/// Instruction variants.
#[derive(Clone, Debug, PartialEq)]
pub enum LirOp {
    /// First instruction of every block.
    Label { block: Block },
    Jump { target: Block },
    /// `if x <cond> y goto true_target else goto false_target`.
    CompareBranch {
        condition: Condition,
        kind: Kind,
        true_target: Block,
        false_target: Block,
        true_probability: f64,
    },
    Move,
    Binary { op: BinaryOp },
    Load { kind: Kind },
    Store { kind: Kind },
    /// Faults if the operand is null; the frame state describes where
    /// to deoptimize.
    NullCheck,
    Call { target: CallTarget },
    Return,
    Safepoint,
    Deoptimize { reason: u32 },
    /// Binds the exception object delivered to a handler.
    ExceptionObject,
    Membar { barriers: MemoryBarriers },
    /// Jump through a table indexed by `index - low`, to `default`
    /// when out of range.
    TableSwitch {
        low: i32,
        targets: Vec<Block>,
        default: Block,
    },
}

const BRANCH_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Use, F::REG), slot(M::Use, REG_STACK_CONST)],
    rest: None,
};
const MOVE_SHAPE: OperandShape = OperandShape {
    fixed: &[
        slot(M::Def, REG_STACK.union(F::HINT)),
        slot(M::Use, REG_STACK_CONST.union(F::HINT)),
    ],
    rest: None,
};
const BINARY_SHAPE: OperandShape = OperandShape {
    fixed: &[
        slot(M::Def, F::REG.union(F::HINT)),
        slot(M::Use, F::REG),
        slot(M::Alive, REG_STACK_CONST),
    ],
    rest: None,
};
const LOAD_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Def, F::REG), slot(M::Use, F::COMPOSITE)],
    rest: None,
};
const STORE_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Use, F::COMPOSITE), slot(M::Use, F::REG.union(F::CONST))],
    rest: None,
};
const NULL_CHECK_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Use, F::REG)],
    rest: None,
};
const CALL_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Def, F::REG.union(F::ILLEGAL))],
    rest: Some(slot(M::Use, REG_STACK)),
};
const RETURN_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Use, F::REG.union(F::ILLEGAL))],
    rest: None,
};
const EXCEPTION_OBJECT_SHAPE: OperandShape = OperandShape {
    fixed: &[slot(M::Def, F::REG)],
    rest: None,
};
const TABLE_SWITCH_SHAPE: OperandShape = OperandShape {
    fixed: &[
        slot(M::Use, F::REG),
        slot(M::Temp, F::REG),
        slot(M::Temp, F::REG),
    ],
    rest: None,
};

impl LirOp {
    pub fn shape(&self) -> OperandShape {
        match self {
            LirOp::Label { .. }
            | LirOp::Jump { .. }
            | LirOp::Safepoint
            | LirOp::Deoptimize { .. }
            | LirOp::Membar { .. } => NO_OPERANDS,
            LirOp::CompareBranch { .. } => BRANCH_SHAPE,
            LirOp::Move => MOVE_SHAPE,
            LirOp::Binary { .. } => BINARY_SHAPE,
            LirOp::Load { .. } => LOAD_SHAPE,
            LirOp::Store { .. } => STORE_SHAPE,
            LirOp::NullCheck => NULL_CHECK_SHAPE,
            LirOp::Call { .. } => CALL_SHAPE,
            LirOp::Return => RETURN_SHAPE,
            LirOp::ExceptionObject => EXCEPTION_OBJECT_SHAPE,
            LirOp::TableSwitch { .. } => TABLE_SWITCH_SHAPE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LirOp::Label { .. } => "label",
            LirOp::Jump { .. } => "jump",
            LirOp::CompareBranch { .. } => "branch",
            LirOp::Move => "move",
            LirOp::Binary { .. } => "binary",
            LirOp::Load { .. } => "load",
            LirOp::Store { .. } => "store",
            LirOp::NullCheck => "nullcheck",
            LirOp::Call { .. } => "call",
            LirOp::Return => "return",
            LirOp::Safepoint => "safepoint",
            LirOp::Deoptimize { .. } => "deopt",
            LirOp::ExceptionObject => "exception-object",
            LirOp::Membar { .. } => "membar",
            LirOp::TableSwitch { .. } => "tableswitch",
        }
    }

    /// Whether the instruction ends a block.
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            LirOp::Jump { .. }
                | LirOp::CompareBranch { .. }
                | LirOp::Return
                | LirOp::Deoptimize { .. }
                | LirOp::TableSwitch { .. }
        )
    }

    /// Replaces every occurrence of `from` as a branch target.
    pub fn replace_target(&mut self, from: Block, to: Block) {
        let retarget = |b: &mut Block| {
            if *b == from {
                *b = to;
            }
        };
        match self {
            LirOp::Jump { target } => retarget(target),
            LirOp::CompareBranch {
                true_target,
                false_target,
                ..
            } => {
                retarget(true_target);
                retarget(false_target);
            }
            LirOp::TableSwitch {
                targets, default, ..
            } => {
                targets.iter_mut().for_each(retarget);
                retarget(default);
            }
            _ => {}
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LirInstruction {
    pub op: LirOp,
    pub operands: SmallVec<[Value; 4]>,
    pub state: Option<Box<LirFrameState>>,
    /// Position in the allocation numbering; -1 until numbered.
    pub id: i32,
}

impl LirInstruction {
    pub fn new(op: LirOp, operands: SmallVec<[Value; 4]>, state: Option<LirFrameState>) -> Self {
        let inst = LirInstruction {
            op,
            operands,
            state: state.map(Box::new),
            id: -1,
        };
        debug_assert!(inst.op.shape().is_valid(), "bad shape for {}", inst.op.name());
        debug_assert!(
            inst.operands.len() >= inst.op.shape().fixed.len()
                && (inst.op.shape().rest.is_some()
                    || inst.operands.len() == inst.op.shape().fixed.len()),
            "wrong operand count for {}",
            inst.op.name()
        );
        inst
    }

    pub fn label(block: Block) -> Self {
        Self::new(LirOp::Label { block }, SmallVec::new(), None)
    }

    pub fn jump(target: Block) -> Self {
        Self::new(LirOp::Jump { target }, SmallVec::new(), None)
    }

    pub fn mov(result: Value, input: Value) -> Self {
        Self::new(LirOp::Move, smallvec::smallvec![result, input], None)
    }

    pub fn is_move(&self) -> bool {
        self.op == LirOp::Move
    }

    /// A move of a constant into a variable.
    pub fn is_constant_load(&self) -> bool {
        self.is_move()
            && matches!(self.operands[0], Value::Variable(_))
            && matches!(self.operands[1], Value::Constant(_))
    }

    pub fn move_result(&self) -> &Value {
        debug_assert!(self.is_move());
        &self.operands[0]
    }

    pub fn move_input(&self) -> &Value {
        debug_assert!(self.is_move());
        &self.operands[1]
    }

    /// Calls destroy every caller-saved register.
    pub fn destroys_caller_saved(&self) -> bool {
        matches!(self.op, LirOp::Call { .. })
    }

    pub fn has_state(&self) -> bool {
        self.state.is_some()
    }

    /// Visits every leaf operand with its mode and flags, descending
    /// into composite values.
    pub fn for_each_operand<F: FnMut(&Value, OperandMode, OperandFlags)>(&self, mut f: F) {
        let shape = self.op.shape();
        for (i, value) in self.operands.iter().enumerate() {
            let s = shape.slot(i);
            visit_leaf(value, s.mode, s.flags, &mut f);
        }
    }

    pub fn for_each_operand_mut<F: FnMut(&mut Value, OperandMode, OperandFlags)>(&mut self, mut f: F) {
        let shape = self.op.shape();
        for (i, value) in self.operands.iter_mut().enumerate() {
            let s = shape.slot(i);
            visit_leaf_mut(value, s.mode, s.flags, &mut f);
        }
    }

    /// Visits every leaf value of the attached frame state.
    pub fn for_each_state_value<F: FnMut(&Value, OperandFlags)>(&self, mut f: F) {
        if let Some(state) = &self.state {
            let flags = REG_STACK_CONST | OperandFlags::ILLEGAL;
            state.top_frame.for_each_value(&mut |v| {
                visit_leaf(v, M::Use, flags, &mut |leaf, _, fl| f(leaf, fl))
            });
        }
    }

    pub fn for_each_state_value_mut<F: FnMut(&mut Value, OperandFlags)>(&mut self, mut f: F) {
        if let Some(state) = &mut self.state {
            let flags = REG_STACK_CONST | OperandFlags::ILLEGAL;
            state.top_frame.for_each_value_mut(&mut |v| {
                visit_leaf_mut(v, M::Use, flags, &mut |leaf, _, fl| f(leaf, fl))
            });
        }
    }

    /// For a HINT-flagged output, the operand whose location it should
    /// prefer.
    pub fn register_hint(&self) -> Option<(&Value, &Value)> {
        match self.op {
            LirOp::Move => Some((&self.operands[0], &self.operands[1])),
            LirOp::Binary { .. } => Some((&self.operands[0], &self.operands[1])),
            _ => None,
        }
    }
}

fn visit_leaf<F: FnMut(&Value, OperandMode, OperandFlags)>(
    value: &Value,
    mode: OperandMode,
    flags: OperandFlags,
    f: &mut F,
) {
    match value {
        Value::Composite(composite) => {
            for (i, component) in composite.components().iter().enumerate() {
                visit_leaf(component, mode, component_flags(composite, i), f);
            }
        }
        _ => f(value, mode, flags),
    }
}

fn visit_leaf_mut<F: FnMut(&mut Value, OperandMode, OperandFlags)>(
    value: &mut Value,
    mode: OperandMode,
    flags: OperandFlags,
    f: &mut F,
) {
    match value {
        Value::Composite(composite) => {
            let flags: [OperandFlags; 2] = [component_flags(composite, 0), component_flags(composite, 1)];
            for (component, flags) in composite.components_mut().iter_mut().zip(flags.iter()) {
                visit_leaf_mut(component, mode, *flags, f);
            }
        }
        _ => f(value, mode, flags),
    }
}

impl fmt::Display for LirInstruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.id >= 0 {
            write!(f, "{:>4} ", self.id)?;
        }
        match &self.op {
            LirOp::Label { block } => write!(f, "{}:", block)?,
            LirOp::Jump { target } => write!(f, "jump {}", target)?,
            LirOp::CompareBranch {
                condition,
                true_target,
                false_target,
                ..
            } => write!(
                f,
                "branch {:?} {}, {} ? {} : {}",
                condition, self.operands[0], self.operands[1], true_target, false_target
            )?,
            LirOp::Binary { op } => write!(
                f,
                "{} = {:?} {}, {}",
                self.operands[0], op, self.operands[1], self.operands[2]
            )?,
            op => {
                write!(f, "{}", op.name())?;
                for (i, v) in self.operands.iter().enumerate() {
                    write!(f, "{}{}", if i == 0 { " " } else { ", " }, v)?;
                }
            }
        }
        if let Some(state) = &self.state {
            write!(f, " @bci{}", state.top_frame.bci)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::Constant;
    use crate::value::Variable;
    use smallvec::smallvec;

    #[test]
    fn shapes_respect_mode_flags() {
        let ops = [
            LirOp::Move,
            LirOp::Binary { op: BinaryOp::Add },
            LirOp::Load { kind: Kind::Int },
            LirOp::Store { kind: Kind::Int },
            LirOp::Call {
                target: CallTarget::Method(crate::MethodId::new(0)),
            },
            LirOp::Return,
            LirOp::ExceptionObject,
            LirOp::NullCheck,
            LirOp::TableSwitch {
                low: 0,
                targets: vec![],
                default: Block::new(0),
            },
        ];
        for op in &ops {
            assert!(op.shape().is_valid(), "{}", op.name());
        }
        assert!(!OperandFlags::allowed_for(OperandMode::Def).contains(F::CONST));
        assert!(!OperandFlags::allowed_for(OperandMode::Temp).contains(F::STACK));
    }

    #[test]
    fn operand_visitor_descends_into_composites() {
        let base = Variable::new(0, Kind::Object);
        let result = Variable::new(1, Kind::Int);
        let load = LirInstruction::new(
            LirOp::Load { kind: Kind::Int },
            smallvec![Value::Variable(result), Value::address(Value::Variable(base), 8)],
            None,
        );
        let mut seen = vec![];
        load.for_each_operand(|v, mode, flags| seen.push((v.clone(), mode, flags)));
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].0, Value::Variable(result));
        assert_eq!(seen[0].1, OperandMode::Def);
        assert_eq!(seen[1].0, Value::Variable(base));
        assert_eq!(seen[1].1, OperandMode::Use);
        assert!(seen[1].2.contains(F::REG));
        assert!(!seen[1].2.contains(F::STACK));
        assert_eq!(seen[2].0, Value::Illegal);
    }

    #[test]
    fn constant_load_and_hints() {
        let v = Variable::new(0, Kind::Int);
        let mov = LirInstruction::mov(Value::Variable(v), Value::Constant(Constant::Int(3)));
        assert!(mov.is_constant_load());
        let (out, input) = mov.register_hint().unwrap();
        assert_eq!(out, &Value::Variable(v));
        assert_eq!(input, &Value::Constant(Constant::Int(3)));
        assert!(F::REG.accepts(&Value::Variable(v)));
        assert!(!F::REG.accepts(&Value::Constant(Constant::Int(3))));
    }

    #[test]
    fn retargeting() {
        let mut op = LirOp::TableSwitch {
            low: 0,
            targets: vec![Block::new(1), Block::new(2), Block::new(1)],
            default: Block::new(1),
        };
        op.replace_target(Block::new(1), Block::new(5));
        assert_eq!(
            op,
            LirOp::TableSwitch {
                low: 0,
                targets: vec![Block::new(5), Block::new(2), Block::new(5)],
                default: Block::new(5),
            }
        );
    }
}
