/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Checker: verifies the output of register allocation.
//!
//! Three properties are checked. No variable survives in an operand or
//! a frame state. Every operand is a value its slot accepts, so a
//! register-only operand really got a register. And no two pieces of
//! different intervals occupy the same register at the same position;
//! fixed register uses count as pieces too.

use crate::alloc::AllocatedRange;
use crate::lir::{Lir, OperandMode};
use crate::target::{Register, TargetDescription};
use crate::value::Variable;
use crate::{Block, FxHashMap};
use smallvec::SmallVec;

/// A set of errors detected by the checker.
#[derive(Clone, Debug)]
pub struct CheckerErrors {
    pub errors: Vec<CheckerError>,
}

/// A single error detected by the checker.
#[derive(Clone, Debug)]
pub enum CheckerError {
    VariableRemains {
        block: Block,
        inst: usize,
        variable: Variable,
    },
    VariableInFrameState {
        block: Block,
        inst: usize,
        variable: Variable,
    },
    FlagsViolated {
        block: Block,
        inst: usize,
        op: &'static str,
        mode: OperandMode,
        value: String,
    },
    NotAllocatable {
        register: Register,
        variable: Option<Variable>,
    },
    Overlap {
        register: Register,
        first: Option<Variable>,
        second: Option<Variable>,
        position: u32,
    },
}

struct Checker<'a> {
    lir: &'a Lir,
    target: &'a TargetDescription,
    errors: Vec<CheckerError>,
}

impl<'a> Checker<'a> {
    fn check_operands(&mut self) {
        for &block in self.lir.linear_scan_order() {
            for (i, inst) in self.lir.block_ops(block).iter().enumerate() {
                let errors = &mut self.errors;
                inst.for_each_operand(|value, mode, flags| {
                    if let Some(variable) = value.as_variable() {
                        errors.push(CheckerError::VariableRemains {
                            block,
                            inst: i,
                            variable,
                        });
                    } else if !flags.accepts(value) {
                        errors.push(CheckerError::FlagsViolated {
                            block,
                            inst: i,
                            op: inst.op.name(),
                            mode,
                            value: value.to_string(),
                        });
                    }
                });
                inst.for_each_state_value(|value, _| {
                    if let Some(variable) = value.as_variable() {
                        errors.push(CheckerError::VariableInFrameState {
                            block,
                            inst: i,
                            variable,
                        });
                    }
                });
            }
        }
    }

    fn check_ranges(&mut self, allocated: &[AllocatedRange]) {
        let mut by_register: FxHashMap<Register, SmallVec<[&AllocatedRange; 8]>> = FxHashMap::default();
        for piece in allocated {
            if piece.variable.is_some()
                && !self.target.register_config.allocatable.contains(&piece.register)
            {
                self.errors.push(CheckerError::NotAllocatable {
                    register: piece.register,
                    variable: piece.variable,
                });
            }
            by_register.entry(piece.register).or_default().push(piece);
        }

        for (&register, pieces) in &by_register {
            trace!("checker: {} holds {} pieces", register, pieces.len());
            for (i, a) in pieces.iter().enumerate() {
                for b in &pieces[i + 1..] {
                    // Fixed uses of one register may touch each other.
                    if a.variable.is_none() && b.variable.is_none() {
                        continue;
                    }
                    if a.variable.is_some() && a.variable == b.variable {
                        continue;
                    }
                    let clash = a
                        .ranges
                        .iter()
                        .flat_map(|ra| b.ranges.iter().map(move |rb| (ra, rb)))
                        .find(|(ra, rb)| ra.overlaps(rb));
                    if let Some((ra, rb)) = clash {
                        self.errors.push(CheckerError::Overlap {
                            register,
                            first: a.variable,
                            second: b.variable,
                            position: ra.from.max(rb.from),
                        });
                    }
                }
            }
        }
    }
}

/// Checks allocated `lir` against the register assignment reported by
/// the allocator. Returns all errors found.
pub fn verify_allocation(
    lir: &Lir,
    allocated: &[AllocatedRange],
    target: &TargetDescription,
) -> Result<(), CheckerErrors> {
    let mut checker = Checker {
        lir,
        target,
        errors: vec![],
    };
    checker.check_operands();
    checker.check_ranges(allocated);
    if checker.errors.is_empty() {
        log::debug!("checker: {} register pieces verified", allocated.len());
        Ok(())
    } else {
        for error in &checker.errors {
            trace!("checker: {:?}", error);
        }
        Err(CheckerErrors {
            errors: checker.errors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::data_structures::CodeRange;
    use crate::cfg::tests::cfg_from_succs;
    use crate::constant::Constant;
    use crate::lir::{LirInstruction, LirOp};
    use crate::target::amd64::*;
    use crate::value::{Kind, Value};
    use smallvec::smallvec;

    fn single_block(ops: Vec<LirInstruction>) -> Lir {
        let mut lir = Lir::new(cfg_from_succs(&[&[]], &[1.0]));
        let mut all = vec![LirInstruction::label(Block::new(0))];
        all.extend(ops);
        lir.set_block_ops(Block::new(0), all);
        lir.set_linear_scan_order(vec![Block::new(0)]);
        lir
    }

    fn piece(variable: Option<Variable>, register: Register, from: u32, to: u32) -> AllocatedRange {
        AllocatedRange {
            variable,
            register,
            ranges: smallvec![CodeRange { from, to }],
        }
    }

    #[test]
    fn leftover_variable_is_reported() {
        let mut lir = Lir::new(cfg_from_succs(&[&[]], &[1.0]));
        let v = lir.new_variable(Kind::Int);
        lir.set_block_ops(
            Block::new(0),
            vec![
                LirInstruction::label(Block::new(0)),
                LirInstruction::new(LirOp::Return, smallvec![Value::Variable(v)], None),
            ],
        );
        lir.set_linear_scan_order(vec![Block::new(0)]);
        let target = TargetDescription::amd64();
        let errors = verify_allocation(&lir, &[], &target).unwrap_err().errors;
        assert!(matches!(errors[0], CheckerError::VariableRemains { inst: 1, .. }));
    }

    #[test]
    fn register_only_operand_in_constant() {
        let target = TargetDescription::amd64();
        let lir = single_block(vec![LirInstruction::new(
            LirOp::NullCheck,
            smallvec![Value::Constant(Constant::Null)],
            None,
        )]);
        let errors = verify_allocation(&lir, &[], &target).unwrap_err().errors;
        assert!(matches!(errors[0], CheckerError::FlagsViolated { op: "nullcheck", .. }));
    }

    #[test]
    fn overlapping_pieces_on_one_register() {
        let target = TargetDescription::amd64();
        let lir = single_block(vec![]);
        let a = Variable::new(0, Kind::Int);
        let b = Variable::new(1, Kind::Int);
        let ok = [piece(Some(a), RBX, 2, 8), piece(Some(b), RBX, 8, 12), piece(None, RAX, 4, 5)];
        assert!(verify_allocation(&lir, &ok, &target).is_ok());

        let bad = [piece(Some(a), RBX, 2, 8), piece(None, RBX, 6, 7)];
        let errors = verify_allocation(&lir, &bad, &target).unwrap_err().errors;
        assert!(matches!(
            errors[0],
            CheckerError::Overlap {
                register: RBX,
                position: 6,
                ..
            }
        ));
    }

    #[test]
    fn scratch_register_is_not_allocatable() {
        let target = TargetDescription::amd64();
        let lir = single_block(vec![]);
        let a = Variable::new(0, Kind::Long);
        let errors = verify_allocation(&lir, &[piece(Some(a), R11, 0, 4)], &target)
            .unwrap_err()
            .errors;
        assert!(matches!(errors[0], CheckerError::NotAllocatable { register: R11, .. }));
    }
}
