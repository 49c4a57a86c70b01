/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Machine code emission for AMD64.

pub mod amd64;
pub mod buffer;
mod builder;

#[cfg(test)]
mod tests;

pub use buffer::{CodeBuffer, FixupKind, Label};
pub use builder::{emit_code, CompilationResultBuilder};

use crate::CompileError;

/// An operand combination the encoder has no form for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodingError {
    pub op: &'static str,
    pub operands: String,
}

impl From<EncodingError> for CompileError {
    fn from(e: EncodingError) -> Self {
        CompileError::Encoding {
            op: e.op,
            operands: e.operands,
        }
    }
}
