/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Compile-time constants.

use crate::target::ByteOrder;
use crate::value::Kind;
use core::fmt;

/// A constant value. Floating-point constants are stored as raw bits so
/// that constants can be hashed and deduplicated exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Constant {
    Int(i32),
    Long(i64),
    Float(u32),
    Double(u64),
    /// The null reference.
    Null,
    /// A handle to a heap object owned by the runtime. The handle is
    /// opaque to the compiler; the installer patches the real address.
    Object(u32),
}

impl Constant {
    pub fn float(f: f32) -> Self {
        Constant::Float(f.to_bits())
    }

    pub fn double(d: f64) -> Self {
        Constant::Double(d.to_bits())
    }

    pub fn kind(&self) -> Kind {
        match self {
            Constant::Int(_) => Kind::Int,
            Constant::Long(_) => Kind::Long,
            Constant::Float(_) => Kind::Float,
            Constant::Double(_) => Kind::Double,
            Constant::Null | Constant::Object(_) => Kind::Object,
        }
    }

    /// Whether the value is the zero pattern of its kind.
    pub fn is_default(&self) -> bool {
        match *self {
            Constant::Int(v) => v == 0,
            Constant::Long(v) => v == 0,
            Constant::Float(bits) => bits == 0,
            Constant::Double(bits) => bits == 0,
            Constant::Null => true,
            Constant::Object(_) => false,
        }
    }

    /// The integral value, for constants that have one.
    pub fn as_long(&self) -> Option<i64> {
        match *self {
            Constant::Int(v) => Some(v as i64),
            Constant::Long(v) => Some(v),
            Constant::Null => Some(0),
            _ => None,
        }
    }

    /// Whether the constant fits a sign-extended 32-bit immediate.
    pub fn fits_imm32(&self) -> bool {
        self.as_long()
            .map_or(false, |v| v >= i32::MIN as i64 && v <= i32::MAX as i64)
    }

    /// Whether the runtime must patch an address for this constant.
    pub fn needs_patch(&self) -> bool {
        matches!(self, Constant::Object(_))
    }

    /// Size of the constant's in-memory representation.
    pub fn size_in_bytes(&self, word_size: u32) -> u32 {
        match self {
            Constant::Int(_) | Constant::Float(_) => 4,
            Constant::Long(_) | Constant::Double(_) => 8,
            Constant::Null | Constant::Object(_) => word_size,
        }
    }

    /// Writes the raw bits of the constant. Object handles are written
    /// as zero and must be patched by the installer.
    pub fn write_bytes(&self, order: ByteOrder, word_size: u32, out: &mut [u8]) {
        let raw: u64 = match *self {
            Constant::Int(v) => v as u32 as u64,
            Constant::Long(v) => v as u64,
            Constant::Float(bits) => bits as u64,
            Constant::Double(bits) => bits,
            Constant::Null | Constant::Object(_) => 0,
        };
        let size = self.size_in_bytes(word_size) as usize;
        debug_assert!(out.len() >= size);
        for i in 0..size {
            let byte = match order {
                ByteOrder::LittleEndian => (raw >> (8 * i)) as u8,
                ByteOrder::BigEndian => (raw >> (8 * (size - 1 - i))) as u8,
            };
            out[i] = byte;
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Constant::Int(v) => write!(f, "{}i", v),
            Constant::Long(v) => write!(f, "{}j", v),
            Constant::Float(bits) => write!(f, "{}f", f32::from_bits(bits)),
            Constant::Double(bits) => write!(f, "{}d", f64::from_bits(bits)),
            Constant::Null => write!(f, "null"),
            Constant::Object(h) => write!(f, "obj@{}", h),
        }
    }
}
