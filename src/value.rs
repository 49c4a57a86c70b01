/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The value model: typed places that hold values before and after
//! register allocation.

use crate::constant::Constant;
use crate::target::{Register, RegisterCategory};
use core::fmt;

/// The semantic type of a value, independent of where it is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Kind {
    Byte = 0,
    Short = 1,
    Int = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Object = 6,
    Illegal = 7,
}

impl Kind {
    pub const COUNT: usize = 8;

    pub fn is_float(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    pub fn is_object(self) -> bool {
        self == Kind::Object
    }

    /// The register category able to hold this kind.
    pub fn category(self) -> RegisterCategory {
        if self.is_float() {
            RegisterCategory::Fpu
        } else {
            RegisterCategory::Cpu
        }
    }

    /// Whether operations on this kind use 64-bit encodings.
    pub fn is_wide(self) -> bool {
        matches!(self, Kind::Long | Kind::Double | Kind::Object)
    }

    pub fn type_char(self) -> char {
        match self {
            Kind::Byte => 'b',
            Kind::Short => 's',
            Kind::Int => 'i',
            Kind::Long => 'j',
            Kind::Float => 'f',
            Kind::Double => 'd',
            Kind::Object => 'a',
            Kind::Illegal => '-',
        }
    }
}

/// A symbolic register: an index into the dense variable namespace of
/// one `Lir`. Variables only exist until register allocation is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Variable {
    pub index: u32,
    pub kind: Kind,
}

impl Variable {
    pub fn new(index: usize, kind: Kind) -> Self {
        Variable {
            index: index as u32,
            kind,
        }
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{}|{}", self.index, self.kind.type_char())
    }
}

/// A physical register paired with the kind it currently holds. The
/// canonical instances live in `Architecture::register_value`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct RegisterValue {
    pub reg: Register,
    pub kind: Kind,
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}|{}", self.reg, self.kind.type_char())
    }
}

/// A concrete stack slot. `offset` is relative to the stack pointer
/// after the prologue, unless `add_frame_size` is set, in which case it
/// is relative to the caller's stack pointer at the call (incoming
/// arguments) and the total frame size must be added.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct StackSlot {
    pub offset: i32,
    pub kind: Kind,
    pub add_frame_size: bool,
}

impl StackSlot {
    pub fn new(offset: i32, kind: Kind, add_frame_size: bool) -> Self {
        StackSlot {
            offset,
            kind,
            add_frame_size,
        }
    }
}

impl fmt::Display for StackSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let prefix = if self.add_frame_size { "in:" } else { "" };
        write!(f, "stack:{}{}|{}", prefix, self.offset, self.kind.type_char())
    }
}

/// A frame slot whose offset is known only once the frame is finalized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct VirtualStackSlot {
    pub id: u32,
    pub kind: Kind,
}

impl fmt::Display for VirtualStackSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "vstack:{}|{}", self.id, self.kind.type_char())
    }
}

/// Values built out of other values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum CompositeValue {
    /// A held monitor: the locked object and the frame slot holding
    /// its lock record.
    Lock { owner: Value, slot: Value },
    /// A memory address `base + index * scale + displacement`.
    Address {
        base: Value,
        index: Value,
        scale: u8,
        displacement: i32,
    },
}

impl CompositeValue {
    /// The nested values, in declaration order.
    pub fn components(&self) -> [&Value; 2] {
        match self {
            CompositeValue::Lock { owner, slot } => [owner, slot],
            CompositeValue::Address { base, index, .. } => [base, index],
        }
    }

    pub fn components_mut(&mut self) -> [&mut Value; 2] {
        match self {
            CompositeValue::Lock { owner, slot } => [owner, slot],
            CompositeValue::Address { base, index, .. } => [base, index],
        }
    }
}

/// A typed place holding a value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum Value {
    Illegal,
    Variable(Variable),
    Register(RegisterValue),
    StackSlot(StackSlot),
    VirtualStackSlot(VirtualStackSlot),
    Constant(Constant),
    Composite(Box<CompositeValue>),
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::Illegal => Kind::Illegal,
            Value::Variable(v) => v.kind,
            Value::Register(r) => r.kind,
            Value::StackSlot(s) => s.kind,
            Value::VirtualStackSlot(s) => s.kind,
            Value::Constant(c) => c.kind(),
            Value::Composite(c) => match **c {
                CompositeValue::Lock { .. } => Kind::Object,
                CompositeValue::Address { .. } => Kind::Long,
            },
        }
    }

    pub fn address(base: Value, displacement: i32) -> Value {
        Value::Composite(Box::new(CompositeValue::Address {
            base,
            index: Value::Illegal,
            scale: 1,
            displacement,
        }))
    }

    pub fn is_illegal(&self) -> bool {
        matches!(self, Value::Illegal)
    }

    pub fn as_variable(&self) -> Option<Variable> {
        match self {
            Value::Variable(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_register(&self) -> Option<Register> {
        match self {
            Value::Register(r) => Some(r.reg),
            _ => None,
        }
    }

    pub fn as_constant(&self) -> Option<&Constant> {
        match self {
            Value::Constant(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_stack(&self) -> bool {
        matches!(self, Value::StackSlot(_) | Value::VirtualStackSlot(_))
    }

    /// Register or stack slot.
    pub fn is_location(&self) -> bool {
        matches!(
            self,
            Value::Register(_) | Value::StackSlot(_) | Value::VirtualStackSlot(_)
        )
    }
}

impl From<Variable> for Value {
    fn from(v: Variable) -> Self {
        Value::Variable(v)
    }
}

impl From<RegisterValue> for Value {
    fn from(r: RegisterValue) -> Self {
        Value::Register(r)
    }
}

impl From<Constant> for Value {
    fn from(c: Constant) -> Self {
        Value::Constant(c)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Illegal => write!(f, "-"),
            Value::Variable(v) => write!(f, "{}", v),
            Value::Register(r) => write!(f, "{}", r),
            Value::StackSlot(s) => write!(f, "{}", s),
            Value::VirtualStackSlot(s) => write!(f, "{}", s),
            Value::Constant(c) => write!(f, "{}", c),
            Value::Composite(c) => match &**c {
                CompositeValue::Lock { owner, slot } => write!(f, "lock({}, {})", owner, slot),
                CompositeValue::Address {
                    base,
                    index,
                    scale,
                    displacement,
                } => {
                    write!(f, "[{}", base)?;
                    if !index.is_illegal() {
                        write!(f, " + {} * {}", index, scale)?;
                    }
                    write!(f, " + {}]", displacement)
                }
            },
        }
    }
}
