/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Immutable facts about the target machine: registers, word size,
//! byte order, stack alignment, memory-barrier semantics, and the
//! register configuration used by allocation and calling conventions.

use crate::value::{Kind, RegisterValue, StackSlot, Value};
use core::fmt;
use core::ops::BitOr;

/// Register categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum RegisterCategory {
    Cpu = 0,
    Fpu = 1,
}

impl RegisterCategory {
    pub const ALL: [RegisterCategory; 2] = [RegisterCategory::Cpu, RegisterCategory::Fpu];
}

/// A physical register: an encoding number within its category.
///
/// `index()` maps every register of every category into one dense
/// space: indices 0..31 are CPU registers and 32..63 FPU registers.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct Register {
    encoding: u8,
    category: RegisterCategory,
}

impl Register {
    pub const MAX_BITS: usize = 5;
    pub const MAX: usize = (1 << Self::MAX_BITS) - 1;
    pub const NUM_INDICES: usize = 1 << (Self::MAX_BITS + 1);

    #[inline(always)]
    pub const fn new(encoding: usize, category: RegisterCategory) -> Self {
        const ENCODING_MUST_BE_IN_BOUNDS: &[bool; Register::MAX + 1] = &[true; Register::MAX + 1];
        let _ = ENCODING_MUST_BE_IN_BOUNDS[encoding];
        Register {
            encoding: encoding as u8,
            category,
        }
    }

    /// The hardware encoding within the register's category.
    #[inline(always)]
    pub fn encoding(self) -> u8 {
        self.encoding
    }

    #[inline(always)]
    pub fn category(self) -> RegisterCategory {
        self.category
    }

    #[inline(always)]
    pub fn index(self) -> usize {
        ((self.category as usize) << Self::MAX_BITS) | (self.encoding as usize)
    }

    #[inline(always)]
    pub fn from_index(index: usize) -> Self {
        let category = match (index >> Self::MAX_BITS) & 1 {
            0 => RegisterCategory::Cpu,
            _ => RegisterCategory::Fpu,
        };
        Register::new(index & Self::MAX, category)
    }

    pub fn as_value(self, kind: Kind) -> Value {
        Value::Register(RegisterValue { reg: self, kind })
    }
}

impl fmt::Debug for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.category {
            RegisterCategory::Cpu if (self.encoding as usize) < amd64::CPU_NAMES.len() => {
                write!(f, "{}", amd64::CPU_NAMES[self.encoding as usize])
            }
            RegisterCategory::Cpu => write!(f, "r{}", self.encoding),
            RegisterCategory::Fpu => write!(f, "xmm{}", self.encoding),
        }
    }
}

/// AMD64 register definitions.
pub mod amd64 {
    use super::{Register, RegisterCategory::Cpu, RegisterCategory::Fpu};

    pub(crate) const CPU_NAMES: [&str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    pub const RAX: Register = Register::new(0, Cpu);
    pub const RCX: Register = Register::new(1, Cpu);
    pub const RDX: Register = Register::new(2, Cpu);
    pub const RBX: Register = Register::new(3, Cpu);
    pub const RSP: Register = Register::new(4, Cpu);
    pub const RBP: Register = Register::new(5, Cpu);
    pub const RSI: Register = Register::new(6, Cpu);
    pub const RDI: Register = Register::new(7, Cpu);
    pub const R8: Register = Register::new(8, Cpu);
    pub const R9: Register = Register::new(9, Cpu);
    pub const R10: Register = Register::new(10, Cpu);
    pub const R11: Register = Register::new(11, Cpu);
    pub const R12: Register = Register::new(12, Cpu);
    pub const R13: Register = Register::new(13, Cpu);
    pub const R14: Register = Register::new(14, Cpu);
    pub const R15: Register = Register::new(15, Cpu);

    pub const fn xmm(n: usize) -> Register {
        Register::new(n, Fpu)
    }

    pub const XMM0: Register = xmm(0);
    pub const XMM15: Register = xmm(15);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// A set of memory-barrier kinds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct MemoryBarriers(pub u8);

impl MemoryBarriers {
    pub const LOAD_LOAD: MemoryBarriers = MemoryBarriers(1);
    pub const LOAD_STORE: MemoryBarriers = MemoryBarriers(2);
    pub const STORE_LOAD: MemoryBarriers = MemoryBarriers(4);
    pub const STORE_STORE: MemoryBarriers = MemoryBarriers(8);
    pub const NONE: MemoryBarriers = MemoryBarriers(0);

    pub fn contains(self, other: MemoryBarriers) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: MemoryBarriers) -> MemoryBarriers {
        MemoryBarriers(self.0 & !other.0)
    }
}

impl BitOr for MemoryBarriers {
    type Output = MemoryBarriers;
    fn bitor(self, rhs: MemoryBarriers) -> MemoryBarriers {
        MemoryBarriers(self.0 | rhs.0)
    }
}

/// Description of a machine architecture. Built once and then shared
/// read-only between compilations.
#[derive(Clone, Debug)]
pub struct Architecture {
    pub name: &'static str,
    pub word_size: u32,
    pub byte_order: ByteOrder,
    pub stack_alignment: u32,
    pub return_address_size: u32,
    /// Barriers the hardware memory model already guarantees.
    pub implicit_barriers: MemoryBarriers,
    registers: Vec<Register>,
    /// Interned register values, indexed by
    /// `register.index() * Kind::COUNT + kind`.
    register_values: Vec<Option<RegisterValue>>,
}

impl Architecture {
    pub fn new(
        name: &'static str,
        word_size: u32,
        byte_order: ByteOrder,
        stack_alignment: u32,
        return_address_size: u32,
        implicit_barriers: MemoryBarriers,
        registers: Vec<Register>,
    ) -> Self {
        let mut register_values = vec![None; Register::NUM_INDICES * Kind::COUNT];
        for &reg in &registers {
            for kind_index in 0..Kind::COUNT {
                let kind = KINDS[kind_index];
                if kind != Kind::Illegal && kind.category() == reg.category() {
                    register_values[reg.index() * Kind::COUNT + kind_index] =
                        Some(RegisterValue { reg, kind });
                }
            }
        }
        Architecture {
            name,
            word_size,
            byte_order,
            stack_alignment,
            return_address_size,
            implicit_barriers,
            registers,
            register_values,
        }
    }

    pub fn amd64() -> Self {
        let mut registers: Vec<Register> = (0..16).map(|i| Register::new(i, RegisterCategory::Cpu)).collect();
        registers.extend((0..16).map(amd64::xmm));
        Architecture::new(
            "AMD64",
            8,
            ByteOrder::LittleEndian,
            16,
            8,
            MemoryBarriers::LOAD_LOAD | MemoryBarriers::LOAD_STORE | MemoryBarriers::STORE_STORE,
            registers,
        )
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    /// The canonical register value for `(reg, kind)`. Panics if the
    /// register does not exist or cannot hold `kind`.
    pub fn register_value(&self, reg: Register, kind: Kind) -> RegisterValue {
        match self.register_values[reg.index() * Kind::COUNT + kind as usize] {
            Some(value) => value,
            None => panic!("register {} cannot hold kind {:?}", reg, kind),
        }
    }

    /// Barriers from `barriers` that must actually be emitted.
    pub fn required_barriers(&self, barriers: MemoryBarriers) -> MemoryBarriers {
        barriers.without(self.implicit_barriers)
    }

    pub fn size_in_bytes(&self, kind: Kind) -> u32 {
        match kind {
            Kind::Byte => 1,
            Kind::Short => 2,
            Kind::Int | Kind::Float => 4,
            Kind::Long | Kind::Double => 8,
            Kind::Object => self.word_size,
            Kind::Illegal => 0,
        }
    }

    /// Number of bits in a register reference map.
    pub fn register_reference_map_size(&self) -> usize {
        Register::NUM_INDICES
    }
}

const KINDS: [Kind; Kind::COUNT] = [
    Kind::Byte,
    Kind::Short,
    Kind::Int,
    Kind::Long,
    Kind::Float,
    Kind::Double,
    Kind::Object,
    Kind::Illegal,
];

/// Which side of a call a calling convention is computed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum CallType {
    /// Outgoing managed call; stack arguments live in the caller's
    /// outgoing area.
    JavaCall,
    /// Incoming parameters of the method being compiled; stack
    /// arguments live in the caller's frame.
    JavaCallee,
    /// Call into the runtime.
    RuntimeCall,
}

/// Argument and return locations for one call shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallingConvention {
    pub arguments: Vec<Value>,
    pub return_location: Value,
    /// Bytes of outgoing stack arguments.
    pub stack_size: u32,
}

/// How registers may be used by allocated code.
#[derive(Clone, Debug)]
pub struct RegisterConfig {
    /// Allocatable registers in preference order.
    pub allocatable: Vec<Register>,
    pub caller_saved: Vec<Register>,
    pub callee_saved: Vec<Register>,
    /// Never allocated; reserved for move cycles.
    pub scratch: [Register; 2],
    pub stack_pointer: Register,
    pub java_arguments: [Vec<Register>; 2],
    pub runtime_arguments: [Vec<Register>; 2],
    pub return_register: [Register; 2],
    /// Holds the exception object on entry to a handler.
    pub exception_register: Register,
}

impl RegisterConfig {
    pub fn amd64() -> Self {
        use amd64::*;
        let cpu = vec![RAX, RCX, RDX, RBX, RSI, RDI, R8, R9, R10, R12, R13, R14];
        let callee_saved = vec![RBX, R12, R13, R14];
        let mut allocatable = cpu.clone();
        allocatable.extend((0..15).map(xmm));
        let mut caller_saved: Vec<Register> = cpu
            .iter()
            .copied()
            .filter(|r| !callee_saved.contains(r))
            .collect();
        caller_saved.push(R11);
        caller_saved.extend((0..16).map(xmm));
        RegisterConfig {
            allocatable,
            caller_saved,
            callee_saved,
            scratch: [R11, XMM15],
            stack_pointer: RSP,
            java_arguments: [vec![RSI, RDX, RCX, R8, R9, RDI], (0..8).map(xmm).collect()],
            runtime_arguments: [vec![RDI, RSI, RDX, RCX, R8, R9], (0..8).map(xmm).collect()],
            return_register: [RAX, XMM0],
            exception_register: RAX,
        }
    }

    pub fn allocatable(&self, category: RegisterCategory) -> impl Iterator<Item = Register> + '_ {
        self.allocatable
            .iter()
            .copied()
            .filter(move |r| r.category() == category)
    }

    pub fn is_caller_saved(&self, reg: Register) -> bool {
        self.caller_saved.contains(&reg)
    }

    pub fn is_callee_saved(&self, reg: Register) -> bool {
        self.callee_saved.contains(&reg)
    }

    pub fn scratch(&self, category: RegisterCategory) -> Register {
        self.scratch[category as usize]
    }

    pub fn return_register(&self, kind: Kind) -> Register {
        self.return_register[kind.category() as usize]
    }

    /// Maps an argument kind sequence to locations. Arguments take the
    /// category's argument registers in order, then word-sized stack
    /// slots.
    pub fn calling_convention(
        &self,
        call_type: CallType,
        arguments: &[Kind],
        return_kind: Kind,
        arch: &Architecture,
    ) -> CallingConvention {
        let registers = match call_type {
            CallType::JavaCall | CallType::JavaCallee => &self.java_arguments,
            CallType::RuntimeCall => &self.runtime_arguments,
        };
        let mut next = [0usize; 2];
        let mut stack_offset = 0u32;
        let mut locations = Vec::with_capacity(arguments.len());
        for &kind in arguments {
            debug_assert!(kind != Kind::Illegal);
            let category = kind.category() as usize;
            if let Some(&reg) = registers[category].get(next[category]) {
                next[category] += 1;
                locations.push(Value::Register(arch.register_value(reg, kind)));
            } else {
                let slot = StackSlot::new(
                    stack_offset as i32,
                    kind,
                    call_type == CallType::JavaCallee,
                );
                locations.push(Value::StackSlot(slot));
                stack_offset += arch.word_size;
            }
        }
        let return_location = if return_kind == Kind::Illegal {
            Value::Illegal
        } else {
            Value::Register(arch.register_value(self.return_register(return_kind), return_kind))
        };
        CallingConvention {
            arguments: locations,
            return_location,
            stack_size: stack_offset,
        }
    }
}

/// Everything the back end needs to know about the target.
#[derive(Clone, Debug)]
pub struct TargetDescription {
    pub arch: Architecture,
    pub register_config: RegisterConfig,
    /// Multiprocessor target: barriers cannot be elided.
    pub is_mp: bool,
    /// Whether object constants may be embedded in instructions.
    pub inline_objects: bool,
}

impl TargetDescription {
    pub fn amd64() -> Self {
        TargetDescription {
            arch: Architecture::amd64(),
            register_config: RegisterConfig::amd64(),
            is_mp: true,
            inline_objects: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_index_space() {
        let r = amd64::R12;
        assert_eq!(Register::from_index(r.index()), r);
        let x = amd64::xmm(3);
        assert_eq!(x.index(), 35);
        assert_eq!(Register::from_index(35), x);
        assert_eq!(r.to_string(), "r12");
        assert_eq!(x.to_string(), "xmm3");
    }

    #[test]
    fn interned_register_values() {
        let arch = Architecture::amd64();
        let a = arch.register_value(amd64::RAX, Kind::Int);
        let b = arch.register_value(amd64::RAX, Kind::Int);
        assert_eq!(a, b);
        assert_ne!(a, arch.register_value(amd64::RAX, Kind::Long));
    }

    #[test]
    #[should_panic]
    fn register_value_wrong_category() {
        let arch = Architecture::amd64();
        arch.register_value(amd64::RAX, Kind::Double);
    }

    #[test]
    fn required_barriers_amd64() {
        let arch = Architecture::amd64();
        let all = MemoryBarriers::LOAD_LOAD
            | MemoryBarriers::LOAD_STORE
            | MemoryBarriers::STORE_LOAD
            | MemoryBarriers::STORE_STORE;
        assert_eq!(arch.required_barriers(all), MemoryBarriers::STORE_LOAD);
        assert!(arch.required_barriers(MemoryBarriers::LOAD_LOAD).is_empty());
    }

    #[test]
    fn calling_convention_spills_to_stack() {
        let target = TargetDescription::amd64();
        let kinds = [Kind::Int; 8];
        let cc = target.register_config.calling_convention(
            CallType::JavaCall,
            &kinds,
            Kind::Long,
            &target.arch,
        );
        assert_eq!(cc.arguments.len(), 8);
        assert_eq!(cc.arguments[0].as_register(), Some(amd64::RSI));
        assert_eq!(
            cc.arguments[6],
            Value::StackSlot(StackSlot::new(0, Kind::Int, false))
        );
        assert_eq!(
            cc.arguments[7],
            Value::StackSlot(StackSlot::new(8, Kind::Int, false))
        );
        assert_eq!(cc.stack_size, 16);
        assert_eq!(cc.return_location.as_register(), Some(amd64::RAX));

        let incoming = target.register_config.calling_convention(
            CallType::JavaCallee,
            &[Kind::Double; 9],
            Kind::Illegal,
            &target.arch,
        );
        assert_eq!(
            incoming.arguments[8],
            Value::StackSlot(StackSlot::new(0, Kind::Double, true))
        );
        assert!(incoming.return_location.is_illegal());
    }
}
