/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A minimal AMD64 instruction encoder: the forms the emitter needs
//! and nothing more. Register operands are `Register`s of the matching
//! category; callers check the combination before encoding.

use super::buffer::{CodeBuffer, FixupKind, Label};
use crate::graph::Condition;
use crate::target::{Register, RegisterCategory};
use crate::value::Kind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
    Qword,
}

impl OperandSize {
    pub fn of(kind: Kind) -> OperandSize {
        match kind {
            Kind::Byte => OperandSize::Byte,
            Kind::Short => OperandSize::Word,
            Kind::Int | Kind::Float => OperandSize::Dword,
            Kind::Long | Kind::Double | Kind::Object => OperandSize::Qword,
            Kind::Illegal => panic!("no operand size for illegal kind"),
        }
    }

    fn rex_w(self) -> bool {
        self == OperandSize::Qword
    }
}

/// A memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Address {
    Base {
        base: Register,
        index: Option<(Register, u8)>,
        disp: i32,
    },
    /// `[rip + disp32]`; the displacement is patched by the caller.
    RipRelative,
}

impl Address {
    pub fn base(base: Register, disp: i32) -> Address {
        Address::Base {
            base,
            index: None,
            disp,
        }
    }
}

/// Integer ALU operations of the `op r/m, r` family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// The `/digit` of the immediate form; the register forms derive
    /// from it.
    fn ext(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// Scalar SSE arithmetic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SseOp {
    Add,
    Mul,
    Sub,
}

impl SseOp {
    fn opcode(self) -> u8 {
        match self {
            SseOp::Add => 0x58,
            SseOp::Mul => 0x59,
            SseOp::Sub => 0x5c,
        }
    }
}

fn low3(reg: Register) -> u8 {
    reg.encoding() & 7
}

fn high(reg: Register) -> u8 {
    (reg.encoding() >> 3) & 1
}

fn fits_i8(value: i32) -> bool {
    value >= i8::MIN as i32 && value <= i8::MAX as i32
}

/// The `cc` nibble of a condition. Float compares set flags like
/// unsigned ones.
fn condition_code(condition: Condition, float: bool) -> u8 {
    match (condition, float) {
        (Condition::Eq, _) => 0x4,
        (Condition::Ne, _) => 0x5,
        (Condition::Below, _) | (Condition::Lt, true) => 0x2,
        (Condition::AboveEqual, _) | (Condition::Ge, true) => 0x3,
        (Condition::Le, true) => 0x6,
        (Condition::Gt, true) => 0x7,
        (Condition::Lt, false) => 0xc,
        (Condition::Ge, false) => 0xd,
        (Condition::Le, false) => 0xe,
        (Condition::Gt, false) => 0xf,
    }
}

/// Unsigned above, for range checks.
pub const COND_ABOVE: u8 = 0x7;

#[derive(Clone, Debug, Default)]
pub struct Assembler {
    pub buf: CodeBuffer,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u32 {
        self.buf.position()
    }

    fn rex(&mut self, w: bool, reg: u8, index: u8, base: u8, force: bool) {
        let rex = 0x40 | (w as u8) << 3 | reg << 2 | index << 1 | base;
        if rex != 0x40 || force {
            self.buf.emit_u8(rex);
        }
    }

    fn rex_mem(&mut self, w: bool, reg: u8, addr: &Address, force: bool) {
        match *addr {
            Address::Base { base, index, .. } => {
                let x = index.map_or(0, |(i, _)| high(i));
                self.rex(w, reg, x, high(base), force)
            }
            Address::RipRelative => self.rex(w, reg, 0, 0, force),
        }
    }

    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(md << 6 | (reg & 7) << 3 | (rm & 7));
    }

    /// ModRM, SIB and displacement for a memory operand. Returns the
    /// position of a rip-relative displacement field.
    fn mem(&mut self, reg: u8, addr: &Address) -> Option<u32> {
        match *addr {
            Address::RipRelative => {
                self.modrm(0, reg, 0b101);
                let at = self.position();
                self.buf.emit_u32(0);
                Some(at)
            }
            Address::Base { base, index, disp } => {
                let needs_sib = index.is_some() || low3(base) == 4;
                let md = if disp == 0 && low3(base) != 5 {
                    0
                } else if fits_i8(disp) {
                    1
                } else {
                    2
                };
                if needs_sib {
                    self.modrm(md, reg, 0b100);
                    let (index_bits, scale_bits) = match index {
                        Some((i, scale)) => {
                            debug_assert!(i.encoding() != 4, "rsp cannot be an index");
                            let bits = match scale {
                                1 => 0,
                                2 => 1,
                                4 => 2,
                                8 => 3,
                                _ => panic!("bad scale {}", scale),
                            };
                            (low3(i), bits)
                        }
                        None => (0b100, 0),
                    };
                    self.buf.emit_u8(scale_bits << 6 | index_bits << 3 | low3(base));
                } else {
                    self.modrm(md, reg, low3(base));
                }
                match md {
                    1 => self.buf.emit_u8(disp as i8 as u8),
                    2 => self.buf.emit_i32(disp),
                    _ => {}
                }
                None
            }
        }
    }

    fn size_prefix(&mut self, size: OperandSize) {
        if size == OperandSize::Word {
            self.buf.emit_u8(0x66);
        }
    }

    /// `mov dst, src` between general registers.
    pub fn mov_rr(&mut self, size: OperandSize, dst: Register, src: Register) {
        self.rex(size.rex_w(), high(src), 0, high(dst), false);
        self.buf.emit_u8(0x89);
        self.modrm(3, low3(src), low3(dst));
    }

    /// Load; narrow kinds are sign-extended to 32 bits.
    pub fn load(&mut self, size: OperandSize, dst: Register, addr: &Address) -> Option<u32> {
        self.rex_mem(size.rex_w(), high(dst), addr, false);
        match size {
            OperandSize::Byte => {
                self.buf.emit_u8(0x0f);
                self.buf.emit_u8(0xbe);
            }
            OperandSize::Word => {
                self.buf.emit_u8(0x0f);
                self.buf.emit_u8(0xbf);
            }
            OperandSize::Dword | OperandSize::Qword => self.buf.emit_u8(0x8b),
        }
        self.mem(low3(dst), addr)
    }

    pub fn store(&mut self, size: OperandSize, addr: &Address, src: Register) {
        self.size_prefix(size);
        // spl/bpl/sil/dil need a REX prefix to be addressable as bytes.
        let force = size == OperandSize::Byte && src.encoding() >= 4;
        self.rex_mem(size.rex_w(), high(src), addr, force);
        self.buf.emit_u8(if size == OperandSize::Byte { 0x88 } else { 0x89 });
        self.mem(low3(src), addr);
    }

    /// Store of a sign-extended 32-bit immediate.
    pub fn store_imm(&mut self, size: OperandSize, addr: &Address, imm: i32) {
        self.size_prefix(size);
        self.rex_mem(size.rex_w(), 0, addr, false);
        self.buf.emit_u8(if size == OperandSize::Byte { 0xc6 } else { 0xc7 });
        self.mem(0, addr);
        match size {
            OperandSize::Byte => self.buf.emit_u8(imm as u8),
            OperandSize::Word => self.buf.emit_u16(imm as u16),
            OperandSize::Dword | OperandSize::Qword => self.buf.emit_i32(imm),
        }
    }

    /// Materializes `imm` in the shortest form.
    pub fn mov_ri(&mut self, size: OperandSize, dst: Register, imm: i64) {
        if size != OperandSize::Qword || (imm >= 0 && imm <= u32::MAX as i64) {
            self.rex(false, 0, 0, high(dst), false);
            self.buf.emit_u8(0xb8 + low3(dst));
            self.buf.emit_u32(imm as u32);
        } else if imm >= i32::MIN as i64 && imm <= i32::MAX as i64 {
            self.rex(true, 0, 0, high(dst), false);
            self.buf.emit_u8(0xc7);
            self.modrm(3, 0, low3(dst));
            self.buf.emit_i32(imm as i32);
        } else {
            self.mov_ri64(dst, imm as u64);
        }
    }

    /// `movabs dst, imm64`, always ten bytes. Returns the position of
    /// the immediate.
    pub fn mov_ri64(&mut self, dst: Register, imm: u64) -> u32 {
        self.rex(true, 0, 0, high(dst), false);
        self.buf.emit_u8(0xb8 + low3(dst));
        let at = self.position();
        self.buf.emit_u64(imm);
        at
    }

    pub fn alu_rr(&mut self, op: AluOp, size: OperandSize, dst: Register, src: Register) {
        self.rex(size.rex_w(), high(src), 0, high(dst), false);
        self.buf.emit_u8(op.ext() << 3 | 0x01);
        self.modrm(3, low3(src), low3(dst));
    }

    pub fn alu_rm(&mut self, op: AluOp, size: OperandSize, dst: Register, addr: &Address) -> Option<u32> {
        self.rex_mem(size.rex_w(), high(dst), addr, false);
        self.buf.emit_u8(op.ext() << 3 | 0x03);
        self.mem(low3(dst), addr)
    }

    pub fn alu_ri(&mut self, op: AluOp, size: OperandSize, dst: Register, imm: i32) {
        self.rex(size.rex_w(), 0, 0, high(dst), false);
        if fits_i8(imm) {
            self.buf.emit_u8(0x83);
            self.modrm(3, op.ext(), low3(dst));
            self.buf.emit_u8(imm as i8 as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.modrm(3, op.ext(), low3(dst));
            self.buf.emit_i32(imm);
        }
    }

    pub fn imul_rr(&mut self, size: OperandSize, dst: Register, src: Register) {
        self.rex(size.rex_w(), high(dst), 0, high(src), false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0xaf);
        self.modrm(3, low3(dst), low3(src));
    }

    pub fn imul_rm(&mut self, size: OperandSize, dst: Register, addr: &Address) -> Option<u32> {
        self.rex_mem(size.rex_w(), high(dst), addr, false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0xaf);
        self.mem(low3(dst), addr)
    }

    /// `imul dst, src, imm32`.
    pub fn imul_rri(&mut self, size: OperandSize, dst: Register, src: Register, imm: i32) {
        self.rex(size.rex_w(), high(dst), 0, high(src), false);
        self.buf.emit_u8(0x69);
        self.modrm(3, low3(dst), low3(src));
        self.buf.emit_i32(imm);
    }

    fn sse_prefix(&mut self, kind: Kind) {
        self.buf.emit_u8(if kind == Kind::Float { 0xf3 } else { 0xf2 });
    }

    /// `movss`/`movsd` load. Returns the rip displacement position.
    pub fn movs_load(&mut self, kind: Kind, dst: Register, addr: &Address) -> Option<u32> {
        self.sse_prefix(kind);
        self.rex_mem(false, high(dst), addr, false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x10);
        self.mem(low3(dst), addr)
    }

    pub fn movs_store(&mut self, kind: Kind, addr: &Address, src: Register) {
        self.sse_prefix(kind);
        self.rex_mem(false, high(src), addr, false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x11);
        self.mem(low3(src), addr);
    }

    /// Register-to-register xmm copy of the whole register.
    pub fn movap_rr(&mut self, kind: Kind, dst: Register, src: Register) {
        if kind == Kind::Double {
            self.buf.emit_u8(0x66);
        }
        self.rex(false, high(dst), 0, high(src), false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x28);
        self.modrm(3, low3(dst), low3(src));
    }

    /// `xorps`/`xorpd dst, dst`: zeroes an xmm register.
    pub fn xorp_zero(&mut self, kind: Kind, dst: Register) {
        if kind == Kind::Double {
            self.buf.emit_u8(0x66);
        }
        self.rex(false, high(dst), 0, high(dst), false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x57);
        self.modrm(3, low3(dst), low3(dst));
    }

    pub fn sse_rr(&mut self, op: SseOp, kind: Kind, dst: Register, src: Register) {
        self.sse_prefix(kind);
        self.rex(false, high(dst), 0, high(src), false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(op.opcode());
        self.modrm(3, low3(dst), low3(src));
    }

    pub fn sse_rm(&mut self, op: SseOp, kind: Kind, dst: Register, addr: &Address) -> Option<u32> {
        self.sse_prefix(kind);
        self.rex_mem(false, high(dst), addr, false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(op.opcode());
        self.mem(low3(dst), addr)
    }

    /// `ucomiss`/`ucomisd x, y`.
    pub fn ucomis_rr(&mut self, kind: Kind, x: Register, y: Register) {
        if kind == Kind::Double {
            self.buf.emit_u8(0x66);
        }
        self.rex(false, high(x), 0, high(y), false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x2e);
        self.modrm(3, low3(x), low3(y));
    }

    pub fn ucomis_rm(&mut self, kind: Kind, x: Register, addr: &Address) -> Option<u32> {
        if kind == Kind::Double {
            self.buf.emit_u8(0x66);
        }
        self.rex_mem(false, high(x), addr, false);
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x2e);
        self.mem(low3(x), addr)
    }

    pub fn lea(&mut self, dst: Register, addr: &Address) -> Option<u32> {
        self.rex_mem(true, high(dst), addr, false);
        self.buf.emit_u8(0x8d);
        self.mem(low3(dst), addr)
    }

    /// `movsxd dst, dword [addr]`.
    pub fn movsxd(&mut self, dst: Register, addr: &Address) {
        self.rex_mem(true, high(dst), addr, false);
        self.buf.emit_u8(0x63);
        self.mem(low3(dst), addr);
    }

    pub fn push_m(&mut self, addr: &Address) -> Option<u32> {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0xff);
        self.mem(6, addr)
    }

    pub fn pop_m(&mut self, addr: &Address) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0x8f);
        self.mem(0, addr);
    }

    /// `test dword [addr], eax`: a read that faults on a bad address.
    pub fn test_m(&mut self, addr: &Address) -> Option<u32> {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0x85);
        self.mem(0, addr)
    }

    pub fn jcc(&mut self, condition: Condition, float: bool, target: Label) {
        self.jcc_code(condition_code(condition, float), target);
    }

    pub fn jcc_code(&mut self, cc: u8, target: Label) {
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x80 | cc);
        self.buf.emit_label_ref(target, FixupKind::Rel32);
    }

    pub fn jmp(&mut self, target: Label) {
        self.buf.emit_u8(0xe9);
        self.buf.emit_label_ref(target, FixupKind::Rel32);
    }

    pub fn jmp_r(&mut self, target: Register) {
        self.rex(false, 0, 0, high(target), false);
        self.buf.emit_u8(0xff);
        self.modrm(3, 4, low3(target));
    }

    /// `call rel32` with a zero displacement for the installer to
    /// patch. Returns the size of the instruction.
    pub fn call(&mut self) -> u32 {
        self.buf.emit_u8(0xe8);
        self.buf.emit_u32(0);
        5
    }

    pub fn ret(&mut self) {
        self.buf.emit_u8(0xc3);
    }

    /// `lock add dword [rsp], 0`: a full fence that is cheaper than
    /// `mfence` on most implementations.
    pub fn lock_add_rsp(&mut self, rsp: Register) {
        self.buf.emit_u8(0xf0);
        self.alu_mi_dword(AluOp::Add, &Address::base(rsp, 0), 0);
    }

    fn alu_mi_dword(&mut self, op: AluOp, addr: &Address, imm: i8) {
        self.rex_mem(false, 0, addr, false);
        self.buf.emit_u8(0x83);
        self.mem(op.ext(), addr);
        self.buf.emit_u8(imm as u8);
    }

    pub fn ud2(&mut self) {
        self.buf.emit_u8(0x0f);
        self.buf.emit_u8(0x0b);
    }

    /// Pads with nops until `position + offset` is a multiple of
    /// `modulus`.
    pub fn align_field(&mut self, offset: u32, modulus: u32) {
        while (self.position() + offset) % modulus != 0 {
            self.buf.emit_u8(0x90);
        }
    }
}

pub fn is_cpu(reg: Register) -> bool {
    reg.category() == RegisterCategory::Cpu
}
