/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! A growable little-endian code buffer with labels.
//!
//! Forward references are emitted as zeroed placeholders and recorded
//! as fixups; `finish` resolves them once every label is bound.

use smallvec::SmallVec;

define_index!(Label);

/// How a fixup is computed from the label position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixupKind {
    /// 32-bit displacement relative to the end of the field.
    Rel32,
    /// 32-bit offset of the label from `base`.
    Offset32 { base: u32 },
}

#[derive(Clone, Copy, Debug)]
struct Fixup {
    at: u32,
    label: Label,
    kind: FixupKind,
}

#[derive(Clone, Debug, Default)]
pub struct CodeBuffer {
    data: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: SmallVec<[Fixup; 16]>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn position(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.data.push(byte);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_i32(&mut self, value: i32) {
        self.emit_u32(value as u32);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Overwrites four bytes at `at`.
    pub fn patch_i32(&mut self, at: u32, value: i32) {
        let at = at as usize;
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_i32(&self, at: u32) -> i32 {
        let at = at as usize;
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.data[at..at + 4]);
        i32::from_le_bytes(bytes)
    }

    /// Pads with single-byte nops up to a multiple of `alignment`.
    pub fn align(&mut self, alignment: u32) {
        while self.position() % alignment != 0 {
            self.emit_u8(0x90);
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label::new(self.labels.len());
        self.labels.push(None);
        label
    }

    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.index()].is_none(), "{:?} bound twice", label);
        self.labels[label.index()] = Some(self.position());
    }

    pub fn label_position(&self, label: Label) -> Option<u32> {
        self.labels[label.index()]
    }

    /// Emits a 4-byte placeholder referring to `label`.
    pub fn emit_label_ref(&mut self, label: Label, kind: FixupKind) {
        self.fixups.push(Fixup {
            at: self.position(),
            label,
            kind,
        });
        self.emit_u32(0);
    }

    /// Points the already emitted placeholder at `at` to `label`.
    pub fn fixup_at(&mut self, at: u32, label: Label, kind: FixupKind) {
        debug_assert!(at + 4 <= self.position());
        self.fixups.push(Fixup { at, label, kind });
    }

    /// Resolves all fixups. Panics on an unbound label.
    pub fn finish(mut self) -> Vec<u8> {
        let fixups = core::mem::take(&mut self.fixups);
        for fixup in fixups {
            let target = match self.labels[fixup.label.index()] {
                Some(pos) => pos as i64,
                None => panic!("unbound {:?}", fixup.label),
            };
            let value = match fixup.kind {
                FixupKind::Rel32 => target - (fixup.at as i64 + 4),
                FixupKind::Offset32 { base } => target - base as i64,
            };
            trace!("fixup at {}: {:?} -> {}", fixup.at, fixup.kind, value);
            self.patch_i32(fixup.at, value as i32);
        }
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backward_and_forward_references() {
        let mut buf = CodeBuffer::new();
        let top = buf.new_label();
        let end = buf.new_label();
        buf.bind(top);
        buf.emit_u8(0x90);
        buf.emit_label_ref(end, FixupKind::Rel32);
        buf.emit_label_ref(top, FixupKind::Rel32);
        buf.bind(end);
        let code = buf.finish();
        assert_eq!(&code[1..5], &4i32.to_le_bytes());
        assert_eq!(&code[5..9], &(-9i32).to_le_bytes());
    }

    #[test]
    fn table_offsets_are_relative_to_base() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.emit_label_ref(target, FixupKind::Offset32 { base: 0 });
        buf.emit_u32(0xffff_ffff);
        buf.bind(target);
        let code = buf.finish();
        assert_eq!(&code[0..4], &8i32.to_le_bytes());
    }

    #[test]
    fn align_pads_with_nops() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0xc3);
        buf.align(4);
        assert_eq!(buf.data(), &[0xc3, 0x90, 0x90, 0x90]);
    }
}
