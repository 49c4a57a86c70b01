/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Stack frame layout.
//!
//! During LIR construction and register allocation a `FrameMapBuilder`
//! hands out virtual slots and records the outgoing-argument area and
//! the callee-saved registers in use. `FrameMapBuilder::finish` fixes
//! the layout; the resulting `FrameMap` resolves every slot to a
//! stack-pointer-relative offset. From the stack pointer upwards:
//!
//! ```text
//!   outgoing arguments
//!   custom area (reserved for the runtime)
//!   spill and lock slots
//!   callee-save area
//!   alignment padding
//!   return address          <- frame_size
//!   incoming stack arguments
//! ```

use crate::data_section::align_up;
use crate::target::{Architecture, Register};
use crate::value::{Kind, StackSlot, Value, VirtualStackSlot};
use crate::{CompileError, CompilerOptions};

#[derive(Clone, Debug)]
pub struct FrameMapBuilder {
    word_size: u32,
    slots: Vec<Kind>,
    lock_slots: Vec<VirtualStackSlot>,
    outgoing_size: u32,
    callee_saved: Vec<Register>,
    custom_area_size: u32,
}

impl FrameMapBuilder {
    pub fn new(arch: &Architecture, options: &CompilerOptions) -> Self {
        FrameMapBuilder {
            word_size: arch.word_size,
            slots: vec![],
            lock_slots: vec![],
            outgoing_size: 0,
            callee_saved: vec![],
            custom_area_size: align_up(options.custom_stack_area_size, arch.word_size),
        }
    }

    /// A fresh word-sized slot.
    pub fn allocate_spill_slot(&mut self, kind: Kind) -> VirtualStackSlot {
        let id = self.slots.len() as u32;
        self.slots.push(kind);
        VirtualStackSlot { id, kind }
    }

    /// The slot holding the lock record for lock nesting depth `depth`.
    /// Frames share lock slots by depth.
    pub fn lock_slot(&mut self, depth: usize) -> VirtualStackSlot {
        while self.lock_slots.len() <= depth {
            let slot = self.allocate_spill_slot(Kind::Long);
            self.lock_slots.push(slot);
        }
        self.lock_slots[depth]
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Makes room for a call passing `size` bytes on the stack.
    pub fn reserve_outgoing(&mut self, size: u32) {
        self.outgoing_size = self.outgoing_size.max(align_up(size, self.word_size));
    }

    /// Records that allocation assigned a callee-saved register, which
    /// the prologue must then preserve.
    pub fn use_callee_saved(&mut self, reg: Register) {
        if !self.callee_saved.contains(&reg) {
            self.callee_saved.push(reg);
        }
    }

    pub fn finish(mut self, arch: &Architecture, max_frame_size: u32) -> Result<FrameMap, CompileError> {
        self.callee_saved.sort();
        let word = self.word_size;
        let custom_area_offset = self.outgoing_size;
        let spill_area_offset = custom_area_offset + self.custom_area_size;
        let callee_save_area_offset = spill_area_offset + self.slots.len() as u32 * word;
        let raw_size = callee_save_area_offset + self.callee_saved.len() as u32 * word;
        let frame_size = align_up(raw_size + arch.return_address_size, arch.stack_alignment)
            - arch.return_address_size;
        if frame_size > max_frame_size {
            return Err(CompileError::FrameTooLarge {
                frame_size,
                limit: max_frame_size,
            });
        }
        log::debug!(
            "frame: size {} (outgoing {}, {} slots, {} callee-saved)",
            frame_size,
            self.outgoing_size,
            self.slots.len(),
            self.callee_saved.len()
        );
        let callee_saved = self
            .callee_saved
            .iter()
            .enumerate()
            .map(|(i, &reg)| (reg, callee_save_area_offset + i as u32 * word))
            .collect();
        Ok(FrameMap {
            word_size: word,
            return_address_size: arch.return_address_size,
            frame_size,
            outgoing_size: self.outgoing_size,
            custom_area_offset: if self.custom_area_size > 0 {
                Some(custom_area_offset)
            } else {
                None
            },
            spill_area_offset,
            num_slots: self.slots.len() as u32,
            callee_saved,
        })
    }
}

/// A finalized frame layout.
#[derive(Clone, Debug)]
pub struct FrameMap {
    word_size: u32,
    return_address_size: u32,
    frame_size: u32,
    outgoing_size: u32,
    custom_area_offset: Option<u32>,
    spill_area_offset: u32,
    num_slots: u32,
    callee_saved: Vec<(Register, u32)>,
}

impl FrameMap {
    /// Bytes allocated by the prologue, excluding the return address.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    pub fn total_frame_size(&self) -> u32 {
        self.frame_size + self.return_address_size
    }

    pub fn outgoing_size(&self) -> u32 {
        self.outgoing_size
    }

    pub fn custom_area_offset(&self) -> Option<u32> {
        self.custom_area_offset
    }

    /// Callee-saved registers to preserve, with their save offsets.
    pub fn callee_saved(&self) -> &[(Register, u32)] {
        &self.callee_saved
    }

    pub fn offset_for_virtual(&self, slot: VirtualStackSlot) -> i32 {
        assert!(slot.id < self.num_slots, "unknown virtual slot {}", slot);
        (self.spill_area_offset + slot.id * self.word_size) as i32
    }

    /// Offset from the stack pointer after the prologue.
    pub fn offset_for_stack_slot(&self, slot: StackSlot) -> i32 {
        if slot.add_frame_size {
            slot.offset + self.total_frame_size() as i32
        } else {
            slot.offset
        }
    }

    /// Resolves a virtual slot to a concrete one; other values are
    /// returned unchanged.
    pub fn to_stack_slot(&self, value: &Value) -> Value {
        match value {
            Value::VirtualStackSlot(slot) => {
                Value::StackSlot(StackSlot::new(self.offset_for_virtual(*slot), slot.kind, false))
            }
            other => other.clone(),
        }
    }

    /// Stack-pointer-relative offset of a slot value.
    pub fn offset_of(&self, value: &Value) -> i32 {
        match value {
            Value::VirtualStackSlot(slot) => self.offset_for_virtual(*slot),
            Value::StackSlot(slot) => self.offset_for_stack_slot(*slot),
            other => panic!("{} is not a stack slot", other),
        }
    }

    /// Bit index of a slot in the frame reference map.
    pub fn reference_map_index(&self, value: &Value) -> usize {
        (self.offset_of(value) as u32 / self.word_size) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{amd64, TargetDescription};

    #[test]
    fn layout_is_aligned() {
        let target = TargetDescription::amd64();
        let options = CompilerOptions::default();
        let mut builder = FrameMapBuilder::new(&target.arch, &options);
        let a = builder.allocate_spill_slot(Kind::Int);
        let b = builder.allocate_spill_slot(Kind::Object);
        builder.reserve_outgoing(12);
        builder.use_callee_saved(amd64::RBX);
        builder.use_callee_saved(amd64::RBX);
        let map = builder.finish(&target.arch, 1 << 20).unwrap();
        // outgoing 16, slots at 16 and 24, rbx at 32, 40 + 8 aligned to 48
        assert_eq!(map.outgoing_size(), 16);
        assert_eq!(map.offset_for_virtual(a), 16);
        assert_eq!(map.offset_for_virtual(b), 24);
        assert_eq!(map.callee_saved(), &[(amd64::RBX, 32)]);
        assert_eq!(map.frame_size(), 40);
        assert_eq!(map.total_frame_size() % 16, 0);
        assert_eq!(map.reference_map_index(&Value::VirtualStackSlot(b)), 3);
        let incoming = StackSlot::new(8, Kind::Long, true);
        assert_eq!(map.offset_for_stack_slot(incoming), 56);
        assert!(map.custom_area_offset().is_none());
    }

    #[test]
    fn custom_area_and_lock_slots() {
        let target = TargetDescription::amd64();
        let options = CompilerOptions {
            custom_stack_area_size: 4,
            ..CompilerOptions::default()
        };
        let mut builder = FrameMapBuilder::new(&target.arch, &options);
        let l0 = builder.lock_slot(0);
        let l1 = builder.lock_slot(1);
        assert_eq!(builder.lock_slot(0), l0);
        assert_ne!(l0, l1);
        let map = builder.finish(&target.arch, 1 << 20).unwrap();
        assert_eq!(map.custom_area_offset(), Some(0));
        assert_eq!(map.offset_for_virtual(l0), 8);
        assert_eq!(map.frame_size(), 24);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let target = TargetDescription::amd64();
        let mut builder = FrameMapBuilder::new(&target.arch, &CompilerOptions::default());
        for _ in 0..100 {
            builder.allocate_spill_slot(Kind::Long);
        }
        match builder.finish(&target.arch, 256) {
            Err(CompileError::FrameTooLarge { limit: 256, .. }) => {}
            other => panic!("unexpected {:?}", other.map(|m| m.frame_size())),
        }
    }
}
