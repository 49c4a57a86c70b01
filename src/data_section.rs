/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! The constant/data section emitted alongside the code.
//!
//! Items are inserted while code is generated and receive a stable
//! reference token immediately. Their offsets are only known after
//! `finalize_layout`, which places items with larger alignment first
//! and freezes the section.

use crate::constant::Constant;
use crate::target::ByteOrder;

define_index!(DataSectionReference);

/// Produces the bytes of one data item once the section is built.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub enum DataBuilder {
    Raw(Vec<u8>),
    Primitive(Constant),
    Zero,
}

/// One item of the data section.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Data {
    alignment: u32,
    size: u32,
    builder: DataBuilder,
}

impl Data {
    pub fn new(alignment: u32, size: u32, builder: DataBuilder) -> Self {
        assert!(alignment > 0, "data alignment must be positive");
        if let DataBuilder::Raw(bytes) = &builder {
            assert_eq!(bytes.len(), size as usize);
        }
        Data {
            alignment,
            size,
            builder,
        }
    }

    pub fn raw(bytes: Vec<u8>, alignment: u32) -> Self {
        let size = bytes.len() as u32;
        Data::new(alignment, size, DataBuilder::Raw(bytes))
    }

    /// A constant aligned to its own size.
    pub fn primitive(constant: Constant, word_size: u32) -> Self {
        let size = constant.size_in_bytes(word_size);
        Data::new(size, size, DataBuilder::Primitive(constant))
    }

    pub fn zero(size: u32, alignment: u32) -> Self {
        Data::new(alignment, size, DataBuilder::Zero)
    }

    pub fn alignment(&self) -> u32 {
        self.alignment
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn builder(&self) -> &DataBuilder {
        &self.builder
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

pub(crate) fn lcm(a: u32, b: u32) -> u32 {
    a / gcd(a, b) * b
}

pub(crate) fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment > 0);
    (value + alignment - 1) / alignment * alignment
}

#[derive(Clone, Debug)]
pub struct DataSection {
    items: Vec<Data>,
    offsets: Vec<u32>,
    finalized: bool,
    section_alignment: u32,
    section_size: u32,
    byte_order: ByteOrder,
    word_size: u32,
}

impl DataSection {
    pub fn new(byte_order: ByteOrder, word_size: u32) -> Self {
        DataSection {
            items: vec![],
            offsets: vec![],
            finalized: false,
            section_alignment: 1,
            section_size: 0,
            byte_order,
            word_size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn word_size(&self) -> u32 {
        self.word_size
    }

    pub fn insert_data(&mut self, data: Data) -> DataSectionReference {
        assert!(!self.finalized, "data section is already finalized");
        trace!(
            "data section: insert #{} size {} align {}",
            self.items.len(),
            data.size,
            data.alignment
        );
        let index = self.items.len();
        self.items.push(data);
        DataSectionReference::new(index)
    }

    /// Widens the alignment of an item to a multiple of `alignment`.
    pub fn update_alignment(&mut self, reference: DataSectionReference, alignment: u32) {
        assert!(!self.finalized, "data section is already finalized");
        assert!(alignment > 0);
        let item = &mut self.items[reference.index()];
        item.alignment = lcm(item.alignment, alignment);
    }

    pub fn data(&self, reference: DataSectionReference) -> &Data {
        &self.items[reference.index()]
    }

    /// Assigns offsets: items are placed by descending alignment,
    /// keeping insertion order among equal alignments.
    pub fn finalize_layout(&mut self) {
        assert!(!self.finalized, "data section layout finalized twice");
        let mut order: Vec<usize> = (0..self.items.len()).collect();
        order.sort_by(|&a, &b| self.items[b].alignment.cmp(&self.items[a].alignment));

        self.offsets = vec![0; self.items.len()];
        let mut section_alignment = 1;
        let mut position = 0;
        for index in order {
            let item = &self.items[index];
            section_alignment = lcm(section_alignment, item.alignment);
            position = align_up(position, item.alignment);
            self.offsets[index] = position;
            position += item.size;
        }
        self.section_alignment = section_alignment;
        self.section_size = align_up(position, section_alignment);
        self.finalized = true;
        trace!(
            "data section: finalized {} items, size {} align {}",
            self.items.len(),
            self.section_size,
            self.section_alignment
        );
    }

    pub fn offset(&self, reference: DataSectionReference) -> u32 {
        assert!(self.finalized, "data section offset read before finalization");
        self.offsets[reference.index()]
    }

    pub fn section_size(&self) -> u32 {
        assert!(self.finalized, "data section size read before finalization");
        self.section_size
    }

    pub fn section_alignment(&self) -> u32 {
        assert!(
            self.finalized,
            "data section alignment read before finalization"
        );
        self.section_alignment
    }

    /// Writes the section into `buffer`, which must hold at least
    /// `section_size()` bytes. `patch` is called with the section
    /// offset of every constant the installer must patch.
    pub fn build_data_section<F: FnMut(u32, &Constant)>(&self, buffer: &mut [u8], mut patch: F) {
        assert!(self.finalized, "data section built before finalization");
        assert!(buffer.len() >= self.section_size as usize);
        for b in buffer[..self.section_size as usize].iter_mut() {
            *b = 0;
        }
        for (item, &offset) in self.items.iter().zip(self.offsets.iter()) {
            let start = offset as usize;
            let dest = &mut buffer[start..start + item.size as usize];
            match &item.builder {
                DataBuilder::Raw(bytes) => dest.copy_from_slice(bytes),
                DataBuilder::Primitive(constant) => {
                    constant.write_bytes(self.byte_order, self.word_size, dest);
                    if constant.needs_patch() {
                        patch(offset, constant);
                    }
                }
                DataBuilder::Zero => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section() -> DataSection {
        DataSection::new(ByteOrder::LittleEndian, 8)
    }

    #[test]
    fn larger_alignment_first() {
        let mut ds = section();
        let a = ds.insert_data(Data::zero(4, 4));
        let b = ds.insert_data(Data::zero(8, 8));
        let c = ds.insert_data(Data::zero(1, 1));
        ds.finalize_layout();
        assert_eq!(ds.offset(b), 0);
        assert_eq!(ds.offset(a), 8);
        assert_eq!(ds.offset(c), 12);
        assert_eq!(ds.section_alignment(), 8);
        assert_eq!(ds.section_size(), 16);
    }

    #[test]
    fn layout_properties() {
        let specs: &[(u32, u32)] = &[(3, 1), (16, 16), (4, 4), (12, 4), (6, 2), (8, 8), (1, 1)];
        let mut ds = section();
        let refs: Vec<_> = specs
            .iter()
            .map(|&(size, align)| ds.insert_data(Data::zero(size, align)))
            .collect();
        ds.update_alignment(refs[6], 2);
        ds.finalize_layout();

        let mut regions = vec![];
        for (r, &(size, _)) in refs.iter().zip(specs.iter()) {
            let offset = ds.offset(*r);
            assert_eq!(offset % ds.data(*r).alignment(), 0);
            regions.push((offset, offset + size));
        }
        regions.sort();
        for w in regions.windows(2) {
            assert!(w[0].1 <= w[1].0, "overlap: {:?}", w);
        }
        assert_eq!(ds.section_alignment(), 16);
        assert_eq!(ds.section_size() % ds.section_alignment(), 0);
        assert!(ds.section_size() >= regions.last().unwrap().1);
    }

    #[test]
    fn widened_alignment_uses_lcm() {
        let mut ds = section();
        let r = ds.insert_data(Data::zero(3, 2));
        ds.update_alignment(r, 3);
        assert_eq!(ds.data(r).alignment(), 6);
        ds.update_alignment(r, 2);
        assert_eq!(ds.data(r).alignment(), 6);
    }

    #[test]
    fn build_bytes_and_patches() {
        let mut ds = section();
        let i = ds.insert_data(Data::primitive(Constant::Int(0x11223344), 8));
        let o = ds.insert_data(Data::primitive(Constant::Object(7), 8));
        let raw = ds.insert_data(Data::raw(vec![0xAA, 0xBB], 1));
        ds.finalize_layout();
        let mut buf = vec![0xFFu8; ds.section_size() as usize];
        let mut patches = vec![];
        ds.build_data_section(&mut buf, |offset, c| patches.push((offset, *c)));
        let io = ds.offset(i) as usize;
        assert_eq!(&buf[io..io + 4], &[0x44, 0x33, 0x22, 0x11]);
        let ro = ds.offset(raw) as usize;
        assert_eq!(&buf[ro..ro + 2], &[0xAA, 0xBB]);
        assert_eq!(patches, vec![(ds.offset(o), Constant::Object(7))]);
    }

    #[test]
    fn empty_section() {
        let mut ds = section();
        ds.finalize_layout();
        assert_eq!(ds.section_size(), 0);
        assert_eq!(ds.section_alignment(), 1);
    }

    #[test]
    #[should_panic(expected = "already finalized")]
    fn insert_after_finalize() {
        let mut ds = section();
        ds.finalize_layout();
        ds.insert_data(Data::zero(4, 4));
    }

    #[test]
    #[should_panic(expected = "finalized twice")]
    fn finalize_twice() {
        let mut ds = section();
        ds.finalize_layout();
        ds.finalize_layout();
    }

    #[test]
    #[should_panic(expected = "before finalization")]
    fn size_before_finalize() {
        let ds = section();
        ds.section_size();
    }
}
