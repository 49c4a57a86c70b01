/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Dense bit sets over index spaces (variables, registers, frame words).

type Frame = u64;
const BITS_PER_FRAME: usize = core::mem::size_of::<Frame>() * 8;

#[derive(Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "enable-serde",
    derive(::serde::Serialize, ::serde::Deserialize)
)]
pub struct BitVec {
    bits: Vec<Frame>,
}

impl BitVec {
    pub fn new() -> Self {
        Self { bits: vec![] }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            bits: vec![0; (n + BITS_PER_FRAME - 1) / BITS_PER_FRAME],
        }
    }

    #[inline(always)]
    fn compute_index(el: usize) -> (usize, usize) {
        (el / BITS_PER_FRAME, el % BITS_PER_FRAME)
    }

    pub fn set(&mut self, el: usize, val: bool) {
        let (frame_no, idx) = Self::compute_index(el);
        if frame_no >= self.bits.len() {
            if !val {
                return;
            }
            self.bits.resize(frame_no + 1, 0);
        }
        if val {
            self.bits[frame_no] |= 1 << idx;
        } else {
            self.bits[frame_no] &= !(1 << idx);
        }
    }

    pub fn get(&self, el: usize) -> bool {
        let (frame_no, idx) = Self::compute_index(el);
        self.bits
            .get(frame_no)
            .map_or(false, |frame| frame & (1 << idx) != 0)
    }

    pub fn clear(&mut self) {
        for frame in self.bits.iter_mut() {
            *frame = 0;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|frame| *frame == 0)
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|f| f.count_ones() as usize).sum()
    }

    /// Set-union with `other`; returns whether any bit changed.
    pub fn union_with(&mut self, other: &Self) -> bool {
        if other.bits.len() > self.bits.len() {
            self.bits.resize(other.bits.len(), 0);
        }
        let mut changed = false;
        for (mine, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            let new = *mine | *theirs;
            changed |= new != *mine;
            *mine = new;
        }
        changed
    }

    /// Removes every bit present in `other`.
    pub fn subtract(&mut self, other: &Self) {
        for (mine, theirs) in self.bits.iter_mut().zip(other.bits.iter()) {
            *mine &= !*theirs;
        }
    }

    pub fn iter(&self) -> BitVecIter {
        BitVecIter {
            next_frame_idx: 0,
            curr_frame: 0,
            bits: &self.bits,
        }
    }
}

pub struct BitVecIter<'a> {
    next_frame_idx: usize,
    curr_frame: Frame,
    bits: &'a [Frame],
}

impl<'a> Iterator for BitVecIter<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.curr_frame == 0 {
            if self.next_frame_idx >= self.bits.len() {
                return None;
            }
            self.curr_frame = self.bits[self.next_frame_idx];
            self.next_frame_idx += 1;
        }
        let skip = self.curr_frame.trailing_zeros();
        self.curr_frame &= !(1 << skip);
        Some((self.next_frame_idx - 1) * BITS_PER_FRAME + skip as usize)
    }
}

impl core::fmt::Debug for BitVec {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
