/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Dense `u32` newtype indices and the vectors they index.

#[macro_export]
macro_rules! define_index {
    ($ix:ident, $storage:ident, $elem:ty) => {
        define_index!($ix);

        #[derive(Clone, Debug, Default)]
        pub struct $storage {
            storage: Vec<$elem>,
        }

        impl $storage {
            #[inline(always)]
            pub fn with_capacity(n: usize) -> Self {
                Self {
                    storage: Vec::with_capacity(n),
                }
            }

            #[inline(always)]
            pub fn len(&self) -> usize {
                self.storage.len()
            }

            #[inline(always)]
            pub fn is_empty(&self) -> bool {
                self.storage.is_empty()
            }

            #[inline(always)]
            pub fn iter(&self) -> impl Iterator<Item = &$elem> {
                self.storage.iter()
            }

            #[inline(always)]
            pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut $elem> {
                self.storage.iter_mut()
            }

            #[inline(always)]
            pub fn push(&mut self, value: $elem) -> $ix {
                let idx = $ix(self.storage.len() as u32);
                self.storage.push(value);
                idx
            }

            /// All indices in this storage, in ascending order.
            #[inline(always)]
            pub fn indices(&self) -> impl Iterator<Item = $ix> {
                (0..self.storage.len()).map($ix::new)
            }
        }

        impl core::ops::Index<$ix> for $storage {
            type Output = $elem;

            #[inline(always)]
            fn index(&self, i: $ix) -> &Self::Output {
                &self.storage[i.index()]
            }
        }

        impl core::ops::IndexMut<$ix> for $storage {
            #[inline(always)]
            fn index_mut(&mut self, i: $ix) -> &mut Self::Output {
                &mut self.storage[i.index()]
            }
        }

        impl<'a> IntoIterator for &'a $storage {
            type Item = &'a $elem;
            type IntoIter = core::slice::Iter<'a, $elem>;

            #[inline(always)]
            fn into_iter(self) -> Self::IntoIter {
                self.storage.iter()
            }
        }
    };

    ($ix:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[cfg_attr(
            feature = "enable-serde",
            derive(::serde::Serialize, ::serde::Deserialize)
        )]
        pub struct $ix(pub u32);
        impl $ix {
            #[inline(always)]
            pub fn new(i: usize) -> Self {
                Self(i as u32)
            }
            #[inline(always)]
            pub fn index(self) -> usize {
                debug_assert!(self.is_valid());
                self.0 as usize
            }
            #[inline(always)]
            pub fn invalid() -> Self {
                Self(u32::MAX)
            }
            #[inline(always)]
            pub fn is_invalid(self) -> bool {
                self == Self::invalid()
            }
            #[inline(always)]
            pub fn is_valid(self) -> bool {
                self != Self::invalid()
            }
            #[inline(always)]
            pub fn next(self) -> $ix {
                debug_assert!(self.is_valid());
                Self(self.0 + 1)
            }
            #[inline(always)]
            pub fn raw_u32(self) -> u32 {
                self.0
            }
        }
    };
}

define_index!(Block);
define_index!(NodeId);
define_index!(MethodId);
define_index!(TypeId);

impl core::fmt::Display for Block {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "B{}", self.0)
    }
}

impl core::fmt::Display for NodeId {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    define_index!(Slot, Slots, u64);

    #[test]
    fn test_index_storage() {
        let mut slots = Slots::with_capacity(4);
        let a = slots.push(10);
        let b = slots.push(20);
        assert_eq!(a, Slot::new(0));
        assert_eq!(b, a.next());
        slots[b] += 1;
        assert_eq!(slots[b], 21);
        assert_eq!(slots.indices().collect::<Vec<_>>(), vec![a, b]);
        assert!(Slot::invalid().is_invalid());
        assert_eq!(Block::new(3).to_string(), "B3");
    }
}
