//! Address representation
use core::ops::Add;

use crate::PAGE_SIZE;

/// A macro for implementing addresses types.
///
/// An address is just a wrapper around an `usize`, with getter and setter methods.
macro_rules! addr_impl {
    ($name:ident) => {
        #[repr(transparent)]
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
        pub struct $name(usize);

        impl $name {
            #[inline]
            pub const fn new(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// Creates an address that points to `0`.
            #[inline]
            pub const fn zero() -> Self {
                Self(0)
            }

            /// Returns true if the address has no offset within its page.
            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.0 & (PAGE_SIZE - 1) == 0
            }

            /// Returns the number of the frame containing this address.
            #[inline]
            pub const fn frame_number(self) -> usize {
                self.0 / PAGE_SIZE
            }

            /// Aligns address downwards to a page boundary.
            #[inline]
            pub const fn align_down(self) -> Self {
                Self::new(self.0 & !(PAGE_SIZE - 1))
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, other: Self) -> Self {
                return Self::new(self.as_usize() + other.as_usize());
            }
        }

        impl Add<usize> for $name {
            type Output = Self;
            fn add(self, other: usize) -> Self {
                return Self::new(self.as_usize() + other);
            }
        }
    };
}

addr_impl!(GuestVirtAddr);
addr_impl!(GuestPhysAddr);
addr_impl!(HostPhysAddr);
addr_impl!(HostVirtAddr);
