//! Guest address spaces and frame arithmetic.

use serde::{Deserialize, Serialize};

/// Number of bits available for the page offset.
pub const PAGE_SHIFT: u64 = 12;

/// Guest page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask isolating the page-aligned part of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// The one-byte breakpoint instruction (`INT3`).
pub const BREAKPOINT: u8 = 0xCC;

macro_rules! impl_addr {
    ($name:ident, $doc:expr) => {
        #[doc = concat!("A ", $doc, ".")]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`.")]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }

        impl ::std::ops::Add<u64> for $name {
            type Output = $name;

            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl ::std::ops::AddAssign<u64> for $name {
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl ::std::ops::Sub<u64> for $name {
            type Output = $name;

            fn sub(self, rhs: u64) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl ::std::ops::Sub<$name> for $name {
            type Output = u64;

            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

impl_addr!(Gfn, "guest frame number");
impl_addr!(Pa, "guest physical address");
impl_addr!(Va, "guest virtual address");

impl Pa {
    /// Composes a physical address from a frame number and a page offset.
    pub const fn from_parts(gfn: Gfn, offset: u64) -> Self {
        Self((gfn.0 << PAGE_SHIFT) | (offset & !PAGE_MASK))
    }

    /// Returns the frame number containing this address.
    pub const fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Returns the offset of this address within its page.
    pub const fn offset(self) -> u64 {
        self.0 & !PAGE_MASK
    }
}

impl Va {
    /// Returns the offset of this address within its page.
    pub const fn offset(self) -> u64 {
        self.0 & !PAGE_MASK
    }
}

/// A physical memory view identifier.
///
/// View 0 is the domain's default (unmodified) view.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct View(pub u16);

impl View {
    /// The default (unmodified) view.
    pub const DEFAULT: View = View(0);
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A virtual CPU identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcpuId(pub u16);

impl From<u16> for VcpuId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for VcpuId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A guest process identifier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub i32);

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Memory access permission flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 1 << 0;

        /// Write permission.
        const W = 1 << 1;

        /// Execute permission.
        const X = 1 << 2;

        /// Combined read and write permissions.
        const RW = Self::R.bits() | Self::W.bits();

        /// Full access.
        const RWX = Self::R.bits() | Self::W.bits() | Self::X.bits();
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 3];

        if self.contains(MemoryAccess::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryAccess::W) {
            result[1] = b'w';
        }
        if self.contains(MemoryAccess::X) {
            result[2] = b'x';
        }

        f.write_str(std::str::from_utf8(&result).unwrap_or("???"))
    }
}

/// Static facts about the traced domain.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DomainInfo {
    /// Number of virtual CPUs.
    pub vcpus: u16,

    /// Current memory reservation in bytes.
    pub memory_size: u64,

    /// Native pointer width of the guest in bytes.
    pub address_width: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pa_round_trip() {
        let pa = Pa::from_parts(Gfn(0x1234), 0x56);
        assert_eq!(pa, Pa(0x1234056));
        assert_eq!(pa.gfn(), Gfn(0x1234));
        assert_eq!(pa.offset(), 0x56);
    }

    #[test]
    fn offset_is_masked() {
        let pa = Pa::from_parts(Gfn(1), 0x1fff);
        assert_eq!(pa.gfn(), Gfn(1));
        assert_eq!(pa.offset(), 0xfff);
    }

    #[test]
    fn access_display() {
        assert_eq!(MemoryAccess::RW.to_string(), "rw-");
        assert_eq!(MemoryAccess::RWX.to_string(), "rwx");
        assert_eq!(MemoryAccess::empty().to_string(), "---");
    }
}
