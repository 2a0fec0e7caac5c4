#[macro_use]
extern crate static_assertions;

use std::fmt;
use thiserror::Error;

pub mod address_range;
pub mod bus;
pub mod commit_log;
pub mod config;
pub mod core;
pub mod cs_registers;
pub mod resources;

/// Re-export of [`AddressRange`] for convenience.
pub use address_range::AddressRange;
pub use config::Config;
pub use core::Hart;

/// List of all possible privilege levels for RISC-V.
///
/// Same as [`PrivilegeLevel`] except that it allows specifying the reserved privilege level `2`.
/// This can be useful in case a minimum required privilege level is specified as a 2-bit value,
/// since that value itself may be a reserved privilege level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum RawPrivilegeLevel {
    User = 0,
    Supervisor = 1,
    /// Privilege level `0b10` is reserved in the base ISA. When using the hypervisor extension,
    /// CSRs with this level in their specifier belong to the hypervisor tier.
    Reserved = 2,
    Machine = 3,
}

impl RawPrivilegeLevel {
    /// Convert a 2-bit value into a [`RawPrivilegeLevel`]. Only the two low bits are considered.
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 & 0b11 {
            0 => Self::User,
            1 => Self::Supervisor,
            2 => Self::Reserved,
            _ => Self::Machine,
        }
    }
}

impl fmt::Display for RawPrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RawPrivilegeLevel::User => "U",
            RawPrivilegeLevel::Supervisor => "S",
            RawPrivilegeLevel::Reserved => "2",
            RawPrivilegeLevel::Machine => "M",
        })
    }
}

/// Defined privilege levels. The hypervisor extension adds no level of its own; guest modes are
/// the virtualization bit of [`HartState`](crate::core::HartState) on top of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl PrivilegeLevel {
    /// Two-bit encoding as used in the MPP, SPVP, and dcsr.prv fields.
    pub fn as_u2(self) -> u64 {
        self as u64
    }
}

impl PartialEq<RawPrivilegeLevel> for PrivilegeLevel {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

impl TryFrom<RawPrivilegeLevel> for PrivilegeLevel {
    type Error = ReservedPrivilegeLevelError;
    fn try_from(value: RawPrivilegeLevel) -> Result<Self, Self::Error> {
        match value {
            RawPrivilegeLevel::User => Ok(Self::User),
            RawPrivilegeLevel::Supervisor => Ok(Self::Supervisor),
            RawPrivilegeLevel::Reserved => Err(ReservedPrivilegeLevelError(value)),
            RawPrivilegeLevel::Machine => Ok(Self::Machine),
        }
    }
}

#[derive(Error, Debug)]
#[error("privilege level {0} is reserved")]
pub struct ReservedPrivilegeLevelError(RawPrivilegeLevel);

/// Native register width of a hart.
///
/// The width is fixed for the lifetime of a hart: UXL, SXL, and VSXL are read-only and always
/// equal to the machine width.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Xlen {
    Rv32,
    #[default]
    Rv64,
}

impl Xlen {
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// Mask with the low [`bits`](Self::bits) bits set.
    pub fn mask(self) -> u64 {
        match self {
            Xlen::Rv32 => 0xFFFF_FFFF,
            Xlen::Rv64 => u64::MAX,
        }
    }

    /// The 2-bit encoding used by the MXL, SXL, UXL, and VSXL fields.
    pub fn encoding(self) -> u64 {
        match self {
            Xlen::Rv32 => 1,
            Xlen::Rv64 => 2,
        }
    }

    /// Truncates `value` to this width.
    pub fn truncate(self, value: u64) -> u64 {
        value & self.mask()
    }
}

impl fmt::Display for Xlen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RV{}", self.bits())
    }
}

pub mod unit {
    //! Units of translation, in bytes.

    /// A _page_ is the 4 KiB unit of virtual memory translation.
    pub const PAGE: u64 = 4096;
}

/// Natural alignment of an access, always a power of two.
// Maintains the invariant that self.0 is a power of two.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Alignment(u64);

impl Alignment {
    /// Halfword alignment means the address is a multiple of 2 (`address & 0b1 == 0`).
    pub const HALFWORD: Self = Self(2);

    /// Word alignment means the address is a multiple of 4 (`address & 0b11 == 0`).
    pub const WORD: Self = Self(4);

    /// Creates the natural alignment for a unit of size `size`. Returns `None` if `size` is not a
    /// power of two.
    pub fn natural_for_size(size: u64) -> Option<Self> {
        size.is_power_of_two().then_some(Self(size))
    }

    /// Returns `true` if `address` is aligned to this alignment.
    pub fn is_aligned(self, address: u64) -> bool {
        address & (self.0 - 1) == 0
    }
}

const_assert!(unit::PAGE.is_power_of_two());
