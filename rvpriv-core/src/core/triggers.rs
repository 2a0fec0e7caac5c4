//! Address-match triggers (Sdtrig type 2, `mcontrol`).

use bitvec::{field::BitField, order::Lsb0, view::BitView};
use log::trace;

use super::AccessType;
use crate::cs_registers::CsRegisters;
use crate::{PrivilegeLevel, Xlen};

/// Fields of a type 2 (`mcontrol`) `tdata1` value below the XLEN-dependent `type` and `dmode`
/// fields.
pub mod mcontrol {
    pub const LOAD: u64 = 1 << 0;
    pub const STORE: u64 = 1 << 1;
    pub const EXECUTE: u64 = 1 << 2;
    pub const U: u64 = 1 << 3;
    pub const S: u64 = 1 << 4;
    pub const M: u64 = 1 << 6;
    pub const MATCH_SHIFT: usize = 7;
    pub const ACTION_SHIFT: usize = 12;
    pub const HIT: u64 = 1 << 20;
}

/// `tinfo` value: only type 2 is supported.
pub const TINFO: u64 = 1 << 2;

const TYPE_MCONTROL: u64 = 2;

const WRITABLE: u64 = mcontrol::LOAD
    | mcontrol::STORE
    | mcontrol::EXECUTE
    | mcontrol::U
    | mcontrol::S
    | mcontrol::M
    | mcontrol::HIT;

fn dmode_bit(xlen: Xlen) -> u64 {
    1 << (xlen.bits() - 5)
}

/// Returns `true` if the trigger described by `tdata1` can only be written from debug mode.
pub fn dmode(tdata1: u64, xlen: Xlen) -> bool {
    tdata1 & dmode_bit(xlen) != 0
}

pub fn mcontrol_reset(xlen: Xlen) -> u64 {
    TYPE_MCONTROL << (xlen.bits() - 4)
}

/// Legalizes a write to the `tdata1` of a type 2 trigger.
///
/// The type is fixed. `action` only supports raising a breakpoint exception (0). `match` only
/// supports equal (0), greater-or-equal (2) and less-than (3); other values select 0. `dmode`
/// can only be changed from debug mode.
pub fn legalize_mcontrol(old: u64, new: u64, xlen: Xlen, debug_mode: bool) -> u64 {
    let dmode = match debug_mode {
        true => new & dmode_bit(xlen),
        false => old & dmode_bit(xlen),
    };
    let mut value = mcontrol_reset(xlen) | dmode | new & WRITABLE;
    let match_kind = new.view_bits::<Lsb0>()[mcontrol::MATCH_SHIFT..mcontrol::MATCH_SHIFT + 4]
        .load_le::<u8>();
    if let Some(kind) = Match::from_u4(match_kind) {
        value.view_bits_mut::<Lsb0>()[mcontrol::MATCH_SHIFT..mcontrol::MATCH_SHIFT + 4]
            .store_le(kind as u8);
    }
    value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Match {
    Equal = 0,
    GreaterOrEqual = 2,
    Less = 3,
}

impl Match {
    fn from_u4(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Equal),
            2 => Some(Self::GreaterOrEqual),
            3 => Some(Self::Less),
            _ => None,
        }
    }
}

/// One configured trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub tdata1: u64,
    /// Compare value (`tdata2`).
    pub address: u64,
}

impl Trigger {
    fn enabled_for(&self, access: AccessType, privilege: PrivilegeLevel) -> bool {
        let access_bit = match access {
            AccessType::Fetch => mcontrol::EXECUTE,
            AccessType::Load => mcontrol::LOAD,
            AccessType::Store => mcontrol::STORE,
        };
        let privilege_bit = match privilege {
            PrivilegeLevel::User => mcontrol::U,
            PrivilegeLevel::Supervisor => mcontrol::S,
            PrivilegeLevel::Machine => mcontrol::M,
        };
        self.tdata1 & access_bit != 0 && self.tdata1 & privilege_bit != 0
    }

    fn matches(&self, address: u64) -> bool {
        let kind = self.tdata1.view_bits::<Lsb0>()
            [mcontrol::MATCH_SHIFT..mcontrol::MATCH_SHIFT + 4]
            .load_le::<u8>();
        match Match::from_u4(kind) {
            Some(Match::Equal) => address == self.address,
            Some(Match::GreaterOrEqual) => address >= self.address,
            Some(Match::Less) => address < self.address,
            None => false,
        }
    }
}

/// Snapshot of the trigger registers, rebuilt after every write to them.
#[derive(Debug, Clone, Default)]
pub struct Triggers {
    triggers: Vec<Trigger>,
}

impl Triggers {
    pub fn new(triggers: Vec<Trigger>) -> Self {
        Self { triggers }
    }

    pub fn from_registers(regs: &CsRegisters) -> Self {
        let ids = &regs.ids;
        let triggers = ids
            .tdata1
            .iter()
            .zip(&ids.tdata2)
            .map(|(&tdata1, &tdata2)| Trigger {
                tdata1: regs.raw(tdata1),
                address: regs.raw(tdata2),
            })
            .collect();
        Self::new(triggers)
    }

    /// Returns `true` if any trigger may fire for `access` at `privilege`. Translations cached
    /// while this holds are tagged so that every access goes through [`check`](Self::check).
    pub fn armed(&self, access: AccessType, privilege: PrivilegeLevel) -> bool {
        self.triggers
            .iter()
            .any(|trigger| trigger.enabled_for(access, privilege))
    }

    /// Index of the first trigger that fires for an access at virtual `address`.
    pub fn check(
        &self,
        address: u64,
        access: AccessType,
        privilege: PrivilegeLevel,
    ) -> Option<usize> {
        let hit = self.triggers.iter().position(|trigger| {
            trigger.enabled_for(access, privilege) && trigger.matches(address)
        });
        if let Some(index) = hit {
            trace!("Trigger {index} fired for {access:?} at {address:#x}");
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_type() {
        assert_eq!(2 << 60, mcontrol_reset(Xlen::Rv64));
        assert_eq!(2 << 28, mcontrol_reset(Xlen::Rv32));
    }

    #[test]
    fn test_legalize_mcontrol() {
        let xlen = Xlen::Rv64;
        let base = mcontrol_reset(xlen);
        // Action is forced to 0, unsupported match kinds select 0.
        let new = 1 << mcontrol::ACTION_SHIFT | 5 << mcontrol::MATCH_SHIFT | mcontrol::LOAD;
        assert_eq!(base | mcontrol::LOAD, legalize_mcontrol(base, new, xlen, false));
        let new = 3 << mcontrol::MATCH_SHIFT | mcontrol::M | mcontrol::EXECUTE;
        assert_eq!(base | new, legalize_mcontrol(base, new, xlen, false));
        // Type cannot be changed.
        assert_eq!(base, legalize_mcontrol(base, 0, xlen, false));
    }

    #[test]
    fn test_dmode_only_from_debug_mode() {
        let xlen = Xlen::Rv32;
        let base = mcontrol_reset(xlen);
        let new = base | dmode_bit(xlen);
        assert!(!dmode(legalize_mcontrol(base, new, xlen, false), xlen));
        assert!(dmode(legalize_mcontrol(base, new, xlen, true), xlen));
    }

    #[test]
    fn test_check() {
        let xlen = Xlen::Rv64;
        let equal = Trigger {
            tdata1: mcontrol_reset(xlen) | mcontrol::S | mcontrol::STORE,
            address: 0x1000,
        };
        let below = Trigger {
            tdata1: mcontrol_reset(xlen)
                | mcontrol::U
                | mcontrol::LOAD
                | (Match::Less as u64) << mcontrol::MATCH_SHIFT,
            address: 0x100,
        };
        let triggers = Triggers::new(vec![equal, below]);
        let s = PrivilegeLevel::Supervisor;
        let u = PrivilegeLevel::User;
        assert_eq!(Some(0), triggers.check(0x1000, AccessType::Store, s));
        assert_eq!(None, triggers.check(0x1000, AccessType::Load, s));
        assert_eq!(None, triggers.check(0x1000, AccessType::Store, u));
        assert_eq!(Some(1), triggers.check(0xFF, AccessType::Load, u));
        assert_eq!(None, triggers.check(0x100, AccessType::Load, u));
        assert!(triggers.armed(AccessType::Load, u));
        assert!(!triggers.armed(AccessType::Fetch, u));
        assert!(!Triggers::default().armed(AccessType::Store, s));
    }
}
