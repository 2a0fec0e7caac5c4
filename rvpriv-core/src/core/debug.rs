//! Debug mode state (`dcsr`).

use bitvec::{field::BitField, order::Lsb0, view::BitView};

use super::HartState;
use crate::config::Extensions;
use crate::{PrivilegeLevel, RawPrivilegeLevel};

/// Bit indices into `dcsr`.
pub mod idx {
    pub const PRV: usize = 0;
    pub const STEP: usize = 2;
    pub const MPRVEN: usize = 4;
    pub const V: usize = 5;
    pub const CAUSE: usize = 6;
    pub const STOPTIME: usize = 9;
    pub const STOPCOUNT: usize = 10;
    pub const STEPIE: usize = 11;
    pub const EBREAKU: usize = 12;
    pub const EBREAKS: usize = 13;
    pub const EBREAKM: usize = 15;
    pub const EBREAKVU: usize = 16;
    pub const EBREAKVS: usize = 17;
    pub const XDEBUGVER: usize = 28;
}

const fn bit(index: usize) -> u64 {
    1 << index
}

/// RISC-V External Debug Support, versions 0.13 and 1.0.
const XDEBUGVER: u64 = 4;

/// Reason for entering debug mode, as reported in `dcsr.cause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DebugCause {
    Ebreak = 1,
    Trigger = 2,
    HaltRequest = 3,
    Step = 4,
}

pub fn dcsr_reset() -> u64 {
    XDEBUGVER << idx::XDEBUGVER | PrivilegeLevel::Machine.as_u2()
}

pub fn dcsr_mask(ext: &Extensions) -> u64 {
    let mut mask = bit(idx::EBREAKM)
        | bit(idx::STEPIE)
        | bit(idx::STOPCOUNT)
        | bit(idx::STOPTIME)
        | bit(idx::STEP)
        | bit(idx::MPRVEN)
        | 0b11 << idx::PRV;
    if ext.supervisor {
        mask |= bit(idx::EBREAKS);
    }
    if ext.user {
        mask |= bit(idx::EBREAKU);
    }
    if ext.hypervisor {
        mask |= bit(idx::EBREAKVS) | bit(idx::EBREAKVU) | bit(idx::V);
    }
    mask
}

/// A `prv` value naming an unimplemented privilege level keeps the old level.
pub fn legalize_dcsr(old: u64, new: u64, ext: &Extensions) -> u64 {
    let prv = RawPrivilegeLevel::from_u2(Dcsr(new).raw_prv());
    let implemented = match prv {
        RawPrivilegeLevel::Machine => true,
        RawPrivilegeLevel::Supervisor => ext.supervisor,
        RawPrivilegeLevel::User => ext.user,
        RawPrivilegeLevel::Reserved => false,
    };
    match implemented {
        true => new,
        false => new & !(0b11 << idx::PRV) | old & 0b11 << idx::PRV,
    }
}

/// Typed view of a `dcsr` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dcsr(pub u64);

impl Dcsr {
    fn bit(self, index: usize) -> bool {
        self.0.view_bits::<Lsb0>()[index]
    }

    fn raw_prv(self) -> u8 {
        self.0.view_bits::<Lsb0>()[idx::PRV..idx::PRV + 2].load_le()
    }

    /// Privilege level to return to on `dret`.
    pub fn prv(self) -> PrivilegeLevel {
        PrivilegeLevel::try_from(RawPrivilegeLevel::from_u2(self.raw_prv()))
            .unwrap_or(PrivilegeLevel::Machine)
    }

    pub fn v(self) -> bool {
        self.bit(idx::V)
    }

    pub fn step(self) -> bool {
        self.bit(idx::STEP)
    }

    pub fn mprven(self) -> bool {
        self.bit(idx::MPRVEN)
    }

    pub fn stopcount(self) -> bool {
        self.bit(idx::STOPCOUNT)
    }

    /// Returns `true` if `ebreak` executed in `state` enters debug mode instead of raising a
    /// breakpoint exception.
    pub fn ebreak_enters_debug(self, state: &HartState) -> bool {
        let index = match (state.privilege, state.virtualized) {
            (PrivilegeLevel::Machine, _) => idx::EBREAKM,
            (PrivilegeLevel::Supervisor, false) => idx::EBREAKS,
            (PrivilegeLevel::User, false) => idx::EBREAKU,
            (PrivilegeLevel::Supervisor, true) => idx::EBREAKVS,
            (PrivilegeLevel::User, true) => idx::EBREAKVU,
        };
        self.bit(index)
    }

    /// Records the mode being left and the reason for entering debug mode.
    pub fn entered(mut self, state: &HartState, cause: DebugCause) -> Self {
        let bits = self.0.view_bits_mut::<Lsb0>();
        bits[idx::PRV..idx::PRV + 2].store_le(state.privilege.as_u2());
        bits[idx::CAUSE..idx::CAUSE + 3].store_le(cause as u8);
        bits.set(idx::V, state.virtualized);
        self
    }
}

const_assert!(idx::CAUSE + 3 <= idx::STOPTIME);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset() {
        let dcsr = Dcsr(dcsr_reset());
        assert_eq!(PrivilegeLevel::Machine, dcsr.prv());
        assert_eq!(XDEBUGVER, dcsr.0 >> idx::XDEBUGVER);
    }

    #[test]
    fn test_legalize_prv() {
        let ext = Extensions {
            supervisor: false,
            ..Extensions::default()
        };
        let old = dcsr_reset();
        let to_s = old & !0b11 | 1;
        assert_eq!(old, legalize_dcsr(old, to_s, &ext));
        let to_u = old & !0b11;
        assert_eq!(to_u, legalize_dcsr(old, to_u, &ext));
        let reserved = old & !0b11 | 2;
        assert_eq!(old, legalize_dcsr(old, reserved, &ext));
    }

    #[test]
    fn test_entered() {
        let state = HartState::at(PrivilegeLevel::User, true);
        let dcsr = Dcsr(dcsr_reset()).entered(&state, DebugCause::HaltRequest);
        assert_eq!(PrivilegeLevel::User, dcsr.prv());
        assert!(dcsr.v());
        assert_eq!(3, dcsr.0 >> idx::CAUSE & 0b111);
    }

    #[test]
    fn test_ebreak_bits() {
        let dcsr = Dcsr(dcsr_reset() | bit(idx::EBREAKVU));
        assert!(dcsr.ebreak_enters_debug(&HartState::at(PrivilegeLevel::User, true)));
        assert!(!dcsr.ebreak_enters_debug(&HartState::at(PrivilegeLevel::User, false)));
        assert!(!dcsr.ebreak_enters_debug(&HartState::new()));
    }
}
