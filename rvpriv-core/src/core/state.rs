use std::fmt;

use crate::{PrivilegeLevel, RawPrivilegeLevel};

/// Current privilege and virtualization mode of a hart.
///
/// > The hypervisor extension changes supervisor mode into hypervisor-extended supervisor mode
/// > (HS-mode, or hypervisor mode for short), where a hypervisor or a hosting-capable operating
/// > system runs. The hypervisor extension also adds another stage of address translation, from
/// > guest physical addresses to supervisor physical addresses, to virtualize the memory and
/// > memory-mapped I/O subsystems for a guest operating system.
///
/// > The current virtualization mode, denoted V, indicates whether the hart is currently executing
/// > in a guest. When V=1, the hart is either in virtual S-mode (VS-mode), or in virtual U-mode
/// > (VU-mode) atop a guest OS running in VS-mode.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct HartState {
    pub privilege: PrivilegeLevel,
    /// The V bit.
    pub virtualized: bool,
    /// Privilege level before the most recent mode-changing trap.
    pub previous_privilege: PrivilegeLevel,
    /// V bit before the most recent mode-changing trap.
    pub previous_virtualized: bool,
    pub debug_mode: bool,
}

impl Default for HartState {
    fn default() -> Self {
        Self::new()
    }
}

impl HartState {
    /// Reset state: M-mode, not virtualized, not in debug mode.
    pub fn new() -> Self {
        Self {
            privilege: PrivilegeLevel::Machine,
            virtualized: false,
            previous_privilege: PrivilegeLevel::Machine,
            previous_virtualized: false,
            debug_mode: false,
        }
    }

    /// State running at `privilege` with the given V bit, outside debug mode.
    pub fn at(privilege: PrivilegeLevel, virtualized: bool) -> Self {
        Self {
            privilege,
            virtualized: virtualized && privilege != PrivilegeLevel::Machine,
            ..Self::new()
        }
    }

    /// The access tier used for CSR permission checks. Debug mode accesses CSRs with M-mode
    /// privileges.
    pub fn mode(&self, hypervisor: bool) -> Mode {
        if self.debug_mode {
            return Mode::Machine;
        }
        match self.privilege {
            PrivilegeLevel::User => Mode::User,
            PrivilegeLevel::Supervisor if hypervisor && !self.virtualized => Mode::Hypervisor,
            PrivilegeLevel::Supervisor => Mode::Supervisor,
            PrivilegeLevel::Machine => Mode::Machine,
        }
    }

    /// Moves to `privilege` and `virtualized`, recording the mode being left.
    pub(crate) fn switch_to(&mut self, privilege: PrivilegeLevel, virtualized: bool) {
        self.previous_privilege = self.privilege;
        self.previous_virtualized = self.virtualized;
        self.privilege = privilege;
        self.virtualized = virtualized && privilege != PrivilegeLevel::Machine;
    }
}

impl fmt::Display for HartState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.virtualized {
            write!(f, "V{}", self.privilege)?;
        } else {
            write!(f, "{}", self.privilege)?;
        }
        if self.debug_mode {
            f.write_str(" (debug)")?;
        }
        Ok(())
    }
}

/// Access tier of the current mode, ordered like the privilege field of a CSR specifier.
///
/// VS-mode maps to [`Mode::Supervisor`], HS-mode to [`Mode::Hypervisor`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum Mode {
    User = 0,
    Supervisor = 1,
    Hypervisor = 2,
    Machine = 3,
}

impl PartialEq<RawPrivilegeLevel> for Mode {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as u8 == *other as u8
    }
}

impl PartialOrd<RawPrivilegeLevel> for Mode {
    fn partial_cmp(&self, other: &RawPrivilegeLevel) -> Option<std::cmp::Ordering> {
        (*self as u8).partial_cmp(&(*other as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_state() {
        let state = HartState::new();
        assert_eq!(PrivilegeLevel::Machine, state.privilege);
        assert!(!state.virtualized);
        assert!(!state.debug_mode);
    }

    #[test]
    fn test_mode() {
        let hs = HartState::at(PrivilegeLevel::Supervisor, false);
        assert_eq!(Mode::Hypervisor, hs.mode(true));
        assert_eq!(Mode::Supervisor, hs.mode(false));
        let vs = HartState::at(PrivilegeLevel::Supervisor, true);
        assert_eq!(Mode::Supervisor, vs.mode(true));
        assert!(Mode::Supervisor < RawPrivilegeLevel::Reserved);
        let debug = HartState {
            debug_mode: true,
            ..HartState::at(PrivilegeLevel::User, false)
        };
        assert_eq!(Mode::Machine, debug.mode(true));
    }

    #[test]
    fn test_switch_records_previous() {
        let mut state = HartState::at(PrivilegeLevel::User, true);
        state.switch_to(PrivilegeLevel::Machine, true);
        assert_eq!(PrivilegeLevel::User, state.previous_privilege);
        assert!(state.previous_virtualized);
        assert!(!state.virtualized);
    }
}
