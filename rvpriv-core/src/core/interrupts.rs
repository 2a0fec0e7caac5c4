//! Interrupt-pending bit layout and selection of the interrupt to take next.

use bitvec::{order::Lsb0, view::BitView};

use super::{HartState, Interrupt};
use crate::config::Extensions;
use crate::PrivilegeLevel;

/// Bit masks of the fields of `mip` and `mie`.
pub mod mip {
    pub const SSIP: u64 = 1 << 1;
    pub const VSSIP: u64 = 1 << 2;
    pub const MSIP: u64 = 1 << 3;
    pub const STIP: u64 = 1 << 5;
    pub const VSTIP: u64 = 1 << 6;
    pub const MTIP: u64 = 1 << 7;
    pub const SEIP: u64 = 1 << 9;
    pub const VSEIP: u64 = 1 << 10;
    pub const MEIP: u64 = 1 << 11;
    pub const SGEIP: u64 = 1 << 12;
    /// Lowest bit available for platform-specific interrupts.
    pub const CUSTOM_START: u64 = 1 << 16;
}

#[allow(clippy::identity_op)]
pub const MACHINE_INTERRUPTS: u64 = 0 | mip::MSIP | mip::MTIP | mip::MEIP;

/// Interrupts that may be delegated to S-mode through `mideleg`.
#[allow(clippy::identity_op)]
pub const SUPERVISOR_INTERRUPTS: u64 = 0 | mip::SSIP | mip::STIP | mip::SEIP;

/// Interrupts of VS-mode, delegable through `hideleg`.
#[allow(clippy::identity_op)]
pub const VIRTUAL_SUPERVISOR_INTERRUPTS: u64 = 0 | mip::VSSIP | mip::VSTIP | mip::VSEIP;

/// Interrupts visible in `hip` and `hie`.
pub const HYPERVISOR_INTERRUPTS: u64 = VIRTUAL_SUPERVISOR_INTERRUPTS | mip::SGEIP;

const_assert!(MACHINE_INTERRUPTS & HYPERVISOR_INTERRUPTS == 0);
const_assert!(SUPERVISOR_INTERRUPTS & HYPERVISOR_INTERRUPTS == 0);
const_assert!((MACHINE_INTERRUPTS | HYPERVISOR_INTERRUPTS) < mip::CUSTOM_START);

/// All standard interrupts implemented for the given extensions.
pub fn standard_interrupts(ext: &Extensions) -> u64 {
    let mut mask = MACHINE_INTERRUPTS;
    if ext.supervisor {
        mask |= SUPERVISOR_INTERRUPTS;
    }
    if ext.hypervisor {
        mask |= HYPERVISOR_INTERRUPTS;
    }
    mask
}

/// Standard interrupts from highest to lowest priority.
///
/// > Multiple simultaneous interrupts destined for M-mode are handled in the following decreasing
/// > priority order: MEI, MSI, MTI, SEI, SSI, STI, SGEI, VSEI, VSSI, VSTI, LCOFI.
///
/// Platform-specific interrupts take precedence over all of these.
pub const PRIORITY: [Interrupt; 10] = [
    Interrupt::MachineExternal,
    Interrupt::MachineSoftware,
    Interrupt::MachineTimer,
    Interrupt::SupervisorExternal,
    Interrupt::SupervisorSoftware,
    Interrupt::SupervisorTimer,
    Interrupt::SupervisorGuestExternal,
    Interrupt::VirtualSupervisorExternal,
    Interrupt::VirtualSupervisorSoftware,
    Interrupt::VirtualSupervisorTimer,
];

/// Snapshot of everything that decides which interrupt is taken.
#[derive(Debug, Clone, Copy)]
pub struct InterruptContext {
    pub state: HartState,
    /// `mip & mie`.
    pub pending: u64,
    /// Effective `mideleg`, including the bits forced to one by the hypervisor extension.
    pub mideleg: u64,
    /// Effective `hideleg`, zero without the hypervisor extension.
    pub hideleg: u64,
    pub mstatus_mie: bool,
    /// `sstatus.SIE` of the host (HS-level `sstatus`).
    pub sstatus_sie: bool,
    pub vsstatus_sie: bool,
}

/// Selects the single interrupt to take, if any.
///
/// Interrupts destined for M-mode are considered first, then those for HS-mode, then those for
/// VS-mode. Within a level, the interrupt with the highest priority wins.
pub fn select(ctx: &InterruptContext) -> Option<Interrupt> {
    let state = &ctx.state;
    if state.debug_mode {
        return None;
    }
    let privilege = state.privilege;

    let m_enabled = privilege < PrivilegeLevel::Machine || ctx.mstatus_mie;
    let m_pending = ctx.pending & !ctx.mideleg;
    if m_enabled && m_pending != 0 {
        return highest_priority(m_pending);
    }

    let hs_enabled = state.virtualized
        || privilege < PrivilegeLevel::Supervisor
        || (privilege == PrivilegeLevel::Supervisor && ctx.sstatus_sie);
    let hs_pending = ctx.pending & ctx.mideleg & !ctx.hideleg;
    if hs_enabled && hs_pending != 0 {
        return highest_priority(hs_pending);
    }

    if state.virtualized {
        let vs_enabled = privilege < PrivilegeLevel::Supervisor
            || (privilege == PrivilegeLevel::Supervisor && ctx.vsstatus_sie);
        let vs_pending = ctx.pending & ctx.mideleg & ctx.hideleg;
        if vs_enabled && vs_pending != 0 {
            return highest_priority(vs_pending);
        }
    }

    None
}

/// Highest priority interrupt among `bits`.
pub fn highest_priority(bits: u64) -> Option<Interrupt> {
    let custom = bits & !(mip::CUSTOM_START - 1);
    if custom != 0 {
        let code = custom.view_bits::<Lsb0>().first_one()?;
        return Some(Interrupt::Custom(code as u8));
    }
    PRIORITY
        .into_iter()
        .find(|interrupt| bits & interrupt.mask() != 0)
}
