//! Access conditions beyond the privilege and read-only bits encoded in a CSR address.

use super::CsRegisters;
use crate::core::control::counter_enabled;
use crate::core::state::HartState;
use crate::core::status::{ExtensionContextStatus, Hstatus};
use crate::core::Exception;
use crate::PrivilegeLevel;

/// Extra condition checked by [`CsRegisters::verify`] for every instance on the forwarding chain
/// of the accessed register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// dcsr, dpc, dscratch0 and dscratch1.
    DebugOnly,
    /// PMP registers, which are only accessible when PMP entries are implemented.
    Pmp,
    /// fflags, frm and fcsr.
    Float,
    /// satp: trapped by `mstatus.TVM` in HS-mode and `hstatus.VTVM` in VS-mode.
    Satp,
    /// hgatp: trapped by `mstatus.TVM` in HS-mode.
    Hgatp,
    /// User-level view of counter `n`.
    Counter(u8),
    /// mseccfg, part of the enhanced PMP extension.
    Mseccfg,
}

impl Gate {
    pub fn check(self, regs: &CsRegisters, state: &HartState) -> Result<(), Exception> {
        let config = &regs.config;
        // Debug mode accesses CSRs with M-mode privileges.
        let privilege = match state.debug_mode {
            true => PrivilegeLevel::Machine,
            false => state.privilege,
        };
        let virtualized = state.virtualized && !state.debug_mode;
        match self {
            Gate::DebugOnly if !state.debug_mode => Err(Exception::illegal_instruction()),
            Gate::Pmp if config.pmp_entries == 0 => Err(Exception::illegal_instruction()),
            Gate::Float => {
                if !config.extensions.float
                    || regs.mstatus().fs() == ExtensionContextStatus::Off
                    || (virtualized && regs.vsstatus().fs() == ExtensionContextStatus::Off)
                {
                    Err(Exception::illegal_instruction())
                } else {
                    Ok(())
                }
            }
            Gate::Satp => {
                if virtualized {
                    match Hstatus(regs.hstatus()).vtvm() {
                        true => Err(Exception::virtual_instruction()),
                        false => Ok(()),
                    }
                } else if privilege < PrivilegeLevel::Machine && regs.mstatus().tvm() {
                    Err(Exception::illegal_instruction())
                } else {
                    Ok(())
                }
            }
            Gate::Hgatp => {
                if !virtualized && privilege == PrivilegeLevel::Supervisor && regs.mstatus().tvm() {
                    Err(Exception::illegal_instruction())
                } else {
                    Ok(())
                }
            }
            Gate::Counter(index) => {
                let index = index as usize;
                if privilege < PrivilegeLevel::Machine
                    && !counter_enabled(regs.mcounteren(), index)
                {
                    return Err(Exception::illegal_instruction());
                }
                if virtualized && !counter_enabled(regs.hcounteren(), index) {
                    return Err(Exception::virtual_instruction());
                }
                if privilege == PrivilegeLevel::User
                    && config.extensions.supervisor
                    && !counter_enabled(regs.scounteren(), index)
                {
                    return match virtualized {
                        true => Err(Exception::virtual_instruction()),
                        false => Err(Exception::illegal_instruction()),
                    };
                }
                Ok(())
            }
            Gate::Mseccfg if !config.extensions.smepmp => Err(Exception::illegal_instruction()),
            _ => Ok(()),
        }
    }
}
