//! Register-specific legalization of written values (WARL fields) and read-side derivation.

use super::CsRegisters;
use crate::core::control::Tvec;
use crate::core::interrupts::{mip, HYPERVISOR_INTERRUPTS};
use crate::core::mmu::{atp, SatpMode};
use crate::core::state::HartState;
use crate::core::{debug, envcfg, pmp, status, triggers};
use crate::Xlen;

/// Legalization rule of a [`Kind::Masked`](super::Kind::Masked) instance.
///
/// [`legalize`](Self::legalize) receives the old value and the candidate value (old value with
/// the writable bits replaced) and returns the value to store. [`on_read`](Self::on_read) derives
/// the architectural value from the stored one, for fields that depend on other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Warl {
    None,
    Mstatus,
    Vsstatus,
    Tvec,
    /// mepc, sepc, vsepc, dpc.
    Epc,
    /// satp and vsatp.
    Satp,
    Hgatp,
    Mip,
    Mideleg,
    Hideleg,
    Henvcfg,
    /// pmpcfg register holding the configuration of entries `first..`.
    PmpCfg { first: u8 },
    PmpAddr { index: u8 },
    Mseccfg,
    /// tdata1 of a match-control trigger.
    Mcontrol,
    Dcsr,
    Tselect { count: u8 },
}

impl Warl {
    pub fn legalize(self, old: u64, new: u64, regs: &CsRegisters, state: &HartState) -> u64 {
        let config = &regs.config;
        let xlen = config.xlen;
        match self {
            Warl::None | Warl::Mip | Warl::Mideleg | Warl::Hideleg | Warl::Henvcfg => new,
            Warl::Mstatus => status::legalize_mstatus(old, new, &config.extensions, xlen),
            Warl::Vsstatus => status::legalize_vsstatus(new, xlen),
            Warl::Tvec => Tvec::legalize(old, new),
            Warl::Epc => new & !1,
            Warl::Satp => legalize_satp(old, new, regs),
            Warl::Hgatp => legalize_hgatp(old, new, regs),
            Warl::PmpCfg { first } => {
                let per_register = xlen.bits() as usize / 8;
                let seccfg = regs.mseccfg();
                let mut result = 0;
                for k in 0..per_register {
                    let index = first as usize + k;
                    let old_cfg = (old >> (8 * k)) as u8;
                    let new_cfg = (new >> (8 * k)) as u8;
                    let cfg = if index >= config.pmp_entries {
                        0
                    } else {
                        pmp::legalize_cfg(old_cfg, new_cfg, seccfg, config.pmp_granularity)
                    };
                    result |= (cfg as u64) << (8 * k);
                }
                result
            }
            Warl::PmpAddr { index } => {
                let index = index as usize;
                let rlb = seccfg_bit(regs.mseccfg(), pmp::mseccfg::RLB);
                let locked = pmp::PmpCfg::from_u8(regs.pmp_cfg(index)).locked;
                let next = pmp::PmpCfg::from_u8(regs.pmp_cfg(index + 1));
                let next_locks = next.locked && next.mode == pmp::PmpMode::Tor;
                if rlb || (!locked && !next_locks) {
                    new
                } else {
                    old
                }
            }
            Warl::Mseccfg => pmp::legalize_mseccfg(old, new, regs.any_pmp_locked()),
            Warl::Mcontrol => triggers::legalize_mcontrol(old, new, xlen, state.debug_mode),
            Warl::Dcsr => debug::legalize_dcsr(old, new, &config.extensions),
            Warl::Tselect { count } => match new < count as u64 {
                true => new,
                false => old,
            },
        }
    }

    pub fn on_read(self, raw: u64, regs: &CsRegisters) -> u64 {
        let config = &regs.config;
        match self {
            Warl::Epc if !config.extensions.compressed => raw & !0b11,
            Warl::Mip if regs.external_seip => raw | mip::SEIP,
            Warl::Mideleg if config.extensions.hypervisor => raw | HYPERVISOR_INTERRUPTS,
            Warl::Hideleg => raw & regs.mideleg(),
            Warl::Henvcfg => envcfg::henvcfg_read(raw, regs.menvcfg()),
            Warl::PmpAddr { index } => {
                pmp::addr_read(raw, regs.pmp_cfg(index as usize), config.pmp_granularity)
            }
            _ => raw,
        }
    }
}

fn seccfg_bit(mseccfg: u64, bit: u64) -> bool {
    mseccfg & bit != 0
}

/// > If satp is written with an unsupported MODE, the entire write has no effect; no fields in
/// > satp are modified.
///
/// The same holds for vsatp. Modes above the configured maximum count as unsupported.
fn legalize_satp(old: u64, new: u64, regs: &CsRegisters) -> u64 {
    let xlen = regs.config.xlen;
    match SatpMode::from_encoding(atp::mode(new, xlen), xlen) {
        Some(mode) if mode <= regs.config.max_satp_mode => {
            atp::with_ppn(new, atp::ppn(new, xlen) & ppn_mask(regs), xlen)
        }
        _ => old,
    }
}

/// hgatp follows the satp rule for its MODE field. VMID is not implemented (read-only zero) and
/// the root page table is 16 KiB aligned, so the two low PPN bits are zero.
fn legalize_hgatp(old: u64, new: u64, regs: &CsRegisters) -> u64 {
    let xlen = regs.config.xlen;
    match SatpMode::from_encoding(atp::mode(new, xlen), xlen) {
        Some(mode) if mode <= regs.config.max_satp_mode => {
            let ppn = atp::ppn(new, xlen) & ppn_mask(regs) & !0b11;
            atp::with_ppn(new & !atp::asid_mask(xlen), ppn, xlen)
        }
        _ => old,
    }
}

fn ppn_mask(regs: &CsRegisters) -> u64 {
    match regs.config.xlen {
        Xlen::Rv32 => u64::MAX,
        Xlen::Rv64 => (1 << (regs.config.physical_address_bits - 12)) - 1,
    }
}
