//! Control and Status Registers.
//!
//! Part of the "Zicsr" extension.

mod build;
mod gate;
mod kind;
mod warl;

pub use gate::Gate;
pub use kind::{Csr, CsrId, Effect, Flush, Kind, View, WriteEffects};
pub use warl::Warl;

use log::trace;
use nohash::IntMap;

use crate::commit_log::CommitLog;
use crate::config::Config;
use crate::core::control::COUNTEREN_MASK;
use crate::core::csr::{self, CsrSpecifier};
use crate::core::state::HartState;
use crate::core::status::Status;
use crate::core::{pmp, Exception};

/// Control and Status Registers of a single hart.
///
/// > RISC-V defines a separate address space of 4096 Control and Status registers associated with
/// > each hart.
///
/// > The standard RISC-V ISA sets aside a 12-bit encoding space (csr\[11:0]) for up to 4,096 CSRs.
/// > By convention, the upper 4 bits of the CSR address (csr\[11:8]) are used to encode the read
/// > and write accessibility of the CSRs according to privilege level as shown in Table 2.1. The
/// > top two bits (csr\[11:10]) indicate whether the register is read/write (00, 01, or 10) or
/// > read-only (11). The next two bits (csr\[9:8]) encode the lowest privilege level that can
/// > access the CSR.
///
/// Instances live in an arena and refer to each other by [`CsrId`]. Every implemented address
/// maps to exactly one instance. Some instances have no address of their own and are only
/// reachable through another instance.
///
/// [`read`](Self::read) and [`write`](Self::write) perform no access control: callers performing
/// an architectural access must call [`verify`](Self::verify) first.
#[derive(Debug, Clone)]
pub struct CsRegisters {
    csrs: Vec<Csr>,
    map: IntMap<CsrSpecifier, CsrId>,
    pub(crate) config: Config,
    /// External S-level interrupt line, ORed into `mip.SEIP` on reads.
    pub(crate) external_seip: bool,
    pub(crate) ids: Ids,
}

/// Instances the rest of the hart accesses directly.
///
/// Registers that only exist for some configurations are `None` when absent. Entries point at
/// storage instances (the 64-bit instance on RV32, the host side of virtualized registers).
#[derive(Debug, Clone)]
pub(crate) struct Ids {
    pub mstatus: CsrId,
    pub mtvec: CsrId,
    pub mie: CsrId,
    pub mip: CsrId,
    pub mepc: CsrId,
    pub mcause: CsrId,
    pub mtval: CsrId,
    pub mcountinhibit: CsrId,
    pub mcycle: CsrId,
    pub minstret: CsrId,
    pub time: CsrId,
    pub mseccfg: CsrId,
    pub pmpcfg: Vec<CsrId>,
    pub pmpaddr: Vec<CsrId>,
    pub dcsr: CsrId,
    pub dpc: CsrId,
    pub mcounteren: Option<CsrId>,
    pub menvcfg: Option<CsrId>,
    pub medeleg: Option<CsrId>,
    pub mideleg: Option<CsrId>,
    pub scounteren: Option<CsrId>,
    pub supervisor: Option<SupervisorIds>,
    pub hypervisor: Option<HypervisorIds>,
    pub tdata1: Vec<CsrId>,
    pub tdata2: Vec<CsrId>,
    pub float: Option<CsrId>,
}

/// Host-side S-level trap registers.
#[derive(Debug, Clone)]
pub(crate) struct SupervisorIds {
    pub stvec: CsrId,
    pub sepc: CsrId,
    pub scause: CsrId,
    pub stval: CsrId,
    pub satp: CsrId,
}

#[derive(Debug, Clone)]
pub(crate) struct HypervisorIds {
    pub hstatus: CsrId,
    pub hedeleg: CsrId,
    pub hideleg: CsrId,
    pub hcounteren: CsrId,
    pub htval: CsrId,
    pub htinst: CsrId,
    pub hgatp: CsrId,
    pub henvcfg: CsrId,
    pub mtval2: CsrId,
    pub mtinst: CsrId,
    pub vsstatus: CsrId,
    pub vstvec: CsrId,
    pub vsepc: CsrId,
    pub vscause: CsrId,
    pub vstval: CsrId,
    pub vsatp: CsrId,
}

impl CsRegisters {
    /// Creates the register set described by `config`, initialized to reset values.
    ///
    /// `config` must have been validated.
    pub fn new(config: &Config) -> Self {
        build::build(config)
    }

    /// Force all Control and Status registers to their reset state.
    pub fn reset(&mut self) {
        for csr in &mut self.csrs {
            csr.kind = csr.reset.clone();
        }
        self.external_seip = false;
    }

    /// Returns `true` if `address` is implemented.
    pub fn contains(&self, address: CsrSpecifier) -> bool {
        self.map.contains_key(&address)
    }

    /// Implemented addresses, in ascending order.
    pub fn addresses(&self) -> Vec<CsrSpecifier> {
        let mut addresses: Vec<_> = self.map.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn csr(&self, id: CsrId) -> &Csr {
        &self.csrs[id.index()]
    }

    /// Checks whether the access is permitted in `state`. Must be called before every
    /// architectural access, and has no side effects.
    ///
    /// Checks, in order:
    /// 1. that the register is implemented,
    /// 2. the minimum privilege level encoded in the address. A guest lacking privilege for an
    ///    S-level or hypervisor-level register gets a virtual instruction fault, so that the
    ///    hypervisor can emulate the access,
    /// 3. writes to read-only registers,
    /// 4. the [`Gate`]s of every instance the access reaches.
    pub fn verify(
        &self,
        address: CsrSpecifier,
        is_write: bool,
        state: &HartState,
    ) -> Result<(), Exception> {
        let Some(&id) = self.map.get(&address) else {
            return Err(Exception::illegal_instruction());
        };
        let mode = state.mode(self.config.extensions.hypervisor);
        let required = csr::required_privilege_level(address);
        if mode < required {
            let guest_tier = required <= crate::RawPrivilegeLevel::Reserved;
            return match state.virtualized && !state.debug_mode && guest_tier {
                true => Err(Exception::virtual_instruction()),
                false => Err(Exception::illegal_instruction()),
            };
        }
        if is_write && csr::is_read_only(address) {
            return Err(Exception::illegal_instruction());
        }
        self.check_gates(id, state)
    }

    fn check_gates(&self, id: CsrId, state: &HartState) -> Result<(), Exception> {
        let csr = self.csr(id);
        if let Some(gate) = csr.gate {
            gate.check(self, state)?;
        }
        match &csr.kind {
            Kind::Virtualized { original, shadow } => {
                self.check_gates(select(state, *original, *shadow), state)
            }
            Kind::Proxy { target, view } if !matches!(view, View::Indexed { .. }) => {
                self.check_gates(*target, state)
            }
            Kind::Composite { upper, lower, .. } => {
                self.check_gates(*upper, state)?;
                self.check_gates(*lower, state)
            }
            _ => Ok(()),
        }
    }

    /// Reads the register at `address`, or `None` if it is not implemented. The value is
    /// truncated to XLEN.
    pub fn read(&self, address: CsrSpecifier, state: &HartState) -> Option<u64> {
        let id = self.map.get(&address)?;
        Some(self.config.xlen.truncate(self.read_id(*id, state)))
    }

    /// Privileged inspection path for debuggers: the value at `address` without permission
    /// checks. Reads have no side effects, so this never changes state.
    pub fn peek(&self, address: CsrSpecifier, state: &HartState) -> Option<u64> {
        self.read(address, state)
    }

    pub(crate) fn read_id(&self, id: CsrId, state: &HartState) -> u64 {
        match &self.csr(id).kind {
            Kind::Basic { value } | Kind::Const { value } | Kind::Counter { value, .. } => *value,
            Kind::Masked { value, warl, .. } => warl.on_read(*value, self),
            Kind::Virtualized { original, shadow } => {
                self.read_id(select(state, *original, *shadow), state)
            }
            Kind::Composite {
                upper,
                lower,
                upper_lsb,
            } => {
                let lower_mask = (1 << upper_lsb) - 1;
                self.read_id(*upper, state) << upper_lsb | self.read_id(*lower, state) & lower_mask
            }
            Kind::Proxy { target, view } => {
                let value = match view {
                    View::Indexed { select, targets, .. } => {
                        let index = self.read_id(*select, state) as usize;
                        return targets
                            .get(index)
                            .map_or(0, |target| self.read_id(*target, state));
                    }
                    _ => self.read_id(*target, state),
                };
                match view {
                    View::Full => value,
                    View::Masked { read, .. } => value & read,
                    View::Interrupt {
                        read, deleg, shift, ..
                    } => {
                        let deleg = deleg.map_or(u64::MAX, |deleg| self.read_id(deleg, state));
                        (value & read & deleg) >> shift
                    }
                    View::Low => value & 0xFFFF_FFFF,
                    View::High => value >> 32,
                    View::Indexed { .. } => value,
                }
            }
        }
    }

    /// Writes `value` to the register at `address` and records the written value in `log`.
    ///
    /// Does nothing for unimplemented addresses. The caller must have checked the access with
    /// [`verify`](Self::verify).
    pub fn write(
        &mut self,
        address: CsrSpecifier,
        value: u64,
        state: &HartState,
        log: &mut CommitLog,
    ) -> WriteEffects {
        let mut effects = WriteEffects::default();
        if let Some(&id) = self.map.get(&address) {
            let value = self.config.xlen.truncate(value);
            self.write_id(id, value, state, log, &mut effects);
        }
        effects
    }

    pub(crate) fn write_id(
        &mut self,
        id: CsrId,
        value: u64,
        state: &HartState,
        log: &mut CommitLog,
        effects: &mut WriteEffects,
    ) {
        let csr = self.csr(id);
        let address = csr.address;
        match csr.kind.clone() {
            Kind::Basic { .. } | Kind::Masked { .. } | Kind::Counter { .. } | Kind::Const { .. } => {
                self.write_leaf(id, value, None, state, Some(log), effects);
            }
            Kind::Virtualized { original, shadow } => {
                self.write_id(select(state, original, shadow), value, state, log, effects);
            }
            Kind::Composite {
                upper,
                lower,
                upper_lsb,
            } => {
                let lower_mask = (1 << upper_lsb) - 1;
                self.write_id(lower, value & lower_mask, state, log, effects);
                self.write_id(upper, value >> upper_lsb, state, log, effects);
            }
            Kind::Proxy { target, view } => match view {
                View::Full => self.write_id(target, value, state, log, effects),
                View::Masked { write, .. } => {
                    self.write_leaf(target, value, Some(write), state, Some(log), effects);
                }
                View::Interrupt {
                    write,
                    deleg,
                    shift,
                    ..
                } => {
                    let deleg = deleg.map_or(u64::MAX, |deleg| self.read_id(deleg, state));
                    let mask = write & deleg;
                    self.write_leaf(target, value << shift, Some(mask), state, Some(log), effects);
                }
                View::Low | View::High => {
                    let (shifted, half) = match view {
                        View::Low => (value & 0xFFFF_FFFF, 0xFFFF_FFFF),
                        _ => ((value & 0xFFFF_FFFF) << 32, 0xFFFF_FFFF_0000_0000),
                    };
                    let mask = self.own_mask(target) & half;
                    self.write_leaf(target, shifted, Some(mask), state, None, effects);
                    log.log_csr(address, value & 0xFFFF_FFFF);
                }
                View::Indexed {
                    select,
                    targets,
                    guards,
                } => {
                    let index = self.read_id(select, state) as usize;
                    let (Some(&target), Some(&guard)) = (targets.get(index), guards.get(index))
                    else {
                        return;
                    };
                    let dmode = crate::core::triggers::dmode(
                        self.read_id(guard, state),
                        self.config.xlen,
                    );
                    if dmode && !state.debug_mode {
                        trace!("Ignoring write to trigger {index} reserved for debug mode");
                        return;
                    }
                    self.write_id(target, value, state, log, effects);
                }
            },
        }
    }

    /// Writes a storage instance. `mask` overrides the instance's own writable mask. Logs the
    /// stored value when `log` is given and the kind records writes.
    fn write_leaf(
        &mut self,
        id: CsrId,
        value: u64,
        mask: Option<u64>,
        state: &HartState,
        log: Option<&mut CommitLog>,
        effects: &mut WriteEffects,
    ) {
        let csr = self.csr(id);
        let (address, flush, effect) = (csr.address, csr.flush, csr.effect);
        let (old, new, logged) = match csr.kind {
            Kind::Basic { value: old } => {
                let mask = mask.unwrap_or(u64::MAX);
                (old, old & !mask | value & mask, true)
            }
            Kind::Masked {
                value: old,
                mask: own,
                warl,
            } => {
                let mask = mask.unwrap_or(own);
                let candidate = old & !mask | value & mask;
                let new = warl.legalize(old, candidate, self, state);
                (old, new, new != old)
            }
            Kind::Counter { value: old, .. } => {
                let mask = mask.unwrap_or(u64::MAX);
                (old, old & !mask | value & mask, true)
            }
            Kind::Const { .. } => return,
            _ => {
                // Proxies may target forwarding instances.
                match log {
                    Some(log) => self.write_id(id, value, state, log, effects),
                    None => trace!("Dropping unlogged write to forwarding instance {address:#x}"),
                }
                return;
            }
        };

        match &mut self.csrs[id.index()].kind {
            Kind::Basic { value } | Kind::Masked { value, .. } => *value = new,
            Kind::Counter { value, written } => {
                *value = new;
                *written = true;
            }
            _ => {}
        }

        if flush.needed(old, new) {
            effects.flush_tlb = true;
        }
        if old != new || flush == Flush::Always {
            match effect {
                Effect::Pmp => effects.pmp_changed = true,
                Effect::Triggers => effects.triggers_changed = true,
                Effect::None => {}
            }
        }
        if logged {
            if let Some(log) = log {
                log.log_csr(address, new);
            }
        }
    }

    /// Writable mask of a storage instance, as used by half-width views.
    fn own_mask(&self, id: CsrId) -> u64 {
        match self.csr(id).kind {
            Kind::Masked { mask, .. } => mask,
            Kind::Const { .. } => 0,
            _ => u64::MAX,
        }
    }

    /// Stored value of an instance, bypassing read-side derivation and views.
    pub(crate) fn raw(&self, id: CsrId) -> u64 {
        match self.csr(id).kind {
            Kind::Basic { value }
            | Kind::Masked { value, .. }
            | Kind::Const { value }
            | Kind::Counter { value, .. } => value,
            _ => 0,
        }
    }

    /// Replaces the stored value of an instance without legalization, logging or effects. Used
    /// for hardware updates of read-only fields.
    pub(crate) fn set_raw(&mut self, id: CsrId, new: u64) {
        match &mut self.csrs[id.index()].kind {
            Kind::Basic { value }
            | Kind::Masked { value, .. }
            | Kind::Const { value }
            | Kind::Counter { value, .. } => *value = new,
            _ => {}
        }
    }

    /// Advances `mcycle` (when `cycle` is set) and `minstret` (when `retired` is set), unless
    /// inhibited by `mcountinhibit` or written by software during this step.
    pub fn bump_counters(&mut self, cycle: bool, retired: bool) {
        use crate::core::control::counter_idx;
        let inhibit = self.raw(self.ids.mcountinhibit);
        let counters = [
            (self.ids.mcycle, cycle, counter_idx::CY),
            (self.ids.minstret, retired, counter_idx::IR),
        ];
        for (id, active, index) in counters {
            if let Kind::Counter { value, written } = &mut self.csrs[id.index()].kind {
                if active && !*written && inhibit & (1 << index) == 0 {
                    *value = value.wrapping_add(1);
                }
                *written = false;
            }
        }
    }

    /// Updates `time` from the platform timer.
    pub fn sync_time(&mut self, value: u64) {
        self.set_raw(self.ids.time, value);
    }

    /// Drives the external S-level interrupt line.
    pub fn set_external_seip(&mut self, value: bool) {
        self.external_seip = value;
    }

    /// Sets (`on`) or clears interrupt-pending `bits` in `mip`, as a device would.
    pub fn set_pending(&mut self, bits: u64, on: bool) {
        let mip = self.raw(self.ids.mip);
        let new = match on {
            true => mip | bits,
            false => mip & !bits,
        };
        self.set_raw(self.ids.mip, new);
    }

    /// Marks the floating-point state dirty after a write to a floating-point CSR.
    pub(crate) fn mark_fs_dirty(&mut self, state: &HartState) {
        use crate::core::status::ExtensionContextStatus::Dirty;
        let mstatus = self.mstatus().with_fs(Dirty);
        self.set_raw(self.ids.mstatus, mstatus.value());
        if state.virtualized {
            if let Some(h) = &self.ids.hypervisor {
                let id = h.vsstatus;
                let vsstatus = self.vsstatus().with_fs(Dirty);
                self.set_raw(id, vsstatus.value());
            }
        }
    }

    /// Returns `true` if `address` is a floating-point CSR.
    pub(crate) fn is_float(&self, address: CsrSpecifier) -> bool {
        self.map
            .get(&address)
            .is_some_and(|id| self.csr(*id).gate == Some(Gate::Float))
    }

    pub fn mstatus(&self) -> Status {
        Status::new(self.raw(self.ids.mstatus), self.config.xlen)
    }

    /// `vsstatus`, or zero without the hypervisor extension.
    pub fn vsstatus(&self) -> Status {
        let raw = self.ids.hypervisor.as_ref().map_or(0, |h| self.raw(h.vsstatus));
        Status::new(raw, self.config.xlen)
    }

    pub fn hstatus(&self) -> u64 {
        self.ids.hypervisor.as_ref().map_or(0, |h| self.raw(h.hstatus))
    }

    fn optional(&self, id: Option<CsrId>, absent: u64) -> u64 {
        id.map_or(absent, |id| self.raw(id))
    }

    pub fn mcounteren(&self) -> u64 {
        self.optional(self.ids.mcounteren, COUNTEREN_MASK)
    }

    pub fn scounteren(&self) -> u64 {
        self.optional(self.ids.scounteren, COUNTEREN_MASK)
    }

    pub fn hcounteren(&self) -> u64 {
        let id = self.ids.hypervisor.as_ref().map(|h| h.hcounteren);
        self.optional(id, COUNTEREN_MASK)
    }

    pub fn menvcfg(&self) -> u64 {
        self.optional(self.ids.menvcfg, 0)
    }

    /// Effective `henvcfg`, zero without the hypervisor extension.
    pub fn henvcfg(&self) -> u64 {
        let raw = self.ids.hypervisor.as_ref().map_or(0, |h| self.raw(h.henvcfg));
        crate::core::envcfg::henvcfg_read(raw, self.menvcfg())
    }

    /// Effective `mideleg`, zero without S-mode.
    pub fn mideleg(&self) -> u64 {
        self.ids.mideleg.map_or(0, |id| {
            let raw = self.raw(id);
            Warl::Mideleg.on_read(raw, self)
        })
    }

    pub fn medeleg(&self) -> u64 {
        self.optional(self.ids.medeleg, 0)
    }

    /// Effective `hideleg`, zero without the hypervisor extension.
    pub fn hideleg(&self) -> u64 {
        let raw = self.ids.hypervisor.as_ref().map_or(0, |h| self.raw(h.hideleg));
        raw & self.mideleg()
    }

    pub fn hedeleg(&self) -> u64 {
        self.ids.hypervisor.as_ref().map_or(0, |h| self.raw(h.hedeleg))
    }

    /// `mip` including the external SEIP line.
    pub fn mip(&self) -> u64 {
        Warl::Mip.on_read(self.raw(self.ids.mip), self)
    }

    pub fn mie(&self) -> u64 {
        self.raw(self.ids.mie)
    }

    /// `vsatp` when `virtualized`, `satp` otherwise. Zero (Bare) when absent.
    pub fn satp(&self, virtualized: bool) -> u64 {
        let id = match virtualized {
            true => self.ids.hypervisor.as_ref().map(|h| h.vsatp),
            false => self.ids.supervisor.as_ref().map(|s| s.satp),
        };
        self.optional(id, 0)
    }

    pub fn hgatp(&self) -> u64 {
        let id = self.ids.hypervisor.as_ref().map(|h| h.hgatp);
        self.optional(id, 0)
    }

    /// Sets the `hit` bit of trigger `index` after it fired.
    pub(crate) fn set_trigger_hit(&mut self, index: usize) {
        if let Some(&id) = self.ids.tdata1.get(index) {
            let tdata1 = self.raw(id) | crate::core::triggers::mcontrol::HIT;
            self.set_raw(id, tdata1);
        }
    }

    pub fn mseccfg(&self) -> u64 {
        self.raw(self.ids.mseccfg)
    }

    pub fn dcsr(&self) -> u64 {
        self.raw(self.ids.dcsr)
    }

    /// Configuration byte of PMP entry `index`; zero for entries that are not implemented.
    pub fn pmp_cfg(&self, index: usize) -> u8 {
        if index >= self.config.pmp_entries {
            return 0;
        }
        let per_register = self.config.xlen.bits() as usize / 8;
        let Some(&id) = self.ids.pmpcfg.get(index / per_register) else {
            return 0;
        };
        (self.raw(id) >> (8 * (index % per_register))) as u8
    }

    /// Stored value of `pmpaddr{index}`, without the granularity adjustment applied on reads.
    pub fn pmp_addr(&self, index: usize) -> u64 {
        match index < self.config.pmp_entries {
            true => self.ids.pmpaddr.get(index).map_or(0, |id| self.raw(*id)),
            false => 0,
        }
    }

    pub fn any_pmp_locked(&self) -> bool {
        (0..self.config.pmp_entries).any(|i| pmp::PmpCfg::from_u8(self.pmp_cfg(i)).locked)
    }
}

fn select(state: &HartState, original: CsrId, shadow: CsrId) -> CsrId {
    match state.virtualized {
        true => shadow,
        false => original,
    }
}
