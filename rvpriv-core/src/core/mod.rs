//! Privileged state of a single RISC-V hart.

pub mod control;
pub mod csr;
pub mod debug;
pub mod envcfg;
pub mod interrupts;
pub mod mmu;
pub mod pmp;
pub mod state;
pub mod status;
pub mod tlb;
pub mod trap;
pub mod triggers;

pub use state::{HartState, Mode};
pub use trap::TrapCause;

use log::debug;
use thiserror::Error;

use crate::bus::Bus;
use crate::commit_log::CommitLog;
use crate::config::{Config, ConfigError};
use crate::core::csr::CsrSpecifier;
use crate::core::debug::Dcsr;
use crate::core::interrupts::InterruptContext;
use crate::core::pmp::Pmp;
use crate::core::status::Hstatus;
use crate::core::tlb::Tlb;
use crate::core::triggers::Triggers;
use crate::cs_registers::{CsRegisters, WriteEffects};
use crate::PrivilegeLevel;

/// Privileged state of a RISC-V hart: its CSRs, privilege and virtualization mode, address
/// translation and protection, and trap delivery.
///
/// Instruction decoding and execution live outside. An executor drives the hart through
/// [`csr_read`](Self::csr_read), [`csr_write`](Self::csr_write), the memory access functions,
/// [`raise_trap`](Self::raise_trap), the trap returns and [`tick`](Self::tick).
///
/// > From the perspective of software running in a given execution environment, a hart is a
/// > resource that autonomously fetches and executes RISC-V instructions within that execution
/// > environment.
///
/// Every operation applies all of its effects before returning, so the next instruction observes
/// them.
#[derive(Debug)]
pub struct Hart<B: Bus> {
    config: Config,
    state: HartState,
    pc: u64,
    csrs: CsRegisters,
    pmp: Pmp,
    triggers: Triggers,
    tlb: Tlb,
    bus: B,
    log: CommitLog,
    /// Number of stage-1 page-table walks performed.
    walks: u64,
}

impl<B: Bus> Hart<B> {
    /// Creates a hart in its reset state. Fails if `config` is inconsistent.
    pub fn new(config: Config, bus: B) -> Result<Self, ConfigError> {
        config.validate()?;
        let csrs = CsRegisters::new(&config);
        let log = CommitLog::new(config.log_commits, config.commit_log_capacity);
        debug!(
            "Creating {} hart {} with {} PMP entries",
            config.xlen, config.hart_id, config.pmp_entries
        );
        Ok(Self {
            pmp: Pmp::from_registers(&csrs),
            triggers: Triggers::from_registers(&csrs),
            tlb: Tlb::new(),
            state: HartState::new(),
            pc: config.reset_vector,
            csrs,
            bus,
            log,
            walks: 0,
            config,
        })
    }

    /// Force this hart to its reset state. Memory behind the bus is left untouched.
    pub fn reset(&mut self) {
        self.csrs.reset();
        self.state = HartState::new();
        self.pc = self.config.reset_vector;
        self.pmp = Pmp::from_registers(&self.csrs);
        self.triggers = Triggers::from_registers(&self.csrs);
        self.tlb.flush();
        self.log.clear();
        self.walks = 0;
    }

    /// Provide a read-only view of this hart's configuration.
    ///
    /// It is not possible to modify the configuration after creation.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &HartState {
        &self.state
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = self.config.xlen.truncate(pc);
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn cs_registers(&self) -> &CsRegisters {
        &self.csrs
    }

    /// Architectural CSR read, as performed by a CSR instruction.
    pub fn csr_read(&self, address: CsrSpecifier) -> Result<u64, Exception> {
        self.csrs.verify(address, false, &self.state)?;
        self.csrs
            .read(address, &self.state)
            .ok_or_else(Exception::illegal_instruction)
    }

    /// Architectural CSR write, as performed by a CSR instruction.
    pub fn csr_write(&mut self, address: CsrSpecifier, value: u64) -> Result<(), Exception> {
        self.csrs.verify(address, true, &self.state)?;
        let effects = self
            .csrs
            .write(address, value, &self.state, &mut self.log);
        if self.csrs.is_float(address) {
            self.csrs.mark_fs_dirty(&self.state);
        }
        self.apply(effects);
        Ok(())
    }

    /// Privileged inspection path: the value of any implemented CSR, without permission checks
    /// or side effects.
    pub fn peek_csr(&self, address: CsrSpecifier) -> Option<u64> {
        self.csrs.peek(address, &self.state)
    }

    /// Rebuilds the snapshots and flushes the translation cache as reported by a CSR write.
    pub(crate) fn apply(&mut self, effects: WriteEffects) {
        if effects.pmp_changed {
            self.pmp = Pmp::from_registers(&self.csrs);
        }
        if effects.triggers_changed {
            self.triggers = Triggers::from_registers(&self.csrs);
        }
        if effects.flush_tlb || effects.pmp_changed || effects.triggers_changed {
            self.tlb.flush();
        }
    }

    /// Raises or clears interrupt-pending `bits` of `mip`, as an interrupt controller would.
    pub fn set_interrupt_pending(&mut self, bits: u64, on: bool) {
        self.csrs.set_pending(bits, on);
    }

    /// Drives the external S-level interrupt line, which is ORed into `mip.SEIP` on reads.
    pub fn set_external_seip(&mut self, value: bool) {
        self.csrs.set_external_seip(value);
    }

    /// Updates `time` from the platform timer.
    pub fn sync_time(&mut self, value: u64) {
        self.csrs.sync_time(value);
    }

    /// Advances the counters by one cycle, and `minstret` when an instruction `retired`.
    ///
    /// Counters stand still in debug mode when `dcsr.stopcount` is set.
    pub fn tick(&mut self, retired: bool) {
        if self.state.debug_mode && Dcsr(self.csrs.dcsr()).stopcount() {
            return;
        }
        self.csrs.bump_counters(true, retired);
    }

    /// The interrupt that would be taken now, if any.
    pub fn pending_interrupt(&self) -> Option<Interrupt> {
        let mstatus = self.csrs.mstatus();
        let ctx = InterruptContext {
            state: self.state,
            pending: self.csrs.mip() & self.csrs.mie(),
            mideleg: self.csrs.mideleg(),
            hideleg: self.csrs.hideleg(),
            mstatus_mie: mstatus.mie(),
            sstatus_sie: mstatus.sie(),
            vsstatus_sie: self.csrs.vsstatus().sie(),
        };
        interrupts::select(&ctx)
    }

    /// Takes the pending interrupt, if any. Returns the interrupt that was taken.
    pub fn poll_interrupts(&mut self) -> Option<Interrupt> {
        let interrupt = self.pending_interrupt()?;
        debug!("Taking interrupt {interrupt:?} in {}", self.state);
        self.take_trap(interrupt.into());
        Some(interrupt)
    }

    /// `sfence.vma`: flushes the translation cache.
    ///
    /// > When TVM=1, attempts to read or write the satp CSR or execute an SFENCE.VMA or
    /// > SINVAL.VMA instruction while executing in S-mode will raise an illegal-instruction
    /// > exception.
    pub fn sfence_vma(&mut self) -> Result<(), Exception> {
        let state = self.state;
        if !state.debug_mode {
            match (state.privilege, state.virtualized) {
                (PrivilegeLevel::User, true) => return Err(Exception::virtual_instruction()),
                (PrivilegeLevel::User, false) => return Err(Exception::illegal_instruction()),
                (PrivilegeLevel::Supervisor, false) if self.csrs.mstatus().tvm() => {
                    return Err(Exception::illegal_instruction());
                }
                (PrivilegeLevel::Supervisor, true) if Hstatus(self.csrs.hstatus()).vtvm() => {
                    return Err(Exception::virtual_instruction());
                }
                _ => {}
            }
        }
        self.tlb.flush();
        Ok(())
    }

    /// `hfence.vvma`: flushes the translation cache. Only valid in HS-mode and M-mode.
    pub fn hfence_vvma(&mut self) -> Result<(), Exception> {
        self.check_hfence(false)?;
        self.tlb.flush();
        Ok(())
    }

    /// `hfence.gvma`: flushes the translation cache. In HS-mode, `mstatus.TVM` makes it illegal.
    pub fn hfence_gvma(&mut self) -> Result<(), Exception> {
        self.check_hfence(true)?;
        self.tlb.flush();
        Ok(())
    }

    fn check_hfence(&self, gvma: bool) -> Result<(), Exception> {
        let state = self.state;
        if !self.config.extensions.hypervisor {
            return Err(Exception::illegal_instruction());
        }
        if state.debug_mode {
            return Ok(());
        }
        match (state.privilege, state.virtualized) {
            (PrivilegeLevel::Machine, _) => Ok(()),
            (_, true) => Err(Exception::virtual_instruction()),
            (PrivilegeLevel::User, false) => Err(Exception::illegal_instruction()),
            (PrivilegeLevel::Supervisor, false) if gvma && self.csrs.mstatus().tvm() => {
                Err(Exception::illegal_instruction())
            }
            (PrivilegeLevel::Supervisor, false) => Ok(()),
        }
    }

    /// Switches privilege and virtualization mode. Any change flushes the translation cache.
    pub(crate) fn set_mode(&mut self, privilege: PrivilegeLevel, virtualized: bool) {
        let before = self.state;
        self.state.switch_to(privilege, virtualized);
        if before.privilege != self.state.privilege
            || before.virtualized != self.state.virtualized
        {
            debug!("Mode change {before} -> {}", self.state);
            self.tlb.flush();
        }
    }

    pub fn commit_log(&mut self) -> &mut CommitLog {
        &mut self.log
    }

    /// Number of stage-1 page-table walks performed since reset.
    pub fn walk_count(&self) -> u64 {
        self.walks
    }
}

/// Exception codes as written to `xcause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCause {
    /// Instruction address is not on a naturally aligned boundary in memory.
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    /// Generic exception used to communicate one of many possible scenarios:
    ///
    /// - Attempt to access a non-existent CSR.
    /// - Attempt to access a CSR without the appropriate privilege level.
    /// - Attempt to write to a read-only CSR.
    /// - Execution of a privileged instruction in a mode that does not allow it.
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreOrAmoAddressMisaligned = 6,
    StoreOrAmoAccessFault = 7,
    EnvironmentCallFromUMode = 8,
    /// Environment call from HS-mode (or S-mode without the hypervisor extension).
    EnvironmentCallFromSMode = 9,
    EnvironmentCallFromVSMode = 10,
    EnvironmentCallFromMMode = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StoreOrAmoPageFault = 15,
    InstructionGuestPageFault = 20,
    LoadGuestPageFault = 21,
    /// An instruction that is legal in HS-mode was attempted in VS-mode or VU-mode.
    VirtualInstruction = 22,
    StoreOrAmoGuestPageFault = 23,
}

impl ExceptionCause {
    /// Returns the exception code (cause) for this exception.
    pub fn code(self) -> u64 {
        self as u64
    }
}

/// A synchronous exception with its trap value payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{cause:?} (tval {tval:#x})")]
pub struct Exception {
    pub cause: ExceptionCause,
    /// Written to `xtval`.
    pub tval: u64,
    /// Written to `htval`/`mtval2`: the guest physical address shifted right by 2 for guest page
    /// faults, zero otherwise.
    pub tval2: u64,
    /// Written to `htinst`/`mtinst`.
    pub tinst: u64,
    /// `tval` holds a guest virtual address. Written to `hstatus.GVA`/`mstatus.GVA`.
    pub gva: bool,
}

impl Exception {
    pub fn new(cause: ExceptionCause) -> Self {
        Self::with_tval(cause, 0)
    }

    pub fn with_tval(cause: ExceptionCause, tval: u64) -> Self {
        Self {
            cause,
            tval,
            tval2: 0,
            tinst: 0,
            gva: false,
        }
    }

    pub fn illegal_instruction() -> Self {
        Self::new(ExceptionCause::IllegalInstruction)
    }

    pub fn virtual_instruction() -> Self {
        Self::new(ExceptionCause::VirtualInstruction)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interrupt {
    SupervisorSoftware,
    VirtualSupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    VirtualSupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    VirtualSupervisorExternal,
    MachineExternal,
    SupervisorGuestExternal,
    /// Platform-specific interrupt with code 16 or higher.
    Custom(u8),
}

impl Interrupt {
    /// Returns the exception code (cause) for this interrupt.
    pub fn code(self) -> u64 {
        match self {
            Self::SupervisorSoftware => 1,
            Self::VirtualSupervisorSoftware => 2,
            Self::MachineSoftware => 3,
            Self::SupervisorTimer => 5,
            Self::VirtualSupervisorTimer => 6,
            Self::MachineTimer => 7,
            Self::SupervisorExternal => 9,
            Self::VirtualSupervisorExternal => 10,
            Self::MachineExternal => 11,
            Self::SupervisorGuestExternal => 12,
            Self::Custom(code) => code as u64,
        }
    }

    /// Bit of this interrupt in `mip` and `mie`.
    pub fn mask(self) -> u64 {
        1 << self.code()
    }

    /// Returns `true` for the interrupts of VS-mode, which are reported to a guest with the code
    /// of the corresponding S-level interrupt.
    pub fn is_virtual_supervisor(self) -> bool {
        matches!(
            self,
            Self::VirtualSupervisorSoftware
                | Self::VirtualSupervisorTimer
                | Self::VirtualSupervisorExternal
        )
    }
}

/// Type of memory access, selecting the permission that is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Fetch,
    Load,
    /// Stores and AMOs.
    Store,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_log::CommitEvent;
    use crate::config::AdUpdatePolicy;
    use crate::core::interrupts::mip;
    use crate::core::pmp::cfg;
    use crate::resources::ram::Ram;
    use crate::Xlen;
    use proptest::prelude::*;

    const RAM_SIZE: usize = 0x10_0000;

    fn new_hart(config: Config) -> Hart<Ram> {
        Hart::new(config, Ram::new(0, RAM_SIZE).unwrap()).unwrap()
    }

    fn napot(base: u64, size: u64) -> u64 {
        (base | (size / 2 - 1)) >> 2
    }

    /// Grants S-mode and U-mode access to all of physical memory through PMP entry 15.
    fn allow_all(hart: &mut Hart<Ram>) {
        let rwx = NAPOT | (cfg::R | cfg::W | cfg::X) as u64;
        hart.csr_write(csr::pmpaddr(15), u64::MAX).unwrap();
        hart.csr_write(csr::pmpcfg(2), rwx << 56).unwrap();
    }

    const NAPOT: u64 = (pmp::PmpMode::Napot as u64) << cfg::A_SHIFT;

    #[test]
    fn test_reset_state() {
        let config = Config {
            reset_vector: 0x8000_0000,
            ..Config::default()
        };
        let hart = new_hart(config);
        assert_eq!(HartState::new(), *hart.state());
        assert_eq!(0x8000_0000, hart.pc());
        assert_eq!(Some(0), hart.peek_csr(csr::MHARTID));
        assert_eq!(0, hart.walk_count());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = Config {
            pmp_entries: 65,
            ..Config::default()
        };
        let ram = Ram::new(0, 0x1000).unwrap();
        assert_eq!(
            Some(ConfigError::TooManyPmpEntries(65)),
            Hart::new(config, ram).err()
        );
    }

    #[test]
    fn test_pmp_denied_store_traps_to_mtvec() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::MTVEC, 0x400).unwrap();
        hart.csr_write(csr::pmpaddr(0), napot(0, 0x1000)).unwrap();
        hart.csr_write(csr::pmpcfg(0), NAPOT | cfg::R as u64).unwrap();
        hart.set_pc(0x100);

        let err = hart.store_doubleword(0, 0xDEAD_BEEF).unwrap_err();
        assert_eq!(ExceptionCause::StoreOrAmoAccessFault, err.cause);
        hart.raise_trap(err);

        assert_eq!(Some(0), hart.peek_csr(csr::MTVAL));
        assert_eq!(Some(7), hart.peek_csr(csr::MCAUSE));
        assert_eq!(Some(0x100), hart.peek_csr(csr::MEPC));
        assert_eq!(0x400, hart.pc());
        assert_eq!(0, hart.load_doubleword(0).unwrap());
    }

    #[test]
    fn test_pmp_write_flushes_cached_translation() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::pmpaddr(0), napot(0, 0x2000)).unwrap();
        hart.csr_write(csr::pmpcfg(0), NAPOT | (cfg::R | cfg::W) as u64)
            .unwrap();
        hart.store_word(0x10, 5).unwrap();
        assert_eq!(5, hart.load_word(0x10).unwrap());

        hart.csr_write(csr::pmpcfg(0), NAPOT | cfg::R as u64).unwrap();
        let err = hart.store_word(0x10, 6).unwrap_err();
        assert_eq!(ExceptionCause::StoreOrAmoAccessFault, err.cause);
        assert_eq!(5, hart.load_word(0x10).unwrap());
    }

    #[test]
    fn test_misaligned_access() {
        let mut hart = new_hart(Config::default());
        let err = hart.load_word(0x2).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::LoadAddressMisaligned, 2), err);

        let config = Config {
            support_misaligned_memory_access: true,
            ..Config::default()
        };
        let mut hart = new_hart(config);
        hart.store_word(0xFFE, 0x1122_3344).unwrap();
        assert_eq!(0x3344, hart.load_halfword(0xFFE).unwrap());
        assert_eq!(0x1122, hart.load_halfword(0x1000).unwrap());
    }

    #[test]
    fn test_unmapped_access_faults() {
        let mut hart = new_hart(Config::default());
        let address = RAM_SIZE as u64;
        let err = hart.load_byte(address).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::LoadAccessFault, address), err);
    }

    #[test]
    fn test_fetch_compressed_parcels() {
        let mut hart = new_hart(Config::default());
        hart.store_word(0x100, 0x0000_4501).unwrap();
        hart.store_word(0x104, 0x0010_0093).unwrap();
        assert_eq!(0x4501, hart.fetch_instruction(0x100).unwrap());
        assert_eq!(0x0010_0093, hart.fetch_instruction(0x104).unwrap());
        let err = hart.fetch_instruction(0x101).unwrap_err();
        assert_eq!(ExceptionCause::InstructionAddressMisaligned, err.cause);
    }

    #[test]
    fn test_commit_log_records_memory_and_csrs() {
        let config = Config {
            log_commits: true,
            commit_log_capacity: 16,
            ..Config::default()
        };
        let mut hart = new_hart(config);
        hart.csr_write(csr::MSCRATCH, 7).unwrap();
        hart.store_halfword(0x20, 0xBEEF).unwrap();
        hart.load_byte(0x21).unwrap();
        let events: Vec<_> = hart.commit_log().drain().collect();
        assert_eq!(
            vec![
                CommitEvent::Csr {
                    address: csr::MSCRATCH,
                    value: 7
                },
                CommitEvent::MemoryWrite {
                    address: 0x20,
                    value: 0xBEEF,
                    size: 2
                },
                CommitEvent::MemoryRead {
                    address: 0x21,
                    size: 1
                },
            ],
            events
        );
    }

    #[test]
    fn test_interrupt_priority() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::MIE, mip::MEIP | mip::MTIP | mip::MSIP).unwrap();
        hart.set_interrupt_pending(mip::MTIP | mip::MEIP, true);
        assert_eq!(None, hart.pending_interrupt());
        hart.csr_write(csr::MSTATUS, 1 << status::idx::MIE).unwrap();
        assert_eq!(Some(Interrupt::MachineExternal), hart.pending_interrupt());
        hart.set_interrupt_pending(mip::MEIP, false);
        assert_eq!(Some(Interrupt::MachineTimer), hart.pending_interrupt());
    }

    #[test]
    fn test_take_interrupt_vectored() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::MTVEC, 0x1000 | 1).unwrap();
        hart.csr_write(csr::MIE, mip::MTIP).unwrap();
        hart.csr_write(csr::MSTATUS, 1 << status::idx::MIE).unwrap();
        hart.set_interrupt_pending(mip::MTIP, true);
        hart.set_pc(0x200);
        assert_eq!(Some(Interrupt::MachineTimer), hart.poll_interrupts());
        assert_eq!(0x1000 + 4 * 7, hart.pc());
        assert_eq!(Some(1 << 63 | 7), hart.peek_csr(csr::MCAUSE));
        assert!(!hart.cs_registers().mstatus().mie());
        assert!(hart.cs_registers().mstatus().mpie());
        // Interrupts are now disabled in M-mode.
        assert_eq!(None, hart.poll_interrupts());
    }

    #[test]
    fn test_medeleg_routes_user_fault() {
        let cause = ExceptionCause::LoadPageFault;
        for (delegated, expected) in [(true, PrivilegeLevel::Supervisor), (false, PrivilegeLevel::Machine)] {
            let mut hart = new_hart(Config::default());
            if delegated {
                hart.csr_write(csr::MEDELEG, 1 << cause.code()).unwrap();
            }
            hart.set_mode(PrivilegeLevel::User, false);
            hart.raise_trap(Exception::with_tval(cause, 0x1234));
            assert_eq!(expected, hart.state().privilege);
            let (tval, xcause) = match delegated {
                true => (csr::STVAL, csr::SCAUSE),
                false => (csr::MTVAL, csr::MCAUSE),
            };
            assert_eq!(Some(0x1234), hart.peek_csr(tval));
            assert_eq!(Some(13), hart.peek_csr(xcause));
        }
    }

    #[test]
    fn test_csr_privilege() {
        let mut hart = new_hart(Config::default());
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        assert_eq!(Err(Exception::illegal_instruction()), hart.csr_read(csr::MSTATUS));
        assert!(hart.csr_read(csr::SSTATUS).is_ok());
        assert_eq!(
            Err(Exception::illegal_instruction()),
            hart.csr_write(csr::CYCLE, 1)
        );
        // The debugger path ignores privilege.
        assert!(hart.peek_csr(csr::MSTATUS).is_some());
    }

    #[test]
    fn test_float_write_marks_dirty() {
        let mut config = Config::default();
        config.extensions.float = true;
        let mut hart = new_hart(config);
        assert_eq!(Err(Exception::illegal_instruction()), hart.csr_read(csr::FFLAGS));
        hart.csr_write(csr::MSTATUS, 1 << status::idx::FS).unwrap();
        hart.csr_write(csr::FRM, 0b010).unwrap();
        assert_eq!(Some(0b010 << 5), hart.peek_csr(csr::FCSR));
        let mstatus = hart.cs_registers().mstatus();
        assert_eq!(status::ExtensionContextStatus::Dirty, mstatus.fs());
        assert!(mstatus.sd());
    }

    #[test]
    fn test_tick_counts() {
        let mut hart = new_hart(Config::default());
        hart.tick(true);
        hart.tick(false);
        assert_eq!(Some(2), hart.peek_csr(csr::MCYCLE));
        assert_eq!(Some(1), hart.peek_csr(csr::MINSTRET));
        hart.csr_write(csr::MCOUNTINHIBIT, 0b101).unwrap();
        hart.tick(true);
        assert_eq!(Some(2), hart.peek_csr(csr::MCYCLE));
        // A software write wins over the increment of the same step.
        hart.csr_write(csr::MCOUNTINHIBIT, 0).unwrap();
        hart.csr_write(csr::MINSTRET, 10).unwrap();
        hart.tick(true);
        assert_eq!(Some(10), hart.peek_csr(csr::MINSTRET));
        hart.tick(true);
        assert_eq!(Some(11), hart.peek_csr(csr::MINSTRET));
    }

    #[test]
    fn test_sfence_permissions() {
        let mut hart = new_hart(Config::default());
        assert_eq!(Ok(()), hart.sfence_vma());
        hart.csr_write(csr::MSTATUS, 1 << status::idx::TVM).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        assert_eq!(Err(Exception::illegal_instruction()), hart.sfence_vma());
        hart.set_mode(PrivilegeLevel::User, false);
        assert_eq!(Err(Exception::illegal_instruction()), hart.sfence_vma());
        assert_eq!(Err(Exception::illegal_instruction()), hart.hfence_gvma());
    }

    #[test]
    fn test_reset_restores_state() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::MSCRATCH, 42).unwrap();
        hart.set_mode(PrivilegeLevel::User, false);
        hart.tick(true);
        hart.reset();
        assert_eq!(HartState::new(), *hart.state());
        assert_eq!(Some(0), hart.peek_csr(csr::MSCRATCH));
        assert_eq!(Some(0), hart.peek_csr(csr::MCYCLE));
    }

    /// Builds an Sv39 identity mapping of the first 2 MiB megapage below RAM size, with `leaf`
    /// as the permission bits of the leaf.
    fn sv39_hart(ad_update: AdUpdatePolicy, leaf: u64) -> Hart<Ram> {
        let config = Config {
            ad_update,
            ..Config::default()
        };
        let mut hart = new_hart(config);
        allow_all(&mut hart);
        let root = 0x1_0000u64;
        let l1 = 0x1_1000u64;
        let l0 = 0x1_2000u64;
        hart.store_doubleword(root, (l1 >> 12) << 10 | 1).unwrap();
        hart.store_doubleword(l1, (l0 >> 12) << 10 | 1).unwrap();
        // Map virtual page 0x40 to physical page 0x40.
        hart.store_doubleword(l0 + 0x40 * 8, 0x40 << 10 | leaf).unwrap();
        hart.csr_write(csr::SATP, 8 << 60 | root >> 12).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        hart
    }

    const V: u64 = 1;
    const R: u64 = 1 << 1;
    const W: u64 = 1 << 2;
    const X: u64 = 1 << 3;
    const U: u64 = 1 << 4;
    const A: u64 = 1 << 6;
    const D: u64 = 1 << 7;

    #[test]
    fn test_repeated_translation_walks_once() {
        let mut hart = sv39_hart(AdUpdatePolicy::Fault, V | R | W | A | D);
        let before = hart.walk_count();
        assert_eq!(Ok(0x40_123), hart.translate(0x40_123, AccessType::Load));
        assert_eq!(before + 1, hart.walk_count());
        assert_eq!(Ok(0x40_123), hart.translate(0x40_123, AccessType::Load));
        assert_eq!(before + 1, hart.walk_count());
        hart.sfence_vma().unwrap();
        hart.sfence_vma().unwrap();
        assert_eq!(Ok(0x40_123), hart.translate(0x40_123, AccessType::Load));
        assert_eq!(before + 2, hart.walk_count());
    }

    #[test]
    fn test_unmapped_page_faults() {
        let mut hart = sv39_hart(AdUpdatePolicy::Fault, V | R | W | A | D);
        let err = hart.load_byte(0x41_000).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::LoadPageFault, 0x41_000), err);
        let err = hart.load_byte(0x0000_0040_0000_0000).unwrap_err();
        assert_eq!(ExceptionCause::LoadPageFault, err.cause);
    }

    #[test]
    fn test_accessed_dirty_policies() {
        let leaf = V | R | W;
        let mut faulting = sv39_hart(AdUpdatePolicy::Fault, leaf);
        let err = faulting.store_byte(0x40_000, 1).unwrap_err();
        assert_eq!(
            Exception::with_tval(ExceptionCause::StoreOrAmoPageFault, 0x40_000),
            err
        );

        let mut updating = sv39_hart(AdUpdatePolicy::SetInPlace, leaf);
        updating.store_byte(0x40_000, 1).unwrap();
        let pte_address = 0x1_2000 + 0x40 * 8;
        let mut pte = [0; 8];
        updating.bus_mut().read(&mut pte, pte_address).unwrap();
        assert_eq!(leaf | A | D, u64::from_le_bytes(pte) & 0xFF);
    }

    #[test]
    fn test_user_page_from_supervisor_needs_sum() {
        let mut hart = sv39_hart(AdUpdatePolicy::Fault, V | R | A | U);
        let err = hart.load_byte(0x40_000).unwrap_err();
        assert_eq!(ExceptionCause::LoadPageFault, err.cause);
        hart.set_mode(PrivilegeLevel::Machine, false);
        hart.csr_write(csr::MSTATUS, 1 << status::idx::SUM).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        assert_eq!(Ok(0), hart.load_byte(0x40_000));
    }

    #[test]
    fn test_mprv_uses_previous_privilege() {
        let mut hart = sv39_hart(AdUpdatePolicy::Fault, V | R | A);
        hart.set_mode(PrivilegeLevel::Machine, false);
        // M-mode is always Bare.
        assert_eq!(Ok(0x41_000), hart.translate(0x41_000, AccessType::Load));
        let mstatus = hart
            .cs_registers()
            .mstatus()
            .with_mpp(PrivilegeLevel::Supervisor)
            .with_mprv(true);
        hart.csr_write(csr::MSTATUS, mstatus.value()).unwrap();
        let err = hart.load_byte(0x41_000).unwrap_err();
        assert_eq!(ExceptionCause::LoadPageFault, err.cause);
        // Fetches are not affected.
        assert_eq!(Ok(0x41_000), hart.translate(0x41_000, AccessType::Fetch));
    }

    #[test]
    fn test_guest_page_fault_payload() {
        let config = Config::from_isa_string("rv64imafdch", "msu").unwrap();
        let mut hart = new_hart(config);
        allow_all(&mut hart);
        // vsatp points at a root table the G-stage does not map.
        let root_gpa = 0x20_0000u64;
        hart.csr_write(csr::VSATP, 8 << 60 | root_gpa >> 12).unwrap();
        // Sv39x4 with an empty root table.
        hart.csr_write(csr::HGATP, 8 << 60 | 0x4_0000 >> 12).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);

        let err = hart.store_word(0x1000, 1).unwrap_err();
        assert_eq!(ExceptionCause::StoreOrAmoGuestPageFault, err.cause);
        assert_eq!(0x1000, err.tval);
        assert_eq!(root_gpa >> 2, err.tval2);
        assert_eq!(0x3020, err.tinst);
        assert!(err.gva);

        hart.raise_trap(err);
        assert_eq!(PrivilegeLevel::Machine, hart.state().privilege);
        assert_eq!(Some(root_gpa >> 2), hart.peek_csr(csr::MTVAL2));
        assert_eq!(Some(0x3020), hart.peek_csr(csr::MTINST));
        let mstatus = hart.cs_registers().mstatus();
        assert!(mstatus.gva());
        assert!(mstatus.mpv());
    }

    /// Hypervisor hart with an Sv39x4 G-stage whose root table at 0x4_0000 maps the first GiB
    /// of guest physical memory with a single leaf of physical page `ppn`.
    fn guest_hart(ppn: u64, leaf: u64) -> Hart<Ram> {
        let config = Config::from_isa_string("rv64imafdch", "msu").unwrap();
        let mut hart = new_hart(config);
        allow_all(&mut hart);
        let root = 0x4_0000u64;
        hart.store_doubleword(root, ppn << 10 | leaf).unwrap();
        hart.csr_write(csr::HGATP, 8 << 60 | root >> 12).unwrap();
        hart
    }

    #[test]
    fn test_implicit_guest_stage_ignores_mxr() {
        let mut hart = guest_hart(0, V | X | U | A);
        let root_gpa = 0x8_0000u64;
        hart.csr_write(csr::VSATP, 8 << 60 | root_gpa >> 12).unwrap();
        hart.csr_write(csr::MSTATUS, 1 << status::idx::MXR).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);

        let err = hart.load_word(0x1000).unwrap_err();
        assert_eq!(ExceptionCause::LoadGuestPageFault, err.cause);
        assert_eq!(0x1000, err.tval);
        assert_eq!(root_gpa >> 2, err.tval2);
        assert_eq!(0x3000, err.tinst);

        // Explicit accesses still see execute-only guest pages as readable.
        hart.set_mode(PrivilegeLevel::Machine, false);
        hart.csr_write(csr::VSATP, 0).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        assert_eq!(Ok(0), hart.load_word(0x1000));
    }

    #[test]
    fn test_misaligned_guest_superpage_faults() {
        let mut hart = guest_hart(1, V | R | W | X | U | A | D);
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        let err = hart.load_byte(0x10).unwrap_err();
        assert_eq!(ExceptionCause::LoadGuestPageFault, err.cause);
        assert_eq!(0x10 >> 2, err.tval2);
        assert_eq!(0, err.tinst);

        hart.set_mode(PrivilegeLevel::Machine, false);
        hart.store_doubleword(0x4_0000, V | R | W | X | U | A | D).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        assert_eq!(Ok(0), hart.load_byte(0x10));
    }

    #[test]
    fn test_misaligned_superpage_faults() {
        let mut hart = sv39_hart(AdUpdatePolicy::Fault, V | R | A);
        hart.set_mode(PrivilegeLevel::Machine, false);
        // Megapages at virtual 2 MiB (physical page 0x201) and 4 MiB (physical page 0).
        hart.store_doubleword(0x1_1000 + 8, 0x201 << 10 | V | R | A).unwrap();
        hart.store_doubleword(0x1_1000 + 16, V | R | A).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);

        let err = hart.load_byte(0x20_0010).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::LoadPageFault, 0x20_0010), err);
        assert_eq!(Ok(0x10), hart.translate(0x40_0010, AccessType::Load));
    }

    #[test]
    fn test_sv32_walk() {
        let mut hart = new_hart(Config::rv32());
        hart.csr_write(csr::pmpaddr(0), u64::from(u32::MAX)).unwrap();
        hart.csr_write(csr::pmpcfg(0), NAPOT | (cfg::R | cfg::W | cfg::X) as u64)
            .unwrap();
        let root = 0x1_0000u64;
        let l0 = 0x1_1000u64;
        // Virtual 0x0040_1234 has VPN[1] = 1 and VPN[0] = 1.
        hart.store_word(root + 4, ((l0 >> 12) << 10 | V) as u32).unwrap();
        hart.store_word(l0 + 4, (0x50 << 10 | V | R | A) as u32).unwrap();
        hart.csr_write(csr::SATP, 1 << 31 | root >> 12).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);

        assert_eq!(Ok(0x5_0234), hart.translate(0x0040_1234, AccessType::Load));
        let err = hart.store_byte(0x0040_1234, 1).unwrap_err();
        assert_eq!(ExceptionCause::StoreOrAmoPageFault, err.cause);
    }

    #[test]
    fn test_sv48_and_sv57_walks() {
        for (mode, levels) in [(9u64, 4u64), (10, 5)] {
            let mut hart = new_hart(Config::default());
            allow_all(&mut hart);
            let table = |level: u64| 0x1_0000 + level * 0x1000;
            for level in 0..levels - 1 {
                let next = table(level + 1);
                hart.store_doubleword(table(level), (next >> 12) << 10 | V).unwrap();
            }
            let leaf = table(levels - 1) + 0x40 * 8;
            hart.store_doubleword(leaf, 0x41 << 10 | V | R | A).unwrap();
            hart.csr_write(csr::SATP, mode << 60 | table(0) >> 12).unwrap();
            hart.set_mode(PrivilegeLevel::Supervisor, false);

            assert_eq!(Ok(0x41_123), hart.translate(0x40_123, AccessType::Load));
            let before = hart.walk_count();
            let err = hart.load_byte(0x42_000).unwrap_err();
            assert_eq!(ExceptionCause::LoadPageFault, err.cause);
            assert_eq!(before + 1, hart.walk_count());
        }
    }

    #[test]
    fn test_vtvm_traps_satp_from_guest() {
        let config = Config::from_isa_string("rv64imafdch", "msu").unwrap();
        let mut hart = new_hart(config);
        let vsatp = 8 << 60 | 0x80;
        hart.csr_write(csr::VSATP, vsatp).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        assert_eq!(Ok(vsatp), hart.csr_read(csr::SATP));

        hart.set_mode(PrivilegeLevel::Machine, false);
        hart.csr_write(csr::HSTATUS, 1 << status::hidx::VTVM).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        assert_eq!(Err(Exception::virtual_instruction()), hart.csr_read(csr::SATP));
        assert_eq!(Err(Exception::virtual_instruction()), hart.csr_write(csr::SATP, 0));
        assert_eq!(Err(Exception::virtual_instruction()), hart.sfence_vma());
        // HS-mode is unaffected.
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        assert!(hart.csr_read(csr::SATP).is_ok());
    }

    #[test]
    fn test_mxr_makes_executable_pages_readable() {
        let mut hart = sv39_hart(AdUpdatePolicy::Fault, V | X | A);
        let err = hart.load_byte(0x40_000).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::LoadPageFault, 0x40_000), err);

        hart.set_mode(PrivilegeLevel::Machine, false);
        hart.csr_write(csr::MSTATUS, 1 << status::idx::MXR).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        assert_eq!(Ok(0), hart.load_byte(0x40_000));
        let err = hart.store_byte(0x40_000, 1).unwrap_err();
        assert_eq!(ExceptionCause::StoreOrAmoPageFault, err.cause);
    }

    #[test]
    fn test_partial_pmp_match_denies() {
        let config = Config {
            support_misaligned_memory_access: true,
            ..Config::default()
        };
        let mut hart = new_hart(config);
        allow_all(&mut hart);
        hart.csr_write(csr::pmpaddr(0), napot(0x800, 0x800)).unwrap();
        hart.csr_write(csr::pmpcfg(0), NAPOT | (cfg::R | cfg::W) as u64)
            .unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);

        // Entry 0 covers only the last two bytes, and entry 15 is never consulted.
        let err = hart.load_word(0x7FE).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::LoadAccessFault, 0x7FE), err);
        assert_eq!(Ok(0), hart.load_word(0x7FC));
        assert_eq!(Ok(0), hart.load_word(0x800));
    }

    #[test]
    fn test_trigger_fires_breakpoint() {
        let mut hart = new_hart(Config::default());
        let tdata1 = triggers::mcontrol_reset(Xlen::Rv64)
            | triggers::mcontrol::M
            | triggers::mcontrol::LOAD;
        hart.csr_write(csr::TSELECT, 0).unwrap();
        hart.csr_write(csr::TDATA1, tdata1).unwrap();
        hart.csr_write(csr::TDATA2, 0x80).unwrap();
        assert_eq!(Ok(0), hart.load_byte(0x40));
        let err = hart.load_byte(0x80).unwrap_err();
        assert_eq!(Exception::with_tval(ExceptionCause::Breakpoint, 0x80), err);
        let tdata1 = hart.peek_csr(csr::TDATA1).unwrap();
        assert_ne!(0, tdata1 & triggers::mcontrol::HIT);
        // Stores are not watched.
        assert_eq!(Ok(()), hart.store_byte(0x80, 1));
    }

    proptest! {
        #[test]
        fn test_csr_read_is_pure(address in 0u16..0x1000, user in any::<bool>()) {
            let mut hart = new_hart(Config::default());
            if user {
                hart.set_mode(PrivilegeLevel::User, false);
            }
            let first = hart.csr_read(address);
            let second = hart.csr_read(address);
            prop_assert_eq!(first, second);
            prop_assert_eq!(Some(0), hart.peek_csr(csr::MSCRATCH));
        }
    }
}
