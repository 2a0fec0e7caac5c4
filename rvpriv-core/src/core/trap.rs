//! Trap delivery and trap returns.
//!
//! > By default, all traps at any privilege level are handled in machine mode, though a
//! > machine-mode handler can redirect traps back to the appropriate level with the MRET
//! > instruction. To increase performance, implementations can provide individual read/write bits
//! > within medeleg and mideleg to indicate that certain exceptions and interrupts should be
//! > processed directly by a lower privilege level.

use log::debug;

use super::control::Tvec;
use super::debug::{Dcsr, DebugCause};
use super::status::Hstatus;
use super::{Exception, ExceptionCause, Hart, Interrupt};
use crate::bus::Bus;
use crate::cs_registers::{CsrId, WriteEffects};
use crate::PrivilegeLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
}

impl From<Exception> for TrapCause {
    fn from(value: Exception) -> Self {
        Self::Exception(value)
    }
}

impl From<Interrupt> for TrapCause {
    fn from(value: Interrupt) -> Self {
        Self::Interrupt(value)
    }
}

impl TrapCause {
    fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupt(_))
    }

    fn code(&self) -> u64 {
        match self {
            Self::Exception(exception) => exception.cause.code(),
            Self::Interrupt(interrupt) => interrupt.code(),
        }
    }

    /// Trap value payload: `(tval, tval2, tinst, gva)`.
    fn payload(&self) -> (u64, u64, u64, bool) {
        match self {
            Self::Exception(e) => (e.tval, e.tval2, e.tinst, e.gva),
            Self::Interrupt(_) => (0, 0, 0, false),
        }
    }
}

/// Privilege level a trap is handled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Machine,
    /// HS-mode, or S-mode without the hypervisor extension.
    Supervisor,
    VirtualSupervisor,
}

impl<B: Bus> Hart<B> {
    /// Delivers a synchronous exception raised by the current instruction.
    pub fn raise_trap(&mut self, exception: Exception) {
        self.take_trap(exception.into());
    }

    /// Delivers a trap: saves the interrupted context into the CSRs of the handling level and
    /// jumps to its trap vector.
    pub fn take_trap(&mut self, cause: TrapCause) {
        let breakpoint = matches!(
            cause,
            TrapCause::Exception(Exception {
                cause: ExceptionCause::Breakpoint,
                ..
            })
        );
        if self.state.debug_mode {
            debug!("{cause:?} in debug mode");
            self.pc = match breakpoint {
                true => self.config.debug_rom_entry,
                false => self.config.debug_rom_tvec,
            };
            return;
        }
        if breakpoint && Dcsr(self.csrs.dcsr()).ebreak_enters_debug(&self.state) {
            self.enter_debug_mode(DebugCause::Ebreak);
            return;
        }

        let target = self.trap_target(&cause);
        debug!("Trap {cause:?} from {} to {target:?}", self.state);
        let mut effects = WriteEffects::default();
        match target {
            Target::VirtualSupervisor => self.trap_to_vs(&cause, &mut effects),
            Target::Supervisor => self.trap_to_hs(&cause, &mut effects),
            Target::Machine => self.trap_to_m(&cause, &mut effects),
        }
        self.apply(effects);
    }

    fn trap_target(&self, cause: &TrapCause) -> Target {
        let bit = 1u64.checked_shl(cause.code() as u32).unwrap_or(0);
        let (medeleg, hedeleg) = match cause.is_interrupt() {
            true => (self.csrs.mideleg(), self.csrs.hideleg()),
            false => (self.csrs.medeleg(), self.csrs.hedeleg()),
        };
        let below_machine = self.state.privilege != PrivilegeLevel::Machine;
        if !below_machine || medeleg & bit == 0 {
            Target::Machine
        } else if self.state.virtualized && hedeleg & bit != 0 {
            Target::VirtualSupervisor
        } else {
            Target::Supervisor
        }
    }

    fn write_csr(&mut self, id: CsrId, value: u64, effects: &mut WriteEffects) {
        self.csrs
            .write_id(id, value, &self.state, &mut self.log, effects);
    }

    fn cause_value(&self, interrupt: bool, code: u64) -> u64 {
        let interrupt_bit = (interrupt as u64) << (self.config.xlen.bits() - 1);
        interrupt_bit | code
    }

    fn trap_to_vs(&mut self, cause: &TrapCause, effects: &mut WriteEffects) {
        let Some(h) = self.csrs.ids.hypervisor.clone() else {
            return;
        };
        let (tval, ..) = cause.payload();
        let code = match cause {
            TrapCause::Interrupt(i) if i.is_virtual_supervisor() => i.code() - 1,
            _ => cause.code(),
        };
        let privilege = self.state.privilege;

        self.write_csr(h.vsepc, self.pc, effects);
        let vscause = self.cause_value(cause.is_interrupt(), code);
        self.write_csr(h.vscause, vscause, effects);
        self.write_csr(h.vstval, tval, effects);
        let vsstatus = self.csrs.vsstatus();
        let vsstatus = vsstatus
            .with_spie(vsstatus.sie())
            .with_sie(false)
            .with_spp(privilege);
        self.write_csr(h.vsstatus, vsstatus.value(), effects);

        let vstvec = Tvec(self.csrs.raw(h.vstvec));
        self.set_mode(PrivilegeLevel::Supervisor, true);
        self.pc = vstvec.target(cause.is_interrupt(), code);
    }

    fn trap_to_hs(&mut self, cause: &TrapCause, effects: &mut WriteEffects) {
        let Some(s) = self.csrs.ids.supervisor.clone() else {
            return;
        };
        let (tval, tval2, tinst, gva) = cause.payload();
        let code = cause.code();
        let (privilege, virtualized) = (self.state.privilege, self.state.virtualized);

        self.write_csr(s.sepc, self.pc, effects);
        let scause = self.cause_value(cause.is_interrupt(), code);
        self.write_csr(s.scause, scause, effects);
        self.write_csr(s.stval, tval, effects);
        if let Some(h) = self.csrs.ids.hypervisor.clone() {
            self.write_csr(h.htval, tval2, effects);
            self.write_csr(h.htinst, tinst, effects);
            let mut hstatus = Hstatus(self.csrs.hstatus())
                .with_spv(virtualized)
                .with_gva(gva);
            if virtualized {
                hstatus = hstatus.with_spvp(privilege);
            }
            self.write_csr(h.hstatus, hstatus.0, effects);
        }
        let mstatus = self.csrs.mstatus();
        let mstatus = mstatus
            .with_spie(mstatus.sie())
            .with_sie(false)
            .with_spp(privilege);
        self.write_csr(self.csrs.ids.mstatus, mstatus.value(), effects);

        let stvec = Tvec(self.csrs.raw(s.stvec));
        self.set_mode(PrivilegeLevel::Supervisor, false);
        self.pc = stvec.target(cause.is_interrupt(), code);
    }

    fn trap_to_m(&mut self, cause: &TrapCause, effects: &mut WriteEffects) {
        let (tval, tval2, tinst, gva) = cause.payload();
        let code = cause.code();
        let (privilege, virtualized) = (self.state.privilege, self.state.virtualized);
        let ids = &self.csrs.ids;
        let (mepc, mcause, mtval, mstatus_id, mtvec) =
            (ids.mepc, ids.mcause, ids.mtval, ids.mstatus, ids.mtvec);

        self.write_csr(mepc, self.pc, effects);
        let value = self.cause_value(cause.is_interrupt(), code);
        self.write_csr(mcause, value, effects);
        self.write_csr(mtval, tval, effects);
        let mut mstatus = self.csrs.mstatus();
        mstatus = mstatus
            .with_mpie(mstatus.mie())
            .with_mie(false)
            .with_mpp(privilege);
        if let Some(h) = self.csrs.ids.hypervisor.clone() {
            self.write_csr(h.mtval2, tval2, effects);
            self.write_csr(h.mtinst, tinst, effects);
            mstatus = mstatus.with_mpv(virtualized).with_gva(gva);
        }
        self.write_csr(mstatus_id, mstatus.value(), effects);

        let mtvec = Tvec(self.csrs.raw(mtvec));
        self.set_mode(PrivilegeLevel::Machine, false);
        self.pc = mtvec.target(cause.is_interrupt(), code);
    }

    /// `mret`: returns from an M-mode trap handler.
    ///
    /// > An MRET or SRET instruction is used to return from a trap in M-mode or S-mode
    /// > respectively. When executing an xRET instruction, supposing xPP holds the value y, xIE
    /// > is set to xPIE; the privilege mode is changed to y; xPIE is set to 1; and xPP is set to
    /// > the least-privileged supported mode (U if U-mode is implemented, else M). If y≠M, xRET
    /// > also sets MPRV=0.
    pub fn mret(&mut self) -> Result<(), Exception> {
        if self.state.privilege != PrivilegeLevel::Machine || self.state.debug_mode {
            return Err(Exception::illegal_instruction());
        }
        let mstatus = self.csrs.mstatus();
        let target = PrivilegeLevel::try_from(mstatus.mpp()).unwrap_or(PrivilegeLevel::Machine);
        let virtualized = mstatus.mpv() && target != PrivilegeLevel::Machine;
        let least = match self.config.extensions.user {
            true => PrivilegeLevel::User,
            false => PrivilegeLevel::Machine,
        };
        let mut mstatus = mstatus
            .with_mie(mstatus.mpie())
            .with_mpie(true)
            .with_mpp(least);
        if self.config.extensions.hypervisor {
            mstatus = mstatus.with_mpv(false);
        }
        if target != PrivilegeLevel::Machine {
            mstatus = mstatus.with_mprv(false);
        }
        let mut effects = WriteEffects::default();
        let ids = &self.csrs.ids;
        let (mstatus_id, mepc) = (ids.mstatus, ids.mepc);
        self.write_csr(mstatus_id, mstatus.value(), &mut effects);
        let pc = self.csrs.read_id(mepc, &self.state);
        self.set_mode(target, virtualized);
        self.apply(effects);
        self.pc = pc;
        debug!("mret to {} at {pc:#x}", self.state);
        Ok(())
    }

    /// `sret`: returns from an HS-mode, S-mode or VS-mode trap handler.
    ///
    /// > When TSR=1, attempts to execute SRET while executing in S-mode will raise an
    /// > illegal-instruction exception.
    pub fn sret(&mut self) -> Result<(), Exception> {
        let state = self.state;
        if !self.config.extensions.supervisor || state.debug_mode {
            return Err(Exception::illegal_instruction());
        }
        match (state.privilege, state.virtualized) {
            (PrivilegeLevel::User, true) => return Err(Exception::virtual_instruction()),
            (PrivilegeLevel::User, false) => return Err(Exception::illegal_instruction()),
            (PrivilegeLevel::Supervisor, false) if self.csrs.mstatus().tsr() => {
                return Err(Exception::illegal_instruction());
            }
            (PrivilegeLevel::Supervisor, true) if Hstatus(self.csrs.hstatus()).vtsr() => {
                return Err(Exception::virtual_instruction());
            }
            _ => {}
        }

        let mut effects = WriteEffects::default();
        if state.virtualized {
            let Some(h) = self.csrs.ids.hypervisor.clone() else {
                return Err(Exception::illegal_instruction());
            };
            let vsstatus = self.csrs.vsstatus();
            let target = vsstatus.spp();
            let vsstatus = vsstatus
                .with_sie(vsstatus.spie())
                .with_spie(true)
                .with_spp(PrivilegeLevel::User);
            self.write_csr(h.vsstatus, vsstatus.value(), &mut effects);
            let pc = self.csrs.read_id(h.vsepc, &self.state);
            self.set_mode(target, true);
            self.apply(effects);
            self.pc = pc;
            debug!("sret to {} at {pc:#x}", self.state);
            return Ok(());
        }

        let Some(s) = self.csrs.ids.supervisor.clone() else {
            return Err(Exception::illegal_instruction());
        };
        let mstatus = self.csrs.mstatus();
        let target = mstatus.spp();
        let mstatus = mstatus
            .with_sie(mstatus.spie())
            .with_spie(true)
            .with_spp(PrivilegeLevel::User)
            .with_mprv(false);
        self.write_csr(self.csrs.ids.mstatus, mstatus.value(), &mut effects);
        let mut virtualized = false;
        if let Some(h) = self.csrs.ids.hypervisor.clone() {
            let hstatus = Hstatus(self.csrs.hstatus());
            virtualized = hstatus.spv();
            self.write_csr(h.hstatus, hstatus.with_spv(false).0, &mut effects);
        }
        let pc = self.csrs.read_id(s.sepc, &self.state);
        self.set_mode(target, virtualized);
        self.apply(effects);
        self.pc = pc;
        debug!("sret to {} at {pc:#x}", self.state);
        Ok(())
    }

    /// `dret`: leaves debug mode, restoring the mode saved in `dcsr` and the pc saved in `dpc`.
    pub fn dret(&mut self) -> Result<(), Exception> {
        if !self.state.debug_mode {
            return Err(Exception::illegal_instruction());
        }
        let dcsr = Dcsr(self.csrs.dcsr());
        let target = dcsr.prv();
        let virtualized = dcsr.v() && self.config.extensions.hypervisor;
        let mut effects = WriteEffects::default();
        if target != PrivilegeLevel::Machine {
            let mstatus = self.csrs.mstatus().with_mprv(false);
            self.write_csr(self.csrs.ids.mstatus, mstatus.value(), &mut effects);
        }
        let pc = self.csrs.read_id(self.csrs.ids.dpc, &self.state);
        self.state.debug_mode = false;
        // Leaving debug mode changes the effective privilege even if the mode is unchanged.
        self.tlb.flush();
        self.set_mode(target, virtualized);
        self.apply(effects);
        self.pc = pc;
        debug!("Leaving debug mode to {} at {pc:#x}", self.state);
        Ok(())
    }

    /// Enters debug mode, as on a halt request, a single step, an `ebreak` or a trigger.
    pub fn enter_debug_mode(&mut self, cause: DebugCause) {
        if self.state.debug_mode {
            return;
        }
        let dcsr = Dcsr(self.csrs.dcsr()).entered(&self.state, cause);
        self.csrs.set_raw(self.csrs.ids.dcsr, dcsr.0);
        let dpc = self.csrs.ids.dpc;
        self.csrs.set_raw(dpc, self.pc);
        self.log.log_csr(super::csr::DPC, self.pc);
        self.log.log_csr(super::csr::DCSR, dcsr.0);
        debug!("Entering debug mode from {} ({cause:?})", self.state);
        self.set_mode(PrivilegeLevel::Machine, false);
        self.state.debug_mode = true;
        self.tlb.flush();
        self.pc = self.config.debug_rom_entry;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{csr, debug, interrupts::mip, status};
    use crate::resources::ram::Ram;
    use crate::Config;

    fn new_hart(config: Config) -> Hart<Ram> {
        Hart::new(config, Ram::new(0, 0x1_0000).unwrap()).unwrap()
    }

    fn hypervisor_config() -> Config {
        let mut config = Config::default();
        config.extensions.hypervisor = true;
        config
    }

    #[test]
    fn test_mret_restores_previous_mode() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::STVEC, 0x300).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        hart.set_pc(0x2000);
        hart.raise_trap(Exception::new(ExceptionCause::EnvironmentCallFromSMode));
        assert_eq!(PrivilegeLevel::Machine, hart.state().privilege);
        assert_eq!(Some(0x2000), hart.peek_csr(csr::MEPC));

        hart.csr_write(csr::MEPC, 0x2004).unwrap();
        hart.mret().unwrap();
        assert_eq!(PrivilegeLevel::Supervisor, hart.state().privilege);
        assert_eq!(0x2004, hart.pc());
        let mstatus = hart.cs_registers().mstatus();
        assert_eq!(PrivilegeLevel::User, mstatus.mpp());
        assert!(mstatus.mpie());
        assert_eq!(Err(Exception::illegal_instruction()), hart.mret());
    }

    #[test]
    fn test_mret_clears_mprv_below_machine() {
        let mut hart = new_hart(Config::default());
        let mstatus = hart
            .cs_registers()
            .mstatus()
            .with_mprv(true)
            .with_mpp(PrivilegeLevel::User);
        hart.csr_write(csr::MSTATUS, mstatus.value()).unwrap();
        hart.mret().unwrap();
        assert_eq!(PrivilegeLevel::User, hart.state().privilege);
        assert!(!hart.cs_registers().mstatus().mprv());
    }

    #[test]
    fn test_sret_honors_tsr() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::MSTATUS, 1 << status::idx::TSR).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        assert_eq!(Err(Exception::illegal_instruction()), hart.sret());
        hart.set_mode(PrivilegeLevel::User, false);
        assert_eq!(Err(Exception::illegal_instruction()), hart.sret());
    }

    #[test]
    fn test_sret_returns_to_user() {
        let mut hart = new_hart(Config::default());
        hart.csr_write(csr::MEDELEG, 1 << ExceptionCause::EnvironmentCallFromUMode.code())
            .unwrap();
        hart.csr_write(csr::STVEC, 0x500).unwrap();
        hart.set_mode(PrivilegeLevel::User, false);
        hart.set_pc(0x40);
        hart.raise_trap(Exception::new(ExceptionCause::EnvironmentCallFromUMode));
        assert_eq!(PrivilegeLevel::Supervisor, hart.state().privilege);
        assert_eq!(0x500, hart.pc());
        assert_eq!(PrivilegeLevel::User, hart.cs_registers().mstatus().spp());

        hart.sret().unwrap();
        assert_eq!(PrivilegeLevel::User, hart.state().privilege);
        assert_eq!(0x40, hart.pc());
        assert!(hart.cs_registers().mstatus().spie());
    }

    #[test]
    fn test_vs_trap_and_return() {
        let mut hart = new_hart(hypervisor_config());
        let code = ExceptionCause::EnvironmentCallFromUMode.code();
        hart.csr_write(csr::MEDELEG, 1 << code).unwrap();
        hart.csr_write(csr::HEDELEG, 1 << code).unwrap();
        hart.csr_write(csr::VSTVEC, 0x700).unwrap();
        hart.set_mode(PrivilegeLevel::User, true);
        hart.set_pc(0x80);
        hart.raise_trap(Exception::new(ExceptionCause::EnvironmentCallFromUMode));

        assert_eq!(PrivilegeLevel::Supervisor, hart.state().privilege);
        assert!(hart.state().virtualized);
        assert_eq!(0x700, hart.pc());
        // Reads of S-level registers see the VS copies while V=1.
        assert_eq!(Some(0x80), hart.peek_csr(csr::SEPC));
        assert_eq!(Some(code), hart.peek_csr(csr::SCAUSE));
        assert_eq!(Some(0), hart.peek_csr(csr::MCAUSE));

        hart.sret().unwrap();
        assert_eq!(PrivilegeLevel::User, hart.state().privilege);
        assert!(hart.state().virtualized);
        assert_eq!(0x80, hart.pc());
    }

    #[test]
    fn test_hs_trap_records_guest_state() {
        let mut hart = new_hart(hypervisor_config());
        let cause = ExceptionCause::LoadGuestPageFault;
        hart.csr_write(csr::MEDELEG, 1 << cause.code()).unwrap();
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        hart.raise_trap(Exception {
            tval2: 0x400,
            gva: true,
            ..Exception::with_tval(cause, 0x1234)
        });
        assert_eq!(PrivilegeLevel::Supervisor, hart.state().privilege);
        assert!(!hart.state().virtualized);
        assert_eq!(Some(0x400), hart.peek_csr(csr::HTVAL));
        assert_eq!(Some(0x1234), hart.peek_csr(csr::STVAL));
        let hstatus = Hstatus(hart.peek_csr(csr::HSTATUS).unwrap());
        assert!(hstatus.spv());
        assert!(hstatus.spvp());

        // sret returns into the guest.
        hart.sret().unwrap();
        assert!(hart.state().virtualized);
        assert_eq!(PrivilegeLevel::Supervisor, hart.state().privilege);
    }

    #[test]
    fn test_virtual_supervisor_interrupt_code() {
        let mut hart = new_hart(hypervisor_config());
        hart.csr_write(csr::HIDELEG, mip::VSTIP).unwrap();
        hart.csr_write(csr::MIE, mip::VSTIP).unwrap();
        hart.set_mode(PrivilegeLevel::User, true);
        hart.set_interrupt_pending(mip::VSTIP, true);
        assert_eq!(
            Some(Interrupt::VirtualSupervisorTimer),
            hart.poll_interrupts()
        );
        assert!(hart.state().virtualized);
        assert_eq!(Some(1 << 63 | 5), hart.peek_csr(csr::SCAUSE));
    }

    #[test]
    fn test_ebreak_enters_debug_mode() {
        let mut hart = new_hart(Config::default());
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        hart.set_pc(0x1230);
        // dcsr is only reachable from debug mode, so set it through a halt request.
        hart.enter_debug_mode(DebugCause::HaltRequest);
        assert!(hart.state().debug_mode);
        assert_eq!(0x800, hart.pc());
        let dcsr = hart.csr_read(csr::DCSR).unwrap();
        assert_eq!(PrivilegeLevel::Supervisor, Dcsr(dcsr).prv());
        hart.csr_write(csr::DCSR, dcsr | 1 << debug::idx::EBREAKS)
            .unwrap();
        hart.dret().unwrap();
        assert!(!hart.state().debug_mode);
        assert_eq!(PrivilegeLevel::Supervisor, hart.state().privilege);
        assert_eq!(0x1230, hart.pc());

        hart.set_pc(0x1240);
        hart.raise_trap(Exception::with_tval(ExceptionCause::Breakpoint, 0x1240));
        assert!(hart.state().debug_mode);
        assert_eq!(Some(0x1240), hart.peek_csr(csr::DPC));
        assert_eq!(Some(0), hart.peek_csr(csr::MCAUSE));
        let dcsr = Dcsr(hart.peek_csr(csr::DCSR).unwrap());
        assert_eq!(1, dcsr.0 >> debug::idx::CAUSE & 0b111);
    }

    #[test]
    fn test_exception_in_debug_mode_goes_to_rom() {
        let mut hart = new_hart(Config::default());
        hart.enter_debug_mode(DebugCause::HaltRequest);
        hart.raise_trap(Exception::illegal_instruction());
        assert_eq!(0x808, hart.pc());
        assert!(hart.state().debug_mode);
        assert_eq!(Some(0), hart.peek_csr(csr::MCAUSE));
        assert_eq!(Err(Exception::illegal_instruction()), hart.mret());
    }

    #[test]
    fn test_debug_registers_need_debug_mode() {
        let hart = new_hart(Config::default());
        assert_eq!(Err(Exception::illegal_instruction()), hart.csr_read(csr::DPC));
    }
}
