//! Specifiers for all supported CSRs.
//!
//! Numbered families (performance counters, PMP registers) are given by their first member plus
//! an offset helper, e.g. [`pmpaddr`].

use crate::RawPrivilegeLevel;

/// General 12-bit value representing a CSR specifier. Note that this can hold any 12-bit value,
/// even if the value represents an unsupported or non-existent CSR.
pub type CsrSpecifier = u16;

//
// Unprivileged floating-point CSRs (`0x001..=0x003`).
//
/// Floating-point accrued exceptions.
pub const FFLAGS: CsrSpecifier = 0x001;
/// Floating-point dynamic rounding mode.
pub const FRM: CsrSpecifier = 0x002;
/// Floating-point CSR ([`FRM`] + [`FFLAGS`]).
pub const FCSR: CsrSpecifier = 0x003;

//
// Unprivileged counters/timers (`0xC00..=0xC1F`, `0xC80..=0xC9F`).
//
/// Cycle counter for RDCYCLE instruction.
pub const CYCLE: CsrSpecifier = 0xC00;
/// Timer for RDTIME instruction.
pub const TIME: CsrSpecifier = 0xC01;
/// Instructions-retired counter for RDINSTRET instruction.
pub const INSTRET: CsrSpecifier = 0xC02;
/// First performance-monitoring counter, see [`hpmcounter`].
pub const HPMCOUNTER3: CsrSpecifier = 0xC03;
/// Upper 32 bits of [`CYCLE`], RV32 only.
pub const CYCLEH: CsrSpecifier = 0xC80;
/// Upper 32 bits of [`TIME`], RV32 only.
pub const TIMEH: CsrSpecifier = 0xC81;
/// Upper 32 bits of [`INSTRET`], RV32 only.
pub const INSTRETH: CsrSpecifier = 0xC82;
/// Upper 32 bits of [`HPMCOUNTER3`], RV32 only.
pub const HPMCOUNTER3H: CsrSpecifier = 0xC83;

//
// Supervisor trap setup (`0x100`, `0x104..=0x106`).
//
/// Supervisor status register.
pub const SSTATUS: CsrSpecifier = 0x100;
/// Supervisor interrupt-enable register.
pub const SIE: CsrSpecifier = 0x104;
/// Supervisor trap handler base address.
pub const STVEC: CsrSpecifier = 0x105;
/// Supervisor counter enable.
pub const SCOUNTEREN: CsrSpecifier = 0x106;
/// Supervisor environment configuration register.
pub const SENVCFG: CsrSpecifier = 0x10A;

//
// Supervisor trap handling (`0x140..=0x144`).
//
/// Scratch register for supervisor trap handling.
pub const SSCRATCH: CsrSpecifier = 0x140;
/// Supervisor exception program counter.
pub const SEPC: CsrSpecifier = 0x141;
/// Supervisor trap cause.
pub const SCAUSE: CsrSpecifier = 0x142;
/// Supervisor bad address or instruction.
pub const STVAL: CsrSpecifier = 0x143;
/// Supervisor interrupt pending.
pub const SIP: CsrSpecifier = 0x144;
/// Supervisor address translation and protection.
pub const SATP: CsrSpecifier = 0x180;

//
// Hypervisor trap setup and handling (`0x600..=0x64A`, `0xE12`).
//
/// Hypervisor status register.
pub const HSTATUS: CsrSpecifier = 0x600;
/// Hypervisor exception delegation register.
pub const HEDELEG: CsrSpecifier = 0x602;
/// Hypervisor interrupt delegation register.
pub const HIDELEG: CsrSpecifier = 0x603;
/// Hypervisor interrupt-enable register.
pub const HIE: CsrSpecifier = 0x604;
/// Hypervisor counter enable.
pub const HCOUNTEREN: CsrSpecifier = 0x606;
/// Hypervisor guest external interrupt-enable register.
pub const HGEIE: CsrSpecifier = 0x607;
/// Hypervisor bad guest physical address.
pub const HTVAL: CsrSpecifier = 0x643;
/// Hypervisor interrupt pending.
pub const HIP: CsrSpecifier = 0x644;
/// Hypervisor virtual interrupt pending.
pub const HVIP: CsrSpecifier = 0x645;
/// Hypervisor trap instruction (transformed).
pub const HTINST: CsrSpecifier = 0x64A;
/// Hypervisor guest external interrupt pending.
pub const HGEIP: CsrSpecifier = 0xE12;
/// Hypervisor environment configuration register.
pub const HENVCFG: CsrSpecifier = 0x60A;
/// Upper 32 bits of [`HENVCFG`], RV32 only.
pub const HENVCFGH: CsrSpecifier = 0x61A;
/// Hypervisor guest address translation and protection.
pub const HGATP: CsrSpecifier = 0x680;

//
// Virtual supervisor registers (`0x200..=0x280`).
//
/// Virtual supervisor status register.
pub const VSSTATUS: CsrSpecifier = 0x200;
/// Virtual supervisor interrupt-enable register.
pub const VSIE: CsrSpecifier = 0x204;
/// Virtual supervisor trap handler base address.
pub const VSTVEC: CsrSpecifier = 0x205;
/// Virtual supervisor scratch register.
pub const VSSCRATCH: CsrSpecifier = 0x240;
/// Virtual supervisor exception program counter.
pub const VSEPC: CsrSpecifier = 0x241;
/// Virtual supervisor trap cause.
pub const VSCAUSE: CsrSpecifier = 0x242;
/// Virtual supervisor bad address or instruction.
pub const VSTVAL: CsrSpecifier = 0x243;
/// Virtual supervisor interrupt pending.
pub const VSIP: CsrSpecifier = 0x244;
/// Virtual supervisor address translation and protection.
pub const VSATP: CsrSpecifier = 0x280;

//
// Machine information registers (`0xF11..=0xF15`).
//
/// Vendor ID.
pub const MVENDORID: CsrSpecifier = 0xF11;
/// Architecture ID.
pub const MARCHID: CsrSpecifier = 0xF12;
/// Implementation ID.
pub const MIMPID: CsrSpecifier = 0xF13;
/// Hardware thread ID.
pub const MHARTID: CsrSpecifier = 0xF14;
/// Pointer to configuration data structure.
pub const MCONFIGPTR: CsrSpecifier = 0xF15;

//
// Machine trap setup (`0x300..=0x306`, `0x310`).
//
/// Machine status register.
pub const MSTATUS: CsrSpecifier = 0x300;
/// ISA and extensions.
pub const MISA: CsrSpecifier = 0x301;
/// Machine exception delegation register.
pub const MEDELEG: CsrSpecifier = 0x302;
/// Machine interrupt delegation register.
pub const MIDELEG: CsrSpecifier = 0x303;
/// Machine interrupt-enable register.
pub const MIE: CsrSpecifier = 0x304;
/// Machine trap-handler base address.
pub const MTVEC: CsrSpecifier = 0x305;
/// Machine counter enable.
pub const MCOUNTEREN: CsrSpecifier = 0x306;
/// Additional machine status register, RV32 only.
pub const MSTATUSH: CsrSpecifier = 0x310;

//
// Machine trap handling (`0x340..=0x34B`).
//
/// Scratch register for machine trap handlers.
pub const MSCRATCH: CsrSpecifier = 0x340;
/// Machine exception program counter.
pub const MEPC: CsrSpecifier = 0x341;
/// Machine trap cause.
pub const MCAUSE: CsrSpecifier = 0x342;
/// Machine bad address or instruction.
pub const MTVAL: CsrSpecifier = 0x343;
/// Machine interrupt pending.
pub const MIP: CsrSpecifier = 0x344;
/// Machine trap instruction (transformed).
pub const MTINST: CsrSpecifier = 0x34A;
/// Machine bad guest physical address.
pub const MTVAL2: CsrSpecifier = 0x34B;

//
// Machine configuration (`0x30A`, `0x31A`, `0x747`).
//
/// Machine environment configuration register.
pub const MENVCFG: CsrSpecifier = 0x30A;
/// Upper 32 bits of [`MENVCFG`], RV32 only.
pub const MENVCFGH: CsrSpecifier = 0x31A;
/// Machine security configuration register.
pub const MSECCFG: CsrSpecifier = 0x747;
/// Upper 32 bits of [`MSECCFG`], RV32 only.
pub const MSECCFGH: CsrSpecifier = 0x757;

//
// Machine memory protection (`0x3A0..=0x3EF`).
//
/// First physical memory protection configuration register, see [`pmpcfg`].
pub const PMPCFG0: CsrSpecifier = 0x3A0;
/// First physical memory protection address register, see [`pmpaddr`].
pub const PMPADDR0: CsrSpecifier = 0x3B0;

//
// Machine counters/timers (`0xB00..=0xB1F`, `0xB80..=0xB9F`).
//
/// Machine cycle counter.
pub const MCYCLE: CsrSpecifier = 0xB00;
/// Machine instructions-retired counter.
pub const MINSTRET: CsrSpecifier = 0xB02;
/// First machine performance-monitoring counter, see [`mhpmcounter`].
pub const MHPMCOUNTER3: CsrSpecifier = 0xB03;
/// Upper 32 bits of [`MCYCLE`], RV32 only.
pub const MCYCLEH: CsrSpecifier = 0xB80;
/// Upper 32 bits of [`MINSTRET`], RV32 only.
pub const MINSTRETH: CsrSpecifier = 0xB82;
/// Upper 32 bits of [`MHPMCOUNTER3`], RV32 only.
pub const MHPMCOUNTER3H: CsrSpecifier = 0xB83;

//
// Machine counter setup (`0x320..=0x33F`).
//
/// Machine counter-inhibit register.
pub const MCOUNTINHIBIT: CsrSpecifier = 0x320;
/// First machine performance-monitoring event selector, see [`mhpmevent`].
pub const MHPMEVENT3: CsrSpecifier = 0x323;

//
// Debug/trace registers (`0x7A0..=0x7A4`)
//
/// Debug/trace trigger register select.
pub const TSELECT: CsrSpecifier = 0x7A0;
/// First debug/trace trigger data register.
pub const TDATA1: CsrSpecifier = 0x7A1;
/// Second debug/trace trigger data register.
pub const TDATA2: CsrSpecifier = 0x7A2;
/// Third debug/trace trigger data register.
pub const TDATA3: CsrSpecifier = 0x7A3;
/// Trigger info.
pub const TINFO: CsrSpecifier = 0x7A4;

//
// Debug mode registers (`0x7B0..=0x7B3`)
//
/// Debug control and status register.
pub const DCSR: CsrSpecifier = 0x7B0;
/// Debug program counter.
pub const DPC: CsrSpecifier = 0x7B1;
/// Debug scratch register 0.
pub const DSCRATCH0: CsrSpecifier = 0x7B2;
/// Debug scratch register 1.
pub const DSCRATCH1: CsrSpecifier = 0x7B3;

/// Performance-monitoring counter `n` (`3..=31`).
pub const fn hpmcounter(n: u16) -> CsrSpecifier {
    CYCLE + n
}

/// Upper 32 bits of performance-monitoring counter `n` (`3..=31`), RV32 only.
pub const fn hpmcounterh(n: u16) -> CsrSpecifier {
    CYCLEH + n
}

/// Machine performance-monitoring counter `n` (`3..=31`).
pub const fn mhpmcounter(n: u16) -> CsrSpecifier {
    MCYCLE + n
}

/// Upper 32 bits of machine performance-monitoring counter `n` (`3..=31`), RV32 only.
pub const fn mhpmcounterh(n: u16) -> CsrSpecifier {
    MCYCLEH + n
}

/// Machine performance-monitoring event selector `n` (`3..=31`).
pub const fn mhpmevent(n: u16) -> CsrSpecifier {
    MCOUNTINHIBIT + n
}

/// PMP configuration register `n` (`0..=15`). On RV64, only even `n` exist.
pub const fn pmpcfg(n: u16) -> CsrSpecifier {
    PMPCFG0 + n
}

/// PMP address register `n` (`0..=63`).
pub const fn pmpaddr(n: u16) -> CsrSpecifier {
    PMPADDR0 + n
}

/// Returns `true` if `specifier` is valid, which is the case if it fits in 12 bits.
pub fn is_valid(specifier: CsrSpecifier) -> bool {
    specifier < 1 << 12
}

/// Returns `true` if this CSR only supports read access.
///
/// Requires [`is_valid(specifier)`](is_valid), otherwise the return value is undefined.
pub fn is_read_only(specifier: CsrSpecifier) -> bool {
    // The top two bits of a CSR specifier indicate whether the CSR is read-only (0b11) or
    // read/write (0b00, 0b01, 0b10)
    specifier >> 10 == 0b11
}

/// Returns the minimum required privilege level to access this CSR.
///
/// Requires [`is_valid(specifier)`](is_valid), otherwise the return value is undefined.
///
/// Note that this returns a [`RawPrivilegeLevel`], meaning the minimum required privilege level
/// may be the reserved level, which denotes the hypervisor tier: accessible from HS-mode and
/// M-mode only.
pub fn required_privilege_level(specifier: CsrSpecifier) -> RawPrivilegeLevel {
    // Bits `9:8` indicate the minimum required privilege level
    RawPrivilegeLevel::from_u2(((specifier >> 8) & 0b11) as u8)
}

/// Returns `true` for CSRs that only exist on RV32, holding the upper half of a 64-bit register.
pub fn is_rv32_only(specifier: CsrSpecifier) -> bool {
    matches!(
        specifier,
        MSTATUSH | MENVCFGH | MSECCFGH | HENVCFGH | 0xB80..=0xB9F | 0xC80..=0xC9F
    )
}

const_assert!(PMPADDR0 + 63 == 0x3EF);
const_assert!(MCOUNTINHIBIT + 31 == 0x33F);
