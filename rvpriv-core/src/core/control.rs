//! Trap vectors, exception delegation masks, and counter-enable bits.

use bitvec::{field::BitField, order::Lsb0, view::BitView};

use super::ExceptionCause;
use crate::config::Extensions;

/// Trap Vector Base Address Register (mtvec, stvec, and vstvec).
///
/// # mtvec
///
/// > The mtvec register is an MXLEN-bit WARL read/write register that holds trap vector
/// > configuration, consisting of a vector base address (BASE) and a vector mode (MODE).
///
/// > When MODE=Direct, all traps into machine mode cause the pc to be set to the address in the
/// > BASE field. When MODE=Vectored, all synchronous exceptions into machine mode cause the pc to
/// > be set to the address in the BASE field, whereas interrupts cause the pc to be set to the
/// > address in the BASE field plus four times the interrupt cause number. For example, a
/// > machine-mode timer interrupt [...] causes the pc to be set to BASE+0x1c.
///
/// # stvec
///
/// > The BASE field in stvec is a WARL field that can hold any valid virtual or physical address,
/// > subject to the following alignment constraints: the address must be 4-byte aligned, and MODE
/// > settings other than Direct might impose additional alignment constraints on the value in the
/// > BASE field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tvec(pub u64);

impl Tvec {
    /// Returns the vector base address (stored in BASE field).
    ///
    /// Note that the returned address was encoded in the field right shifted by 2 bits.
    pub fn base(self) -> u64 {
        self.0.view_bits::<Lsb0>()[2..].load_le::<u64>() << 2
    }

    /// Returns the vector mode (stored in MODE field).
    pub fn mode(self) -> VectorMode {
        // Values >= 2 are reserved and never stored, see `legalize`.
        match self.0.view_bits::<Lsb0>()[0] {
            false => VectorMode::Direct,
            true => VectorMode::Vectored,
        }
    }

    /// Address the pc is set to for a trap with the given cause code.
    pub fn target(self, interrupt: bool, code: u64) -> u64 {
        match (self.mode(), interrupt) {
            (VectorMode::Vectored, true) => self.base().wrapping_add(4 * code),
            _ => self.base(),
        }
    }

    /// A write with a reserved MODE is ignored entirely.
    ///
    /// Since this is a WARL register, we can set the register to any legal value here.
    /// Choose to preserve the old value, matching the behavior of QEMU's implementation.
    pub fn legalize(old: u64, new: u64) -> u64 {
        if new & 0b11 >= 2 {
            old
        } else {
            new
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorMode {
    Direct,
    Vectored,
}

const fn cause_bit(cause: ExceptionCause) -> u64 {
    1 << cause as u64
}

/// Exceptions delegable to HS-mode (or S-mode) through `medeleg`.
///
/// Environment calls from M-mode can never be delegated. Guest page faults, virtual instruction
/// faults and environment calls from VS-mode only exist with the hypervisor extension.
pub fn medeleg_mask(ext: &Extensions) -> u64 {
    use ExceptionCause::*;
    #[allow(clippy::identity_op)]
    let mut mask = 0
        | cause_bit(InstructionAddressMisaligned)
        | cause_bit(InstructionAccessFault)
        | cause_bit(IllegalInstruction)
        | cause_bit(Breakpoint)
        | cause_bit(LoadAddressMisaligned)
        | cause_bit(LoadAccessFault)
        | cause_bit(StoreOrAmoAddressMisaligned)
        | cause_bit(StoreOrAmoAccessFault)
        | cause_bit(EnvironmentCallFromUMode)
        | cause_bit(EnvironmentCallFromSMode)
        | cause_bit(InstructionPageFault)
        | cause_bit(LoadPageFault)
        | cause_bit(StoreOrAmoPageFault);
    if ext.hypervisor {
        mask |= cause_bit(EnvironmentCallFromVSMode)
            | cause_bit(InstructionGuestPageFault)
            | cause_bit(LoadGuestPageFault)
            | cause_bit(VirtualInstruction)
            | cause_bit(StoreOrAmoGuestPageFault);
    }
    mask
}

/// Exceptions delegable to VS-mode through `hedeleg`.
///
/// > Bits 10, 11, 20, 21, 22, and 23 of hedeleg are read-only zeros.
#[allow(clippy::identity_op)]
pub const HEDELEG_MASK: u64 = {
    use ExceptionCause::*;
    0 | cause_bit(InstructionAddressMisaligned)
        | cause_bit(InstructionAccessFault)
        | cause_bit(IllegalInstruction)
        | cause_bit(Breakpoint)
        | cause_bit(LoadAddressMisaligned)
        | cause_bit(LoadAccessFault)
        | cause_bit(StoreOrAmoAddressMisaligned)
        | cause_bit(StoreOrAmoAccessFault)
        | cause_bit(EnvironmentCallFromUMode)
        | cause_bit(InstructionPageFault)
        | cause_bit(LoadPageFault)
        | cause_bit(StoreOrAmoPageFault)
};

const_assert!(HEDELEG_MASK & (1 << 10) == 0);
const_assert!(HEDELEG_MASK & (0b1111 << 20) == 0);

/// Counter-enable registers (mcounteren, scounteren, hcounteren) are 32 bits wide, one bit per
/// counter.
pub const COUNTEREN_MASK: u64 = 0xFFFF_FFFF;

/// Bit indices shared by the counter-enable and counter-inhibit registers.
pub mod counter_idx {
    pub const CY: usize = 0;
    pub const TM: usize = 1;
    pub const IR: usize = 2;
}

/// `mcountinhibit`: TM is read-only zero, since `time` is a shadow of a platform timer.
pub const MCOUNTINHIBIT_MASK: u64 = COUNTEREN_MASK & !(1 << counter_idx::TM);

/// Returns `true` if counter `index` is enabled in a counter-enable register value.
pub fn counter_enabled(counteren: u64, index: usize) -> bool {
    index < 32 && counteren.view_bits::<Lsb0>()[index]
}
