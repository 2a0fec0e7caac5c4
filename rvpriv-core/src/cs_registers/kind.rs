use super::gate::Gate;
use super::warl::Warl;
use crate::core::csr::CsrSpecifier;

/// Stable index of an instance in the register arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CsrId(pub(crate) u16);

impl CsrId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One register instance.
///
/// `address` is the architectural address the instance represents. Hidden instances (e.g. the
/// host side of a virtualized register) carry the address of the register they implement, which
/// is what the commit log reports when they are written.
#[derive(Debug, Clone)]
pub struct Csr {
    pub address: CsrSpecifier,
    pub kind: Kind,
    pub gate: Option<Gate>,
    pub flush: Flush,
    pub effect: Effect,
    /// Kind (with its value) restored on reset.
    pub(crate) reset: Kind,
}

impl Csr {
    pub fn new(address: CsrSpecifier, kind: Kind) -> Self {
        Self {
            address,
            reset: kind.clone(),
            kind,
            gate: None,
            flush: Flush::Never,
            effect: Effect::None,
        }
    }
}

/// Behavior of an instance. Every instance has exactly one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// Holds its own value; writes replace it.
    Basic { value: u64 },
    /// Only the bits in `mask` are writable. The result is passed through `warl` for
    /// register-specific legalization.
    Masked { value: u64, mask: u64, warl: Warl },
    /// Forwards to `original` when V=0 and to `shadow` when V=1.
    Virtualized { original: CsrId, shadow: CsrId },
    /// Forwards to `target` through `view`.
    Proxy { target: CsrId, view: View },
    /// Value is `upper << upper_lsb | lower`.
    Composite {
        upper: CsrId,
        lower: CsrId,
        upper_lsb: u32,
    },
    /// Fixed value; writes are discarded.
    Const { value: u64 },
    /// Free-running 64-bit counter. `written` records a CSR write during the current step, which
    /// suppresses the increment at the end of that step.
    Counter { value: u64, written: bool },
}

impl Kind {
    pub fn basic(value: u64) -> Self {
        Self::Basic { value }
    }

    pub fn masked(value: u64, mask: u64) -> Self {
        Self::Masked {
            value,
            mask,
            warl: Warl::None,
        }
    }

    pub fn warl(value: u64, mask: u64, warl: Warl) -> Self {
        Self::Masked { value, mask, warl }
    }

    pub fn constant(value: u64) -> Self {
        Self::Const { value }
    }

    pub fn counter() -> Self {
        Self::Counter {
            value: 0,
            written: false,
        }
    }

    pub fn proxy(target: CsrId, view: View) -> Self {
        Self::Proxy { target, view }
    }
}

/// How a [`Kind::Proxy`] presents its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum View {
    /// All bits, forwarded verbatim.
    Full,
    /// Reads are masked with `read`; only bits in `write` are writable. The write mask replaces
    /// the target's own mask.
    Masked { read: u64, write: u64 },
    /// Interrupt-pending or interrupt-enable view. Both masks are further restricted by the
    /// current value of `deleg` (if any). The target's bits are shifted right by `shift`.
    Interrupt {
        read: u64,
        write: u64,
        deleg: Option<CsrId>,
        shift: u32,
    },
    /// Bits 31:0 of a 64-bit register (RV32).
    Low,
    /// Bits 63:32 of a 64-bit register (RV32).
    High,
    /// The entry of `targets` selected by the value of `select`. Writes are ignored while the
    /// selected entry of `guards` is reserved for debug mode.
    Indexed {
        select: CsrId,
        targets: Box<[CsrId]>,
        guards: Box<[CsrId]>,
    },
}

/// When a write must invalidate the translation cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    Never,
    Always,
    /// When any of the given bits changes.
    OnChange(u64),
}

impl Flush {
    pub fn needed(self, old: u64, new: u64) -> bool {
        match self {
            Flush::Never => false,
            Flush::Always => true,
            Flush::OnChange(mask) => (old ^ new) & mask != 0,
        }
    }
}

/// Derived state that depends on an instance and must be rebuilt after it is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    Pmp,
    Triggers,
}

/// What a write requires the hart to do before the next instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteEffects {
    pub flush_tlb: bool,
    pub pmp_changed: bool,
    pub triggers_changed: bool,
}
