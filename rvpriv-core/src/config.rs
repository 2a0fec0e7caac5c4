//! Immutable hart configuration, validated once at construction.

use log::warn;
use thiserror::Error;

use crate::core::interrupts::{mip, SUPERVISOR_INTERRUPTS};
use crate::core::mmu::SatpMode;
use crate::Xlen;

/// Highest number of PMP entries the architecture allows.
pub const MAX_PMP_ENTRIES: usize = 64;

/// Highest number of triggers supported by this implementation.
pub const MAX_TRIGGERS: usize = 32;

/// How the page-table walker treats leaf PTEs whose A (accessed) or D (dirty) bit would have to
/// change for the current access.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AdUpdatePolicy {
    /// Raise the access-type-specific page fault and leave the PTE untouched, so that software
    /// maintains the bits.
    #[default]
    Fault,
    /// Set the missing bits in the PTE in memory and continue the translation.
    SetInPlace,
}

/// Optional ISA features.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Extensions {
    /// User mode.
    pub user: bool,
    /// Supervisor mode, with virtual memory.
    pub supervisor: bool,
    /// Hypervisor extension (two-stage translation, VS/VU modes).
    pub hypervisor: bool,
    /// Floating-point state (`fflags`, `frm`, `fcsr`, `mstatus.FS`).
    pub float: bool,
    /// Compressed instructions. Controls the alignment of `xepc` registers.
    pub compressed: bool,
    /// Page-based memory types (PBMT field in PTEs).
    pub svpbmt: bool,
    /// Enhanced PMP (`mseccfg`).
    pub smepmp: bool,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            user: true,
            supervisor: true,
            hypervisor: false,
            float: false,
            compressed: true,
            svpbmt: false,
            smepmp: false,
        }
    }
}

/// Configuration of a single hart. Consumed by [`Hart::new`](crate::Hart::new) and never
/// mutated afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub xlen: Xlen,
    pub extensions: Extensions,
    /// Width of physical addresses. Accesses beyond it are access faults.
    pub physical_address_bits: u32,
    /// Number of implemented PMP entries (`0..=64`).
    pub pmp_entries: usize,
    /// PMP granularity in bytes. Must be a power of two of at least 4.
    pub pmp_granularity: u64,
    /// If set, M-mode accesses matching an unlocked PMP entry ignore its permissions, as the
    /// privileged architecture prescribes. If not set, unlocked entries bind M-mode too.
    pub pmp_machine_bypass: bool,
    /// Number of address-match triggers.
    pub triggers: usize,
    /// Interrupts that `mideleg` can delegate. Subset of SSIP, STIP, and SEIP.
    pub delegable_interrupts: u64,
    /// Platform-specific interrupts, bit positions 16 and up.
    pub custom_interrupts: u64,
    /// Largest translation mode `satp` accepts.
    pub max_satp_mode: SatpMode,
    pub ad_update: AdUpdatePolicy,
    pub hart_id: u64,
    pub vendor_id: u64,
    pub arch_id: u64,
    pub impl_id: u64,
    /// Address to which the pc is reset.
    pub reset_vector: u64,
    /// If `true`, non-naturally-aligned memory accesses are supported.
    /// If `false`, they will generate an address-misaligned exception.
    pub support_misaligned_memory_access: bool,
    /// Record CSR writes and memory accesses in the commit log.
    pub log_commits: bool,
    pub commit_log_capacity: usize,
    /// Where the pc goes when entering debug mode.
    pub debug_rom_entry: u64,
    /// Where the pc goes on an exception taken while in debug mode.
    pub debug_rom_tvec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            xlen: Xlen::Rv64,
            extensions: Extensions::default(),
            physical_address_bits: 56,
            pmp_entries: 16,
            pmp_granularity: 4,
            pmp_machine_bypass: false,
            triggers: 4,
            delegable_interrupts: SUPERVISOR_INTERRUPTS,
            custom_interrupts: 0,
            max_satp_mode: SatpMode::Sv57,
            ad_update: AdUpdatePolicy::Fault,
            hart_id: 0,
            vendor_id: 0,
            arch_id: 0,
            impl_id: 0,
            reset_vector: 0x1000,
            support_misaligned_memory_access: false,
            log_commits: true,
            commit_log_capacity: 4096,
            debug_rom_entry: 0x800,
            debug_rom_tvec: 0x808,
        }
    }
}

impl Config {
    /// Default RV32 configuration.
    pub fn rv32() -> Self {
        Self {
            xlen: Xlen::Rv32,
            physical_address_bits: 34,
            max_satp_mode: SatpMode::Sv32,
            ..Self::default()
        }
    }

    /// Builds a configuration from an ISA string such as `rv64imafdch_svpbmt_smepmp` and a
    /// privilege-mode string such as `msu`.
    ///
    /// Single-letter extensions other than `f`, `d`, `c`, and `h` are accepted and ignored, since
    /// they don't affect privileged state. The `h` letter requires `s` in `privilege_modes`.
    pub fn from_isa_string(isa: &str, privilege_modes: &str) -> Result<Self, ConfigError> {
        let lower = isa.to_ascii_lowercase();
        let invalid = || ConfigError::InvalidIsaString(isa.to_owned());
        let (mut config, rest) = if let Some(rest) = lower.strip_prefix("rv32") {
            (Self::rv32(), rest)
        } else if let Some(rest) = lower.strip_prefix("rv64") {
            (Self::default(), rest)
        } else {
            return Err(invalid());
        };

        let mut parts = rest.split('_');
        let letters = parts.next().unwrap_or_default();
        if !letters.starts_with(['i', 'e', 'g']) {
            return Err(invalid());
        }
        let mut extensions = Extensions {
            user: false,
            supervisor: false,
            hypervisor: false,
            float: false,
            compressed: false,
            svpbmt: false,
            smepmp: false,
        };
        for letter in letters.chars() {
            match letter {
                'f' | 'd' | 'g' | 'q' => extensions.float = true,
                'c' => extensions.compressed = true,
                'h' => extensions.hypervisor = true,
                'a'..='z' => {}
                _ => return Err(invalid()),
            }
        }
        for multi in parts {
            match multi {
                "svpbmt" => extensions.svpbmt = true,
                "smepmp" => extensions.smepmp = true,
                "" => return Err(invalid()),
                _ => {}
            }
        }

        let modes = privilege_modes.to_ascii_lowercase();
        if !modes.contains('m') || modes.chars().any(|c| !matches!(c, 'm' | 's' | 'u')) {
            return Err(ConfigError::InvalidPrivilegeModes(privilege_modes.to_owned()));
        }
        extensions.supervisor = modes.contains('s');
        extensions.user = modes.contains('u');

        config.extensions = extensions;
        config.validate()?;
        Ok(config)
    }

    /// Checks this configuration for inconsistencies that make construction of a hart impossible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ext = &self.extensions;
        if ext.supervisor && !ext.user {
            return Err(ConfigError::SupervisorWithoutUser);
        }
        if ext.hypervisor && !ext.supervisor {
            return Err(ConfigError::HypervisorWithoutSupervisor);
        }
        let max_paddr = match self.xlen {
            Xlen::Rv32 => 34,
            Xlen::Rv64 => 56,
        };
        if !(12..=max_paddr).contains(&self.physical_address_bits) {
            return Err(ConfigError::PhysicalAddressWidth {
                bits: self.physical_address_bits,
                xlen: self.xlen,
            });
        }
        if self.pmp_entries > MAX_PMP_ENTRIES {
            return Err(ConfigError::TooManyPmpEntries(self.pmp_entries));
        }
        if self.pmp_granularity < 4 || !self.pmp_granularity.is_power_of_two() {
            return Err(ConfigError::PmpGranularity(self.pmp_granularity));
        }
        if self.triggers > MAX_TRIGGERS {
            return Err(ConfigError::TooManyTriggers(self.triggers));
        }
        if self.delegable_interrupts & !SUPERVISOR_INTERRUPTS != 0 {
            return Err(ConfigError::DelegableInterrupts(self.delegable_interrupts));
        }
        if self.custom_interrupts & (mip::CUSTOM_START - 1) != 0
            || self.custom_interrupts & !(self.xlen.mask() >> 1) != 0
        {
            return Err(ConfigError::CustomInterrupts(self.custom_interrupts));
        }
        if ext.supervisor && !self.max_satp_mode.is_valid_for(self.xlen) {
            return Err(ConfigError::SatpMode {
                mode: self.max_satp_mode,
                xlen: self.xlen,
            });
        }
        if ext.svpbmt && self.xlen == Xlen::Rv32 {
            return Err(ConfigError::SvpbmtOnRv32);
        }
        if self.log_commits && self.commit_log_capacity == 0 {
            warn!("Commit logging enabled with zero capacity; no events will be kept");
        }
        Ok(())
    }
}

/// Reasons a [`Config`] cannot be used to construct a hart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("S-mode requires U-mode")]
    SupervisorWithoutUser,
    #[error("the hypervisor extension requires S-mode")]
    HypervisorWithoutSupervisor,
    #[error("physical address width of {bits} bits is not supported on {xlen}")]
    PhysicalAddressWidth { bits: u32, xlen: Xlen },
    #[error("{0} PMP entries configured, at most 64 are allowed")]
    TooManyPmpEntries(usize),
    #[error("PMP granularity {0} is not a power of two of at least 4 bytes")]
    PmpGranularity(u64),
    #[error("{0} triggers configured, at most 32 are supported")]
    TooManyTriggers(usize),
    #[error("interrupts {0:#x} cannot be delegated to S-mode")]
    DelegableInterrupts(u64),
    #[error("custom interrupts {0:#x} must use bits 16 and up, below the interrupt bit")]
    CustomInterrupts(u64),
    #[error("translation mode {mode:?} is not valid on {xlen}")]
    SatpMode { mode: SatpMode, xlen: Xlen },
    #[error("Svpbmt is only defined for RV64")]
    SvpbmtOnRv32,
    #[error("invalid ISA string: {0:?}")]
    InvalidIsaString(String),
    #[error("invalid privilege modes: {0:?}")]
    InvalidPrivilegeModes(String),
}
