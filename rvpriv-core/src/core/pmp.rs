//! Physical Memory Protection, including the enhanced PMP (Smepmp) rules.
//!
//! > PMP entries are described by an 8-bit configuration register and one MXLEN-bit address
//! > register. Some PMP settings additionally use the address register associated with the
//! > preceding PMP entry.

use log::trace;

use super::AccessType;
use crate::cs_registers::CsRegisters;
use crate::{AddressRange, PrivilegeLevel};

/// Bits of a `pmpNcfg` byte.
pub mod cfg {
    pub const R: u8 = 1 << 0;
    pub const W: u8 = 1 << 1;
    pub const X: u8 = 1 << 2;
    pub const A_SHIFT: u8 = 3;
    pub const A: u8 = 0b11 << A_SHIFT;
    pub const L: u8 = 1 << 7;
}

/// Bits of `mseccfg`.
pub mod mseccfg {
    /// Machine Mode Lockdown.
    pub const MML: u64 = 1 << 0;
    /// Machine Mode Whitelist Policy.
    pub const MMWP: u64 = 1 << 1;
    /// Rule Locking Bypass.
    pub const RLB: u64 = 1 << 2;
}

const_assert!(cfg::A >> cfg::A_SHIFT == 0b11);
const_assert!(cfg::R | cfg::W | cfg::X | cfg::A | cfg::L == 0b1001_1111);

/// Address-matching mode of an entry (the A field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpMode {
    Off,
    /// Top of range: the entry covers `[pmpaddr{i-1}, pmpaddr{i})`.
    Tor,
    /// Naturally aligned four-byte region.
    Na4,
    /// Naturally aligned power-of-two region, at least eight bytes.
    Napot,
}

impl PmpMode {
    fn from_u2(value_u2: u8) -> Self {
        match value_u2 & 0b11 {
            0 => Self::Off,
            1 => Self::Tor,
            2 => Self::Na4,
            _ => Self::Napot,
        }
    }
}

/// Decoded `pmpNcfg` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmpCfg {
    pub r: bool,
    pub w: bool,
    pub x: bool,
    pub mode: PmpMode,
    pub locked: bool,
}

impl PmpCfg {
    pub fn from_u8(value: u8) -> Self {
        Self {
            r: value & cfg::R != 0,
            w: value & cfg::W != 0,
            x: value & cfg::X != 0,
            mode: PmpMode::from_u2((value & cfg::A) >> cfg::A_SHIFT),
            locked: value & cfg::L != 0,
        }
    }

    pub fn to_u8(self) -> u8 {
        let mut value = (self.mode as u8) << cfg::A_SHIFT;
        if self.r {
            value |= cfg::R;
        }
        if self.w {
            value |= cfg::W;
        }
        if self.x {
            value |= cfg::X;
        }
        if self.locked {
            value |= cfg::L;
        }
        value
    }

    /// Plain R/W/X check.
    fn permits(self, access: AccessType) -> bool {
        match access {
            AccessType::Fetch => self.x,
            AccessType::Load => self.r,
            AccessType::Store => self.w,
        }
    }

    /// Permissions under Machine Mode Lockdown, as `(r, w, x)`.
    ///
    /// With MML set, the meaning of an entry depends on L and on whether the mode accessing it is
    /// M. The otherwise reserved combination R=0,W=1 encodes regions shared between M-mode and
    /// S/U-mode.
    fn mml_permissions(self, machine: bool) -> (bool, bool, bool) {
        let Self { r, w, x, locked, .. } = self;
        match (locked, r, w, x) {
            (false, false, true, false) => match machine {
                true => (true, true, false),
                false => (true, false, false),
            },
            (false, false, true, true) => (true, true, false),
            (true, false, true, false) => (false, false, true),
            (true, false, true, true) => match machine {
                true => (true, false, true),
                false => (false, false, true),
            },
            (true, true, true, true) => (true, false, false),
            // Locked rules apply to M-mode only, unlocked rules to S/U-mode only.
            _ if locked == machine => (r, w, x),
            _ => (false, false, false),
        }
    }

    fn mml_permits(self, access: AccessType, machine: bool) -> bool {
        let (r, w, x) = self.mml_permissions(machine);
        match access {
            AccessType::Fetch => x,
            AccessType::Load => r,
            AccessType::Store => w,
        }
    }
}

/// Legalizes a write of `new` to a `pmpNcfg` byte currently holding `old`.
///
/// - Locked entries cannot be modified, unless `mseccfg.RLB` is set.
/// - Without MML, the reserved combination R=0,W=1 is turned into R=0,W=0.
/// - NA4 is not selectable if the granularity is above four bytes, and becomes NAPOT.
/// - With MML and without RLB, adding a locked rule that grants M-mode execution is not
///   possible, and the write is ignored.
pub fn legalize_cfg(old: u8, new: u8, seccfg: u64, granularity: u64) -> u8 {
    let rlb = seccfg & mseccfg::RLB != 0;
    let mml = seccfg & mseccfg::MML != 0;
    if PmpCfg::from_u8(old).locked && !rlb {
        return old;
    }
    let mut cfg = PmpCfg::from_u8(new);
    if !mml && cfg.w && !cfg.r {
        cfg.w = false;
    }
    if granularity > 4 && cfg.mode == PmpMode::Na4 {
        cfg.mode = PmpMode::Napot;
    }
    if mml && !rlb && cfg.locked && cfg.mml_permissions(true).2 {
        return old;
    }
    cfg.to_u8()
}

/// Legalizes a write to `mseccfg`. MML and MMWP are sticky: once set, they can only be cleared
/// by a reset. RLB can only be set while no entry is locked.
pub fn legalize_mseccfg(old: u64, new: u64, any_locked: bool) -> u64 {
    let sticky = mseccfg::MML | mseccfg::MMWP;
    let mut value = old & sticky | new & (sticky | mseccfg::RLB);
    if old & mseccfg::RLB == 0 && any_locked {
        value &= !mseccfg::RLB;
    }
    value
}

/// Value of `pmpaddrN` as read by software, given the stored value and the entry's cfg byte.
///
/// > Although changing pmpcfgi.A affects the value read from pmpaddri, it does not affect the
/// > underlying value stored in that register.
///
/// With a granularity of `2^(G+2)` bytes and G ≥ 1, bits `G-1:0` read as all ones in NAPOT
/// mode and bits `G-1:0` read as zeros in TOR and OFF mode. Bit `G-1` reads as one in NAPOT
/// mode for G ≥ 2 only through the all-ones rule above.
pub fn addr_read(raw: u64, cfg: u8, granularity: u64) -> u64 {
    let g = granularity.trailing_zeros().saturating_sub(2);
    if g == 0 {
        return raw;
    }
    match PmpCfg::from_u8(cfg).mode {
        PmpMode::Napot => raw | ((1 << (g - 1)) - 1),
        _ => raw & !((1 << g) - 1),
    }
}

/// One active entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmpEntry {
    pub index: usize,
    pub cfg: PmpCfg,
    /// Stored `pmpaddr` value (physical address bits 55:2).
    pub addr: u64,
}

/// Snapshot of the PMP configuration, rebuilt whenever a PMP register is written.
#[derive(Debug, Clone, Default)]
pub struct Pmp {
    entries: Vec<PmpEntry>,
    /// Byte ranges of `entries`, `None` for entries that match nothing.
    ranges: Vec<Option<AddressRange>>,
    seccfg: u64,
    machine_bypass: bool,
    any_locked: bool,
}

impl Pmp {
    pub fn new(
        entries: Vec<PmpEntry>,
        seccfg: u64,
        granularity: u64,
        machine_bypass: bool,
    ) -> Self {
        let g = granularity.trailing_zeros().saturating_sub(2);
        let tor_mask = !((1u64 << g) - 1);
        let ranges = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let top = entry.addr;
                match entry.cfg.mode {
                    PmpMode::Off => None,
                    PmpMode::Tor => {
                        let base = match i {
                            0 => 0,
                            _ => entries[i - 1].addr & tor_mask,
                        };
                        let end = (top & tor_mask) << 2;
                        end.checked_sub(1)
                            .and_then(|last| AddressRange::new(base << 2, last).ok())
                    }
                    PmpMode::Na4 => Some(AddressRange::access(top << 2, 4)),
                    PmpMode::Napot => {
                        let effective = top | ((1 << g.saturating_sub(1)) - 1);
                        let ones = effective.trailing_ones();
                        let low = 1u64.checked_shl(ones).map_or(u64::MAX, |bit| bit - 1);
                        let start = (effective & !low) << 2;
                        let span = 1u64.checked_shl(ones + 3).map_or(u64::MAX, |size| size - 1);
                        AddressRange::new(start, start.saturating_add(span)).ok()
                    }
                }
            })
            .collect();
        let any_locked = entries.iter().any(|entry| entry.cfg.locked);
        Self {
            entries,
            ranges,
            seccfg,
            machine_bypass,
            any_locked,
        }
    }

    /// Reads the configured entries from the registers.
    pub fn from_registers(regs: &CsRegisters) -> Self {
        let config = &regs.config;
        let entries = (0..config.pmp_entries)
            .map(|index| PmpEntry {
                index,
                cfg: PmpCfg::from_u8(regs.pmp_cfg(index)),
                addr: regs.pmp_addr(index),
            })
            .collect();
        let pmp = Self::new(
            entries,
            regs.mseccfg(),
            config.pmp_granularity,
            config.pmp_machine_bypass,
        );
        trace!(
            "PMP rebuilt: {} active entries",
            pmp.ranges.iter().flatten().count()
        );
        pmp
    }

    /// Checks an access of `len` bytes at physical `address` from `privilege`.
    ///
    /// The lowest-numbered entry that matches any byte of the access decides. If that entry does
    /// not match all bytes, the access fails.
    pub fn check(
        &self,
        address: u64,
        len: u64,
        access: AccessType,
        privilege: PrivilegeLevel,
    ) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let bytes = AddressRange::access(address, len);
        let machine = privilege == PrivilegeLevel::Machine;
        let mml = self.seccfg & mseccfg::MML != 0;
        for (entry, range) in self.entries.iter().zip(&self.ranges) {
            let Some(range) = *range else {
                continue;
            };
            if !range.overlaps(bytes) {
                continue;
            }
            if !range.contains_range(bytes) {
                trace!("PMP entry {} partially matches {address:#x}+{len}", entry.index);
                return false;
            }
            return match mml {
                true => entry.cfg.mml_permits(access, machine),
                false => {
                    (machine && !entry.cfg.locked && self.machine_bypass)
                        || entry.cfg.permits(access)
                }
            };
        }
        if !machine {
            return false;
        }
        let mmwp = self.seccfg & mseccfg::MMWP != 0;
        !(mmwp || mml && (self.any_locked || access == AccessType::Fetch))
    }

    /// Returns `true` if every byte of the page gets the same outcome from [`check`](Self::check)
    /// for any privilege and access type, i.e. no entry boundary falls strictly inside the page.
    pub fn is_homogeneous(&self, page_base: u64, page_size: u64) -> bool {
        let page = AddressRange::access(page_base, page_size);
        self.ranges.iter().flatten().all(|range| !page.splits(*range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    const NAPOT: u8 = (PmpMode::Napot as u8) << cfg::A_SHIFT;
    const TOR: u8 = (PmpMode::Tor as u8) << cfg::A_SHIFT;

    fn napot(base: u64, size: u64) -> u64 {
        (base | (size / 2 - 1)) >> 2
    }

    fn pmp(entries: &[(u8, u64)], seccfg: u64) -> Pmp {
        let entries = entries
            .iter()
            .enumerate()
            .map(|(index, &(cfg, addr))| PmpEntry {
                index,
                cfg: PmpCfg::from_u8(cfg),
                addr,
            })
            .collect();
        Pmp::new(entries, seccfg, 4, false)
    }

    #[test]
    fn test_cfg_round_trip() {
        let value = cfg::L | NAPOT | cfg::X | cfg::R;
        assert_eq!(value, PmpCfg::from_u8(value).to_u8());
    }

    #[test]
    fn test_no_entries_allows_everything() {
        let pmp = Pmp::default();
        assert!(pmp.check(0x8000_0000, 8, AccessType::Store, PrivilegeLevel::User));
    }

    #[test]
    fn test_napot_read_only() {
        let pmp = pmp(&[(NAPOT | cfg::R, napot(0, 0x1000))], 0);
        let m = PrivilegeLevel::Machine;
        assert!(pmp.check(0, 8, AccessType::Load, m));
        assert!(!pmp.check(0, 8, AccessType::Store, m));
        assert!(!pmp.check(0xFFC, 4, AccessType::Fetch, m));
        // Outside the region M-mode is allowed, U-mode is not.
        assert!(pmp.check(0x1000, 8, AccessType::Store, m));
        assert!(!pmp.check(0x1000, 8, AccessType::Load, PrivilegeLevel::User));
    }

    #[test]
    fn test_napot_all_ones_covers_everything() {
        let pmp = pmp(&[(NAPOT | cfg::R, u64::MAX)], 0);
        let u = PrivilegeLevel::User;
        assert!(pmp.check(0, 8, AccessType::Load, u));
        assert!(pmp.check(u64::MAX - 7, 8, AccessType::Load, u));
        assert!(!pmp.check(0x1000, 8, AccessType::Store, u));
        assert!(pmp.is_homogeneous(0x8000_0000, 0x1000));
    }

    #[test]
    fn test_machine_bypass() {
        let entries = vec![PmpEntry {
            index: 0,
            cfg: PmpCfg::from_u8(NAPOT | cfg::R),
            addr: napot(0, 0x1000),
        }];
        let pmp = Pmp::new(entries.clone(), 0, 4, true);
        assert!(pmp.check(0, 8, AccessType::Store, PrivilegeLevel::Machine));
        assert!(!pmp.check(0, 8, AccessType::Store, PrivilegeLevel::Supervisor));

        let mut locked = entries;
        locked[0].cfg.locked = true;
        let pmp = Pmp::new(locked, 0, 4, true);
        assert!(!pmp.check(0, 8, AccessType::Store, PrivilegeLevel::Machine));
    }

    #[test]
    fn test_tor() {
        let pmp = pmp(
            &[(0, 0x1000 >> 2), (TOR | cfg::R | cfg::W, 0x2000 >> 2)],
            0,
        );
        let u = PrivilegeLevel::User;
        assert!(pmp.check(0x1000, 4, AccessType::Store, u));
        assert!(pmp.check(0x1FF8, 8, AccessType::Load, u));
        assert!(!pmp.check(0x0FF8, 8, AccessType::Load, u));
        assert!(!pmp.check(0x1FFC, 8, AccessType::Load, u));
    }

    #[test]
    fn test_partial_match_denied() {
        let pmp = pmp(&[(NAPOT | cfg::R | cfg::W | cfg::X, napot(0, 0x1000))], 0);
        assert!(!pmp.check(0xFFC, 8, AccessType::Load, PrivilegeLevel::Machine));
    }

    #[test]
    fn test_lower_index_wins() {
        let rw = NAPOT | cfg::R | cfg::W;
        let none = NAPOT;
        let pmp_a = pmp(&[(none, napot(0, 0x1000)), (rw, napot(0, 0x2000))], 0);
        let pmp_b = pmp(&[(rw, napot(0, 0x2000)), (none, napot(0, 0x1000))], 0);
        let s = PrivilegeLevel::Supervisor;
        assert!(!pmp_a.check(0x800, 4, AccessType::Load, s));
        assert!(pmp_a.check(0x1800, 4, AccessType::Load, s));
        assert!(pmp_b.check(0x800, 4, AccessType::Load, s));
    }

    #[rstest]
    #[case::shared_data_m(0b0010, true, (true, true, false))]
    #[case::shared_data_su(0b0010, false, (true, false, false))]
    #[case::shared_code(0b1010, false, (false, false, true))]
    #[case::shared_read_only(0b1111, false, (true, false, false))]
    #[case::m_only(0b1101, true, (true, false, true))]
    #[case::m_only_from_su(0b1101, false, (false, false, false))]
    #[case::su_only(0b0101, true, (false, false, false))]
    #[case::su_only_from_su(0b0101, false, (true, false, true))]
    fn test_mml_table(
        #[case] lrwx: u8,
        #[case] machine: bool,
        #[case] expected: (bool, bool, bool),
    ) {
        let value = (lrwx & 0b1000) << 4
            | (lrwx & 0b0100) >> 2
            | (lrwx & 0b0010)
            | (lrwx & 0b0001) << 2;
        let cfg = PmpCfg::from_u8(value | NAPOT);
        assert_eq!(expected, cfg.mml_permissions(machine));
    }

    #[test]
    fn test_no_match_machine() {
        let entry = [(NAPOT | cfg::R, napot(0x1000, 0x1000))];
        let m = PrivilegeLevel::Machine;
        assert!(pmp(&entry, 0).check(0, 4, AccessType::Fetch, m));
        assert!(!pmp(&entry, mseccfg::MMWP).check(0, 4, AccessType::Load, m));
        assert!(!pmp(&entry, mseccfg::MML).check(0, 4, AccessType::Fetch, m));
        assert!(pmp(&entry, mseccfg::MML).check(0, 4, AccessType::Load, m));
        let locked = [(NAPOT | cfg::L | cfg::R, napot(0x1000, 0x1000))];
        assert!(!pmp(&locked, mseccfg::MML).check(0, 4, AccessType::Load, m));
    }

    #[test]
    fn test_legalize_cfg() {
        // Locked entries keep their value.
        let locked = cfg::L | NAPOT | cfg::R;
        assert_eq!(locked, legalize_cfg(locked, 0, 0, 4));
        assert_eq!(0, legalize_cfg(locked, 0, mseccfg::RLB, 4));
        // W without R is reserved.
        assert_eq!(NAPOT, legalize_cfg(0, NAPOT | cfg::W, 0, 4));
        assert_eq!(NAPOT | cfg::W, legalize_cfg(0, NAPOT | cfg::W, mseccfg::MML, 4));
        // NA4 is not selectable with coarse granularity.
        let na4 = (PmpMode::Na4 as u8) << cfg::A_SHIFT;
        assert_eq!(na4, legalize_cfg(0, na4, 0, 4));
        assert_eq!(NAPOT, legalize_cfg(0, na4, 0, 4096));
        // No new M-mode executable rules under MML.
        let m_exec = cfg::L | NAPOT | cfg::R | cfg::X;
        assert_eq!(0, legalize_cfg(0, m_exec, mseccfg::MML, 4));
        assert_eq!(m_exec, legalize_cfg(0, m_exec, mseccfg::MML | mseccfg::RLB, 4));
    }

    #[test]
    fn test_legalize_mseccfg() {
        let all = mseccfg::MML | mseccfg::MMWP | mseccfg::RLB;
        assert_eq!(all, legalize_mseccfg(0, all, false));
        assert_eq!(mseccfg::MML, legalize_mseccfg(mseccfg::MML, 0, false));
        assert_eq!(mseccfg::MMWP, legalize_mseccfg(0, mseccfg::MMWP | mseccfg::RLB, true));
        assert_eq!(mseccfg::RLB, legalize_mseccfg(mseccfg::RLB, mseccfg::RLB, true));
    }

    #[test]
    fn test_addr_read_granularity() {
        assert_eq!(0x1234, addr_read(0x1234, TOR, 4));
        // 4 KiB granularity: G = 10.
        assert_eq!(0x1000, addr_read(0x13FF, TOR, 4096));
        assert_eq!(0x11FF, addr_read(0x1000, NAPOT, 4096));
    }

    #[test]
    fn test_is_homogeneous() {
        let pmp = pmp(&[(NAPOT | cfg::R, napot(0x1000, 0x800))], 0);
        assert!(pmp.is_homogeneous(0x0000, 0x1000));
        assert!(!pmp.is_homogeneous(0x1000, 0x1000));
        assert!(pmp.is_homogeneous(0x2000, 0x1000));
        let pmp = self::pmp(&[(NAPOT | cfg::R, napot(0, 0x4000))], 0);
        assert!(pmp.is_homogeneous(0x1000, 0x1000));
    }

    proptest! {
        #[test]
        fn test_check_is_total(address in any::<u64>(), len in 1u64..=8, bits in any::<u8>()) {
            let pmp = pmp(&[(bits, address >> 2), (TOR | cfg::R, u64::MAX >> 10)], 0);
            for access in [AccessType::Fetch, AccessType::Load, AccessType::Store] {
                let _ = pmp.check(address, len, access, PrivilegeLevel::User);
            }
        }

        #[test]
        fn test_disjoint_entries_commute(
            a in 0u64..16,
            b in 16u64..32,
            address in 0u64..0x20000,
            ra in any::<bool>(),
            rb in any::<bool>(),
        ) {
            let perm = |r: bool| NAPOT | if r { cfg::R } else { 0 };
            let first = (perm(ra), napot(a * 0x1000, 0x1000));
            let second = (perm(rb), napot(b * 0x1000, 0x1000));
            let address = address & !0b111;
            let s = PrivilegeLevel::Supervisor;
            prop_assert_eq!(
                pmp(&[first, second], 0).check(address, 8, AccessType::Load, s),
                pmp(&[second, first], 0).check(address, 8, AccessType::Load, s)
            );
        }
    }
}
