//! Translation cache.
//!
//! Direct-mapped, with one table per access type so that a page that is readable but not
//! executable only gets a load entry. An entry is only installed for a page that is fully backed
//! by directly addressable memory and fully covered by a single PMP outcome, so a hit needs no
//! further checks.
//!
//! Entries are not tagged with an address-space identifier: every write that can change a
//! translation flushes the whole cache.

use log::trace;

use super::AccessType;
use crate::unit;

const SETS: usize = 256;

const PAGE_SHIFT: u32 = unit::PAGE.trailing_zeros();

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    /// Virtual page number, `None` when the entry is empty.
    tag: Option<u64>,
    /// Every access through this entry must be checked against the triggers.
    check_triggers: bool,
    /// Backing-memory index of the page.
    host: usize,
    /// Physical address of the page.
    target: u64,
}

/// Result of a cache hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbHit {
    pub paddr: u64,
    /// Backing-memory index of `paddr`.
    pub host: usize,
}

#[derive(Debug, Clone)]
pub struct Tlb {
    fetch: Box<[Entry; SETS]>,
    load: Box<[Entry; SETS]>,
    store: Box<[Entry; SETS]>,
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            fetch: Box::new([Entry::default(); SETS]),
            load: Box::new([Entry::default(); SETS]),
            store: Box::new([Entry::default(); SETS]),
        }
    }

    fn table(&self, access: AccessType) -> &[Entry; SETS] {
        match access {
            AccessType::Fetch => &self.fetch,
            AccessType::Load => &self.load,
            AccessType::Store => &self.store,
        }
    }

    fn table_mut(&mut self, access: AccessType) -> &mut [Entry; SETS] {
        match access {
            AccessType::Fetch => &mut self.fetch,
            AccessType::Load => &mut self.load,
            AccessType::Store => &mut self.store,
        }
    }

    /// Looks up the translation of `vaddr`. Entries that require trigger checks never hit.
    pub fn lookup(&self, vaddr: u64, access: AccessType) -> Option<TlbHit> {
        let vpn = vaddr >> PAGE_SHIFT;
        let entry = &self.table(access)[vpn as usize % SETS];
        if entry.tag != Some(vpn) || entry.check_triggers {
            return None;
        }
        let offset = vaddr & (unit::PAGE - 1);
        Some(TlbHit {
            paddr: entry.target | offset,
            host: entry.host + offset as usize,
        })
    }

    /// Installs the translation `vaddr -> paddr`, where `paddr` lives at backing-memory index
    /// `host`. Replaces whatever entry occupied the set.
    pub fn refill(
        &mut self,
        vaddr: u64,
        access: AccessType,
        paddr: u64,
        host: usize,
        check_triggers: bool,
    ) {
        let vpn = vaddr >> PAGE_SHIFT;
        let offset = vaddr & (unit::PAGE - 1);
        trace!("TLB refill {access:?} {vaddr:#x} -> {paddr:#x}");
        self.table_mut(access)[vpn as usize % SETS] = Entry {
            tag: Some(vpn),
            check_triggers,
            host: host - offset as usize,
            target: paddr & !(unit::PAGE - 1),
        };
    }

    /// Drops every entry.
    pub fn flush(&mut self) {
        trace!("TLB flush");
        for table in [&mut self.fetch, &mut self.load, &mut self.store] {
            table.fill(Entry::default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_applies_offset() {
        let mut tlb = Tlb::new();
        tlb.refill(0x4000_1234, AccessType::Load, 0x8000_0234, 0x234, false);
        let hit = tlb.lookup(0x4000_1FF0, AccessType::Load);
        assert_eq!(
            Some(TlbHit {
                paddr: 0x8000_0FF0,
                host: 0xFF0
            }),
            hit
        );
        assert_eq!(None, tlb.lookup(0x4000_1FF0, AccessType::Store));
        assert_eq!(None, tlb.lookup(0x4000_2000, AccessType::Load));
    }

    #[test]
    fn test_trigger_tagged_entries_miss() {
        let mut tlb = Tlb::new();
        tlb.refill(0x1000, AccessType::Fetch, 0x1000, 0, true);
        assert_eq!(None, tlb.lookup(0x1000, AccessType::Fetch));
        tlb.refill(0x1000, AccessType::Fetch, 0x1000, 0, false);
        assert_eq!(0x1000, tlb.lookup(0x1000, AccessType::Fetch).unwrap().paddr);
    }

    #[test]
    fn test_conflicting_page_replaces() {
        let mut tlb = Tlb::new();
        let stride = (SETS as u64) << PAGE_SHIFT;
        tlb.refill(0, AccessType::Store, 0x1000, 0x1000, false);
        tlb.refill(stride, AccessType::Store, 0x2000, 0x2000, false);
        assert_eq!(None, tlb.lookup(0, AccessType::Store));
        assert_eq!(0x2000, tlb.lookup(stride, AccessType::Store).unwrap().paddr);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut tlb = Tlb::new();
        tlb.refill(0x3000, AccessType::Load, 0x3000, 0x3000, false);
        tlb.flush();
        assert_eq!(None, tlb.lookup(0x3000, AccessType::Load));
        tlb.flush();
        assert_eq!(None, tlb.lookup(0x3000, AccessType::Load));
    }
}
