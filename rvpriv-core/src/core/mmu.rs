//! Virtual-memory translation and the hart's view of memory.
//!
//! > The supervisor operates in a paged virtual-memory system [...]. When Sv39 is enabled,
//! > instruction fetch addresses and load and store effective addresses, which are 64 bits, must
//! > have bits 63–39 all equal to bit 38, or else a page-fault exception will occur.
//!
//! Every access goes through, in order: trigger matching, the translation cache, the two
//! translation stages, the physical-address width check, and PMP.

use log::trace;

use super::debug::Dcsr;
use super::tlb::TlbHit;
use super::{AccessType, Exception, ExceptionCause, Hart};
use crate::bus::Bus;
use crate::commit_log::CommitEvent;
use crate::config::AdUpdatePolicy;
use crate::core::envcfg;
use crate::{unit, Alignment, PrivilegeLevel, Xlen};

macro_rules! access_fns {
    ( $( $load_fn:ident, $store_fn:ident => $u:ident ),* $(,)? ) => {
        $(
            /// Invoke a load of a little-endian value at virtual `address`.
            ///
            /// The address doesn't need to be naturally aligned, but misaligned accesses fault
            /// unless [`Config::support_misaligned_memory_access`](crate::Config) is set.
            pub fn $load_fn(&mut self, address: u64) -> Result<$u, Exception> {
                let mut buf = [0u8; std::mem::size_of::<$u>()];
                self.load(&mut buf, address)?;
                Ok($u::from_le_bytes(buf))
            }

            /// Invoke a store of a little-endian value at virtual `address`.
            ///
            /// The address doesn't need to be naturally aligned, but misaligned accesses fault
            /// unless [`Config::support_misaligned_memory_access`](crate::Config) is set.
            pub fn $store_fn(&mut self, address: u64, value: $u) -> Result<(), Exception> {
                self.store(address, &value.to_le_bytes())
            }
        )*
    };
}

/// Address-translation scheme selected by the MODE field of `satp`, `vsatp`, or `hgatp`.
///
/// For `hgatp` the same encodings select the `x4` variants (Sv32x4, Sv39x4, ...), whose root
/// table is widened by two bits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SatpMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

impl SatpMode {
    pub fn from_encoding(encoding: u64, xlen: Xlen) -> Option<Self> {
        match (xlen, encoding) {
            (_, 0) => Some(Self::Bare),
            (Xlen::Rv32, 1) => Some(Self::Sv32),
            (Xlen::Rv64, 8) => Some(Self::Sv39),
            (Xlen::Rv64, 9) => Some(Self::Sv48),
            (Xlen::Rv64, 10) => Some(Self::Sv57),
            _ => None,
        }
    }

    pub fn encoding(self) -> u64 {
        match self {
            Self::Bare => 0,
            Self::Sv32 => 1,
            Self::Sv39 => 8,
            Self::Sv48 => 9,
            Self::Sv57 => 10,
        }
    }

    pub fn is_valid_for(self, xlen: Xlen) -> bool {
        match self {
            Self::Bare => true,
            Self::Sv32 => xlen == Xlen::Rv32,
            _ => xlen == Xlen::Rv64,
        }
    }

    /// Number of page-table levels.
    pub fn levels(self) -> u32 {
        match self {
            Self::Bare => 0,
            Self::Sv32 => 2,
            Self::Sv39 => 3,
            Self::Sv48 => 4,
            Self::Sv57 => 5,
        }
    }

    /// Width of each VPN field.
    pub fn vpn_bits(self) -> u32 {
        match self {
            Self::Sv32 => 10,
            _ => 9,
        }
    }

    /// Size of a page-table entry in bytes.
    pub fn pte_size(self) -> u64 {
        match self {
            Self::Sv32 => 4,
            _ => 8,
        }
    }

    /// Width of virtual addresses.
    pub fn va_bits(self) -> u32 {
        12 + self.levels() * self.vpn_bits()
    }

    /// Returns `true` if the bits of `vaddr` above the virtual address width all equal its most
    /// significant bit. Always `true` for Sv32, which uses all 32 address bits.
    fn is_canonical(self, vaddr: u64) -> bool {
        match self {
            Self::Bare | Self::Sv32 => true,
            _ => {
                let shift = 64 - self.va_bits();
                (((vaddr << shift) as i64) >> shift) as u64 == vaddr
            }
        }
    }

    /// PPN field of a page-table entry.
    fn pte_ppn(self, pte: u64) -> u64 {
        match self {
            Self::Sv32 => (pte >> pte::PPN_SHIFT) & 0x3F_FFFF,
            _ => (pte >> pte::PPN_SHIFT) & ((1 << 44) - 1),
        }
    }
}

/// Fields of `satp`, `vsatp` and `hgatp`.
///
/// | XLEN | MODE  | ASID (VMID) | PPN  |
/// | ---- | ----- | ----------- | ---- |
/// | 32   | 31    | 30:22       | 21:0 |
/// | 64   | 63:60 | 59:44       | 43:0 |
pub mod atp {
    use crate::Xlen;

    pub fn mode(value: u64, xlen: Xlen) -> u64 {
        match xlen {
            Xlen::Rv32 => value >> 31 & 1,
            Xlen::Rv64 => value >> 60,
        }
    }

    fn ppn_mask(xlen: Xlen) -> u64 {
        match xlen {
            Xlen::Rv32 => 0x3F_FFFF,
            Xlen::Rv64 => (1 << 44) - 1,
        }
    }

    pub fn ppn(value: u64, xlen: Xlen) -> u64 {
        value & ppn_mask(xlen)
    }

    pub fn with_ppn(value: u64, ppn: u64, xlen: Xlen) -> u64 {
        let mask = ppn_mask(xlen);
        value & !mask | ppn & mask
    }

    pub fn asid_mask(xlen: Xlen) -> u64 {
        match xlen {
            Xlen::Rv32 => 0x1FF << 22,
            Xlen::Rv64 => 0xFFFF << 44,
        }
    }
}

/// Bits of a page-table entry.
mod pte {
    pub const V: u64 = 1 << 0;
    pub const R: u64 = 1 << 1;
    pub const W: u64 = 1 << 2;
    pub const X: u64 = 1 << 3;
    pub const U: u64 = 1 << 4;
    pub const A: u64 = 1 << 6;
    pub const D: u64 = 1 << 7;
    pub const PPN_SHIFT: u32 = 10;
    /// Bits 60:54 (RV64).
    pub const RESERVED: u64 = 0x7F << 54;
    pub const PBMT_SHIFT: u32 = 61;
    /// NAPOT translation contiguity (Svnapot), not implemented.
    pub const N: u64 = 1 << 63;
}

/// Privilege and virtualization mode an access is performed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Effective {
    pub privilege: PrivilegeLevel,
    pub virtualized: bool,
    /// The mode comes from `mstatus.MPP`/`MPV` rather than the current mode.
    pub mprv: bool,
}

/// Outcome of translating one access that does not cross a page boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct Translation {
    pub paddr: u64,
    /// Index into the bus's backing memory, when the translation cache provided one.
    pub host: Option<usize>,
}

impl Exception {
    fn access_fault(access: AccessType, vaddr: u64, gva: bool) -> Self {
        let cause = match access {
            AccessType::Fetch => ExceptionCause::InstructionAccessFault,
            AccessType::Load => ExceptionCause::LoadAccessFault,
            AccessType::Store => ExceptionCause::StoreOrAmoAccessFault,
        };
        Self {
            gva,
            ..Self::with_tval(cause, vaddr)
        }
    }

    fn page_fault(access: AccessType, vaddr: u64, gva: bool) -> Self {
        let cause = match access {
            AccessType::Fetch => ExceptionCause::InstructionPageFault,
            AccessType::Load => ExceptionCause::LoadPageFault,
            AccessType::Store => ExceptionCause::StoreOrAmoPageFault,
        };
        Self {
            gva,
            ..Self::with_tval(cause, vaddr)
        }
    }

    fn guest_page_fault(access: AccessType, gva: u64, gpa: u64, tinst: u64) -> Self {
        let cause = match access {
            AccessType::Fetch => ExceptionCause::InstructionGuestPageFault,
            AccessType::Load => ExceptionCause::LoadGuestPageFault,
            AccessType::Store => ExceptionCause::StoreOrAmoGuestPageFault,
        };
        Self {
            tval2: gpa >> 2,
            tinst,
            gva: true,
            ..Self::with_tval(cause, gva)
        }
    }

    fn misaligned(access: AccessType, vaddr: u64, gva: bool) -> Self {
        let cause = match access {
            AccessType::Fetch => ExceptionCause::InstructionAddressMisaligned,
            AccessType::Load => ExceptionCause::LoadAddressMisaligned,
            AccessType::Store => ExceptionCause::StoreOrAmoAddressMisaligned,
        };
        Self {
            gva,
            ..Self::with_tval(cause, vaddr)
        }
    }
}

/// Checks the permission bits of a leaf PTE. With `mxr`, executable pages are readable too.
fn leaf_permits(pte: u64, access: AccessType, mxr: bool) -> bool {
    match access {
        AccessType::Fetch => pte & pte::X != 0,
        AccessType::Load => pte & pte::R != 0 || (mxr && pte & pte::X != 0),
        AccessType::Store => pte & pte::W != 0,
    }
}

/// Checks the fields of a PTE that are reserved in every context.
fn pte_is_malformed(pte: u64, pbmte: bool) -> bool {
    let pbmt = pte >> pte::PBMT_SHIFT & 0b11;
    pte & pte::RESERVED != 0
        || pte & pte::N != 0
        || (pbmt != 0 && !pbmte)
        || pbmt == 0b11
        || pte & pte::V == 0
        || (pte & pte::R == 0 && pte & pte::W != 0)
}

impl<B: Bus> Hart<B> {
    access_fns! {
        load_byte, store_byte => u8,
        load_halfword, store_halfword => u16,
        load_word, store_word => u32,
        load_doubleword, store_doubleword => u64,
    }

    /// Fetches the instruction at virtual `address`.
    ///
    /// > Instructions are stored in memory as a sequence of 16-bit little-endian parcels,
    /// > regardless of memory system endianness. Parcels forming one instruction are stored at
    /// > increasing halfword addresses, with the lowest-addressed parcel holding the
    /// > lowest-numbered bits in the instruction specification.
    ///
    /// With compressed instructions enabled, the second parcel is only fetched if the first one
    /// does not encode a 16-bit instruction, and may lie on another page.
    pub fn fetch_instruction(&mut self, address: u64) -> Result<u32, Exception> {
        let alignment = match self.config.extensions.compressed {
            true => Alignment::HALFWORD,
            false => Alignment::WORD,
        };
        if !alignment.is_aligned(address) {
            let gva = self.effective_mode(AccessType::Fetch).virtualized;
            return Err(Exception::misaligned(AccessType::Fetch, address, gva));
        }
        if !self.config.extensions.compressed {
            let mut buf = [0u8; 4];
            self.access(&mut buf, address, AccessType::Fetch)?;
            return Ok(u32::from_le_bytes(buf));
        }
        let mut low = [0u8; 2];
        self.access(&mut low, address, AccessType::Fetch)?;
        let low = u16::from_le_bytes(low) as u32;
        if low & 0b11 != 0b11 {
            return Ok(low);
        }
        let mut high = [0u8; 2];
        let next = self.config.xlen.truncate(address.wrapping_add(2));
        self.access(&mut high, next, AccessType::Fetch)?;
        Ok((u16::from_le_bytes(high) as u32) << 16 | low)
    }

    /// Translates virtual `vaddr` for an access of type `access` in the current mode, including
    /// the PMP check of the resulting physical address.
    ///
    /// Uses and refills the translation cache like a real access does.
    pub fn translate(&mut self, vaddr: u64, access: AccessType) -> Result<u64, Exception> {
        self.translate_access(vaddr, 1, access)
            .map(|translation| translation.paddr)
    }

    fn load(&mut self, buf: &mut [u8], address: u64) -> Result<(), Exception> {
        self.check_alignment(address, buf.len(), AccessType::Load)?;
        self.access(buf, address, AccessType::Load)?;
        self.log.push(CommitEvent::MemoryRead {
            address,
            size: buf.len() as u8,
        });
        Ok(())
    }

    fn store(&mut self, address: u64, buf: &[u8]) -> Result<(), Exception> {
        self.check_alignment(address, buf.len(), AccessType::Store)?;
        let mut data = buf.to_vec();
        self.access(&mut data, address, AccessType::Store)?;
        let mut value = [0u8; 8];
        value[..buf.len()].copy_from_slice(buf);
        self.log.push(CommitEvent::MemoryWrite {
            address,
            value: u64::from_le_bytes(value),
            size: buf.len() as u8,
        });
        Ok(())
    }

    fn check_alignment(
        &self,
        address: u64,
        size: usize,
        access: AccessType,
    ) -> Result<(), Exception> {
        let aligned = Alignment::natural_for_size(size as u64)
            .is_some_and(|alignment| alignment.is_aligned(address));
        if aligned || self.config.support_misaligned_memory_access {
            return Ok(());
        }
        let gva = self.effective_mode(access).virtualized;
        Err(Exception::misaligned(access, address, gva))
    }

    /// Performs an access of `buf.len()` bytes. For loads and fetches the result is written to
    /// `buf`, for stores `buf` holds the data.
    ///
    /// An access crossing a page boundary is split in two. Both halves are translated before
    /// memory is touched, so a fault on the second half leaves memory unchanged.
    fn access(&mut self, buf: &mut [u8], address: u64, access: AccessType) -> Result<(), Exception> {
        let len = buf.len() as u64;
        let first_len = len.min(unit::PAGE - address % unit::PAGE);
        let first = self.translate_access(address, first_len, access)?;
        let second = match first_len < len {
            true => {
                let next = self.config.xlen.truncate(address.wrapping_add(first_len));
                Some(self.translate_access(next, len - first_len, access)?)
            }
            false => None,
        };
        let (head, tail) = buf.split_at_mut(first_len as usize);
        self.physical_access(head, first, access, address)?;
        if let Some(second) = second {
            self.physical_access(tail, second, access, address)?;
        }
        Ok(())
    }

    fn physical_access(
        &mut self,
        buf: &mut [u8],
        translation: Translation,
        access: AccessType,
        vaddr: u64,
    ) -> Result<(), Exception> {
        if let Some(index) = translation.host {
            let memory = self.bus.backing_memory();
            if let Some(bytes) = memory.get_mut(index..index + buf.len()) {
                match access {
                    AccessType::Store => bytes.copy_from_slice(buf),
                    _ => buf.copy_from_slice(bytes),
                }
                return Ok(());
            }
        }
        let result = match access {
            AccessType::Store => self.bus.write(translation.paddr, buf),
            _ => self.bus.read(buf, translation.paddr),
        };
        result.map_err(|err| {
            trace!("Bus error at {:#x}: {err}", translation.paddr);
            let gva = self.effective_mode(access).virtualized;
            Exception::access_fault(access, vaddr, gva)
        })
    }

    fn is_physical(&self, address: u64) -> bool {
        address
            .checked_shr(self.config.physical_address_bits)
            .map_or(true, |high| high == 0)
    }

    /// Mode that accesses of type `access` are performed in, taking MPRV into account.
    pub(super) fn effective_mode(&self, access: AccessType) -> Effective {
        let mstatus = self.csrs.mstatus();
        let mprv_allowed = !self.state.debug_mode || Dcsr(self.csrs.dcsr()).mprven();
        if access != AccessType::Fetch && mstatus.mprv() && mprv_allowed {
            let privilege =
                PrivilegeLevel::try_from(mstatus.mpp()).unwrap_or(PrivilegeLevel::Machine);
            return Effective {
                privilege,
                virtualized: mstatus.mpv() && privilege != PrivilegeLevel::Machine,
                mprv: true,
            };
        }
        match self.state.debug_mode {
            true => Effective {
                privilege: PrivilegeLevel::Machine,
                virtualized: false,
                mprv: false,
            },
            false => Effective {
                privilege: self.state.privilege,
                virtualized: self.state.virtualized,
                mprv: false,
            },
        }
    }

    /// Translates an access of `len` bytes that does not cross a page boundary.
    pub(super) fn translate_access(
        &mut self,
        vaddr: u64,
        len: u64,
        access: AccessType,
    ) -> Result<Translation, Exception> {
        let vaddr = self.config.xlen.truncate(vaddr);
        let effective = self.effective_mode(access);
        let check_triggers =
            !self.state.debug_mode && self.triggers.armed(access, effective.privilege);
        if check_triggers {
            if let Some(index) = self.triggers.check(vaddr, access, effective.privilege) {
                self.csrs.set_trigger_hit(index);
                return Err(Exception::with_tval(ExceptionCause::Breakpoint, vaddr));
            }
        }

        if !effective.mprv {
            if let Some(TlbHit { paddr, host }) = self.tlb.lookup(vaddr, access) {
                return Ok(Translation {
                    paddr,
                    host: Some(host),
                });
            }
        }

        let paddr = self.translate_slow(vaddr, len, access, effective)?;
        let host = match effective.mprv {
            true => None,
            false => self.refill(vaddr, paddr, access, effective, check_triggers),
        };
        Ok(Translation { paddr, host })
    }

    /// Installs the translation of the page containing `vaddr`, if the page qualifies. Returns
    /// the backing-memory index of `paddr` if an entry was installed.
    fn refill(
        &mut self,
        vaddr: u64,
        paddr: u64,
        access: AccessType,
        effective: Effective,
        check_triggers: bool,
    ) -> Option<usize> {
        let page = paddr & !(unit::PAGE - 1);
        if !self.pmp.is_homogeneous(page, unit::PAGE)
            || !self.pmp.check(page, unit::PAGE, access, effective.privilege)
        {
            return None;
        }
        let first = self.bus.backing_index(page)?;
        let last = self.bus.backing_index(page + unit::PAGE - 1)?;
        if last.checked_sub(first) != Some(unit::PAGE as usize - 1) {
            return None;
        }
        let host = first + (paddr - page) as usize;
        self.tlb.refill(vaddr, access, paddr, host, check_triggers);
        Some(host)
    }

    fn translate_slow(
        &mut self,
        vaddr: u64,
        len: u64,
        access: AccessType,
        effective: Effective,
    ) -> Result<u64, Exception> {
        let gpa = match effective.privilege {
            PrivilegeLevel::Machine => vaddr,
            _ => self.first_stage(vaddr, access, effective)?,
        };
        let paddr = match effective.virtualized {
            true => self.guest_stage(gpa, vaddr, access, false)?,
            false => gpa,
        };
        let gva = effective.virtualized;
        if !self.is_physical(paddr) {
            trace!("Physical address {paddr:#x} out of range");
            return Err(Exception::access_fault(access, vaddr, gva));
        }
        if !self.pmp.check(paddr, len, access, effective.privilege) {
            trace!("PMP denied {access:?} of {len} bytes at {paddr:#x}");
            return Err(Exception::access_fault(access, vaddr, gva));
        }
        Ok(paddr)
    }

    /// VS-stage or single-stage translation through `vsatp` or `satp`. Returns the (guest)
    /// physical address.
    fn first_stage(
        &mut self,
        vaddr: u64,
        access: AccessType,
        effective: Effective,
    ) -> Result<u64, Exception> {
        let xlen = self.config.xlen;
        let virtualized = effective.virtualized;
        let satp = self.csrs.satp(virtualized);
        let mode = SatpMode::from_encoding(atp::mode(satp, xlen), xlen).unwrap_or(SatpMode::Bare);
        if mode == SatpMode::Bare {
            return Ok(vaddr);
        }
        self.walks += 1;
        trace!("Walking {mode:?} page table for {access:?} at {vaddr:#x}");

        let page_fault = Exception::page_fault(access, vaddr, virtualized);
        if !mode.is_canonical(vaddr) {
            return Err(page_fault);
        }
        let mstatus = self.csrs.mstatus();
        let (status, envcfg) = match virtualized {
            true => (self.csrs.vsstatus(), self.csrs.henvcfg()),
            false => (mstatus, self.csrs.menvcfg()),
        };
        let mxr = status.mxr() || (virtualized && mstatus.mxr());
        let pbmte = self.config.extensions.svpbmt && envcfg::pbmte(envcfg);

        let vpn_bits = mode.vpn_bits();
        let mut table = atp::ppn(satp, xlen) << 12;
        for level in (0..mode.levels()).rev() {
            let shift = 12 + level * vpn_bits;
            let index = vaddr >> shift & ((1 << vpn_bits) - 1);
            let pte_gpa = table + index * mode.pte_size();
            let pte_addr = match virtualized {
                true => self.guest_stage(pte_gpa, vaddr, access, true)?,
                false => pte_gpa,
            };
            let pte = self.read_pte(pte_addr, mode.pte_size(), access, vaddr, virtualized)?;
            if pte_is_malformed(pte, pbmte) {
                return Err(page_fault);
            }
            let ppn = mode.pte_ppn(pte);
            if pte & (pte::R | pte::X) == 0 {
                let pbmt = pte >> pte::PBMT_SHIFT & 0b11;
                if level == 0 || pte & (pte::D | pte::A | pte::U) != 0 || pbmt != 0 {
                    return Err(page_fault);
                }
                table = ppn << 12;
                continue;
            }

            let user_page = pte & pte::U != 0;
            let privilege_ok = match effective.privilege {
                PrivilegeLevel::User => user_page,
                PrivilegeLevel::Supervisor => {
                    !user_page || (status.sum() && access != AccessType::Fetch)
                }
                PrivilegeLevel::Machine => true,
            };
            if !privilege_ok || !leaf_permits(pte, access, mxr) {
                return Err(page_fault);
            }
            let superpage_mask = (1 << (level * vpn_bits)) - 1;
            if ppn & superpage_mask != 0 {
                return Err(page_fault);
            }
            self.update_accessed_dirty(pte, pte_addr, mode.pte_size(), access, page_fault)?;

            let offset_mask = (1u64 << shift) - 1;
            return Ok((ppn << 12) & !offset_mask | vaddr & offset_mask);
        }
        Err(page_fault)
    }

    /// G-stage translation of guest physical address `gpa` through `hgatp`.
    ///
    /// `implicit` is set for the page-table accesses of the VS-stage walk, which are checked as
    /// loads. Guest page faults report the access type of the original access.
    fn guest_stage(
        &mut self,
        gpa: u64,
        gva: u64,
        access: AccessType,
        implicit: bool,
    ) -> Result<u64, Exception> {
        let xlen = self.config.xlen;
        let hgatp = self.csrs.hgatp();
        let mode = SatpMode::from_encoding(atp::mode(hgatp, xlen), xlen).unwrap_or(SatpMode::Bare);
        if mode == SatpMode::Bare {
            return Ok(gpa);
        }
        let tinst = match implicit {
            true => {
                let read = match xlen {
                    Xlen::Rv32 => 0x2000,
                    Xlen::Rv64 => 0x3000,
                };
                match access {
                    AccessType::Store => read | 0x20,
                    _ => read,
                }
            }
            false => 0,
        };
        let fault = Exception::guest_page_fault(access, gva, gpa, tinst);
        if gpa >> (mode.va_bits() + 2) != 0 {
            return Err(fault);
        }
        let check = match implicit {
            true => AccessType::Load,
            false => access,
        };
        let mxr = !implicit && self.csrs.mstatus().mxr();
        let pbmte = self.config.extensions.svpbmt && envcfg::pbmte(self.csrs.menvcfg());

        let vpn_bits = mode.vpn_bits();
        let levels = mode.levels();
        let mut table = atp::ppn(hgatp, xlen) << 12;
        for level in (0..levels).rev() {
            let shift = 12 + level * vpn_bits;
            let index_bits = match level == levels - 1 {
                true => vpn_bits + 2,
                false => vpn_bits,
            };
            let index = gpa >> shift & ((1 << index_bits) - 1);
            let pte_addr = table + index * mode.pte_size();
            let pte = self.read_pte(pte_addr, mode.pte_size(), access, gva, true)?;
            if pte_is_malformed(pte, pbmte) {
                return Err(fault);
            }
            let ppn = mode.pte_ppn(pte);
            if pte & (pte::R | pte::X) == 0 {
                if level == 0 || pte & (pte::D | pte::A | pte::U) != 0 {
                    return Err(fault);
                }
                table = ppn << 12;
                continue;
            }
            if pte & pte::U == 0 || !leaf_permits(pte, check, mxr) {
                return Err(fault);
            }
            if ppn & ((1 << (level * vpn_bits)) - 1) != 0 {
                return Err(fault);
            }
            self.update_accessed_dirty(pte, pte_addr, mode.pte_size(), check, fault)?;

            let offset_mask = (1u64 << shift) - 1;
            return Ok((ppn << 12) & !offset_mask | gpa & offset_mask);
        }
        Err(fault)
    }

    /// Reads a page-table entry, checked by PMP as an S-mode load. Failures are access faults
    /// of the original access type.
    fn read_pte(
        &mut self,
        address: u64,
        size: u64,
        access: AccessType,
        vaddr: u64,
        gva: bool,
    ) -> Result<u64, Exception> {
        let fault = Exception::access_fault(access, vaddr, gva);
        if !self.is_physical(address)
            || !self
                .pmp
                .check(address, size, AccessType::Load, PrivilegeLevel::Supervisor)
        {
            return Err(fault);
        }
        let mut buf = [0u8; 8];
        self.bus
            .read(&mut buf[..size as usize], address)
            .map_err(|_| fault)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Handles a leaf PTE whose A bit (or D bit, for stores) is clear, following
    /// [`Config::ad_update`](crate::Config::ad_update).
    fn update_accessed_dirty(
        &mut self,
        pte: u64,
        address: u64,
        size: u64,
        access: AccessType,
        fault: Exception,
    ) -> Result<(), Exception> {
        let needed = match access {
            AccessType::Store => pte::A | pte::D,
            _ => pte::A,
        };
        if pte & needed == needed {
            return Ok(());
        }
        match self.config.ad_update {
            AdUpdatePolicy::Fault => Err(fault),
            AdUpdatePolicy::SetInPlace => {
                let access_fault = Exception::access_fault(access, fault.tval, fault.gva);
                if !self
                    .pmp
                    .check(address, size, AccessType::Store, PrivilegeLevel::Supervisor)
                {
                    return Err(access_fault);
                }
                let bytes = (pte | needed).to_le_bytes();
                trace!("Setting A/D bits of PTE at {address:#x}");
                self.bus
                    .write(address, &bytes[..size as usize])
                    .map_err(|_| access_fault)
            }
        }
    }
}
