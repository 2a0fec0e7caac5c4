use bitvec::{field::BitField, order::Lsb0, view::BitView};

use crate::config::Extensions;
use crate::{PrivilegeLevel, RawPrivilegeLevel, Xlen};

/// Typed view of an `mstatus`, `sstatus`, or `vsstatus` value.
///
/// > The mstatus register is an MXLEN-bit read/write register [...]. The mstatus register keeps
/// > track of and controls the hart’s current operating state. A restricted view of mstatus appears
/// > as the sstatus register in the S-level ISA.
/// >
/// > For RV32 only, mstatush is a 32-bit read/write register [...].
///
/// Values are held in their 64-bit layout on every XLEN, so that the fields of `mstatush` live in
/// bits 63:32. The SD bit is the exception: it is bit XLEN-1.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Status {
    value: u64,
    xlen: Xlen,
}

impl Status {
    pub fn new(value: u64, xlen: Xlen) -> Self {
        Self { value, xlen }
    }

    pub fn value(self) -> u64 {
        self.value
    }

    fn bit(self, index: usize) -> bool {
        self.value.view_bits::<Lsb0>()[index]
    }

    fn with_bit(mut self, index: usize, value: bool) -> Self {
        self.value.view_bits_mut::<Lsb0>().set(index, value);
        self
    }

    /// Returns `true` if the MIE (M-mode Interrupt Enable) bit is set.
    pub fn mie(self) -> bool {
        self.bit(idx::MIE)
    }

    pub fn with_mie(self, value: bool) -> Self {
        self.with_bit(idx::MIE, value)
    }

    /// Returns `true` if the SIE (S-mode Interrupt Enable) bit is set.
    pub fn sie(self) -> bool {
        self.bit(idx::SIE)
    }

    pub fn with_sie(self, value: bool) -> Self {
        self.with_bit(idx::SIE, value)
    }

    /// Returns `true` if the MPIE (M-mode Previous Interrupt Enable) bit is set.
    pub fn mpie(self) -> bool {
        self.bit(idx::MPIE)
    }

    pub fn with_mpie(self, value: bool) -> Self {
        self.with_bit(idx::MPIE, value)
    }

    /// Returns `true` if the SPIE (S-mode Previous Interrupt Enable) bit is set.
    pub fn spie(self) -> bool {
        self.bit(idx::SPIE)
    }

    pub fn with_spie(self, value: bool) -> Self {
        self.with_bit(idx::SPIE, value)
    }

    /// Returns the raw MPP (M-mode Previous Privilege level) field.
    ///
    /// The MPP field is **WARL**, so after legalization it never holds the reserved level.
    pub fn mpp(self) -> RawPrivilegeLevel {
        RawPrivilegeLevel::from_u2(self.value.view_bits::<Lsb0>()[idx::MPP..idx::MPP + 2].load_le())
    }

    pub fn with_mpp(mut self, value: PrivilegeLevel) -> Self {
        self.value.view_bits_mut::<Lsb0>()[idx::MPP..idx::MPP + 2].store_le(value as u8);
        self
    }

    /// Returns the privilege level encoded by the SPP (S-mode Previous Privilege level) field.
    pub fn spp(self) -> PrivilegeLevel {
        match self.bit(idx::SPP) {
            true => PrivilegeLevel::Supervisor,
            false => PrivilegeLevel::User,
        }
    }

    /// Sets SPP. Only U and S are representable; M is stored as S.
    pub fn with_spp(self, value: PrivilegeLevel) -> Self {
        self.with_bit(idx::SPP, value != PrivilegeLevel::User)
    }

    /// Returns `true` if the MPRV (Modify PRiVilege) bit is set.
    pub fn mprv(self) -> bool {
        self.bit(idx::MPRV)
    }

    pub fn with_mprv(self, value: bool) -> Self {
        self.with_bit(idx::MPRV, value)
    }

    /// Returns `true` if the SUM (permit Supervisor User Memory access) bit is set.
    pub fn sum(self) -> bool {
        self.bit(idx::SUM)
    }

    /// Returns `true` if the MXR (Make eXecutable Readable) bit is set.
    pub fn mxr(self) -> bool {
        self.bit(idx::MXR)
    }

    /// Returns `true` if the TVM (Trap Virtual Memory) bit is set.
    pub fn tvm(self) -> bool {
        self.bit(idx::TVM)
    }

    /// Returns `true` if the TSR (Trap SRET) bit is set.
    pub fn tsr(self) -> bool {
        self.bit(idx::TSR)
    }

    /// Returns the extension context status encoded by the FS (F extension Status) field.
    pub fn fs(self) -> ExtensionContextStatus {
        ExtensionContextStatus::from_u2(self.value.view_bits::<Lsb0>()[idx::FS..idx::FS + 2].load_le())
    }

    /// Sets FS and recomputes SD.
    pub fn with_fs(mut self, value: ExtensionContextStatus) -> Self {
        self.value.view_bits_mut::<Lsb0>()[idx::FS..idx::FS + 2].store_le(value as u8);
        self.with_updated_sd()
    }

    /// Returns `true` if the MPV (Machine Previous Virtualization mode) bit is set.
    pub fn mpv(self) -> bool {
        self.bit(idx::MPV)
    }

    pub fn with_mpv(self, value: bool) -> Self {
        self.with_bit(idx::MPV, value)
    }

    /// Returns `true` if the GVA (Guest Virtual Address) bit is set.
    pub fn gva(self) -> bool {
        self.bit(idx::GVA)
    }

    pub fn with_gva(self, value: bool) -> Self {
        self.with_bit(idx::GVA, value)
    }

    /// Returns `true` if the SD (extension Status Dirty) bit is set.
    pub fn sd(self) -> bool {
        self.bit(sd_index(self.xlen))
    }

    fn with_updated_sd(self) -> Self {
        use ExtensionContextStatus::Dirty;
        let bits = self.value.view_bits::<Lsb0>();
        let dirty = [idx::FS, idx::VS, idx::XS]
            .into_iter()
            .any(|i| ExtensionContextStatus::from_u2(bits[i..i + 2].load_le()) == Dirty);
        self.with_bit(sd_index(self.xlen), dirty)
    }
}

/// Bit indices into the 64-bit status layout.
pub mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const UBE: usize = 6;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const VS: usize = 9;
    pub const MPP: usize = 11;
    pub const FS: usize = 13;
    pub const XS: usize = 15;
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
    pub const TVM: usize = 20;
    pub const TW: usize = 21;
    pub const TSR: usize = 22;
    pub const UXL: usize = 32;
    pub const SXL: usize = 34;
    pub const SBE: usize = 36;
    pub const MBE: usize = 37;
    pub const GVA: usize = 38;
    pub const MPV: usize = 39;
}

/// Index of the SD bit, which is always the most significant bit of the register.
pub fn sd_index(xlen: Xlen) -> usize {
    xlen.bits() as usize - 1
}

const fn bit(index: usize) -> u64 {
    1 << index
}

const fn field(index: usize, width: usize) -> u64 {
    ((1 << width) - 1) << index
}

/// Fields that trigger a translation-cache flush when they change.
pub const TRANSLATION_FIELDS: u64 = field(idx::MPP, 2)
    | bit(idx::MPRV)
    | bit(idx::SUM)
    | bit(idx::MXR)
    | bit(idx::MPV)
    | bit(idx::GVA);

/// Writable fields of `mstatus`, given the enabled extensions.
pub fn mstatus_write_mask(ext: &Extensions) -> u64 {
    let mut mask = bit(idx::MIE) | bit(idx::MPIE) | field(idx::MPP, 2);
    if ext.user {
        mask |= bit(idx::MPRV) | bit(idx::TW);
    }
    if ext.supervisor {
        mask |= bit(idx::SIE)
            | bit(idx::SPIE)
            | bit(idx::SPP)
            | bit(idx::SUM)
            | bit(idx::MXR)
            | bit(idx::TVM)
            | bit(idx::TSR);
    }
    if ext.float {
        mask |= field(idx::FS, 2);
    }
    if ext.hypervisor {
        mask |= bit(idx::MPV) | bit(idx::GVA);
    }
    mask
}

/// Fields of `mstatus` visible through `sstatus` (and those of `vsstatus`).
pub fn sstatus_read_mask(xlen: Xlen) -> u64 {
    bit(idx::SIE)
        | bit(idx::SPIE)
        | bit(idx::UBE)
        | bit(idx::SPP)
        | field(idx::VS, 2)
        | field(idx::FS, 2)
        | field(idx::XS, 2)
        | bit(idx::SUM)
        | bit(idx::MXR)
        | field(idx::UXL, 2)
        | bit(sd_index(xlen))
}

/// Writable fields of `sstatus` and `vsstatus`.
pub fn sstatus_write_mask(ext: &Extensions) -> u64 {
    let mut mask = bit(idx::SIE) | bit(idx::SPIE) | bit(idx::SPP) | bit(idx::SUM) | bit(idx::MXR);
    if ext.float {
        mask |= field(idx::FS, 2);
    }
    mask
}

/// Reset value of `mstatus`: every field zero except the fixed UXL and SXL fields on RV64.
pub fn mstatus_reset(ext: &Extensions, xlen: Xlen) -> u64 {
    let mut value = 0;
    if xlen == Xlen::Rv64 {
        if ext.user {
            value |= xlen.encoding() << idx::UXL;
        }
        if ext.supervisor {
            value |= xlen.encoding() << idx::SXL;
        }
    }
    value
}

/// Reset value of `vsstatus`.
pub fn vsstatus_reset(xlen: Xlen) -> u64 {
    match xlen {
        Xlen::Rv32 => 0,
        Xlen::Rv64 => xlen.encoding() << idx::UXL,
    }
}

/// Applies the WARL rules of `mstatus` to a candidate value whose non-writable fields already
/// equal `old`.
///
/// - MPP keeps its old value when written with a level that is reserved or not implemented.
/// - SD mirrors the dirty state of FS.
pub fn legalize_mstatus(old: u64, new: u64, ext: &Extensions, xlen: Xlen) -> u64 {
    let old_status = Status::new(old, xlen);
    let mut status = Status::new(new, xlen);
    let mpp_legal = match PrivilegeLevel::try_from(status.mpp()) {
        Ok(PrivilegeLevel::Machine) => true,
        Ok(PrivilegeLevel::Supervisor) => ext.supervisor,
        Ok(PrivilegeLevel::User) => ext.user,
        Err(_) => false,
    };
    if !mpp_legal {
        let old_mpp = PrivilegeLevel::try_from(old_status.mpp()).unwrap_or(PrivilegeLevel::Machine);
        status = status.with_mpp(old_mpp);
    }
    status.with_updated_sd().value()
}

/// Applies the WARL rules of `vsstatus`: SD mirrors FS.
pub fn legalize_vsstatus(new: u64, xlen: Xlen) -> u64 {
    Status::new(new, xlen).with_updated_sd().value()
}

/// Possible values of the extension context status fields (FS, VS, XS) in the mstatus register.
///
/// > | Status | FS and VS Meaning | XS Meaning                   |
/// > | ------ | ----------------- | ---------------------------- |
/// > | 0      | Off               | All off                      |
/// > | 1      | Initial           | None dirty or clean, some on |
/// > | 2      | Clean             | None dirty, some clean       |
/// > | 3      | Dirty             | Some dirty                   |
///
/// > When an extension’s status is set to Off, any instruction that attempts to read or write the
/// > corresponding state will cause an illegal instruction exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtensionContextStatus {
    Off = 0,
    Initial = 1,
    Clean = 2,
    Dirty = 3,
}

impl ExtensionContextStatus {
    /// Convert a 2-bit value into an [`ExtensionContextStatus`]. Only the two low bits are
    /// considered.
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 & 0b11 {
            0 => Self::Off,
            1 => Self::Initial,
            2 => Self::Clean,
            _ => Self::Dirty,
        }
    }
}

/// Typed view of an `hstatus` value.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Hstatus(pub u64);

impl Hstatus {
    fn bit(self, index: usize) -> bool {
        self.0.view_bits::<Lsb0>()[index]
    }

    fn with_bit(mut self, index: usize, value: bool) -> Self {
        self.0.view_bits_mut::<Lsb0>().set(index, value);
        self
    }

    /// Returns `true` if the SPV (Supervisor Previous Virtualization mode) bit is set.
    pub fn spv(self) -> bool {
        self.bit(hidx::SPV)
    }

    pub fn with_spv(self, value: bool) -> Self {
        self.with_bit(hidx::SPV, value)
    }

    /// Returns `true` if SPVP (Supervisor Previous Virtual Privilege) is S.
    pub fn spvp(self) -> bool {
        self.bit(hidx::SPVP)
    }

    pub fn with_spvp(self, privilege: PrivilegeLevel) -> Self {
        self.with_bit(hidx::SPVP, privilege != PrivilegeLevel::User)
    }

    pub fn with_gva(self, value: bool) -> Self {
        self.with_bit(hidx::GVA, value)
    }

    /// Returns `true` if the VTVM (Virtual Trap Virtual Memory) bit is set.
    pub fn vtvm(self) -> bool {
        self.bit(hidx::VTVM)
    }

    /// Returns `true` if the VTSR (Virtual Trap SRET) bit is set.
    pub fn vtsr(self) -> bool {
        self.bit(hidx::VTSR)
    }
}

/// Bit indices into the hstatus register.
pub mod hidx {
    pub const VSBE: usize = 5;
    pub const GVA: usize = 6;
    pub const SPV: usize = 7;
    pub const SPVP: usize = 8;
    pub const HU: usize = 9;
    pub const VTVM: usize = 20;
    pub const VTW: usize = 21;
    pub const VTSR: usize = 22;
    pub const VSXL: usize = 32;
}

/// Writable fields of `hstatus`. VGEIN is read-only zero, since no guest external interrupts
/// are implemented.
pub const HSTATUS_WRITE_MASK: u64 = bit(hidx::GVA)
    | bit(hidx::SPV)
    | bit(hidx::SPVP)
    | bit(hidx::HU)
    | bit(hidx::VTVM)
    | bit(hidx::VTW)
    | bit(hidx::VTSR);

/// Reset value of `hstatus`: VSXL is fixed to the machine width on RV64.
pub fn hstatus_reset(xlen: Xlen) -> u64 {
    match xlen {
        Xlen::Rv32 => 0,
        Xlen::Rv64 => xlen.encoding() << hidx::VSXL,
    }
}

const_assert!(idx::MPV < 64 && hidx::VSXL < 64);
const_assert!(HSTATUS_WRITE_MASK & (1 << hidx::VSBE) == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mpp_warl_keeps_old_value() {
        let ext = Extensions::default();
        let old = Status::new(0, Xlen::Rv64)
            .with_mpp(PrivilegeLevel::Supervisor)
            .value();
        let reserved = old & !field(idx::MPP, 2) | 0b10 << idx::MPP;
        let legal = legalize_mstatus(old, reserved, &ext, Xlen::Rv64);
        assert_eq!(RawPrivilegeLevel::Supervisor, Status::new(legal, Xlen::Rv64).mpp());
    }

    #[test]
    fn test_mpp_warl_without_supervisor() {
        let ext = Extensions {
            supervisor: false,
            ..Extensions::default()
        };
        let old = Status::new(0, Xlen::Rv32).with_mpp(PrivilegeLevel::User).value();
        let new = Status::new(old, Xlen::Rv32)
            .with_mpp(PrivilegeLevel::Supervisor)
            .value();
        let legal = legalize_mstatus(old, new, &ext, Xlen::Rv32);
        assert_eq!(RawPrivilegeLevel::User, Status::new(legal, Xlen::Rv32).mpp());
    }

    #[test]
    fn test_sd_follows_fs() {
        let status = Status::new(0, Xlen::Rv32).with_fs(ExtensionContextStatus::Dirty);
        assert!(status.sd());
        assert_eq!(1 << 31, status.value() & (1 << 31));
        let status = status.with_fs(ExtensionContextStatus::Clean);
        assert!(!status.sd());
    }

    #[test]
    fn test_sstatus_masks() {
        let ext = Extensions::default();
        assert_eq!(0, sstatus_write_mask(&ext) & !sstatus_read_mask(Xlen::Rv64));
        assert_eq!(0, sstatus_read_mask(Xlen::Rv64) & bit(idx::MPP));
        assert_ne!(0, mstatus_write_mask(&ext) & bit(idx::TVM));
    }

    #[test]
    fn test_reset_uxl_sxl() {
        let value = mstatus_reset(&Extensions::default(), Xlen::Rv64);
        assert_eq!(2, (value >> idx::UXL) & 0b11);
        assert_eq!(2, (value >> idx::SXL) & 0b11);
        assert_eq!(0, mstatus_reset(&Extensions::default(), Xlen::Rv32));
    }

    #[test]
    fn test_hstatus_fields() {
        let hstatus = Hstatus(0)
            .with_spv(true)
            .with_spvp(PrivilegeLevel::Supervisor)
            .with_gva(true);
        assert!(hstatus.spv());
        assert!(hstatus.spvp());
        assert_eq!(hstatus.0, hstatus.0 & HSTATUS_WRITE_MASK);
    }
}
