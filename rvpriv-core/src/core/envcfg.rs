//! Fields of the menvcfg, senvcfg, and henvcfg registers.

use bitvec::{order::Lsb0, view::BitView};

use crate::config::Extensions;

/// Bit indices for the fields of the envcfg registers, in their 64-bit layout.
pub mod idx {
    pub const FIOM: usize = 0;
    // The cache-block fields (CBIE, CBCFE, CBZE) belong to extensions that are not implemented.
    pub const PBMTE: usize = 62;
}

/// Writable fields of `menvcfg`.
pub fn menvcfg_mask(ext: &Extensions) -> u64 {
    let mut mask = 1 << idx::FIOM;
    if ext.svpbmt {
        mask |= 1 << idx::PBMTE;
    }
    mask
}

/// Writable fields of `senvcfg`.
pub const SENVCFG_MASK: u64 = 1 << idx::FIOM;

/// Writable fields of `henvcfg`. PBMTE reads as zero whenever `menvcfg.PBMTE` is clear.
pub fn henvcfg_mask(ext: &Extensions) -> u64 {
    menvcfg_mask(ext)
}

pub fn pbmte(envcfg: u64) -> bool {
    envcfg.view_bits::<Lsb0>()[idx::PBMTE]
}

/// Value of `henvcfg` as read, given the raw stored value and the current `menvcfg`.
pub fn henvcfg_read(raw: u64, menvcfg: u64) -> u64 {
    match pbmte(menvcfg) {
        true => raw,
        false => raw & !(1 << idx::PBMTE),
    }
}
