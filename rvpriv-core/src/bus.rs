//! Physical memory as reached by a hart after translation and protection checks.

use std::fmt::Debug;
use thiserror::Error;

/// Byte-addressable, little-endian physical address space.
///
/// Every `(address, size)` pair must be handled without panics; addresses that are not backed by
/// anything are reported through [`BusError`], which the hart turns into an access fault.
///
/// Implementors backed by a directly addressable byte array may expose it through
/// [`backing_index`](Self::backing_index) and [`backing_memory`](Self::backing_memory). The
/// translation cache only caches pages for which this is the case, and then reaches the bytes
/// without going through [`read`](Self::read) and [`write`](Self::write).
pub trait Bus: Debug {
    /// Reads `buf.len()` bytes at `address` into `buf`.
    fn read(&mut self, buf: &mut [u8], address: u64) -> Result<(), BusError>;

    /// Writes `buf` to `address`.
    fn write(&mut self, address: u64, buf: &[u8]) -> Result<(), BusError>;

    /// Index into [`backing_memory`](Self::backing_memory) of the byte at physical `address`, if
    /// that byte lives in directly addressable memory.
    fn backing_index(&self, address: u64) -> Option<usize> {
        let _ = address;
        None
    }

    /// Directly addressable memory, indexed by [`backing_index`](Self::backing_index).
    fn backing_memory(&mut self) -> &mut [u8] {
        &mut []
    }
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum BusError {
    /// No resource responds to (part of) the requested range.
    #[error("no resource mapped at {address:#x} (size {size})")]
    Unmapped { address: u64, size: usize },
}
