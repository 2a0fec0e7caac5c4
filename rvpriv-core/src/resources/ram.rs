use crate::bus::{Bus, BusError};
use crate::AddressRange;

/// Zero-initialized main memory occupying one continuous physical range.
///
/// Accesses that fall (partly) outside the range are reported as [`BusError::Unmapped`] without
/// touching any byte. The whole range is directly addressable, so every page of it can be cached
/// by the translation cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ram {
    data: Vec<u8>,
    range: AddressRange,
}

impl Ram {
    /// Create a new zero-initialized RAM resource that holds `size` bytes, mapped at `base`.
    ///
    /// Returns `None` if `size == 0` or the range would not fit in the 64-bit address space.
    pub fn new(base: u64, size: usize) -> Option<Self> {
        let range = AddressRange::with_size(base, u64::try_from(size).ok()?)?;
        Some(Self {
            data: vec![0; size],
            range,
        })
    }

    fn index_of(&self, address: u64, size: usize) -> Result<usize, BusError> {
        let unmapped = BusError::Unmapped { address, size };
        let bytes = AddressRange::with_size(address, size.max(1) as u64);
        match bytes {
            Some(bytes) if self.range.contains_range(bytes) => {
                usize::try_from(address - self.range.start()).map_err(|_| unmapped)
            }
            _ => Err(unmapped),
        }
    }
}

impl Bus for Ram {
    fn read(&mut self, buf: &mut [u8], address: u64) -> Result<(), BusError> {
        let start = self.index_of(address, buf.len())?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, address: u64, buf: &[u8]) -> Result<(), BusError> {
        let start = self.index_of(address, buf.len())?;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn backing_index(&self, address: u64) -> Option<usize> {
        self.index_of(address, 1).ok()
    }

    fn backing_memory(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
