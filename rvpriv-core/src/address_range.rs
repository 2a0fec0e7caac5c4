use thiserror::Error;

/// A non-empty range of physical addresses bounded inclusively below and above.
///
/// Enforces the invariant that `self.start() <= self.end()`. Inclusive bounds let a PMP region
/// or a RAM unit reach `u64::MAX`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddressRange {
    start: u64,
    end: u64,
}

impl AddressRange {
    pub fn new(start: u64, end: u64) -> Result<Self, InvalidBoundsError> {
        (start <= end)
            .then_some(Self { start, end })
            .ok_or(InvalidBoundsError { start, end })
    }

    /// Create the range `[start, start + size)`, or `None` if `size == 0` or the range would wrap
    /// around the address space.
    pub fn with_size(start: u64, size: u64) -> Option<Self> {
        let end = start.checked_add(size.checked_sub(1)?)?;
        Some(Self { start, end })
    }

    /// The bytes touched by an access of `len` bytes at `start`, clamped to the top of the address
    /// space. Zero-length accesses touch `start` only.
    pub fn access(start: u64, len: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(len.saturating_sub(1)),
        }
    }

    pub fn start(self) -> u64 {
        self.start
    }

    /// Check if `other` lies entirely within this address range.
    pub fn contains_range(self, other: Self) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Check if this address range shares at least one address with `other`.
    pub fn overlaps(self, other: Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Check if `other` starts or ends strictly inside this range, so that this range holds
    /// addresses on both sides of one of its bounds.
    pub fn splits(self, other: Self) -> bool {
        (self.start < other.start && other.start <= self.end)
            || (self.start <= other.end && other.end < self.end)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("bounds [{start:#x}, {end:#x}] do not form a valid address range")]
pub struct InvalidBoundsError {
    start: u64,
    end: u64,
}
