//! Side channel recording every architecturally visible state change for trace comparison.

use log::trace;
use std::collections::VecDeque;

use crate::core::csr::CsrSpecifier;

/// A single committed change.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommitEvent {
    /// A CSR write took effect. `value` is the value that was written to the instance behind
    /// `address`, which may differ from what a subsequent read returns.
    Csr { address: CsrSpecifier, value: u64 },
    /// A load completed at virtual `address`.
    MemoryRead { address: u64, size: u8 },
    /// A store completed at virtual `address`.
    MemoryWrite { address: u64, value: u64, size: u8 },
}

/// Bounded queue of [`CommitEvent`]s. When full, the oldest event is discarded.
///
/// A disabled log accepts every event and records nothing.
#[derive(Debug, Clone)]
pub struct CommitLog {
    enabled: bool,
    capacity: usize,
    events: VecDeque<CommitEvent>,
}

impl CommitLog {
    pub fn new(enabled: bool, capacity: usize) -> Self {
        Self {
            enabled,
            capacity,
            events: VecDeque::new(),
        }
    }

    /// A log that records nothing.
    pub fn disabled() -> Self {
        Self::new(false, 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn push(&mut self, event: CommitEvent) {
        if !self.enabled || self.capacity == 0 {
            return;
        }
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn log_csr(&mut self, address: CsrSpecifier, value: u64) {
        trace!("CSR {address:#05X} <- {value:#x}");
        self.push(CommitEvent::Csr { address, value });
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommitEvent> {
        self.events.iter()
    }

    /// Removes and returns all recorded events, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = CommitEvent> + '_ {
        self.events.drain(..)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl Default for CommitLog {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded() {
        let mut log = CommitLog::new(true, 2);
        log.log_csr(0x300, 1);
        log.log_csr(0x300, 2);
        log.log_csr(0x300, 3);
        let events: Vec<_> = log.drain().collect();
        assert_eq!(
            vec![
                CommitEvent::Csr {
                    address: 0x300,
                    value: 2
                },
                CommitEvent::Csr {
                    address: 0x300,
                    value: 3
                },
            ],
            events
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_disabled_records_nothing() {
        let mut log = CommitLog::disabled();
        log.log_csr(0x300, 1);
        assert_eq!(0, log.len());
    }
}
