//! Ephemeral port allocation
//!
//! Every reply the server sends (a whole transfer or a single ERROR packet)
//! originates from its own port, never from the well-known listening port.
//! Ports are handed out by a monotonically increasing cursor and are never
//! reused within the lifetime of an allocator.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

/// A half-open range of UDP ports, `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// The IANA dynamic/private range, excluding 65535
    pub const EPHEMERAL: Self = Self::new(49152, 65535);

    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        usize::from(self.end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..self.end).contains(&port)
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::EPHEMERAL
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Every port of the range has been issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ephemeral port range {0} exhausted")]
pub struct PortExhausted(pub PortRange);

/// Lock-free allocator over a [`PortRange`]
///
/// Safe to share between tasks: each successful [`allocate`](Self::allocate)
/// returns a port strictly greater than every port issued before it.
///
/// # Examples
/// ```
/// use tftp::{PortAllocator, PortRange};
///
/// let ports = PortAllocator::new(PortRange::new(50000, 50002));
/// assert_eq!(ports.allocate(), Ok(50000));
/// assert_eq!(ports.allocate(), Ok(50001));
/// assert!(ports.allocate().is_err());
/// ```
#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    next: AtomicU32,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            next: AtomicU32::new(u32::from(range.start)),
        }
    }

    /// Issue the next unused port
    ///
    /// The cursor never moves past the end of the range, so once exhausted
    /// the allocator stays exhausted.
    pub fn allocate(&self) -> Result<u16, PortExhausted> {
        let end = u32::from(self.range.end);
        self.next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| (n < end).then_some(n + 1))
            .map(|port| port as u16)
            .map_err(|_| PortExhausted(self.range))
    }

    /// Number of ports issued so far
    pub fn issued(&self) -> usize {
        (self.next.load(Ordering::Relaxed) - u32::from(self.range.start)) as usize
    }

    /// Number of ports still available
    pub fn remaining(&self) -> usize {
        self.range.len() - self.issued()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn test_port_range() {
        let range = PortRange::default();
        assert_eq!(range, PortRange::EPHEMERAL);
        assert_eq!(range.len(), 16383);
        assert!(range.contains(49152));
        assert!(range.contains(65534));
        assert!(!range.contains(65535));
        assert!(!range.contains(69));
        assert!(PortRange::new(10, 10).is_empty());
        assert_eq!(PortRange::new(10, 5).len(), 0);
    }

    #[test]
    fn test_sequential_allocation() {
        let ports = PortAllocator::default();
        assert_eq!(ports.allocate(), Ok(49152));
        assert_eq!(ports.allocate(), Ok(49153));
        assert_eq!(ports.allocate(), Ok(49154));
        assert_eq!(ports.issued(), 3);
        assert_eq!(ports.remaining(), 16380);
    }

    #[test]
    fn test_exhaustion_is_permanent() {
        let range = PortRange::new(65533, 65535);
        let ports = PortAllocator::new(range);
        assert_eq!(ports.allocate(), Ok(65533));
        assert_eq!(ports.allocate(), Ok(65534));
        assert_eq!(ports.allocate(), Err(PortExhausted(range)));
        assert_eq!(ports.allocate(), Err(PortExhausted(range)));
        assert_eq!(ports.remaining(), 0);
    }

    #[test]
    fn test_empty_range() {
        let ports = PortAllocator::new(PortRange::new(50000, 50000));
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let ports = Arc::new(PortAllocator::new(PortRange::new(50000, 54000)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                thread::spawn(move || {
                    let mut issued = Vec::new();
                    while let Ok(port) = ports.allocate() {
                        issued.push(port);
                    }
                    issued
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            let issued = handle.join().unwrap();
            // Each thread observes a strictly increasing sequence
            assert!(issued.windows(2).all(|w| w[0] < w[1]));
            for port in issued {
                assert!(all.insert(port), "port {} issued twice", port);
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
