//! The VXI-11 port shared between the session engine and the portmappers.
use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicU16, Ordering},
    },
};

use crate::error::ServerError;

/// Default first port of the VXI-11 rotation
pub const DEFAULT_PORT_RANGE_START: u16 = 9010;
/// Default last port (inclusive) of the VXI-11 rotation
pub const DEFAULT_PORT_RANGE_END: u16 = 9019;

/// An inclusive, non-empty range of TCP ports.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Returns `None` if `start > end`.
    pub fn new(start: u16, end: u16) -> Option<PortRange> {
        (start <= end).then_some(PortRange { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// The port following `port`, wrapping around to the start.
    pub fn next_after(&self, port: u16) -> u16 {
        match port.checked_add(1) {
            Some(next) if next <= self.end => next,
            _ => self.start,
        }
    }
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            start: DEFAULT_PORT_RANGE_START,
            end: DEFAULT_PORT_RANGE_END,
        }
    }
}

impl Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Holds the port the VXI-11 service currently listens on.
///
/// Only the session engine moves the port. Portmappers get a [`PortReader`].
#[derive(Debug)]
pub struct PortRegistry {
    port: Arc<AtomicU16>,
    range: PortRange,
}

impl PortRegistry {
    /// Creates a registry pointing at the start of `range`.
    pub fn new(range: PortRange) -> PortRegistry {
        PortRegistry {
            port: Arc::new(AtomicU16::new(range.start())),
            range,
        }
    }

    pub fn get(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn set(&self, port: u16) -> Result<(), ServerError> {
        if !self.range.contains(port) {
            return Err(ServerError::PortOutOfRange {
                port,
                range: self.range,
            });
        }
        self.port.store(port, Ordering::Release);
        Ok(())
    }

    /// Moves to the next port of the range and returns it.
    pub fn advance(&self) -> u16 {
        let range = self.range;
        let previous = self
            .port
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |port| {
                Some(range.next_after(port))
            })
            // The closure never returns `None`
            .unwrap_or_else(|port| port);
        range.next_after(previous)
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn reader(&self) -> PortReader {
        PortReader {
            port: Arc::clone(&self.port),
        }
    }
}

/// Read-only view of a [`PortRegistry`], handed to the portmapper workers.
#[derive(Clone, Debug)]
pub struct PortReader {
    port: Arc<AtomicU16>,
}

impl PortReader {
    pub fn get(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn empty_range_is_rejected() {
        assert!(PortRange::new(9011, 9010).is_none());
        assert!(PortRange::new(9010, 9010).is_some());
    }

    #[test]
    fn starts_at_range_start() {
        let registry = PortRegistry::new(PortRange::default());
        assert_eq!(registry.get(), 9010);
        assert_eq!(registry.reader().get(), 9010);
    }

    #[test]
    fn rotation_is_circular() {
        let range = PortRange::new(9010, 9013).unwrap();
        let registry = PortRegistry::new(range);
        for k in 1..=13u16 {
            registry.advance();
            assert_eq!(registry.get(), 9010 + k % 4);
        }
    }

    #[test]
    fn single_port_range() {
        let registry = PortRegistry::new(PortRange::new(5025, 5025).unwrap());
        assert_eq!(registry.advance(), 5025);
        assert_eq!(registry.get(), 5025);
    }

    #[test]
    fn range_ending_at_max_port() {
        let registry = PortRegistry::new(PortRange::new(65534, 65535).unwrap());
        assert_eq!(registry.advance(), 65535);
        assert_eq!(registry.advance(), 65534);
    }

    #[test]
    fn set_outside_range() {
        let registry = PortRegistry::new(PortRange::default());
        assert!(matches!(
            registry.set(9020),
            Err(ServerError::PortOutOfRange { port: 9020, .. })
        ));
        registry.set(9015).unwrap();
        assert_eq!(registry.reader().get(), 9015);
    }

    #[test]
    fn readers_observe_advances() {
        let registry = PortRegistry::new(PortRange::default());
        let reader = registry.reader();
        let observer = thread::spawn(move || {
            for _ in 0..1000 {
                let port = reader.get();
                assert!(PortRange::default().contains(port));
            }
        });
        for _ in 0..1000 {
            registry.advance();
        }
        observer.join().unwrap();
        assert_eq!(registry.get(), 9010);
    }
}
