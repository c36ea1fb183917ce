//! Capability interfaces consumed by the protocol engine.
//!
//! The engine itself has no dependency on a particular serial stack or
//! platform: it talks to the bus through [`Transport`], arbitrates a
//! half-duplex line through an optional [`DirectionControl`], and measures
//! bus-quiet spacing through a [`Clock`]. Concrete implementations live in
//! the `serialport` module or in the caller's own code.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// A blocking byte-stream transport.
///
/// Read deadlines are owned by the transport: `read_exact` is expected to
/// fail with `std::io::ErrorKind::TimedOut` when the peripheral stays
/// silent.
pub trait Transport {
    /// Writes `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize>;
    /// Reads exactly `buf.len()` bytes or fails.
    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()>;
    /// Blocks until previously written bytes are physically transmitted.
    fn flush(&mut self) -> std::io::Result<()>;
    /// Drops any stale bytes waiting in the receive path.
    fn discard_input(&mut self) -> std::io::Result<()>;
}

/// Direction of a half-duplex bus transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusDirection {
    Transmit,
    Receive,
}

/// Output switching a shared bus between transmit and receive mode.
///
/// Not needed when the transceiver arbitrates direction on its own.
pub trait DirectionControl {
    fn set(&mut self, direction: BusDirection) -> std::io::Result<()>;
}

/// Millisecond-resolution monotonic time source.
///
/// Injectable so transaction spacing can be driven deterministically in
/// tests.
pub trait Clock {
    /// Milliseconds since an arbitrary fixed epoch.
    fn now_millis(&self) -> u64;
    /// Blocks the caller for `duration`.
    fn sleep(&self, duration: Duration);
}

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// [`Clock`] backed by `std::time::Instant` and `std::thread::sleep`.
///
/// All instances share one process-wide epoch, so clients constructed at
/// different times still agree on the timeline of a shared bus timestamp.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        // Pin the epoch at first use.
        process_epoch();
        SystemClock
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        process_epoch().elapsed().as_millis() as u64
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
