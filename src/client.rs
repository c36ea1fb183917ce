//! The transaction executor: one blocking write-then-read exchange per call.
//!
//! Each call walks the same path: wait out the bus-quiet spacing, switch the
//! bus to transmit if a direction line is configured, send the request,
//! switch back, read and validate the response, and finally record the
//! transaction end time in the shared bus timestamp whether the exchange
//! succeeded or not. That last step keeps failed exchanges from letting the
//! next caller hit the bus too early.

use crate::protocol::{self, Command, Direction, ResponseHeader};
use crate::transport::{BusDirection, Clock, DirectionControl, SystemClock, Transport};
use crate::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timestamp of the most recent exchange on a physical bus, in clock
/// milliseconds.
///
/// Clone it into every client that shares the bus so their quiet spacing
/// combines. The store is atomic; serializing whole transactions across
/// threads remains the caller's job.
#[derive(Debug, Clone, Default)]
pub struct BusTimestamp(Arc<AtomicU64>);

impl BusTimestamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn millis(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn store(&self, millis: u64) {
        self.0.store(millis, Ordering::Release);
    }
}

/// Client for a JBD battery management system on a half-duplex serial bus.
///
/// Generic over the [`Transport`] carrying the bytes; the `serialport`
/// module provides the usual serial implementation. A single instance is
/// not safe to share between threads without external locking.
pub struct JbdBms<T: Transport> {
    transport: T,
    direction: Option<Box<dyn DirectionControl>>,
    clock: Box<dyn Clock>,
    last_exchange: BusTimestamp,
    delay: Duration,
    frame_observer: Option<Box<dyn FnMut(&[u8])>>,
}

impl<T: Transport> JbdBms<T> {
    /// Creates a client with its own bus timestamp and the system clock.
    pub fn new(transport: T) -> Self {
        let bms = Self::with_shared_timestamp(transport, BusTimestamp::new());
        bms.last_exchange.store(bms.clock.now_millis());
        bms
    }

    /// Creates a client sharing `last_exchange` with other clients on the
    /// same physical bus, so their quiet spacing is enforced jointly. The
    /// shared value is left untouched; the peers that already use it own
    /// its history.
    pub fn with_shared_timestamp(transport: T, last_exchange: BusTimestamp) -> Self {
        let clock = Box::new(SystemClock::new());
        Self {
            transport,
            direction: None,
            clock,
            last_exchange,
            delay: protocol::DEFAULT_COMMAND_DELAY,
            frame_observer: None,
        }
    }

    /// Minimum quiet time between the end of one exchange and the start of
    /// the next.
    pub fn set_delay(&mut self, delay: Duration) {
        self.delay = delay;
    }

    /// Installs the output that switches the bus between transmit and
    /// receive. Without one the bus is assumed to arbitrate itself.
    pub fn set_direction_control(&mut self, direction: Box<dyn DirectionControl>) {
        self.direction = Some(direction);
    }

    /// Replaces the time source. Intended for tests and for platforms with
    /// their own notion of monotonic time.
    pub fn set_clock(&mut self, clock: Box<dyn Clock>) {
        self.clock = clock;
    }

    /// Registers a diagnostic callback receiving the exact bytes of every
    /// completely received response, valid or not. It must not block.
    pub fn set_frame_observer(&mut self, observer: impl FnMut(&[u8]) + 'static) {
        self.frame_observer = Some(Box::new(observer));
    }

    /// The shared bus timestamp, cloneable into peer clients.
    pub fn shared_timestamp(&self) -> BusTimestamp {
        self.last_exchange.clone()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Reads pack telemetry.
    pub fn get_status(&mut self) -> Result<protocol::Status, Error> {
        log::trace!("get status");
        let mut payload = [0u8; protocol::MAX_RESPONSE_PAYLOAD];
        let len = self.execute(Direction::Read, Command::Status, &[], &mut payload)?;
        Ok(protocol::Status::decode(&payload[..len]))
    }

    /// Reads the per-cell voltages.
    pub fn get_cells(&mut self) -> Result<protocol::Cells, Error> {
        log::trace!("get cell voltages");
        let mut payload = [0u8; protocol::MAX_RESPONSE_PAYLOAD];
        let len = self.execute(Direction::Read, Command::Cells, &[], &mut payload)?;
        Ok(protocol::Cells::decode(&payload[..len]))
    }

    /// Reads the hardware identification text.
    pub fn get_hardware(&mut self) -> Result<protocol::Hardware, Error> {
        log::trace!("get hardware id");
        let mut payload = [0u8; protocol::MAX_RESPONSE_PAYLOAD];
        let len = self.execute(Direction::Read, Command::Hardware, &[], &mut payload)?;
        Ok(protocol::Hardware::decode(&payload[..len]))
    }

    /// Switches the charge and discharge MOSFETs.
    pub fn set_mosfet(&mut self, state: protocol::Mosfet) -> Result<(), Error> {
        log::trace!("set mosfet to {state:?}");
        let frame = protocol::SetMosfet::request(state)?;
        self.run_transaction(&frame, &mut []).map(|_| ())
    }

    /// Performs one raw exchange: builds the request frame, transmits it and
    /// receives the response payload into `response`. Returns the payload
    /// length.
    pub fn execute(
        &mut self,
        direction: Direction,
        command: Command,
        request_payload: &[u8],
        response: &mut [u8],
    ) -> Result<usize, Error> {
        let frame = protocol::build_request(direction, command, request_payload)?;
        self.run_transaction(&frame, response)
    }

    /// The transaction proper. The shared timestamp is advanced on every
    /// path out of here, success or failure, so a failed exchange still
    /// counts for the next caller's quiet spacing.
    fn run_transaction(&mut self, frame: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        let result = self.exchange(frame, response);
        self.last_exchange.store(self.clock.now_millis());
        result
    }

    fn exchange(&mut self, frame: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        self.await_bus_quiet();
        self.transmit(frame)?;
        self.receive(response)
    }

    /// Blocks until the configured quiet time since the last exchange has
    /// passed. The subtraction wraps, so a last-exchange value in the
    /// future or from an overflowed clock yields a huge "remaining" that
    /// fails the guard and lets the call proceed immediately.
    fn await_bus_quiet(&self) {
        let delay = self.delay.as_millis() as u64;
        let elapsed = self
            .clock
            .now_millis()
            .wrapping_sub(self.last_exchange.millis());
        let remaining = delay.wrapping_sub(elapsed);
        if remaining <= delay {
            self.clock.sleep(Duration::from_millis(remaining));
        }
    }

    fn transmit(&mut self, frame: &[u8]) -> Result<(), Error> {
        if let Some(direction) = self.direction.as_mut() {
            direction.set(BusDirection::Transmit)?;
        }
        let result = self.write_frame(frame);
        if let Some(direction) = self.direction.as_mut() {
            direction.set(BusDirection::Receive)?;
        }
        result
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
        // Stale bytes from an earlier timed-out exchange would otherwise be
        // taken for this command's response.
        self.transport.discard_input()?;

        log::trace!("write frame: {frame:02X?}");
        let payload_len = frame.len() - 7;
        let (header, rest) = frame.split_at(4);
        let (payload, trailer) = rest.split_at(payload_len);
        let (crc, stop) = trailer.split_at(2);
        for part in [header, payload, crc, stop] {
            let written = self.transport.write(part)?;
            if written != part.len() {
                return Err(Error::ShortWrite {
                    written,
                    expected: part.len(),
                });
            }
        }
        self.transport.flush()?;
        Ok(())
    }

    fn receive(&mut self, response: &mut [u8]) -> Result<usize, Error> {
        let mut header_bytes = [0u8; ResponseHeader::SIZE];
        self.transport.read_exact(&mut header_bytes)?;
        let header = ResponseHeader::from_bytes(header_bytes);
        // Judge the header before committing to a payload read of its
        // declared length.
        header.validate()?;

        let length = usize::from(header.length);
        if length > response.len() {
            return Err(Error::ResponseBuffer {
                needed: header.length,
                capacity: response.len(),
            });
        }
        self.transport.read_exact(&mut response[..length])?;

        let mut crc_bytes = [0u8; 2];
        self.transport.read_exact(&mut crc_bytes)?;
        let mut stop = [0u8; 1];
        self.transport.read_exact(&mut stop)?;

        log::trace!(
            "received: header={header_bytes:02X?} payload={:02X?} crc={crc_bytes:02X?}",
            &response[..length]
        );

        if let Some(observer) = self.frame_observer.as_mut() {
            let mut raw = Vec::with_capacity(ResponseHeader::SIZE + length + 3);
            raw.extend_from_slice(&header.to_bytes());
            raw.extend_from_slice(&response[..length]);
            raw.extend_from_slice(&crc_bytes);
            raw.push(stop[0]);
            observer(&raw);
        }

        protocol::validate_response(&header, &response[..length], u16::from_be_bytes(crc_bytes))?;
        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{checksum, Mosfet, START_BYTE, STOP_BYTE};
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockState {
        rx: RefCell<VecDeque<u8>>,
        tx: RefCell<Vec<u8>>,
        write_sizes: RefCell<Vec<usize>>,
        discards: Cell<usize>,
        short_write: Cell<bool>,
    }

    #[derive(Clone, Default)]
    struct MockTransport(Rc<MockState>);

    impl MockTransport {
        fn enqueue_response(&self, code: u8, payload: &[u8]) {
            let mut rx = self.0.rx.borrow_mut();
            rx.extend([START_BYTE, code, payload.len() as u8]);
            rx.extend(payload.iter().copied());
            rx.extend(checksum(code, payload.len() as u8, payload).to_be_bytes());
            rx.push_back(STOP_BYTE);
        }

        fn enqueue_raw(&self, bytes: &[u8]) {
            self.0.rx.borrow_mut().extend(bytes.iter().copied());
        }

        fn tx(&self) -> Vec<u8> {
            self.0.tx.borrow().clone()
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            if self.0.short_write.get() && !data.is_empty() {
                return Ok(data.len() - 1);
            }
            self.0.tx.borrow_mut().extend_from_slice(data);
            self.0.write_sizes.borrow_mut().push(data.len());
            Ok(data.len())
        }

        fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
            let mut rx = self.0.rx.borrow_mut();
            if rx.len() < buf.len() {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "no response",
                ));
            }
            for byte in buf.iter_mut() {
                *byte = rx.pop_front().unwrap();
            }
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }

        fn discard_input(&mut self) -> std::io::Result<()> {
            self.0.discards.set(self.0.discards.get() + 1);
            Ok(())
        }
    }

    #[derive(Default)]
    struct ClockState {
        now: Cell<u64>,
        slept: RefCell<Vec<u64>>,
    }

    #[derive(Clone, Default)]
    struct MockClock(Rc<ClockState>);

    impl MockClock {
        fn advance(&self, millis: u64) {
            self.0.now.set(self.0.now.get() + millis);
        }

        fn slept(&self) -> Vec<u64> {
            self.0.slept.borrow().clone()
        }
    }

    impl Clock for MockClock {
        fn now_millis(&self) -> u64 {
            self.0.now.get()
        }

        fn sleep(&self, duration: Duration) {
            let millis = duration.as_millis() as u64;
            self.0.slept.borrow_mut().push(millis);
            self.0.now.set(self.0.now.get() + millis);
        }
    }

    fn test_bms(delay_ms: u64) -> (JbdBms<MockTransport>, MockTransport, MockClock) {
        let transport = MockTransport::default();
        let clock = MockClock::default();
        let mut bms = JbdBms::new(transport.clone());
        bms.set_clock(Box::new(clock.clone()));
        bms.set_delay(Duration::from_millis(delay_ms));
        // Align the timestamp with the mock clock's zero.
        bms.last_exchange.store(0);
        (bms, transport, clock)
    }

    #[test]
    fn status_roundtrip() {
        let (mut bms, transport, _clock) = test_bms(0);
        let mut payload = vec![0u8; 23];
        payload[0] = 0x08;
        payload[1] = 0x42;
        payload[21] = 4;
        transport.enqueue_response(0, &payload);

        let status = bms.get_status().unwrap();
        assert_eq!(status.voltage, 2114);
        assert_eq!(status.cells, 4);
        // The request went out as one frame in four writes.
        assert_eq!(transport.tx(), [0xDD, 0xA5, 0x03, 0x00, 0xFF, 0xFD, 0x77]);
        assert_eq!(*transport.0.write_sizes.borrow(), [4, 0, 2, 1]);
        assert_eq!(transport.0.discards.get(), 1);
    }

    #[test]
    fn set_mosfet_writes_inverted_mask() {
        let (mut bms, transport, _clock) = test_bms(0);
        transport.enqueue_response(0, &[]);
        bms.set_mosfet(Mosfet::Both).unwrap();
        assert_eq!(
            transport.tx(),
            [0xDD, 0x5A, 0xE1, 0x02, 0x00, 0x00, 0xFF, 0x1D, 0x77]
        );
    }

    #[test]
    fn second_call_waits_out_the_quiet_time() {
        let (mut bms, transport, clock) = test_bms(60);
        transport.enqueue_response(0, &[]);
        transport.enqueue_response(0, &[]);

        bms.get_hardware().unwrap();
        let first_sleeps = clock.slept();

        clock.advance(10);
        bms.get_hardware().unwrap();
        let mut second_sleeps = clock.slept();
        second_sleeps.drain(..first_sleeps.len());

        // 60 ms spacing minus the 10 ms already elapsed.
        assert_eq!(second_sleeps, [50]);
    }

    #[test]
    fn elapsed_quiet_time_means_no_wait() {
        let (mut bms, transport, clock) = test_bms(60);
        transport.enqueue_response(0, &[]);
        transport.enqueue_response(0, &[]);

        bms.get_hardware().unwrap();
        let sleeps_after_first = clock.slept().len();

        clock.advance(200);
        bms.get_hardware().unwrap();
        assert_eq!(clock.slept().len(), sleeps_after_first);
    }

    #[test]
    fn future_timestamp_does_not_stall() {
        // A last-exchange value past "now" makes the elapsed-time
        // subtraction wrap; the guard must fall through rather than sleep
        // for an absurd while.
        let (mut bms, transport, clock) = test_bms(60);
        transport.enqueue_response(0, &[]);
        bms.last_exchange.store(clock.now_millis() + 1_000);
        bms.get_hardware().unwrap();
        assert!(clock.slept().is_empty());
    }

    #[test]
    fn failure_still_advances_the_timestamp() {
        let (mut bms, transport, clock) = test_bms(60);
        // Bad start marker.
        transport.enqueue_raw(&[0xAA, 0x00, 0x00, 0xFF, 0xFF, 0x77]);
        clock.advance(500);

        let err = bms.get_status().unwrap_err();
        assert!(matches!(err, Error::StartMarker(0xAA)));
        assert_eq!(bms.shared_timestamp().millis(), clock.now_millis());
    }

    #[test]
    fn shared_timestamp_spaces_out_peer_clients() {
        let transport_a = MockTransport::default();
        let transport_b = MockTransport::default();
        let clock = MockClock::default();

        let mut a = JbdBms::new(transport_a.clone());
        a.set_clock(Box::new(clock.clone()));
        a.set_delay(Duration::from_millis(60));
        let mut b = JbdBms::with_shared_timestamp(transport_b.clone(), a.shared_timestamp());
        b.set_clock(Box::new(clock.clone()));
        b.set_delay(Duration::from_millis(60));

        transport_a.enqueue_response(0, &[]);
        transport_b.enqueue_response(0, &[]);

        a.get_hardware().unwrap();
        let sleeps_before = clock.slept();
        clock.advance(20);
        b.get_hardware().unwrap();

        let mut sleeps = clock.slept();
        sleeps.drain(..sleeps_before.len());
        assert_eq!(sleeps, [40]);
    }

    #[test]
    fn short_write_fails_the_transaction() {
        let (mut bms, transport, clock) = test_bms(0);
        transport.0.short_write.set(true);
        clock.advance(7);
        let err = bms.get_status().unwrap_err();
        assert!(matches!(
            err,
            Error::ShortWrite {
                written: 3,
                expected: 4
            }
        ));
        assert_eq!(bms.shared_timestamp().millis(), 7);
    }

    #[test]
    fn silent_bus_times_out() {
        let (mut bms, _transport, _clock) = test_bms(0);
        assert!(matches!(bms.get_status().unwrap_err(), Error::Timeout));
    }

    #[test]
    fn oversized_response_aborts_before_payload_read() {
        let (mut bms, transport, _clock) = test_bms(0);
        transport.enqueue_raw(&[0xDD, 0x00, 65]);
        assert!(matches!(
            bms.get_status().unwrap_err(),
            Error::PayloadLength(65)
        ));
    }

    #[test]
    fn nonempty_response_without_buffer_fails() {
        let (mut bms, transport, _clock) = test_bms(0);
        transport.enqueue_response(0, &[0x01]);
        let frame = protocol::build_request(Direction::Write, Command::Mosfet, &[0, 0]).unwrap();
        let err = bms.run_transaction(&frame, &mut []).unwrap_err();
        assert!(matches!(
            err,
            Error::ResponseBuffer {
                needed: 1,
                capacity: 0
            }
        ));
    }

    #[test]
    fn observer_sees_invalid_frames_too() {
        let (mut bms, transport, _clock) = test_bms(0);
        // Valid structure, corrupted checksum.
        let frame = [0xDD, 0x00, 0x01, 0xAB, 0x00, 0x00, 0x77];
        transport.enqueue_raw(&frame);

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        bms.set_frame_observer(move |raw: &[u8]| sink.borrow_mut().push(raw.to_vec()));

        let err = bms.get_status().unwrap_err();
        assert!(matches!(err, Error::Checksum { .. }));
        assert_eq!(*seen.borrow(), [frame.to_vec()]);
    }

    #[test]
    fn observer_skipped_when_header_never_arrives() {
        let (mut bms, _transport, _clock) = test_bms(0);
        let seen = Rc::new(Cell::new(0));
        let sink = seen.clone();
        bms.set_frame_observer(move |_: &[u8]| sink.set(sink.get() + 1));
        let _ = bms.get_status().unwrap_err();
        assert_eq!(seen.get(), 0);
    }

    #[test]
    fn peripheral_error_code_is_reported() {
        let (mut bms, transport, _clock) = test_bms(0);
        transport.enqueue_response(0x80, &[]);
        assert!(matches!(
            bms.get_status().unwrap_err(),
            Error::ReturnCode(0x80)
        ));
    }

    #[test]
    fn direction_line_toggles_around_the_write() {
        #[derive(Clone, Default)]
        struct RecordingDirection(Rc<RefCell<Vec<BusDirection>>>);
        impl DirectionControl for RecordingDirection {
            fn set(&mut self, direction: BusDirection) -> std::io::Result<()> {
                self.0.borrow_mut().push(direction);
                Ok(())
            }
        }

        let (mut bms, transport, _clock) = test_bms(0);
        transport.enqueue_response(0, &[]);
        let line = RecordingDirection::default();
        bms.set_direction_control(Box::new(line.clone()));

        bms.get_hardware().unwrap();
        assert_eq!(
            *line.0.borrow(),
            [BusDirection::Transmit, BusDirection::Receive]
        );
    }
}
