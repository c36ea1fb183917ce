//! Synchronous serial transport backed by the `serialport` crate.
//!
//! JBD packs speak 9600 baud, 8 data bits, no parity, one stop bit over
//! their UART/RS485 port. Read deadlines are owned by the port timeout.
//!
//! # Example
//!
//! ```no_run
//! use jbdbms_lib::client::JbdBms;
//! use jbdbms_lib::serialport::SerialTransport;
//! use std::time::Duration;
//!
//! fn main() -> Result<(), jbdbms_lib::Error> {
//!     let transport = SerialTransport::open("/dev/ttyUSB0", Duration::from_millis(500))?;
//!     let mut bms = JbdBms::new(transport);
//!     let status = bms.get_status()?;
//!     println!("pack voltage: {} x 10mV", status.voltage);
//!     Ok(())
//! }
//! ```

use crate::transport::{BusDirection, DirectionControl, Transport};
use crate::Error;
use std::io::{Read, Write};
use std::time::Duration;

/// Baud rate of the JBD UART port.
pub const BAUD_RATE: u32 = 9600;

fn into_io(err: serialport::Error) -> std::io::Error {
    std::io::Error::other(err)
}

/// A serial port configured for JBD communication.
pub struct SerialTransport {
    serial: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    /// Opens `port` at 9600 8N1 with the given read/write timeout.
    pub fn open(port: &str, timeout: Duration) -> Result<Self, Error> {
        let serial = serialport::new(port, BAUD_RATE)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(into_io)?;
        Ok(Self { serial })
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), Error> {
        self.serial.set_timeout(timeout).map_err(into_io)?;
        Ok(())
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.serial.write(data)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.serial.read_exact(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.serial.flush()
    }

    fn discard_input(&mut self) -> std::io::Result<()> {
        self.serial
            .clear(serialport::ClearBuffer::Input)
            .map_err(into_io)
    }
}

/// Bus direction control over the port's RTS line.
///
/// Many RS485 dongles expose their DE/!RE driver-enable pins on RTS and
/// need it asserted while transmitting. Boards with automatic direction
/// selection do not need this.
pub struct RtsDirection {
    serial: Box<dyn serialport::SerialPort>,
}

impl RtsDirection {
    /// Creates a direction control sharing `transport`'s port handle.
    pub fn new(transport: &SerialTransport) -> Result<Self, Error> {
        let serial = transport.serial.try_clone().map_err(into_io)?;
        Ok(Self { serial })
    }
}

impl DirectionControl for RtsDirection {
    fn set(&mut self, direction: BusDirection) -> std::io::Result<()> {
        self.serial
            .write_request_to_send(direction == BusDirection::Transmit)
            .map_err(into_io)
    }
}
