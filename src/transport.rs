//! Duplex byte channel to the BLED112 dongle.
//!
//! The dongle enumerates as a USB CDC serial device, so the production
//! transport is a plain serial port. The trait exists so the session can be
//! driven by anything that moves bytes, including the simulated dongle used
//! in tests.

use std::io::{self, Read, Write};

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};

use crate::config::SerialConfig;
use crate::errors::Result;

/// Byte channel owned by the session loop.
pub trait Transport {
    /// Read whatever is available. `Ok(0)` means nothing arrived within the
    /// transport's read timeout; it is not end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Release the underlying device. Further reads and writes fail.
    fn close(&mut self) -> io::Result<()>;
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write_all(bytes)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Serial port connection to a BLED112 dongle (e.g. `/dev/ttyACM0`, `COM3`).
pub struct SerialTransport {
    port: Option<Box<dyn SerialPort>>,
    path: String,
}

impl SerialTransport {
    /// Open the serial device described by `config`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let mut port = serialport::new(&config.path, config.baud_rate)
            .timeout(config.read_timeout)
            .open()?;

        // The dongle ignores line settings, but expects DTR like any CDC device.
        port.write_data_terminal_ready(true)?;
        port.clear(ClearBuffer::All)?;

        info!(
            "serial transport open: path={}, baud={}",
            config.path, config.baud_rate
        );
        Ok(Self {
            port: Some(port),
            path: config.path.clone(),
        })
    }

    /// Device path this transport was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port()?;
        Write::write_all(port, bytes)?;
        port.flush()
    }

    fn close(&mut self) -> io::Result<()> {
        if self.port.take().is_some() {
            debug!("serial transport closed: path={}", self.path);
        }
        Ok(())
    }
}
