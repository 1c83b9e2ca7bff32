//! Byte transports for the emulator session.
//!
//! The session loop depends only on the `Transport` contract: open once at
//! startup, poll for whatever bytes have arrived without blocking past a
//! short timeout, write responses, close at shutdown. Two bindings are
//! provided:
//! - `SerialTransport`: a physical serial device
//! - `TcpTransport`: a loopback-friendly listener serving one peer at a
//!   time, so the controlling side can be tested with no hardware attached

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tracing::{debug, info};

/// Bound applied to blocking transport reads.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Read chunk size for the TCP peer socket.
const READ_CHUNK: usize = 1024;

/// Transport-level errors.
#[derive(Debug)]
pub enum TransportError {
    /// The transport could not be opened at startup.
    Open(String),
    /// A read or write failed on an open transport.
    Io(std::io::Error),
    /// Operation attempted with no open device or connected peer.
    NotConnected,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Open(what) => write!(f, "Failed to open transport: {what}"),
            TransportError::Io(e) => write!(f, "Transport I/O error: {e}"),
            TransportError::NotConnected => write!(f, "Transport not connected"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A reliable ordered byte stream the session loop can poll.
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), TransportError>;

    /// Bytes that have arrived since the last poll, possibly empty. Must not
    /// block past the internal read timeout.
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError>;

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    fn close(&mut self);
}

/// A physical serial device.
pub struct SerialTransport {
    path: String,
    baud: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self {
            path: path.into(),
            baud,
            port: None,
        }
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let port = serialport::new(self.path.as_str(), self.baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| TransportError::Open(format!("{}: {e}", self.path)))?;
        info!(path = %self.path, baud = self.baud, "serial port open");
        self.port = Some(port);
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let pending = port
            .bytes_to_read()
            .map_err(|e| TransportError::Io(e.into()))? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }

        let mut data = vec![0u8; pending];
        match port.read(&mut data) {
            Ok(n) => {
                data.truncate(n);
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            }
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        port.write_all(data).map_err(TransportError::Io)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!(path = %self.path, "serial port closed");
        }
    }
}

/// A TCP listener serving exactly one peer at a time. After a peer drops,
/// the next connection attempt is accepted.
pub struct TcpTransport {
    addr: String,
    listener: Option<TcpListener>,
    peer: Option<TcpStream>,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            listener: None,
            peer: None,
        }
    }

    /// Address the listener actually bound, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn poll_accept(&mut self) -> Result<(), TransportError> {
        let listener = self.listener.as_ref().ok_or(TransportError::NotConnected)?;
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false).map_err(TransportError::Io)?;
                stream
                    .set_read_timeout(Some(READ_TIMEOUT))
                    .map_err(TransportError::Io)?;
                info!(%peer, "peer connected");
                self.peer = Some(stream);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.addr)
            .map_err(|e| TransportError::Open(format!("{}: {e}", self.addr)))?;
        listener.set_nonblocking(true).map_err(TransportError::Io)?;
        info!(address = %self.addr, "listening for a peer");
        self.listener = Some(listener);
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        if self.peer.is_none() {
            self.poll_accept()?;
        }
        let Some(peer) = self.peer.as_mut() else {
            return Ok(Vec::new());
        };

        let mut buf = [0u8; READ_CHUNK];
        match peer.read(&mut buf) {
            Ok(0) => {
                debug!("peer disconnected");
                self.peer = None;
                Ok(Vec::new())
            }
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                Ok(Vec::new())
            }
            Err(e) => {
                self.peer = None;
                Err(TransportError::Io(e))
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let peer = self.peer.as_mut().ok_or(TransportError::NotConnected)?;
        peer.write_all(data).map_err(TransportError::Io)
    }

    fn close(&mut self) {
        self.peer = None;
        if self.listener.take().is_some() {
            info!(address = %self.addr, "listener closed");
        }
    }
}
