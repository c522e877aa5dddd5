//! Raw TCP paired stream
//!
//! The bottom of every layer stack. Readiness is reported by the event
//! loop; `try_read`/`try_write` keep the socket non-blocking and a
//! `WouldBlock` result clears the corresponding readiness flag until the
//! next event arrives.

use super::{PairedStream, StreamEvent};
use std::io;
use tokio::net::TcpStream;

/// Non-blocking TCP stream with event-tracked readiness
pub struct RawStream {
    socket: TcpStream,
    readable: bool,
    writable: bool,
    open: bool,
}

impl RawStream {
    /// Wrap a connected socket
    pub fn new(socket: TcpStream) -> Self {
        Self {
            socket,
            readable: false,
            writable: false,
            open: true,
        }
    }

    /// The underlying socket, for readiness polling
    pub fn socket(&self) -> &TcpStream {
        &self.socket
    }
}

impl PairedStream for RawStream {
    fn handle_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        if !self.open {
            return Vec::new();
        }
        match &event {
            StreamEvent::HasBytesAvailable => self.readable = true,
            StreamEvent::HasSpaceAvailable => self.writable = true,
            _ => {}
        }
        vec![event]
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }
        match self.socket.try_read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.readable = false;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        match self.socket.try_write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.writable = false;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn has_bytes_available(&self) -> bool {
        self.open && self.readable
    }

    fn has_space_available(&self) -> bool {
        self.open && self.writable
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn close(&mut self) {
        // The descriptor is released when the socket drops with the stack
        self.open = false;
        self.readable = false;
        self.writable = false;
    }
}
