//! Line-oriented transports for instrument drivers.
//!
//! Drivers such as [`OpenFlexureStage`](crate::hardware::openflexure::OpenFlexureStage)
//! speak a text protocol: one command line out, one reply line back. They are written
//! against [`LineTransport`] so the same driver runs over a real serial port or a
//! scripted transport in tests.

pub mod mock;
pub mod serial_adapter;

pub use mock::ScriptedTransport;
pub use serial_adapter::SerialAdapter;

use crate::error::AppResult;

/// Blocking, line-framed I/O.
pub trait LineTransport {
    /// Send one line. The terminator is added by the transport.
    fn write_line(&mut self, line: &str) -> AppResult<()>;

    /// Receive one line, without its terminator.
    fn read_line(&mut self) -> AppResult<String>;

    /// Send `command` and return the single reply line.
    fn query(&mut self, command: &str) -> AppResult<String> {
        self.write_line(command)?;
        self.read_line()
    }
}

impl<T: LineTransport + ?Sized> LineTransport for Box<T> {
    fn write_line(&mut self, line: &str) -> AppResult<()> {
        (**self).write_line(line)
    }

    fn read_line(&mut self) -> AppResult<String> {
        (**self).read_line()
    }
}
