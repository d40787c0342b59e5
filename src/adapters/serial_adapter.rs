//! Blocking RS-232 line transport, available with the `instrument_serial` feature.

use crate::adapters::LineTransport;
use crate::error::{AppResult, MicroscopeError};
use std::time::Duration;

#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use tracing::debug;

/// Default read timeout for a reply line.
pub const DEFAULT_SERIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Serial adapter for RS-232 / USB-CDC line protocols
///
/// This adapter wraps the serialport crate. I/O is blocking: a reply is read byte by
/// byte until the response delimiter arrives or the timeout expires.
#[cfg_attr(not(feature = "instrument_serial"), allow(dead_code))]
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Read timeout for one reply line
    timeout: Duration,

    /// Line terminator for commands (e.g., "\n")
    line_terminator: String,

    /// Response line ending character (e.g., '\n')
    response_delimiter: char,

    #[cfg(feature = "instrument_serial")]
    port: Option<Box<dyn SerialPort>>,
}

impl SerialAdapter {
    /// Create a new serial adapter with default settings
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: DEFAULT_SERIAL_TIMEOUT,
            line_terminator: "\n".to_string(),
            response_delimiter: '\n',
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Deadline for a complete reply line.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Appended to every command written.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self
    }

    /// Serial device path.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Configured line speed.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Open the port (8N1).
    pub fn connect(&mut self) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            // Short internal timeout; the reply deadline is enforced in read_line
            let port = serialport::new(&self.port_name, self.baud_rate)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .timeout(Duration::from_millis(100))
                .open()
                .map_err(|e| {
                    MicroscopeError::Protocol(format!(
                        "failed to open serial port '{}' at {} baud: {e}",
                        self.port_name, self.baud_rate
                    ))
                })?;
            self.port = Some(port);
            debug!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(MicroscopeError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    /// Close the port. Safe to call when not connected.
    pub fn disconnect(&mut self) {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!(port = %self.port_name, "Serial port closed");
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&mut self) -> AppResult<&mut Box<dyn SerialPort>> {
        let name = self.port_name.clone();
        self.port
            .as_mut()
            .ok_or_else(|| MicroscopeError::Protocol(format!("serial port '{name}' is not open")))
    }
}

impl LineTransport for SerialAdapter {
    fn write_line(&mut self, line: &str) -> AppResult<()> {
        #[cfg(feature = "instrument_serial")]
        {
            use std::io::Write;

            let command = format!("{line}{}", self.line_terminator);
            let port = self.port()?;
            port.write_all(command.as_bytes())?;
            port.flush()?;
            debug!(command = line.trim(), "Sent serial command");
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = line;
            Err(MicroscopeError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }

    fn read_line(&mut self) -> AppResult<String> {
        #[cfg(feature = "instrument_serial")]
        {
            use std::io::Read;

            let delimiter = self.response_delimiter;
            let timeout = self.timeout;
            let port = self.port()?;

            // Read response byte by byte until delimiter
            let mut response = String::new();
            let mut buffer = [0u8; 1];
            let start = std::time::Instant::now();
            loop {
                if start.elapsed() > timeout {
                    return Err(MicroscopeError::Protocol(format!(
                        "serial read timeout after {timeout:?}"
                    )));
                }
                match port.read(&mut buffer) {
                    Ok(0) => {
                        return Err(MicroscopeError::Protocol(
                            "unexpected EOF on serial port".to_string(),
                        ))
                    }
                    Ok(_) => {
                        let ch = buffer[0] as char;
                        if ch == delimiter {
                            break;
                        }
                        response.push(ch);
                    }
                    // Port timeout is shorter than our overall timeout
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let response = response.trim().to_string();
            debug!(%response, "Received serial response");
            Ok(response)
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(MicroscopeError::FeatureNotEnabled(
                "instrument_serial".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0", 115200);
        assert_eq!(adapter.port_name(), "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate(), 115200);
    }

    #[test]
    fn test_unopened_port_refuses_io() {
        let mut adapter = SerialAdapter::new("COM3", 115200);
        assert!(adapter.write_line("p?").is_err());
        assert!(adapter.read_line().is_err());
    }
}
