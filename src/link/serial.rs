//! Serial connector for the indicator. Bluetooth SPP links appear as RFCOMM ttys
//! (`/dev/rfcomm0`), so the same path serves wired and wireless indicators.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serialport::SerialPort;

use super::{LinkConnector, LinkError, LinkStream};

pub struct SerialConnector {
    baud_rate: u32,
    read_timeout: Duration,
    settle: Duration,
}

impl SerialConnector {
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            read_timeout: Duration::from_millis(500),
            settle: Duration::from_millis(150),
        }
    }

    /// Read timeout bounds how long the listener takes to notice a closed session.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

impl LinkConnector for SerialConnector {
    fn resolve(&self, remote: &str) -> Result<String, LinkError> {
        match serialport::available_ports() {
            Ok(ports) if ports.iter().any(|p| p.port_name == remote) => {
                debug!("Found {} among {} serial ports", remote, ports.len());
                return Ok(remote.to_string());
            }
            Ok(_) => {}
            Err(e) => debug!("Serial port enumeration failed: {}", e),
        }
        // RFCOMM bindings are often missing from enumeration but exist as device nodes.
        if Path::new(remote).exists() {
            Ok(remote.to_string())
        } else {
            Err(LinkError::DeviceNotFound(remote.to_string()))
        }
    }

    fn open(&self, address: &str) -> Result<Box<dyn LinkStream>, LinkError> {
        let mut builder = serialport::new(address, self.baud_rate).timeout(self.read_timeout);
        #[cfg(unix)]
        {
            builder = builder
                .data_bits(serialport::DataBits::Eight)
                .stop_bits(serialport::StopBits::One)
                .parity(serialport::Parity::None);
        }
        let mut port = builder.open().map_err(|e| LinkError::OpenFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        // Raise DTR/RTS so the remote end sees a live peer, then let it settle.
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
        std::thread::sleep(self.settle);

        // Anything already buffered predates this session.
        if let Ok(available) = port.bytes_to_read() {
            if available > 0 {
                let _ = port.clear(serialport::ClearBuffer::Input);
                debug!("Discarded {} stale bytes from {}", available, address);
            }
        }

        info!("Opened serial link {} at {} baud", address, self.baud_rate);
        Ok(Box::new(SerialStream { port: Some(port) }))
    }
}

struct SerialStream {
    port: Option<Box<dyn SerialPort>>,
}

impl SerialStream {
    fn port(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))
    }
}

impl Read for SerialStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port()?.read(buf)
    }
}

impl Write for SerialStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port()?.flush()
    }
}

impl LinkStream for SerialStream {
    fn try_clone_reader(&self) -> io::Result<Box<dyn Read + Send>> {
        let port = self
            .port
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port closed"))?;
        let clone = port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(clone))
    }

    fn close(&mut self) -> io::Result<()> {
        self.port.take();
        Ok(())
    }
}
