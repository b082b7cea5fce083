use std::io::{ErrorKind, Read, Write};
use std::time::Duration;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};
use tokio::time::{sleep, Instant};

use super::{PortConnector, Result, SerialDeviceInfo, SerialError, SerialPortIO};
use crate::config::RotatorSettings;

// CH340 USB-serial bridge used by Wanderer rotators
pub const ROTATOR_VID: u16 = 0x1A86;
pub const ROTATOR_PID: u16 = 0x7523;
pub const BAUD_RATE: u32 = 19200;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct SerialInterface {
    port: Option<Box<dyn SerialPort>>,
    port_name: Option<String>,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            port: None,
            port_name: None,
        }
    }

    /// Discover USB serial ports whose bridge matches `vid`/`pid`
    pub fn discover_devices(vid: u16, pid: u16) -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                if usb_info.vid == vid && usb_info.pid == pid {
                    log::debug!("Found candidate port {} ({:04x}:{:04x})", port.port_name, vid, pid);
                    devices.push(SerialDeviceInfo {
                        port_name: port.port_name.clone(),
                        vid: usb_info.vid,
                        pid: usb_info.pid,
                        serial_number: usb_info.serial_number.clone(),
                        manufacturer: usb_info.manufacturer.clone(),
                        product: usb_info.product.clone(),
                    });
                }
            }
        }

        Ok(devices)
    }

    /// Open `port_name` raw, 8N1, no flow control
    pub fn connect(&mut self, port_name: &str, baud_rate: u32) -> Result<()> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", port_name, e)))?;

        port.clear(ClearBuffer::All)?;

        self.port = Some(port);
        self.port_name = Some(port_name.to_string());

        log::info!("Opened rotator line on {}", port_name);
        Ok(())
    }

    /// Disconnect from the current device
    pub fn disconnect(&mut self) {
        if self.port.take().is_some() {
            if let Some(name) = &self.port_name {
                log::info!("Closed rotator line on {}", name);
            }
        }
    }

    /// Check if currently connected
    pub fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port
            .as_mut()
            .ok_or(SerialError::ConnectionFailed("Not connected".to_string()))
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SerialPortIO for SerialInterface {
    fn is_open(&self) -> bool {
        self.is_connected()
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port_mut()?;

        port.write_all(data).map_err(SerialError::IoError)?;
        // Blocks until the output queue has drained
        port.flush().map_err(SerialError::IoError)?;

        log::debug!("Wrote {} bytes", data.len());
        Ok(())
    }

    async fn read_until(&mut self, max_len: usize, stop: u8, timeout_ms: u64) -> Result<Vec<u8>> {
        let port = self.port_mut()?;
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut frame = Vec::with_capacity(max_len);
        let mut byte = [0u8; 1];

        while frame.len() + 1 < max_len && Instant::now() < deadline {
            match port.bytes_to_read() {
                Ok(0) => sleep(POLL_INTERVAL).await,
                Ok(_) => match port.read(&mut byte) {
                    Ok(1) => {
                        frame.push(byte[0]);
                        if byte[0] == stop {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(ref e) if e.kind() == ErrorKind::TimedOut => {}
                    Err(e) => return Err(SerialError::IoError(e)),
                },
                Err(e) => return Err(SerialError::SerialportError(e)),
            }
        }

        Ok(frame)
    }

    fn clear(&mut self, buffer: ClearBuffer) -> Result<()> {
        self.port_mut()?.clear(buffer)?;
        Ok(())
    }

    fn close(&mut self) {
        self.disconnect();
    }
}

/// Opens real serial lines, enumerating ports by USB bridge id
pub struct SerialConnector {
    vid: u16,
    pid: u16,
    baud_rate: u32,
}

impl SerialConnector {
    pub fn new(settings: &RotatorSettings) -> Self {
        Self {
            vid: settings.vendor_id,
            pid: settings.product_id,
            baud_rate: settings.baud_rate,
        }
    }
}

impl PortConnector for SerialConnector {
    fn candidate_ports(&self) -> Result<Vec<String>> {
        Ok(SerialInterface::discover_devices(self.vid, self.pid)?
            .into_iter()
            .map(|info| info.port_name)
            .collect())
    }

    fn connect(&self, port_name: &str) -> Result<Box<dyn SerialPortIO>> {
        let mut interface = SerialInterface::new();
        interface.connect(port_name, self.baud_rate)?;
        Ok(Box::new(interface))
    }
}
