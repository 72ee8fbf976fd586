use std::sync::Arc;

use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::{DeviceDescriptor, Result, SerialError, UsbFilter};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Both ends of an opened device stream
pub struct SerialLink {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

/// Host capability for discovering and selecting serial devices
#[async_trait::async_trait]
pub trait SerialBackend: Send + Sync {
    /// Check that serial access works in this environment
    async fn is_available(&self) -> Result<()>;

    /// Ask the user for a device. Cancelling yields `UserCancelledSelection`.
    async fn request_port(&self) -> Result<Box<dyn SerialDevice>>;
}

/// A selected, not yet opened device
#[async_trait::async_trait]
pub trait SerialDevice: Send + Sync {
    fn descriptor(&self) -> DeviceDescriptor;

    async fn open(&mut self, baud_rate: u32) -> Result<SerialLink>;

    /// Called after both link halves have been dropped
    async fn close(&mut self) -> Result<()>;
}

/// User-mediated choice among enumerated ports
#[async_trait::async_trait]
pub trait PortPicker: Send + Sync {
    /// Return the index of the chosen candidate, or `None` when cancelled
    async fn pick(&self, candidates: &[DeviceDescriptor]) -> Option<usize>;
}

/// Picks the first candidate without asking
pub struct AutoPicker;

#[async_trait::async_trait]
impl PortPicker for AutoPicker {
    async fn pick(&self, candidates: &[DeviceDescriptor]) -> Option<usize> {
        if candidates.is_empty() {
            None
        } else {
            Some(0)
        }
    }
}

/// Backend over the operating system's serial ports
pub struct SystemSerialBackend {
    filters: Vec<UsbFilter>,
    preferred_port: Option<String>,
    auto_select: bool,
    picker: Arc<dyn PortPicker>,
}

impl SystemSerialBackend {
    pub fn new(picker: Arc<dyn PortPicker>) -> Self {
        Self {
            filters: UsbFilter::esp32_defaults(),
            preferred_port: None,
            auto_select: false,
            picker,
        }
    }

    pub fn with_filters(mut self, filters: Vec<UsbFilter>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_preferred_port(mut self, port: Option<String>) -> Self {
        self.preferred_port = port;
        self
    }

    /// Skip the picker when exactly one candidate is found
    pub fn with_auto_select(mut self, auto_select: bool) -> Self {
        self.auto_select = auto_select;
        self
    }

    /// Enumerate USB serial ports, narrowed to the configured filters when any match
    pub fn discover_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let ports = serialport::available_ports()?;
        let mut all_usb = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                all_usb.push(DeviceDescriptor {
                    port_name: port.port_name.clone(),
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number.clone(),
                    manufacturer: usb_info.manufacturer.clone(),
                    product: usb_info.product.clone(),
                });
            }
        }

        let matching: Vec<DeviceDescriptor> = all_usb
            .iter()
            .filter(|d| match (d.vid, d.pid) {
                (Some(vid), Some(pid)) => self.filters.iter().any(|f| f.matches(vid, pid)),
                _ => false,
            })
            .cloned()
            .collect();

        if matching.is_empty() {
            log::debug!(
                "No ports matched {} USB filters, offering all {} USB ports",
                self.filters.len(),
                all_usb.len()
            );
            Ok(all_usb)
        } else {
            Ok(matching)
        }
    }

    fn lookup_descriptor(&self, port_name: &str) -> DeviceDescriptor {
        serialport::available_ports()
            .ok()
            .and_then(|ports| ports.into_iter().find(|p| p.port_name == port_name))
            .map(|p| match p.port_type {
                SerialPortType::UsbPort(usb_info) => DeviceDescriptor {
                    port_name: p.port_name,
                    vid: Some(usb_info.vid),
                    pid: Some(usb_info.pid),
                    serial_number: usb_info.serial_number,
                    manufacturer: usb_info.manufacturer,
                    product: usb_info.product,
                },
                _ => DeviceDescriptor::unknown(p.port_name),
            })
            .unwrap_or_else(|| DeviceDescriptor::unknown(port_name))
    }
}

#[async_trait::async_trait]
impl SerialBackend for SystemSerialBackend {
    async fn is_available(&self) -> Result<()> {
        if !cfg!(any(unix, windows)) {
            return Err(SerialError::CapabilityUnavailable(
                "no serial port support on this platform".to_string(),
            ));
        }
        serialport::available_ports()
            .map(|_| ())
            .map_err(|e| SerialError::CapabilityUnavailable(e.to_string()))
    }

    async fn request_port(&self) -> Result<Box<dyn SerialDevice>> {
        if let Some(port_name) = &self.preferred_port {
            log::info!("Using configured port {}", port_name);
            let descriptor = self.lookup_descriptor(port_name);
            return Ok(Box::new(SystemSerialDevice::new(descriptor)));
        }

        let candidates = self.discover_devices()?;
        if candidates.is_empty() {
            return Err(SerialError::PortNotFound(
                "no USB serial devices detected".to_string(),
            ));
        }

        let index = if self.auto_select && candidates.len() == 1 {
            Some(0)
        } else {
            self.picker.pick(&candidates).await
        };

        match index.and_then(|i| candidates.get(i)) {
            Some(descriptor) => {
                log::info!("Selected port {}", descriptor.port_name);
                Ok(Box::new(SystemSerialDevice::new(descriptor.clone())))
            }
            None => Err(SerialError::UserCancelledSelection),
        }
    }
}

/// A port opened through tokio-serial
pub struct SystemSerialDevice {
    descriptor: DeviceDescriptor,
    opened: bool,
}

impl SystemSerialDevice {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            opened: false,
        }
    }
}

#[async_trait::async_trait]
impl SerialDevice for SystemSerialDevice {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    async fn open(&mut self, baud_rate: u32) -> Result<SerialLink> {
        if self.opened {
            return Err(SerialError::OpenFailure(format!(
                "{} is already open",
                self.descriptor.port_name
            )));
        }

        let stream = tokio_serial::new(&self.descriptor.port_name, baud_rate)
            .open_native_async()
            .map_err(|e| SerialError::OpenFailure(format!("{}: {}", self.descriptor.port_name, e)))?;

        let (reader, writer) = tokio::io::split(stream);
        self.opened = true;
        log::info!("Opened {} at {} baud", self.descriptor.port_name, baud_rate);

        Ok(SerialLink {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn close(&mut self) -> Result<()> {
        // The stream is owned by the link halves and closes once both drop
        if self.opened {
            self.opened = false;
            log::info!("Closed {}", self.descriptor.port_name);
        }
        Ok(())
    }
}
