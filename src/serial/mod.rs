pub mod decoder;
pub mod interface;
pub mod manager;

pub use decoder::Utf8ChunkDecoder;
pub use interface::{
    AutoPicker, BoxedReader, BoxedWriter, PortPicker, SerialBackend, SerialDevice, SerialLink,
    SystemSerialBackend,
};
pub use manager::{
    ConnectionSnapshot, ConnectionState, IncomingChunk, SerialManager, TransportMetrics,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Identifying information reported by a serial device.
/// Every field except the port name may be missing on real hardware.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl DeviceDescriptor {
    pub fn unknown(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    pub fn vid_label(&self) -> String {
        self.vid
            .map(|v| format!("0x{:04X}", v))
            .unwrap_or_else(|| "N/A".to_string())
    }

    pub fn pid_label(&self) -> String {
        self.pid
            .map(|p| format!("0x{:04X}", p))
            .unwrap_or_else(|| "N/A".to_string())
    }

    /// Multi-line summary shown next to the terminal while connected
    pub fn summary(&self, baud_rate: u32) -> String {
        let name = self.product.as_deref().unwrap_or("ESP32");
        format!(
            "Device: {}\nVID: {}\nPID: {}\nPort: {}\nBaud: {}\nStatus: CONNECTED",
            name,
            self.vid_label(),
            self.pid_label(),
            self.port_name,
            baud_rate
        )
    }
}

/// USB vendor/product pair used to narrow port enumeration.
/// A missing `pid` matches every product of the vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbFilter {
    pub vid: u16,
    #[serde(default)]
    pub pid: Option<u16>,
}

impl UsbFilter {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid.map_or(true, |p| p == pid)
    }

    /// USB bridges commonly found on ESP32 Marauder boards
    pub fn esp32_defaults() -> Vec<UsbFilter> {
        vec![
            // Espressif native USB (S2/S3/C3)
            UsbFilter { vid: 0x303A, pid: None },
            // Silicon Labs CP210x
            UsbFilter { vid: 0x10C4, pid: Some(0xEA60) },
            // WCH CH340 / CH9102
            UsbFilter { vid: 0x1A86, pid: Some(0x7523) },
            UsbFilter { vid: 0x1A86, pid: Some(0x55D4) },
            // FTDI FT232
            UsbFilter { vid: 0x0403, pid: Some(0x6001) },
        ]
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Serial port access is not supported in this environment: {0}")]
    CapabilityUnavailable(String),

    #[error("No port selected")]
    UserCancelledSelection,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Failed to open port: {0}")]
    OpenFailure(String),

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Read failed: {0}")]
    ReadFailure(String),

    #[error("Write failed: {0}")]
    WriteFailure(String),

    #[error("Teardown failed: {0}")]
    TeardownFailure(String),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_missing_ids_as_na() {
        let descriptor = DeviceDescriptor::unknown("/dev/ttyUSB0");
        let summary = descriptor.summary(115200);
        assert!(summary.contains("VID: N/A"));
        assert!(summary.contains("PID: N/A"));
        assert!(summary.contains("Device: ESP32"));
        assert!(summary.contains("Baud: 115200"));
    }

    #[test]
    fn filter_without_pid_matches_whole_vendor() {
        let filter = UsbFilter { vid: 0x303A, pid: None };
        assert!(filter.matches(0x303A, 0x1001));
        assert!(!filter.matches(0x10C4, 0x1001));

        let exact = UsbFilter { vid: 0x10C4, pid: Some(0xEA60) };
        assert!(exact.matches(0x10C4, 0xEA60));
        assert!(!exact.matches(0x10C4, 0xEA70));
    }
}
