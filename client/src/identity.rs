//! Hardware identity derived from the station MAC address

use core::fmt::Write as FmtWrite;

use heapless::String;

/// Prefix of the configuration access point name
const AP_PREFIX: &str = "paperdink";

/// MAC-derived device identifier, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId {
    mac: String<17>,
}

impl DeviceId {
    pub fn from_mac(mac: [u8; 6]) -> Self {
        let mut text: String<17> = String::new();
        for (i, byte) in mac.iter().enumerate() {
            if i > 0 {
                let _ = text.push(':');
            }
            let _ = write!(text, "{:02X}", byte);
        }
        Self { mac: text }
    }

    /// `AA:BB:CC:DD:EE:FF`
    pub fn as_str(&self) -> &str {
        &self.mac
    }

    /// Access point name, suffixed with the last three octets
    pub fn ap_name(&self) -> String<32> {
        let mut name: String<32> = String::new();
        let _ = write!(name, "{}-{}", AP_PREFIX, &self.mac[9..]);
        name
    }
}
