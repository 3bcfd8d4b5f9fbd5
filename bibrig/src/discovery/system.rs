//! Platform-backed enumerator using the OS serial port listing.
//!
//! USB metadata comes from the platform's descriptor cache, which mirrors
//! the chip EEPROM fields (vendor/product id, serial, manufacturer, product
//! description). Non-USB ports degrade to partial metadata.

use log::trace;
use serialport::{SerialPortType, UsbPortInfo};

use super::{
    grouping_key, strip_channel_suffix, ChipFamily, DeviceEnumerator, DeviceMetadata,
    DiscoveryError,
};

/// Enumerator over `serialport::available_ports`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnumerator;

impl SystemEnumerator {
    pub fn new() -> Self {
        SystemEnumerator
    }

    fn ports() -> Result<Vec<serialport::SerialPortInfo>, DiscoveryError> {
        serialport::available_ports().map_err(|e| DiscoveryError::Enumeration(e.to_string()))
    }

    fn usb_metadata(endpoint: &str, info: &UsbPortInfo) -> DeviceMetadata {
        let serial = info.serial_number.clone();
        // A serial-less chip cannot be keyed by the eeprom triple; the
        // endpoint name keeps it in a group of its own.
        let (base, channel) = match serial.as_deref() {
            Some(s) => strip_channel_suffix(s),
            None => (endpoint.to_string(), None),
        };
        DeviceMetadata {
            vendor_id: info.vid,
            product_id: info.pid,
            family: ChipFamily::from_ids(info.vid, info.pid),
            serial,
            description: info.product.clone(),
            manufacturer: info.manufacturer.clone(),
            grouping_key: grouping_key(info.vid, info.pid, &base),
            channel_index: channel,
            partial: false,
            enrich_error: None,
        }
    }
}

impl DeviceEnumerator for SystemEnumerator {
    fn list_endpoints(&self) -> Result<Vec<String>, DiscoveryError> {
        let mut names: Vec<String> = Self::ports()?
            .into_iter()
            .map(|p| p.port_name)
            .collect();
        names.sort();
        Ok(names)
    }

    fn read_metadata(&self, endpoint: &str) -> Result<DeviceMetadata, DiscoveryError> {
        let ports = Self::ports()?;
        let info = ports
            .iter()
            .find(|p| p.port_name == endpoint)
            .ok_or_else(|| DiscoveryError::Metadata {
                endpoint: endpoint.to_string(),
                reason: "endpoint no longer enumerated".to_string(),
            })?;

        match &info.port_type {
            SerialPortType::UsbPort(usb) => {
                trace!(
                    "endpoint={} vid={:04x} pid={:04x} serial={:?}",
                    endpoint,
                    usb.vid,
                    usb.pid,
                    usb.serial_number
                );
                Ok(Self::usb_metadata(endpoint, usb))
            }
            other => Ok(DeviceMetadata::degraded(
                endpoint,
                format!("not a usb bridge: {:?}", other),
            )),
        }
    }
}
