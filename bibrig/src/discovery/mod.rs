//! Device discovery: enumerate serial endpoints, enrich them with
//! EEPROM/product-description metadata and group the channels that belong to
//! one physical multi-channel bridge chip.
//!
//! The platform-specific part is behind [`DeviceEnumerator`];
//! [`Discovery`] layers per-endpoint error containment and grouping on top.
//! Grouping is a pure function over the snapshot, so it is exercised in
//! tests without hardware.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod system;

pub use system::SystemEnumerator;

/// Well-known USB-UART bridge vendors.
pub const VID_FTDI: u16 = 0x0403;
pub const VID_SILABS: u16 = 0x10c4;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Platform enumeration itself failed; no endpoints are available.
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// Metadata for one endpoint could not be read.
    #[error("metadata read failed for {endpoint}: {reason}")]
    Metadata { endpoint: String, reason: String },
}

/// Channel count class of a bridge chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChipFamily {
    Single,
    Dual,
    Quad,
    Octal,
    Unknown,
}

impl ChipFamily {
    /// Channels per chip, if the family is known.
    pub fn channels(&self) -> Option<u32> {
        match self {
            ChipFamily::Single => Some(1),
            ChipFamily::Dual => Some(2),
            ChipFamily::Quad => Some(4),
            ChipFamily::Octal => Some(8),
            ChipFamily::Unknown => None,
        }
    }

    /// Classify by USB vendor/product id.
    pub fn from_ids(vendor_id: u16, product_id: u16) -> Self {
        match (vendor_id, product_id) {
            // FT232R, FT232H, FT-X
            (VID_FTDI, 0x6001) | (VID_FTDI, 0x6014) | (VID_FTDI, 0x6015) => ChipFamily::Single,
            // FT2232D/H
            (VID_FTDI, 0x6010) => ChipFamily::Dual,
            // FT4232H
            (VID_FTDI, 0x6011) => ChipFamily::Quad,
            // CP2102/CP2102N
            (VID_SILABS, 0xea60) => ChipFamily::Single,
            // CP2105
            (VID_SILABS, 0xea70) => ChipFamily::Dual,
            // CP2108
            (VID_SILABS, 0xea71) => ChipFamily::Quad,
            _ => ChipFamily::Unknown,
        }
    }
}

/// EEPROM/platform metadata for the chip behind one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub vendor_id: u16,
    pub product_id: u16,
    pub family: ChipFamily,
    /// Chip serial as reported, channel suffix included (`"FT0ABCDA"`).
    pub serial: Option<String>,
    pub description: Option<String>,
    pub manufacturer: Option<String>,
    /// Endpoints sharing this key belong to one physical chip.
    pub grouping_key: String,
    /// Zero-based channel index within the chip, when derivable.
    pub channel_index: Option<u32>,
    /// Set when enrichment failed and only platform data is present.
    pub partial: bool,
    /// The enrichment error, recorded instead of aborting enumeration.
    pub enrich_error: Option<String>,
}

impl DeviceMetadata {
    /// Metadata for an endpoint whose chip could not be enriched at all.
    pub fn degraded(endpoint: &str, error: impl Into<String>) -> Self {
        let (base, channel) = strip_channel_suffix(endpoint);
        DeviceMetadata {
            vendor_id: 0,
            product_id: 0,
            family: ChipFamily::Unknown,
            serial: None,
            description: None,
            manufacturer: None,
            grouping_key: base,
            channel_index: channel,
            partial: true,
            enrich_error: Some(error.into()),
        }
    }
}

/// One OS-level serial device handle: a single channel of a single chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalEndpoint {
    /// OS handle name (`COM3`, `/dev/ttyUSB0`).
    pub name: String,
    pub metadata: DeviceMetadata,
}

impl PhysicalEndpoint {
    pub fn new(name: impl Into<String>, metadata: DeviceMetadata) -> Self {
        PhysicalEndpoint {
            name: name.into(),
            metadata,
        }
    }
}

/// The endpoints of one physical chip, in channel order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChipGroup {
    pub key: String,
    /// Metadata of the group's first channel, representative for the chip.
    pub metadata: DeviceMetadata,
    pub endpoints: Vec<PhysicalEndpoint>,
}

impl ChipGroup {
    /// Endpoint of the zero-based channel, by the group's channel order.
    pub fn channel(&self, index: u32) -> Option<&PhysicalEndpoint> {
        self.endpoints.get(index as usize)
    }
}

/// Platform enumeration plus vendor EEPROM access.
///
/// `read_metadata` errors are contained per endpoint by [`Discovery`]; an
/// implementation does not need to degrade gracefully itself.
pub trait DeviceEnumerator: Send + Sync {
    /// Names of the currently present serial endpoints.
    fn list_endpoints(&self) -> Result<Vec<String>, DiscoveryError>;

    /// EEPROM/platform metadata for one endpoint.
    fn read_metadata(&self, endpoint: &str) -> Result<DeviceMetadata, DiscoveryError>;
}

impl<T: DeviceEnumerator + ?Sized> DeviceEnumerator for Arc<T> {
    fn list_endpoints(&self) -> Result<Vec<String>, DiscoveryError> {
        (**self).list_endpoints()
    }

    fn read_metadata(&self, endpoint: &str) -> Result<DeviceMetadata, DiscoveryError> {
        (**self).read_metadata(endpoint)
    }
}

/// On-demand snapshots of the attached endpoints.
#[derive(Clone)]
pub struct Discovery {
    enumerator: Arc<dyn DeviceEnumerator>,
}

impl Discovery {
    pub fn new(enumerator: Arc<dyn DeviceEnumerator>) -> Self {
        Discovery { enumerator }
    }

    /// Enumerate and enrich every endpoint. Per-endpoint metadata failures
    /// degrade that endpoint to partial metadata and never abort the sweep.
    pub fn snapshot(&self) -> Result<Vec<PhysicalEndpoint>, DiscoveryError> {
        let names = self.enumerator.list_endpoints()?;
        debug!("discovery: {} endpoint(s) enumerated", names.len());

        let mut endpoints = Vec::with_capacity(names.len());
        for name in names {
            let metadata = match self.enumerator.read_metadata(&name) {
                Ok(meta) => meta,
                Err(err) => {
                    warn!("discovery: endpoint={} metadata degraded: {}", name, err);
                    DeviceMetadata::degraded(&name, err.to_string())
                }
            };
            endpoints.push(PhysicalEndpoint::new(name, metadata));
        }
        Ok(endpoints)
    }

    /// Snapshot grouped per physical chip.
    pub fn groups(&self) -> Result<Vec<ChipGroup>, DiscoveryError> {
        Ok(group_endpoints(&self.snapshot()?))
    }
}

/// Partition endpoints into chip groups and order each group's channels.
///
/// Endpoints sharing a grouping key belong to one chip. Channels are ordered
/// by their EEPROM channel index when present, by name otherwise; groups are
/// ordered by key. The partition is deterministic and idempotent.
pub fn group_endpoints(endpoints: &[PhysicalEndpoint]) -> Vec<ChipGroup> {
    let mut by_key: BTreeMap<String, Vec<PhysicalEndpoint>> = BTreeMap::new();
    for ep in endpoints {
        by_key
            .entry(ep.metadata.grouping_key.clone())
            .or_default()
            .push(ep.clone());
    }

    by_key
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| {
                let ka = (a.metadata.channel_index, a.name.clone());
                let kb = (b.metadata.channel_index, b.name.clone());
                ka.cmp(&kb)
            });
            let metadata = members[0].metadata.clone();
            ChipGroup {
                key,
                metadata,
                endpoints: members,
            }
        })
        .collect()
}

/// Split a device identifier into its base and an optional channel suffix.
///
/// Multi-channel bridges expose per-channel identifiers as the chip serial
/// followed by one uppercase channel letter (`FT0ABCDA`..`FT0ABCDD`).
pub fn strip_channel_suffix(identifier: &str) -> (String, Option<u32>) {
    let mut chars = identifier.chars();
    match chars.next_back() {
        Some(last) if last.is_ascii_uppercase() && ('A'..='H').contains(&last) => {
            let base = chars.as_str();
            if base.is_empty() {
                (identifier.to_string(), None)
            } else {
                (base.to_string(), Some(last as u32 - 'A' as u32))
            }
        }
        _ => (identifier.to_string(), None),
    }
}

/// Grouping key for an enriched chip: the vendor+product+serial triple.
pub fn grouping_key(vendor_id: u16, product_id: u16, serial_base: &str) -> String {
    format!("{:04x}:{:04x}:{}", vendor_id, product_id, serial_base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quad_endpoint(name: &str, serial: &str) -> PhysicalEndpoint {
        let (base, channel) = strip_channel_suffix(serial);
        PhysicalEndpoint::new(
            name,
            DeviceMetadata {
                vendor_id: VID_FTDI,
                product_id: 0x6011,
                family: ChipFamily::Quad,
                serial: Some(serial.to_string()),
                description: Some("Quad RS232-HS".into()),
                manufacturer: Some("FTDI".into()),
                grouping_key: grouping_key(VID_FTDI, 0x6011, &base),
                channel_index: channel,
                partial: false,
                enrich_error: None,
            },
        )
    }

    #[test]
    fn channel_suffix_stripping() {
        assert_eq!(strip_channel_suffix("FT0XYZA"), ("FT0XYZ".into(), Some(0)));
        assert_eq!(strip_channel_suffix("FT0XYZD"), ("FT0XYZ".into(), Some(3)));
        assert_eq!(strip_channel_suffix("FT0XYZ9"), ("FT0XYZ9".into(), None));
        assert_eq!(
            strip_channel_suffix("/dev/ttyUSB0"),
            ("/dev/ttyUSB0".into(), None)
        );
    }

    #[test]
    fn quad_chip_groups_to_four_ordered_channels() {
        // Shuffled input; channel order must come from the serial suffix.
        let eps = vec![
            quad_endpoint("/dev/ttyUSB2", "FT0XYZC"),
            quad_endpoint("/dev/ttyUSB0", "FT0XYZA"),
            quad_endpoint("/dev/ttyUSB3", "FT0XYZD"),
            quad_endpoint("/dev/ttyUSB1", "FT0XYZB"),
        ];
        let groups = group_endpoints(&eps);
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.endpoints.len(), 4);
        assert_eq!(group.channel(0).unwrap().name, "/dev/ttyUSB0");
        assert_eq!(group.channel(3).unwrap().name, "/dev/ttyUSB3");
        assert!(group.channel(4).is_none());
    }

    #[test]
    fn distinct_serials_make_distinct_groups() {
        let eps = vec![
            quad_endpoint("/dev/ttyUSB0", "FT0AAAA"),
            quad_endpoint("/dev/ttyUSB1", "FT0BBBA"),
        ];
        let groups = group_endpoints(&eps);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn grouping_is_idempotent() {
        let eps = vec![
            quad_endpoint("/dev/ttyUSB1", "FT0XYZB"),
            quad_endpoint("/dev/ttyUSB0", "FT0XYZA"),
        ];
        let once = group_endpoints(&eps);
        let again = group_endpoints(
            &once
                .iter()
                .flat_map(|g| g.endpoints.clone())
                .collect::<Vec<_>>(),
        );
        assert_eq!(once.len(), again.len());
        for (a, b) in once.iter().zip(again.iter()) {
            assert_eq!(a.key, b.key);
            assert_eq!(a.endpoints, b.endpoints);
        }
    }

    #[test]
    fn degraded_endpoint_groups_by_name() {
        let meta = DeviceMetadata::degraded("/dev/ttyS4", "no eeprom access");
        assert!(meta.partial);
        assert_eq!(meta.grouping_key, "/dev/ttyS4");
        assert!(meta.enrich_error.is_some());
    }

    #[test]
    fn family_classification() {
        assert_eq!(ChipFamily::from_ids(VID_FTDI, 0x6011), ChipFamily::Quad);
        assert_eq!(ChipFamily::from_ids(VID_FTDI, 0x6010), ChipFamily::Dual);
        assert_eq!(ChipFamily::from_ids(VID_SILABS, 0xea60), ChipFamily::Single);
        assert_eq!(ChipFamily::from_ids(0x1234, 0x5678), ChipFamily::Unknown);
        assert_eq!(ChipFamily::Quad.channels(), Some(4));
        assert_eq!(ChipFamily::Unknown.channels(), None);
    }
}
