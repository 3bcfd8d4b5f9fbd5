//! Shared fixtures: a scripted device fleet, a recording side-signal and a
//! fully wired orchestrator over the loopback protocol.

// Shared across test binaries; not every binary uses every fixture.
#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use bibrig::prelude::*;
use bibrig::discovery::{grouping_key, DiscoveryError, VID_FTDI};
use bibrig::signal::SideSignal;

/// One simulated multi-channel bridge chip.
#[derive(Clone)]
pub struct MockChip {
    pub serial_base: String,
    pub description: String,
    pub endpoints: Vec<String>,
}

impl MockChip {
    pub fn quad(serial_base: &str, description: &str, first_endpoint: usize) -> Self {
        MockChip {
            serial_base: serial_base.to_string(),
            description: description.to_string(),
            endpoints: (first_endpoint..first_endpoint + 4)
                .map(|i| format!("/dev/ttyUSB{}", i))
                .collect(),
        }
    }
}

/// Enumerator over a fixed set of simulated chips.
pub struct MockEnumerator {
    chips: Vec<MockChip>,
}

impl MockEnumerator {
    pub fn new(chips: Vec<MockChip>) -> Self {
        MockEnumerator { chips }
    }
}

impl DeviceEnumerator for MockEnumerator {
    fn list_endpoints(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok(self
            .chips
            .iter()
            .flat_map(|c| c.endpoints.clone())
            .collect())
    }

    fn read_metadata(&self, endpoint: &str) -> Result<DeviceMetadata, DiscoveryError> {
        for chip in &self.chips {
            if let Some(idx) = chip.endpoints.iter().position(|e| e == endpoint) {
                let suffix = (b'A' + idx as u8) as char;
                return Ok(DeviceMetadata {
                    vendor_id: VID_FTDI,
                    product_id: 0x6011,
                    family: ChipFamily::Quad,
                    serial: Some(format!("{}{}", chip.serial_base, suffix)),
                    description: Some(chip.description.clone()),
                    manufacturer: Some("FTDI".into()),
                    grouping_key: grouping_key(VID_FTDI, 0x6011, &chip.serial_base),
                    channel_index: Some(idx as u32),
                    partial: false,
                    enrich_error: None,
                });
            }
        }
        Err(DiscoveryError::Metadata {
            endpoint: endpoint.to_string(),
            reason: "not simulated".into(),
        })
    }
}

/// Side-signal double recording every transition.
#[derive(Default)]
pub struct RecordingSignal {
    events: Mutex<Vec<(&'static str, bool)>>,
}

impl RecordingSignal {
    pub fn critical_raised(&self) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(line, value)| *line == "critical" && *value)
    }

    pub fn workflow_active_events(&self) -> Vec<bool> {
        self.events
            .lock()
            .iter()
            .filter(|(line, _)| *line == "workflow_active")
            .map(|(_, value)| *value)
            .collect()
    }
}

impl SideSignal for RecordingSignal {
    fn set_workflow_active(&self, active: bool) -> Result<(), String> {
        self.events.lock().push(("workflow_active", active));
        Ok(())
    }

    fn set_critical_fail(&self, raised: bool) -> Result<(), String> {
        self.events.lock().push(("critical", raised));
        Ok(())
    }
}

/// A loopback port with the classic INIT/PING/QUIT script.
pub fn scripted_port() -> PortConfig {
    let mut port = PortConfig::rs232(9600);
    port.protocol = "loopback".into();
    port.start = CommandSequence::new(vec![ProtocolCommand::literal("INIT\r", "READY")]);
    port.test = CommandSequence::new(vec![ProtocolCommand::literal("PING\r", "PONG")]);
    port.stop = CommandSequence::new(vec![ProtocolCommand::literal("QUIT\r", "BYE")]);
    port
}

/// Script happy-path responses for one endpoint.
pub fn script_happy(handler: &LoopbackHandler, endpoint: &str) {
    handler.respond(endpoint, "INIT\r", "READY");
    handler.respond(endpoint, "PING\r", "PONG");
    handler.respond(endpoint, "QUIT\r", "BYE");
}

/// A fully wired rig over simulated chips and the loopback protocol.
pub struct Rig {
    pub orchestrator: Orchestrator,
    pub handler: LoopbackHandler,
    pub signal: Arc<RecordingSignal>,
    pub pool: Arc<PortPool>,
}

pub fn rig(chips: Vec<MockChip>, store: MemoryConfigStore) -> Rig {
    let discovery = Discovery::new(Arc::new(MockEnumerator::new(chips)));
    let pool = Arc::new(PortPool::new(discovery.clone(), PortValidator::default()));
    let store: Arc<dyn ConfigStore> = Arc::new(store);
    let mapper = Arc::new(DynamicPortMapper::new(discovery, store.clone()));

    let handler = LoopbackHandler::new();
    let mut registry = ProtocolRegistry::new();
    registry.register(Arc::new(handler.clone()));

    let signal = Arc::new(RecordingSignal::default());
    let orchestrator = Orchestrator::new(store, mapper, Arc::clone(&pool), registry)
        .with_signal(Arc::clone(&signal) as Arc<dyn SideSignal>)
        .with_delays(SettleDelays::none());

    Rig {
        orchestrator,
        handler,
        signal,
        pool,
    }
}

/// The S1 fixture: BIB `demo`, UUT `u1`, port 1, one quad chip whose
/// description matches `demo.u1`, channel 0 at `/dev/ttyUSB0`.
pub fn demo_rig() -> Rig {
    let store = MemoryConfigStore::new()
        .with_bib(
            BibConfig::new("demo").with_uut(UutConfig::new("u1").with_port(1, scripted_port())),
        )
        .with_rule(MappingRule::new(
            "demo",
            "u1",
            DescriptionMatch::Contains("demo.u1".into()),
        ));
    rig(
        vec![MockChip::quad("FT0XYZ", "BIB demo.u1 bridge", 0)],
        store,
    )
}
