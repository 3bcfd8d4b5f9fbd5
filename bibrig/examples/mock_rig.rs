//! A complete host wired to in-memory collaborators: one simulated BIB with
//! one UUT, scripted loopback responses, and a full three-phase run.
//!
//! Run with `cargo run --example mock_rig` (RUST_LOG=debug for the play by
//! play).

use std::sync::Arc;

use bibrig::discovery::{grouping_key, DiscoveryError, VID_FTDI};
use bibrig::prelude::*;

/// Simulates one quad bridge whose EEPROM says it belongs to `demo.u1`.
struct DemoFleet;

impl DeviceEnumerator for DemoFleet {
    fn list_endpoints(&self) -> Result<Vec<String>, DiscoveryError> {
        Ok((0..4).map(|i| format!("SIM{}", i)).collect())
    }

    fn read_metadata(&self, endpoint: &str) -> Result<DeviceMetadata, DiscoveryError> {
        let channel: u32 = endpoint
            .strip_prefix("SIM")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Ok(DeviceMetadata {
            vendor_id: VID_FTDI,
            product_id: 0x6011,
            family: ChipFamily::Quad,
            serial: Some(format!("FTDEMO{}", (b'A' + channel as u8) as char)),
            description: Some("BIB demo.u1 bridge".into()),
            manufacturer: Some("FTDI".into()),
            grouping_key: grouping_key(VID_FTDI, 0x6011, "FTDEMO"),
            channel_index: Some(channel),
            partial: false,
            enrich_error: None,
        })
    }
}

fn main() {
    env_logger::init();

    // Fixture configuration, as the XML store would load it.
    let mut port = PortConfig::rs232(9600);
    port.protocol = "loopback".into();
    port.start = CommandSequence::new(vec![ProtocolCommand::literal("INIT\r", "READY")]);
    port.test = CommandSequence::new(vec![
        ProtocolCommand::literal("PING\r", "PONG"),
        ProtocolCommand::unchecked("VER?\r").with_levels(
            PatternSet::new()
                .with_pass(Pattern::regex(r"^V[0-9]+\.[0-9]+"))
                .with_critical(Pattern::literal("FATAL"), true),
        ),
    ]);
    port.stop = CommandSequence::new(vec![ProtocolCommand::literal("QUIT\r", "BYE")]);

    let store: Arc<dyn ConfigStore> = Arc::new(
        MemoryConfigStore::new()
            .with_bib(BibConfig::new("demo").with_uut(UutConfig::new("u1").with_port(1, port)))
            .with_rule(MappingRule::new(
                "demo",
                "u1",
                DescriptionMatch::Contains("demo.u1".into()),
            )),
    );

    // Scripted UUT behaviour.
    let handler = LoopbackHandler::new();
    handler.respond("SIM0", "INIT\r", "READY");
    handler.respond("SIM0", "PING\r", "PONG");
    handler.respond("SIM0", "VER?\r", "V1.04");
    handler.respond("SIM0", "QUIT\r", "BYE");

    let discovery = Discovery::new(Arc::new(DemoFleet));
    let pool = Arc::new(PortPool::new(discovery.clone(), PortValidator::default()));
    let mapper = Arc::new(DynamicPortMapper::new(discovery, store.clone()));
    let mut registry = ProtocolRegistry::new();
    registry.register(Arc::new(handler));

    let orchestrator = Orchestrator::new(store, mapper, Arc::clone(&pool), registry)
        .with_delays(SettleDelays::none());

    let outcome = orchestrator.run_single(
        &Coordinate::new("demo", "u1", 1),
        "mock-rig",
        &CancelToken::new(),
    );

    println!(
        "workflow on {} ({}): {}",
        outcome.coordinate,
        outcome.endpoint.as_deref().unwrap_or("?"),
        if outcome.success { "PASS" } else { "FAIL" }
    );
    for phase in [Phase::Start, Phase::Test, Phase::Stop] {
        if let Some(p) = outcome.phase(phase) {
            for cmd in &p.commands {
                println!(
                    "  {} {:10} {:?} -> {:?}",
                    phase,
                    cmd.verdict.to_string(),
                    cmd.command.trim_end(),
                    cmd.response.as_deref().unwrap_or("<none>")
                );
            }
        }
    }
    println!("pool after run: {:?}", pool.statistics());
}
