//! This crate drives automated hardware test workflows over serial links
//! attached to multi-interface USB-to-UART bridges.
//!
//! A fleet of physical test fixtures (BIBs, boards-in-box), each hosting one
//! or more UUTs (units-under-test), is described by declarative
//! configuration. The crate discovers the underlying serial devices,
//! correlates them to the configured fixtures by reading device EEPROM
//! identifiers, reserves ports exclusively per workflow, executes a
//! three-phase command protocol (START → TEST → STOP) against each port and
//! reports structured per-fixture outcomes.
//!
//! # Scope
//! The crate contains no configuration file parser, no log sink and no user
//! interface. Hosts supply a [`config::ConfigStore`] (see the
//! `bibrig-xmlstore` crate for the XML file store), optionally a
//! [`signal::SideSignal`] for GPIO-style indicators, and select one of the
//! [`orchestrator::Orchestrator`] operations.
//!
//! # Getting started
//! Look at `examples/mock_rig.rs` for a complete host wired to in-memory
//! collaborators.
//!
//! ```
//! use std::sync::Arc;
//!
//! use bibrig::prelude::*;
//!
//! // Declarative fixture: one BIB, one UUT, one rs232 port.
//! let mut port = PortConfig::rs232(9600);
//! port.start = CommandSequence::new(vec![ProtocolCommand::literal("INIT\r", "READY")]);
//! let store = MemoryConfigStore::new()
//!     .with_bib(BibConfig::new("demo").with_uut(UutConfig::new("u1").with_port(1, port)))
//!     .with_rule(MappingRule::new(
//!         "demo",
//!         "u1",
//!         DescriptionMatch::Contains("demo.u1".into()),
//!     ));
//!
//! let store: Arc<dyn ConfigStore> = Arc::new(store);
//! let discovery = Discovery::new(Arc::new(SystemEnumerator::new()));
//! let pool = Arc::new(PortPool::new(discovery.clone(), PortValidator::default()));
//! let mapper = Arc::new(DynamicPortMapper::new(discovery, store.clone()));
//! let orchestrator = Orchestrator::new(store, mapper, pool, ProtocolRegistry::with_defaults());
//!
//! let outcome = orchestrator.run_single(
//!     &Coordinate::new("demo", "u1", 1),
//!     "example-client",
//!     &CancelToken::new(),
//! );
//! assert!(!outcome.success); // no such fixture attached here
//! ```
//!
//! # Project organisation
//!  * `bibrig` - core library: discovery, validation, pool, mapping,
//!    sessions, response classification and orchestration
//!  * `bibrig-xmlstore` - BIB-per-file XML configuration store

pub mod cancel;
pub mod config;
pub mod discovery;
pub mod error;
pub mod mapper;
pub mod orchestrator;
pub mod outcome;
pub mod pool;
pub mod response;
pub mod session;
pub mod signal;
pub mod validate;

/// Everything a host needs to wire up and run workflows.
pub mod prelude {
    pub use crate::cancel::CancelToken;
    pub use crate::config::{
        BibConfig, CommandSequence, ConfigStore, Coordinate, DescriptionMatch, Handshake,
        MappingRule, MemoryConfigStore, Phase, PortConfig, ProtocolCommand, UutConfig,
    };
    pub use crate::discovery::{
        ChipFamily, DeviceEnumerator, DeviceMetadata, Discovery, PhysicalEndpoint,
        SystemEnumerator,
    };
    pub use crate::error::{OpenError, WorkflowError};
    pub use crate::mapper::DynamicPortMapper;
    pub use crate::orchestrator::{Orchestrator, SettleDelays};
    pub use crate::outcome::{
        BibOutcome, CommandOutcome, MultiBibOutcome, PhaseOutcome, UutOutcome, WorkflowOutcome,
    };
    pub use crate::pool::{PortLease, PortPool};
    pub use crate::response::{CommandVerdict, Pattern, PatternSet, ValidationLevel};
    pub use crate::session::{
        LoopbackHandler, ProtocolHandler, ProtocolRegistry, ProtocolSession, Rs232Handler,
        SessionInfo,
    };
    pub use crate::signal::{NoopSignal, SideSignal};
    pub use crate::validate::{PortValidator, ValidationMode, ValidationPolicy};
}
