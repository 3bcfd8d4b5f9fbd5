//! Declarative fixture configuration: which BIBs exist, which UUTs they
//! host, how each port talks and what the three command phases send.
//!
//! The core never parses configuration files. A host supplies a
//! [`ConfigStore`] implementation (see the `bibrig-xmlstore` crate for the
//! XML file store); [`MemoryConfigStore`] is provided for tests and embedded
//! hosts that build configuration in code.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::response::{Pattern, PatternSet};

/// Logical address of one communication port: `(bib, uut, port#)`.
///
/// Ids are matched case-insensitively; `port_number` starts at 1 and is
/// unique within its UUT. A coordinate never names a physical device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub bib_id: String,
    pub uut_id: String,
    pub port_number: u32,
}

impl Coordinate {
    pub fn new(bib_id: impl Into<String>, uut_id: impl Into<String>, port_number: u32) -> Self {
        Coordinate {
            bib_id: bib_id.into(),
            uut_id: uut_id.into(),
            port_number,
        }
    }

    /// Case-folded key for cache maps and id comparison.
    pub fn key(&self) -> (String, String, u32) {
        (
            self.bib_id.to_ascii_lowercase(),
            self.uut_id.to_ascii_lowercase(),
            self.port_number,
        )
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bib_id, self.uut_id, self.port_number)
    }
}

/// The three workflow phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Start,
    Test,
    Stop,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Start => "START",
            Phase::Test => "TEST",
            Phase::Stop => "STOP",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One literal command plus its response expectations.
///
/// A command with only `expected` behaves as legacy binary pass/fail; a
/// command with a [`PatternSet`] gets full multi-level classification. Both
/// are one type, distinguished by what is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolCommand {
    /// Bytes sent to the UUT, including any terminator (e.g. `"INIT\r"`).
    pub command: String,
    /// Primary expected-response pattern. Acts as the PASS pattern when no
    /// explicit PASS entry exists in `levels`.
    pub expected: Option<Pattern>,
    /// Per-command read timeout.
    pub timeout: Duration,
    /// Retries on execution error (0 = single attempt).
    pub retries: u32,
    /// Optional WARN/FAIL/CRITICAL pattern set.
    pub levels: Option<PatternSet>,
    /// Keep the sequence running past a FAIL verdict on this command.
    pub continue_on_failure: bool,
}

impl ProtocolCommand {
    /// Plain command expecting `expected` as a literal substring.
    pub fn literal(command: impl Into<String>, expected: impl Into<String>) -> Self {
        ProtocolCommand {
            command: command.into(),
            expected: Some(Pattern::literal(expected)),
            timeout: Duration::from_millis(2000),
            retries: 0,
            levels: None,
            continue_on_failure: false,
        }
    }

    /// Command with no response expectation at all.
    pub fn unchecked(command: impl Into<String>) -> Self {
        ProtocolCommand {
            command: command.into(),
            expected: None,
            timeout: Duration::from_millis(2000),
            retries: 0,
            levels: None,
            continue_on_failure: false,
        }
    }

    pub fn with_levels(mut self, levels: PatternSet) -> Self {
        self.levels = Some(levels);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn continue_on_failure(mut self, yes: bool) -> Self {
        self.continue_on_failure = yes;
        self
    }
}

/// Ordered commands for one phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSequence {
    pub commands: Vec<ProtocolCommand>,
}

impl CommandSequence {
    pub fn new(commands: Vec<ProtocolCommand>) -> Self {
        CommandSequence { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Sequence-level continue policy: OR over every command's flag.
    pub fn continue_on_failure(&self) -> bool {
        self.commands.iter().any(|c| c.continue_on_failure)
    }
}

/// Handshake mode of a serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Handshake {
    #[default]
    None,
    /// XON/XOFF software flow control.
    Software,
    /// RTS/CTS hardware flow control.
    Hardware,
}

/// Communication parameters and command sequences for one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Protocol name, lower-case ascii (`"rs232"`, `"loopback"`, ..).
    pub protocol: String,
    /// Line speed in bit/s.
    pub speed: u32,
    /// Data pattern such as `"n81"` (parity, data bits, stop bits).
    pub data_pattern: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake: Handshake,
    pub start: CommandSequence,
    pub test: CommandSequence,
    pub stop: CommandSequence,
}

impl PortConfig {
    /// A conventional `rs232 @ 9600 n81` port with empty sequences.
    pub fn rs232(speed: u32) -> Self {
        PortConfig {
            protocol: "rs232".into(),
            speed,
            data_pattern: "n81".into(),
            read_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(2000),
            handshake: Handshake::None,
            start: CommandSequence::default(),
            stop: CommandSequence::default(),
            test: CommandSequence::default(),
        }
    }

    pub fn sequence(&self, phase: Phase) -> &CommandSequence {
        match phase {
            Phase::Start => &self.start,
            Phase::Test => &self.test,
            Phase::Stop => &self.stop,
        }
    }
}

/// One UUT and its ports, keyed by port number (ascending iteration order
/// matters for auto-port workflows).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UutConfig {
    pub id: String,
    pub ports: BTreeMap<u32, PortConfig>,
}

impl UutConfig {
    pub fn new(id: impl Into<String>) -> Self {
        UutConfig {
            id: id.into(),
            ports: BTreeMap::new(),
        }
    }

    pub fn with_port(mut self, number: u32, config: PortConfig) -> Self {
        self.ports.insert(number, config);
        self
    }
}

/// One BIB: a fixture hosting one or more UUTs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BibConfig {
    pub id: String,
    pub uuts: Vec<UutConfig>,
}

impl BibConfig {
    pub fn new(id: impl Into<String>) -> Self {
        BibConfig {
            id: id.into(),
            uuts: Vec::new(),
        }
    }

    pub fn with_uut(mut self, uut: UutConfig) -> Self {
        self.uuts.push(uut);
        self
    }

    pub fn uut(&self, uut_id: &str) -> Option<&UutConfig> {
        self.uuts.iter().find(|u| u.id.eq_ignore_ascii_case(uut_id))
    }

    pub fn port(&self, uut_id: &str, port_number: u32) -> Option<&PortConfig> {
        self.uut(uut_id).and_then(|u| u.ports.get(&port_number))
    }
}

/// How a chip's product description is matched against a mapping rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DescriptionMatch {
    /// Exact match, case-insensitive.
    Equals(String),
    /// Substring match, case-insensitive.
    Contains(String),
}

impl DescriptionMatch {
    pub fn matches(&self, description: &str) -> bool {
        let haystack = description.to_ascii_lowercase();
        match self {
            DescriptionMatch::Equals(want) => haystack == want.to_ascii_lowercase(),
            DescriptionMatch::Contains(want) => haystack.contains(&want.to_ascii_lowercase()),
        }
    }
}

/// Associates a chip (by its EEPROM product description, optionally refined
/// by manufacturer and serial) with a logical `(bib, uut)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingRule {
    pub bib_id: String,
    pub uut_id: String,
    pub description: DescriptionMatch,
    /// Optional case-insensitive substring refinement on the manufacturer.
    pub manufacturer: Option<String>,
    /// Optional exact-match refinement on the chip serial.
    pub serial: Option<String>,
}

impl MappingRule {
    pub fn new(
        bib_id: impl Into<String>,
        uut_id: impl Into<String>,
        description: DescriptionMatch,
    ) -> Self {
        MappingRule {
            bib_id: bib_id.into(),
            uut_id: uut_id.into(),
            description,
            manufacturer: None,
            serial: None,
        }
    }

    pub fn applies_to(&self, bib_id: &str, uut_id: &str) -> bool {
        self.bib_id.eq_ignore_ascii_case(bib_id) && self.uut_id.eq_ignore_ascii_case(uut_id)
    }
}

/// The configuration collaborator the core depends on.
///
/// Concrete sources (XML files today) live outside the core; the orchestrator
/// and mapper only see this trait.
pub trait ConfigStore: Send + Sync {
    /// Load one BIB by id (case-insensitive). `Ok(None)` means not declared.
    fn load_bib(&self, bib_id: &str) -> Result<Option<BibConfig>, ConfigError>;

    /// All declared BIB ids, in store order.
    fn list_configured_bibs(&self) -> Result<Vec<String>, ConfigError>;

    /// Chip-to-UUT association rules used by dynamic port mapping.
    fn mapping_rules(&self) -> Result<Vec<MappingRule>, ConfigError>;
}

impl<T: ConfigStore + ?Sized> ConfigStore for Arc<T> {
    fn load_bib(&self, bib_id: &str) -> Result<Option<BibConfig>, ConfigError> {
        (**self).load_bib(bib_id)
    }

    fn list_configured_bibs(&self) -> Result<Vec<String>, ConfigError> {
        (**self).list_configured_bibs()
    }

    fn mapping_rules(&self) -> Result<Vec<MappingRule>, ConfigError> {
        (**self).mapping_rules()
    }
}

/// In-memory store for tests, examples and hosts that configure in code.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    bibs: Vec<BibConfig>,
    rules: Vec<MappingRule>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bib(mut self, bib: BibConfig) -> Self {
        self.bibs.push(bib);
        self
    }

    pub fn with_rule(mut self, rule: MappingRule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load_bib(&self, bib_id: &str) -> Result<Option<BibConfig>, ConfigError> {
        Ok(self
            .bibs
            .iter()
            .find(|b| b.id.eq_ignore_ascii_case(bib_id))
            .cloned())
    }

    fn list_configured_bibs(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.bibs.iter().map(|b| b.id.clone()).collect())
    }

    fn mapping_rules(&self) -> Result<Vec<MappingRule>, ConfigError> {
        Ok(self.rules.clone())
    }
}
