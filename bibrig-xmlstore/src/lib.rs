//! BIB-per-file XML configuration store.
//!
//! Implements [`bibrig::config::ConfigStore`] over a directory of XML
//! files, one per BIB, with a legacy single-file fallback:
//!
//! * root directory configurable, `Configuration/` by default
//! * one file per BIB named `bib_<bib_id>.xml` with document element
//!   `<bib id="…">`
//! * a legacy `<root><bib …/>…</root>` file is also accepted; individual
//!   files are always tried first
//!
//! Unknown elements and attributes are ignored, so fixture files may carry
//! annotations this crate knows nothing about.
//!
//! # File shape
//! ```xml
//! <bib id="demo">
//!   <uut id="u1">
//!     <mapping description_contains="demo.u1" manufacturer="FTDI"/>
//!     <port number="1">
//!       <protocol>rs232</protocol>
//!       <speed>9600</speed>
//!       <data_pattern>n81</data_pattern>
//!       <read_timeout>2000</read_timeout>
//!       <write_timeout>2000</write_timeout>
//!       <start>
//!         <command>INIT</command>
//!         <expected_response>READY</expected_response>
//!       </start>
//!       <test continue_on_failure="false" timeout_ms="3000" retries="1">
//!         <command>PING</command>
//!         <expected_response>PONG</expected_response>
//!         <validation_levels>
//!           <warn regex="true">^WARN</warn>
//!           <fail>ERR</fail>
//!           <critical trigger_hardware="true">FATAL</critical>
//!         </validation_levels>
//!       </test>
//!       <stop>
//!         <command>QUIT</command>
//!         <expected_response>BYE</expected_response>
//!       </stop>
//!     </port>
//!   </uut>
//! </bib>
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use roxmltree::{Document, Node};

use bibrig::config::{
    BibConfig, CommandSequence, ConfigStore, DescriptionMatch, Handshake, MappingRule,
    PortConfig, ProtocolCommand, UutConfig,
};
use bibrig::error::ConfigError;
use bibrig::response::{Pattern, PatternSet};

const DEFAULT_ROOT: &str = "Configuration";
const LEGACY_FILE: &str = "bib_configurations.xml";

/// One parsed BIB plus the mapping rules its file declares.
#[derive(Debug, Clone)]
struct ParsedBib {
    config: BibConfig,
    rules: Vec<MappingRule>,
}

/// Directory-backed XML store.
pub struct XmlConfigStore {
    root: PathBuf,
    legacy: PathBuf,
}

impl Default for XmlConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}

impl XmlConfigStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let legacy = root.join(LEGACY_FILE);
        XmlConfigStore { root, legacy }
    }

    pub fn with_legacy_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.legacy = path.into();
        self
    }

    /// All `bib_*.xml` files under the root, sorted for deterministic order.
    fn bib_files(&self) -> Result<Vec<PathBuf>, ConfigError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if path.is_file()
                && name.starts_with("bib_")
                && name.ends_with(".xml")
                && path != self.legacy
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn parse_file(&self, path: &Path) -> Result<Vec<ParsedBib>, ConfigError> {
        let text = fs::read_to_string(path)?;
        let source_name = path.display().to_string();
        let doc = Document::parse(&text).map_err(|e| ConfigError::Parse {
            source_name: source_name.clone(),
            reason: e.to_string(),
        })?;
        let root = doc.root_element();

        match root.tag_name().name() {
            "bib" => Ok(vec![parse_bib(&source_name, root)?]),
            // Legacy multi-bib document.
            "root" => root
                .children()
                .filter(|n| n.is_element() && n.has_tag_name("bib"))
                .map(|n| parse_bib(&source_name, n))
                .collect(),
            other => Err(ConfigError::Parse {
                source_name,
                reason: format!("unexpected document element <{}>", other),
            }),
        }
    }

    fn load_all(&self) -> Result<Vec<ParsedBib>, ConfigError> {
        let mut bibs: Vec<ParsedBib> = Vec::new();
        for path in self.bib_files()? {
            match self.parse_file(&path) {
                Ok(parsed) => bibs.extend(parsed),
                Err(err) => warn!("skipping {}: {}", path.display(), err),
            }
        }
        if self.legacy.is_file() {
            match self.parse_file(&self.legacy) {
                Ok(parsed) => {
                    for bib in parsed {
                        // Individual files win over the legacy document.
                        if !bibs
                            .iter()
                            .any(|b| b.config.id.eq_ignore_ascii_case(&bib.config.id))
                        {
                            bibs.push(bib);
                        }
                    }
                }
                Err(err) => warn!("skipping legacy {}: {}", self.legacy.display(), err),
            }
        }
        Ok(bibs)
    }

    fn find_bib(&self, bib_id: &str) -> Result<Option<ParsedBib>, ConfigError> {
        // Individual files first.
        for path in self.bib_files()? {
            match self.parse_file(&path) {
                Ok(parsed) => {
                    if let Some(bib) = parsed
                        .into_iter()
                        .find(|b| b.config.id.eq_ignore_ascii_case(bib_id))
                    {
                        debug!("bib {} loaded from {}", bib_id, path.display());
                        return Ok(Some(bib));
                    }
                }
                Err(err) => warn!("skipping {}: {}", path.display(), err),
            }
        }
        // Then the legacy document.
        if self.legacy.is_file() {
            match self.parse_file(&self.legacy) {
                Ok(parsed) => {
                    if let Some(bib) = parsed
                        .into_iter()
                        .find(|b| b.config.id.eq_ignore_ascii_case(bib_id))
                    {
                        debug!("bib {} loaded from legacy {}", bib_id, self.legacy.display());
                        return Ok(Some(bib));
                    }
                }
                Err(err) => warn!("skipping legacy {}: {}", self.legacy.display(), err),
            }
        }
        Ok(None)
    }
}

impl ConfigStore for XmlConfigStore {
    fn load_bib(&self, bib_id: &str) -> Result<Option<BibConfig>, ConfigError> {
        Ok(self.find_bib(bib_id)?.map(|b| b.config))
    }

    fn list_configured_bibs(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.load_all()?.into_iter().map(|b| b.config.id).collect())
    }

    fn mapping_rules(&self) -> Result<Vec<MappingRule>, ConfigError> {
        Ok(self
            .load_all()?
            .into_iter()
            .flat_map(|b| b.rules)
            .collect())
    }
}

fn parse_bool(value: Option<&str>) -> bool {
    matches!(value, Some("true") | Some("1"))
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(name))
        .and_then(|n| n.text())
}

fn parse_bib(source_name: &str, node: Node) -> Result<ParsedBib, ConfigError> {
    let id = node
        .attribute("id")
        .ok_or_else(|| ConfigError::Parse {
            source_name: source_name.to_string(),
            reason: "<bib> without id attribute".to_string(),
        })?
        .to_string();

    let mut config = BibConfig::new(id.clone());
    let mut rules = Vec::new();
    for uut_node in node
        .children()
        .filter(|n| n.is_element() && n.has_tag_name("uut"))
    {
        let (uut, uut_rules) = parse_uut(source_name, &id, uut_node)?;
        config = config.with_uut(uut);
        rules.extend(uut_rules);
    }
    Ok(ParsedBib { config, rules })
}

fn parse_uut(
    source_name: &str,
    bib_id: &str,
    node: Node,
) -> Result<(UutConfig, Vec<MappingRule>), ConfigError> {
    let id = node
        .attribute("id")
        .ok_or_else(|| ConfigError::Parse {
            source_name: source_name.to_string(),
            reason: format!("<uut> without id attribute in bib {}", bib_id),
        })?
        .to_string();

    let mut uut = UutConfig::new(id.clone());
    let mut rules = Vec::new();

    for child in node.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "mapping" => {
                if let Some(rule) = parse_mapping(bib_id, &id, child) {
                    rules.push(rule);
                }
            }
            "port" => {
                let number = child
                    .attribute("number")
                    .and_then(|n| n.parse::<u32>().ok())
                    .filter(|n| *n >= 1)
                    .ok_or_else(|| ConfigError::Parse {
                        source_name: source_name.to_string(),
                        reason: format!(
                            "<port> in {}.{} needs a positive number attribute",
                            bib_id, id
                        ),
                    })?;
                uut = uut.with_port(number, parse_port(child));
            }
            // Unknown elements are tolerated.
            _ => {}
        }
    }
    Ok((uut, rules))
}

fn parse_mapping(bib_id: &str, uut_id: &str, node: Node) -> Option<MappingRule> {
    let description = if let Some(text) = node.attribute("description_equals") {
        DescriptionMatch::Equals(text.to_string())
    } else if let Some(text) = node.attribute("description_contains") {
        DescriptionMatch::Contains(text.to_string())
    } else {
        warn!(
            "mapping for {}.{} has no description_equals/description_contains",
            bib_id, uut_id
        );
        return None;
    };
    let mut rule = MappingRule::new(bib_id, uut_id, description);
    rule.manufacturer = node.attribute("manufacturer").map(str::to_string);
    rule.serial = node.attribute("serial").map(str::to_string);
    Some(rule)
}

fn parse_port(node: Node) -> PortConfig {
    let mut config = PortConfig::rs232(9600);

    if let Some(text) = child_text(node, "protocol") {
        config.protocol = text.trim().to_ascii_lowercase();
    }
    if let Some(speed) = child_text(node, "speed").and_then(|t| t.trim().parse().ok()) {
        config.speed = speed;
    }
    if let Some(text) = child_text(node, "data_pattern") {
        config.data_pattern = text.trim().to_string();
    }
    if let Some(ms) = child_text(node, "read_timeout").and_then(|t| t.trim().parse().ok()) {
        config.read_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = child_text(node, "write_timeout").and_then(|t| t.trim().parse().ok()) {
        config.write_timeout = Duration::from_millis(ms);
    }
    if let Some(text) = child_text(node, "handshake") {
        config.handshake = match text.trim().to_ascii_lowercase().as_str() {
            "software" | "xonxoff" => Handshake::Software,
            "hardware" | "rtscts" => Handshake::Hardware,
            _ => Handshake::None,
        };
    }

    let mut start = Vec::new();
    let mut test = Vec::new();
    let mut stop = Vec::new();
    for child in node.children().filter(|n| n.is_element()) {
        let slot = match child.tag_name().name() {
            "start" => &mut start,
            "test" => &mut test,
            "stop" => &mut stop,
            _ => continue,
        };
        slot.push(parse_command(child, &config));
    }
    config.start = CommandSequence::new(start);
    config.test = CommandSequence::new(test);
    config.stop = CommandSequence::new(stop);
    config
}

fn parse_command(node: Node, port: &PortConfig) -> ProtocolCommand {
    let command = child_text(node, "command").unwrap_or("").to_string();
    let mut parsed = ProtocolCommand::unchecked(command)
        .with_timeout(port.read_timeout)
        .continue_on_failure(parse_bool(node.attribute("continue_on_failure")));

    if let Some(ms) = node
        .attribute("timeout_ms")
        .and_then(|t| t.parse().ok())
    {
        parsed = parsed.with_timeout(Duration::from_millis(ms));
    }
    if let Some(retries) = node.attribute("retries").and_then(|t| t.parse().ok()) {
        parsed = parsed.with_retries(retries);
    }

    if let Some(expected) = node
        .children()
        .find(|n| n.is_element() && n.has_tag_name("expected_response"))
    {
        parsed.expected = pattern_from(expected);
    }

    if let Some(levels) = node
        .children()
        .find(|n| n.is_element() && n.has_tag_name("validation_levels"))
    {
        parsed = parsed.with_levels(parse_levels(levels));
    }
    parsed
}

fn parse_levels(node: Node) -> PatternSet {
    let mut set = PatternSet::new();
    for child in node.children().filter(|n| n.is_element()) {
        let pattern = match pattern_from(child) {
            Some(p) => p,
            None => continue,
        };
        match child.tag_name().name() {
            "pass" => set.pass = Some(pattern),
            "warn" => set.warn = Some(pattern),
            "fail" => set.fail = Some(pattern),
            "critical" => {
                set.trigger_hardware = parse_bool(child.attribute("trigger_hardware"));
                set.critical = Some(pattern);
            }
            _ => {}
        }
    }
    set
}

fn pattern_from(node: Node) -> Option<Pattern> {
    let text = node.text()?.to_string();
    if text.is_empty() {
        return None;
    }
    Some(if parse_bool(node.attribute("regex")) {
        Pattern::regex(text)
    } else {
        Pattern::literal(text)
    })
}
