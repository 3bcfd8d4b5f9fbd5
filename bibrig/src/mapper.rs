//! Dynamic port mapping: `(bib, uut, port#)` → physical endpoint.
//!
//! Resolution consults the configuration collaborator's mapping rules and a
//! fresh discovery snapshot, then picks the chip whose EEPROM description
//! matches the rule and the channel at `port_number - 1`. Successful
//! mappings are cached with a TTL; failures are cached only for a short
//! back-off so a re-plugged fixture is picked up promptly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::config::{ConfigStore, Coordinate, MappingRule};
use crate::discovery::{strip_channel_suffix, ChipGroup, Discovery};
use crate::discovery::PhysicalEndpoint;
use crate::error::WorkflowError;

const DEFAULT_TTL: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);

type CoordKey = (String, String, u32);

struct CachedMapping {
    endpoint: PhysicalEndpoint,
    cached_at: Instant,
}

#[derive(Default)]
struct MapperInner {
    forward: HashMap<CoordKey, CachedMapping>,
    reverse: HashMap<String, Coordinate>,
    negative: HashMap<CoordKey, Instant>,
}

/// Coordinate resolver with TTL'd caching.
pub struct DynamicPortMapper {
    discovery: Discovery,
    store: Arc<dyn ConfigStore>,
    ttl: Duration,
    backoff: Duration,
    inner: Mutex<MapperInner>,
}

impl DynamicPortMapper {
    pub fn new(discovery: Discovery, store: Arc<dyn ConfigStore>) -> Self {
        DynamicPortMapper {
            discovery,
            store,
            ttl: DEFAULT_TTL,
            backoff: DEFAULT_BACKOFF,
            inner: Mutex::new(MapperInner::default()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Resolve a coordinate to the endpoint currently backing it.
    pub fn resolve(&self, coord: &Coordinate) -> Result<PhysicalEndpoint, WorkflowError> {
        let key = coord.key();

        {
            let mut inner = self.inner.lock();
            if let Some(hit) = inner.forward.get(&key) {
                if hit.cached_at.elapsed() < self.ttl {
                    debug!("mapper: {} cache hit → {}", coord, hit.endpoint.name);
                    return Ok(hit.endpoint.clone());
                }
                inner.forward.remove(&key);
            }
            if let Some(failed_at) = inner.negative.get(&key) {
                if failed_at.elapsed() < self.backoff {
                    return Err(WorkflowError::ResolutionFailed(format!(
                        "{} failed to resolve recently, backing off",
                        coord
                    )));
                }
                inner.negative.remove(&key);
            }
        }

        match self.resolve_uncached(coord) {
            Ok(endpoint) => {
                let mut inner = self.inner.lock();
                inner.negative.remove(&key);
                inner.reverse.insert(endpoint.name.clone(), coord.clone());
                inner.forward.insert(
                    key,
                    CachedMapping {
                        endpoint: endpoint.clone(),
                        cached_at: Instant::now(),
                    },
                );
                info!("mapper: {} → endpoint={}", coord, endpoint.name);
                Ok(endpoint)
            }
            Err(err) => {
                self.inner.lock().negative.insert(key, Instant::now());
                warn!("mapper: {} resolution failed: {}", coord, err);
                Err(err)
            }
        }
    }

    fn resolve_uncached(&self, coord: &Coordinate) -> Result<PhysicalEndpoint, WorkflowError> {
        let rules = self
            .store
            .mapping_rules()
            .map_err(|e| WorkflowError::ResolutionFailed(format!("mapping rules: {}", e)))?;
        let rule = rules
            .iter()
            .find(|r| r.applies_to(&coord.bib_id, &coord.uut_id))
            .ok_or_else(|| {
                WorkflowError::ResolutionFailed(format!(
                    "no mapping rule for {}.{}",
                    coord.bib_id, coord.uut_id
                ))
            })?;

        let groups = self
            .discovery
            .groups()
            .map_err(|e| WorkflowError::ResolutionFailed(format!("discovery: {}", e)))?;
        let group = groups
            .iter()
            .find(|g| rule_matches_group(rule, g))
            .ok_or_else(|| {
                WorkflowError::ResolutionFailed(format!(
                    "no chip matches rule for {}.{}",
                    coord.bib_id, coord.uut_id
                ))
            })?;

        if coord.port_number == 0 {
            return Err(WorkflowError::ResolutionFailed(format!(
                "{}: port numbers start at 1",
                coord
            )));
        }
        group
            .channel(coord.port_number - 1)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::ResolutionFailed(format!(
                    "{}: chip {} has {} channel(s), port {} out of range",
                    coord,
                    group.key,
                    group.endpoints.len(),
                    coord.port_number
                ))
            })
    }

    /// Reverse index, for log lines about an endpoint.
    pub fn coordinate_for(&self, endpoint: &str) -> Option<Coordinate> {
        self.inner.lock().reverse.get(endpoint).cloned()
    }

    /// Drop any cached mapping for one coordinate.
    pub fn invalidate(&self, coord: &Coordinate) {
        let key = coord.key();
        let mut inner = self.inner.lock();
        if let Some(old) = inner.forward.remove(&key) {
            inner.reverse.remove(&old.endpoint.name);
        }
        inner.negative.remove(&key);
    }

    /// Drop every cached mapping.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.forward.clear();
        inner.reverse.clear();
        inner.negative.clear();
    }
}

fn rule_matches_group(rule: &MappingRule, group: &ChipGroup) -> bool {
    let description = group.metadata.description.as_deref().unwrap_or("");
    if !rule.description.matches(description) {
        return false;
    }
    if let Some(want) = &rule.manufacturer {
        let found = group
            .metadata
            .manufacturer
            .as_deref()
            .map(|m| m.to_ascii_lowercase().contains(&want.to_ascii_lowercase()))
            .unwrap_or(false);
        if !found {
            return false;
        }
    }
    if let Some(want) = &rule.serial {
        let base = group
            .metadata
            .serial
            .as_deref()
            .map(|s| strip_channel_suffix(s).0)
            .unwrap_or_default();
        if !base.eq_ignore_ascii_case(want) {
            return false;
        }
    }
    true
}
