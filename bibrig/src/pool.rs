//! Exclusive port reservations.
//!
//! The pool is the single shared mutable structure of the system. One
//! mutex serializes every mutation, and the critical section only touches
//! the lease map: discovery and validation run before the lock is taken,
//! and eligibility is re-checked under the lock, so two racing acquisitions
//! can never hold the same endpoint.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::discovery::Discovery;
use crate::validate::{PortValidator, PortVerdict, ValidationPolicy};

/// Implicit bound on any hung workflow.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(50 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseState {
    Active,
    Released,
    Expired,
}

/// Proof of exclusive access to one endpoint for a bounded time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortLease {
    pub lease_id: String,
    pub endpoint: String,
    pub client_id: String,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
    pub state: LeaseState,
    /// Validation snapshot taken at acquisition, when a policy was applied.
    pub verdict: Option<PortVerdict>,
}

impl PortLease {
    fn new(
        endpoint: &str,
        client_id: &str,
        duration: Duration,
        verdict: Option<PortVerdict>,
    ) -> Self {
        let now = SystemTime::now();
        PortLease {
            lease_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            client_id: client_id.to_string(),
            created_at: now,
            expires_at: now + duration,
            state: LeaseState::Active,
            verdict,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == LeaseState::Active && SystemTime::now() < self.expires_at
    }
}

/// Aggregate pool counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_discovered: usize,
    pub active_leases: usize,
    pub available: usize,
    pub released_total: u64,
    pub expired_total: u64,
}

#[derive(Default)]
struct PoolInner {
    /// endpoint → most recent lease on it.
    leases: HashMap<String, PortLease>,
    released_total: u64,
    expired_total: u64,
}

impl PoolInner {
    /// Lazy expiry: flip stale Active leases to Expired on observation.
    fn expire_stale(&mut self) {
        let now = SystemTime::now();
        for lease in self.leases.values_mut() {
            if lease.state == LeaseState::Active && now >= lease.expires_at {
                warn!(
                    "lease_id={} endpoint={} client={} expired",
                    lease.lease_id, lease.endpoint, lease.client_id
                );
                lease.state = LeaseState::Expired;
                self.expired_total += 1;
            }
        }
    }

    fn endpoint_free(&self, endpoint: &str) -> bool {
        self.leases
            .get(endpoint)
            .map(|l| l.state != LeaseState::Active)
            .unwrap_or(true)
    }
}

/// Thread-safe registry of active leases, one exclusive lease per endpoint.
pub struct PortPool {
    discovery: Discovery,
    validator: PortValidator,
    default_duration: Duration,
    inner: Mutex<PoolInner>,
}

impl PortPool {
    pub fn new(discovery: Discovery, validator: PortValidator) -> Self {
        PortPool {
            discovery,
            validator,
            default_duration: DEFAULT_LEASE_DURATION,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn with_default_duration(mut self, duration: Duration) -> Self {
        self.default_duration = duration;
        self
    }

    /// Lease the first discovered endpoint that satisfies `policy`.
    ///
    /// Discovery and validation happen before the lock; the installed lease
    /// snapshots the winning verdict. Returns `None` when nothing eligible
    /// is free.
    pub fn acquire_any(&self, policy: &ValidationPolicy, client_id: &str) -> Option<PortLease> {
        let endpoints = match self.discovery.snapshot() {
            Ok(eps) => eps,
            Err(err) => {
                warn!("acquire_any: discovery failed: {}", err);
                return None;
            }
        };

        let mut candidates = Vec::new();
        for ep in &endpoints {
            let verdict = self.validator.validate(ep, policy);
            if verdict.valid {
                candidates.push((ep.name.clone(), verdict));
            } else {
                debug!("acquire_any: {} rejected: {}", ep.name, verdict.reason);
            }
        }

        let mut inner = self.inner.lock();
        inner.expire_stale();
        for (endpoint, verdict) in candidates {
            if inner.endpoint_free(&endpoint) {
                let lease = PortLease::new(
                    &endpoint,
                    client_id,
                    self.default_duration,
                    Some(verdict),
                );
                info!(
                    "lease_id={} endpoint={} client={} acquired",
                    lease.lease_id, endpoint, client_id
                );
                inner.leases.insert(endpoint, lease.clone());
                return Some(lease);
            }
        }
        None
    }

    /// Lease one specific endpoint, if it is discovered and free.
    pub fn acquire_specific(
        &self,
        endpoint: &str,
        client_id: &str,
        duration: Option<Duration>,
    ) -> Option<PortLease> {
        let known = match self.discovery.snapshot() {
            Ok(eps) => eps.iter().any(|e| e.name == endpoint),
            Err(err) => {
                warn!("acquire_specific: discovery failed: {}", err);
                return None;
            }
        };
        if !known {
            warn!("acquire_specific: endpoint={} not discovered", endpoint);
            return None;
        }

        let mut inner = self.inner.lock();
        inner.expire_stale();
        if !inner.endpoint_free(endpoint) {
            debug!("acquire_specific: endpoint={} already leased", endpoint);
            return None;
        }
        let lease = PortLease::new(
            endpoint,
            client_id,
            duration.unwrap_or(self.default_duration),
            None,
        );
        info!(
            "lease_id={} endpoint={} client={} acquired",
            lease.lease_id, endpoint, client_id
        );
        inner.leases.insert(endpoint.to_string(), lease.clone());
        Some(lease)
    }

    /// Release a lease. True only when the lease is Active and the client
    /// matches; anything else leaves the registry untouched.
    pub fn release(&self, lease_id: &str, client_id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.expire_stale();
        let lease = inner
            .leases
            .values_mut()
            .find(|l| l.lease_id == lease_id);
        match lease {
            Some(lease) if lease.state == LeaseState::Active => {
                if lease.client_id != client_id {
                    warn!(
                        "lease_id={} release denied: client={} does not hold it",
                        lease_id, client_id
                    );
                    return false;
                }
                lease.state = LeaseState::Released;
                inner.released_total += 1;
                info!("lease_id={} client={} released", lease_id, client_id);
                true
            }
            Some(_) => {
                debug!("lease_id={} already inactive", lease_id);
                false
            }
            None => {
                debug!("lease_id={} unknown", lease_id);
                false
            }
        }
    }

    /// Release every Active lease held by `client_id`; returns the count.
    pub fn release_all_for(&self, client_id: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.expire_stale();
        let mut released = 0;
        for lease in inner.leases.values_mut() {
            if lease.state == LeaseState::Active && lease.client_id == client_id {
                lease.state = LeaseState::Released;
                released += 1;
                info!(
                    "lease_id={} endpoint={} client={} released (bulk)",
                    lease.lease_id, lease.endpoint, client_id
                );
            }
        }
        inner.released_total += released as u64;
        released
    }

    /// Current lease on an endpoint, lazy expiry applied.
    pub fn lookup(&self, endpoint: &str) -> Option<PortLease> {
        let mut inner = self.inner.lock();
        inner.expire_stale();
        inner.leases.get(endpoint).cloned()
    }

    pub fn active_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire_stale();
        inner
            .leases
            .values()
            .filter(|l| l.state == LeaseState::Active)
            .count()
    }

    /// Discovered endpoints that are free and (optionally) pass `policy`.
    pub fn available_count(&self, policy: Option<&ValidationPolicy>) -> usize {
        let endpoints = match self.discovery.snapshot() {
            Ok(eps) => eps,
            Err(_) => return 0,
        };
        let mut inner = self.inner.lock();
        inner.expire_stale();
        endpoints
            .iter()
            .filter(|ep| inner.endpoint_free(&ep.name))
            .filter(|ep| match policy {
                Some(p) => self.validator.validate(ep, p).valid,
                None => true,
            })
            .count()
    }

    pub fn statistics(&self) -> PoolStats {
        let total_discovered = self.discovery.snapshot().map(|e| e.len()).unwrap_or(0);
        let mut inner = self.inner.lock();
        inner.expire_stale();
        let active = inner
            .leases
            .values()
            .filter(|l| l.state == LeaseState::Active)
            .count();
        PoolStats {
            total_discovered,
            active_leases: active,
            available: total_discovered.saturating_sub(active),
            released_total: inner.released_total,
            expired_total: inner.expired_total,
        }
    }

    /// Drop Released/Expired entries from the registry; returns the count.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.expire_stale();
        let before = inner.leases.len();
        inner.leases.retain(|_, l| l.state == LeaseState::Active);
        before - inner.leases.len()
    }
}
