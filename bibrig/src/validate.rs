//! Eligibility scoring for candidate endpoints.
//!
//! [`PortValidator::validate`] scores one endpoint against a
//! [`ValidationPolicy`] without retrying or mutating anything. The only
//! side effect is the optional accessibility probe, which is injected so
//! the scoring itself stays pure and testable.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::{ChipFamily, PhysicalEndpoint};

/// Probes whether an endpoint can currently be opened.
pub trait AccessProbe: Send + Sync {
    fn can_open(&self, endpoint: &str) -> bool;
}

/// Probe that actually opens the OS device with a short timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialAccessProbe;

impl AccessProbe for SerialAccessProbe {
    fn can_open(&self, endpoint: &str) -> bool {
        serialport::new(endpoint, 9600)
            .timeout(Duration::from_millis(100))
            .open()
            .is_ok()
    }
}

/// Probe that treats every endpoint as accessible. Used when the policy
/// should not touch hardware, and by tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAccessible;

impl AccessProbe for AlwaysAccessible {
    fn can_open(&self, _endpoint: &str) -> bool {
        true
    }
}

/// Strictness of a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ValidationMode {
    /// Any failed criterion rejects the endpoint.
    #[default]
    Strict,
    /// Valid while `passed > failed` and the score clears `minimum_score`.
    Lenient,
}

/// Which endpoints a client is willing to lease.
///
/// Empty allow-lists accept anything for that criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationPolicy {
    pub mode: ValidationMode,
    pub allowed_vendors: Vec<u16>,
    pub allowed_products: Vec<u16>,
    pub allowed_families: Vec<ChipFamily>,
    /// Case-insensitive substring required in the manufacturer string.
    pub manufacturer_contains: Option<String>,
    /// Endpoints rejected outright, before any scoring.
    pub excluded_endpoints: Vec<String>,
    /// Lenient-mode score floor, 0..=100.
    pub minimum_score: u8,
    /// Probe the OS device for openability.
    pub check_accessibility: bool,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        ValidationPolicy {
            mode: ValidationMode::Strict,
            allowed_vendors: Vec::new(),
            allowed_products: Vec::new(),
            allowed_families: Vec::new(),
            manufacturer_contains: None,
            excluded_endpoints: Vec::new(),
            minimum_score: 50,
            check_accessibility: false,
        }
    }
}

impl ValidationPolicy {
    /// Accept-everything policy.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// Typical production policy: FTDI chips of the given families only.
    pub fn ftdi(families: Vec<ChipFamily>) -> Self {
        ValidationPolicy {
            allowed_vendors: vec![crate::discovery::VID_FTDI],
            allowed_families: families,
            ..Self::default()
        }
    }

    pub fn lenient(mut self, minimum_score: u8) -> Self {
        self.mode = ValidationMode::Lenient;
        self.minimum_score = minimum_score;
        self
    }

    pub fn excluding(mut self, endpoints: Vec<String>) -> Self {
        self.excluded_endpoints = endpoints;
        self
    }
}

/// Scored verdict for one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortVerdict {
    pub valid: bool,
    /// `100 × passed / (passed + failed)`.
    pub score: u8,
    pub passed_criteria: Vec<String>,
    pub failed_criteria: Vec<String>,
    pub reason: String,
}

impl PortVerdict {
    fn excluded(endpoint: &str) -> Self {
        PortVerdict {
            valid: false,
            score: 0,
            passed_criteria: Vec::new(),
            failed_criteria: vec!["excluded".to_string()],
            reason: format!("{} is on the exclusion list", endpoint),
        }
    }
}

/// Validator with an injected accessibility probe.
#[derive(Clone)]
pub struct PortValidator {
    probe: Arc<dyn AccessProbe>,
}

impl Default for PortValidator {
    fn default() -> Self {
        PortValidator {
            probe: Arc::new(AlwaysAccessible),
        }
    }
}

impl PortValidator {
    pub fn new(probe: Arc<dyn AccessProbe>) -> Self {
        PortValidator { probe }
    }

    pub fn validate(&self, endpoint: &PhysicalEndpoint, policy: &ValidationPolicy) -> PortVerdict {
        if policy
            .excluded_endpoints
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&endpoint.name))
        {
            return PortVerdict::excluded(&endpoint.name);
        }

        let meta = &endpoint.metadata;
        let mut passed = Vec::new();
        let mut failed = Vec::new();
        let mut check = |name: &str, ok: bool| {
            if ok {
                passed.push(name.to_string());
            } else {
                failed.push(name.to_string());
            }
        };

        if policy.check_accessibility {
            check("accessible", self.probe.can_open(&endpoint.name));
        }
        check(
            "vendor",
            policy.allowed_vendors.is_empty() || policy.allowed_vendors.contains(&meta.vendor_id),
        );
        check(
            "product",
            policy.allowed_products.is_empty() || policy.allowed_products.contains(&meta.product_id),
        );
        check(
            "chip-family",
            policy.allowed_families.is_empty() || policy.allowed_families.contains(&meta.family),
        );
        check(
            "manufacturer",
            match &policy.manufacturer_contains {
                None => true,
                Some(want) => meta
                    .manufacturer
                    .as_deref()
                    .map(|m| m.to_ascii_lowercase().contains(&want.to_ascii_lowercase()))
                    .unwrap_or(false),
            },
        );

        let total = passed.len() + failed.len();
        let score = if total == 0 {
            100
        } else {
            (100 * passed.len() / total) as u8
        };
        let valid = match policy.mode {
            ValidationMode::Strict => failed.is_empty(),
            ValidationMode::Lenient => {
                passed.len() > failed.len() && score >= policy.minimum_score
            }
        };
        let reason = if valid {
            format!("{} passed {}/{} criteria", endpoint.name, passed.len(), total)
        } else {
            format!(
                "{} failed criteria: {}",
                endpoint.name,
                failed.join(", ")
            )
        };

        PortVerdict {
            valid,
            score,
            passed_criteria: passed,
            failed_criteria: failed,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{grouping_key, DeviceMetadata, VID_FTDI};

    fn ftdi_quad(name: &str) -> PhysicalEndpoint {
        PhysicalEndpoint::new(
            name,
            DeviceMetadata {
                vendor_id: VID_FTDI,
                product_id: 0x6011,
                family: ChipFamily::Quad,
                serial: Some("FT0XYZA".into()),
                description: Some("Quad RS232-HS".into()),
                manufacturer: Some("FTDI".into()),
                grouping_key: grouping_key(VID_FTDI, 0x6011, "FT0XYZ"),
                channel_index: Some(0),
                partial: false,
                enrich_error: None,
            },
        )
    }

    #[test]
    fn empty_allow_lists_accept_any_chip() {
        let verdict =
            PortValidator::default().validate(&ftdi_quad("COM3"), &ValidationPolicy::permissive());
        assert!(verdict.valid);
        assert_eq!(verdict.score, 100);
        assert!(verdict.failed_criteria.is_empty());
    }

    #[test]
    fn strict_mode_rejects_on_any_failure() {
        let mut policy = ValidationPolicy::ftdi(vec![ChipFamily::Quad]);
        policy.allowed_vendors = vec![0x1234];
        let verdict = PortValidator::default().validate(&ftdi_quad("COM3"), &policy);
        assert!(!verdict.valid);
        assert!(verdict.failed_criteria.contains(&"vendor".to_string()));
        assert!(verdict.score < 100);
    }

    #[test]
    fn lenient_mode_uses_score_floor() {
        let mut policy = ValidationPolicy::ftdi(vec![ChipFamily::Quad]).lenient(50);
        policy.allowed_vendors = vec![0x1234];
        // 3 of 4 criteria pass: 75 >= 50 and passed > failed.
        let verdict = PortValidator::default().validate(&ftdi_quad("COM3"), &policy);
        assert!(verdict.valid);
        assert_eq!(verdict.score, 75);

        let policy = policy.lenient(90);
        let verdict = PortValidator::default().validate(&ftdi_quad("COM3"), &policy);
        assert!(!verdict.valid);
    }

    #[test]
    fn exclusion_short_circuits() {
        let policy = ValidationPolicy::permissive().excluding(vec!["com3".to_string()]);
        let verdict = PortValidator::default().validate(&ftdi_quad("COM3"), &policy);
        assert!(!verdict.valid);
        assert_eq!(verdict.score, 0);
        assert_eq!(verdict.failed_criteria, vec!["excluded".to_string()]);
    }

    #[test]
    fn manufacturer_substring_is_case_insensitive() {
        let mut policy = ValidationPolicy::permissive();
        policy.manufacturer_contains = Some("ftdi".into());
        let verdict = PortValidator::default().validate(&ftdi_quad("COM3"), &policy);
        assert!(verdict.valid);

        policy.manufacturer_contains = Some("prolific".into());
        let verdict = PortValidator::default().validate(&ftdi_quad("COM3"), &policy);
        assert!(!verdict.valid);
    }

    struct DeadProbe;
    impl AccessProbe for DeadProbe {
        fn can_open(&self, _endpoint: &str) -> bool {
            false
        }
    }

    #[test]
    fn accessibility_uses_injected_probe() {
        let mut policy = ValidationPolicy::permissive();
        policy.check_accessibility = true;
        let verdict = PortValidator::new(Arc::new(DeadProbe)).validate(&ftdi_quad("COM3"), &policy);
        assert!(!verdict.valid);
        assert!(verdict.failed_criteria.contains(&"accessible".to_string()));
    }
}
