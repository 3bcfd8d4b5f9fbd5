//! Structured results: per command, per phase, per coordinate, and the
//! nested aggregations hosts report on.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::{Coordinate, Phase};
use crate::response::CommandVerdict;

/// Result of one command exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub command: String,
    /// Response as received (lossy utf-8), terminator trimmed.
    pub response: Option<String>,
    pub verdict: CommandVerdict,
    pub duration: Duration,
    pub started_at: SystemTime,
    pub finished_at: SystemTime,
    /// IO/timeout detail when the verdict is EXECUTION_ERROR.
    pub error: Option<String>,
    /// Attempts made, retries included.
    pub attempts: u32,
}

/// Ordered command outcomes of one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase: Phase,
    pub commands: Vec<CommandOutcome>,
    /// True when every command passed or warned.
    pub is_success: bool,
    pub duration: Duration,
}

impl PhaseOutcome {
    pub fn new(phase: Phase, commands: Vec<CommandOutcome>) -> Self {
        let is_success = commands.iter().all(|c| c.verdict.is_success());
        let duration = commands.iter().map(|c| c.duration).sum();
        PhaseOutcome {
            phase,
            commands,
            is_success,
            duration,
        }
    }

    /// An empty phase (no commands configured) is a success.
    pub fn empty(phase: Phase) -> Self {
        Self::new(phase, Vec::new())
    }
}

/// Result of one full (or single-phase) workflow on one coordinate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    pub coordinate: Coordinate,
    /// Physical endpoint used, once resolution succeeded.
    pub endpoint: Option<String>,
    pub lease_id: Option<String>,
    pub start: Option<PhaseOutcome>,
    pub test: Option<PhaseOutcome>,
    pub stop: Option<PhaseOutcome>,
    /// `start.is_success && test.is_success`; STOP never factors in.
    pub success: bool,
    pub cancelled: bool,
    /// Stable failure kind (see [`crate::error::WorkflowError::kind`]).
    pub error: Option<String>,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl WorkflowOutcome {
    pub(crate) fn failed(coordinate: Coordinate, error: String) -> Self {
        WorkflowOutcome {
            coordinate,
            endpoint: None,
            lease_id: None,
            start: None,
            test: None,
            stop: None,
            success: false,
            cancelled: false,
            error: Some(error),
            started_at: SystemTime::now(),
            duration: Duration::ZERO,
        }
    }

    /// Recompute `success` from the phases currently attached.
    pub(crate) fn derive_success(&mut self) {
        self.success = self.start.as_ref().is_some_and(|p| p.is_success)
            && self.test.as_ref().is_some_and(|p| p.is_success);
    }

    pub fn phase(&self, phase: Phase) -> Option<&PhaseOutcome> {
        match phase {
            Phase::Start => self.start.as_ref(),
            Phase::Test => self.test.as_ref(),
            Phase::Stop => self.stop.as_ref(),
        }
    }
}

/// All workflows run against one UUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UutOutcome {
    pub bib_id: String,
    pub uut_id: String,
    pub workflows: Vec<WorkflowOutcome>,
    pub successful: usize,
    pub failed: usize,
}

impl UutOutcome {
    pub fn new(bib_id: String, uut_id: String, workflows: Vec<WorkflowOutcome>) -> Self {
        let successful = workflows.iter().filter(|w| w.success).count();
        let failed = workflows.len() - successful;
        UutOutcome {
            bib_id,
            uut_id,
            workflows,
            successful,
            failed,
        }
    }
}

/// All workflows run against one BIB. Partial success is first-class: the
/// tallies count leaf workflows, they are never collapsed to one bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BibOutcome {
    pub bib_id: String,
    pub uuts: Vec<UutOutcome>,
    /// Set when the BIB as a whole could not run (e.g. missing config).
    pub error: Option<String>,
    pub total_workflows: usize,
    pub successful_workflows: usize,
    pub failed_workflows: usize,
}

impl BibOutcome {
    pub fn new(bib_id: String, uuts: Vec<UutOutcome>) -> Self {
        let total = uuts.iter().map(|u| u.workflows.len()).sum();
        let successful = uuts.iter().map(|u| u.successful).sum();
        BibOutcome {
            bib_id,
            uuts,
            error: None,
            total_workflows: total,
            successful_workflows: successful,
            failed_workflows: total - successful,
        }
    }

    /// A BIB that failed before any workflow could run. It still contributes
    /// one failed workflow so aggregate tallies enumerate every attempt.
    pub fn failed(bib_id: String, error: String) -> Self {
        let placeholder = WorkflowOutcome::failed(
            Coordinate::new(bib_id.clone(), String::new(), 0),
            error.clone(),
        );
        let uut = UutOutcome::new(bib_id.clone(), String::new(), vec![placeholder]);
        BibOutcome {
            bib_id,
            uuts: vec![uut],
            error: Some(error),
            total_workflows: 1,
            successful_workflows: 0,
            failed_workflows: 1,
        }
    }

    /// At least one workflow succeeded.
    pub fn has_success(&self) -> bool {
        self.successful_workflows > 0
    }
}

/// Aggregation over a list of BIBs (or every configured BIB).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiBibOutcome {
    pub bibs: Vec<BibOutcome>,
    pub total_bibs_executed: usize,
    /// BIBs with at least one successful workflow.
    pub successful_bibs: usize,
    pub total_workflows: usize,
    pub successful_workflows: usize,
    pub failed_workflows: usize,
    pub duration: Duration,
}

impl MultiBibOutcome {
    pub fn new(bibs: Vec<BibOutcome>, duration: Duration) -> Self {
        let total_workflows = bibs.iter().map(|b| b.total_workflows).sum();
        let successful_workflows = bibs.iter().map(|b| b.successful_workflows).sum();
        MultiBibOutcome {
            total_bibs_executed: bibs.len(),
            successful_bibs: bibs.iter().filter(|b| b.has_success()).count(),
            total_workflows,
            successful_workflows,
            failed_workflows: total_workflows - successful_workflows,
            bibs,
            duration,
        }
    }

    /// `successful / total`, or 1.0 for an empty run.
    pub fn success_rate(&self) -> f64 {
        if self.total_workflows == 0 {
            1.0
        } else {
            self.successful_workflows as f64 / self.total_workflows as f64
        }
    }

    /// One-line digest hosts can print.
    pub fn summary(&self) -> String {
        format!(
            "{}/{} bibs ok, {}/{} workflows ok ({:.1}%) in {:.1}s",
            self.successful_bibs,
            self.total_bibs_executed,
            self.successful_workflows,
            self.total_workflows,
            self.success_rate() * 100.0,
            self.duration.as_secs_f64()
        )
    }
}
