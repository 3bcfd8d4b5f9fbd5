//! Hardware side-signal collaborator.
//!
//! Binary outputs the orchestrator raises around workflows and on CRITICAL
//! verdicts, plus two optional power-state inputs. Everything is
//! best-effort: implementations report failure through their return value
//! and the orchestrator only ever logs it.

/// Narrow GPIO-style interface. Implementations may be no-ops.
pub trait SideSignal: Send + Sync {
    /// Workflow-active indicator.
    fn set_workflow_active(&self, active: bool) -> Result<(), String>;

    /// CRITICAL-failure indicator.
    fn set_critical_fail(&self, raised: bool) -> Result<(), String>;

    /// Power-ready input, `None` when the line is not wired.
    fn read_power_ready(&self) -> Option<bool> {
        None
    }

    /// Power-down-request input, `None` when the line is not wired.
    fn read_power_down_requested(&self) -> Option<bool> {
        None
    }
}

/// Default implementation with no hardware attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSignal;

impl SideSignal for NoopSignal {
    fn set_workflow_active(&self, _active: bool) -> Result<(), String> {
        Ok(())
    }

    fn set_critical_fail(&self, _raised: bool) -> Result<(), String> {
        Ok(())
    }
}
