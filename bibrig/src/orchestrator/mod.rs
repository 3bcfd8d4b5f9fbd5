//! Workflow orchestration: resolve → reserve → open → START/TEST/STOP →
//! close → release, composed into per-UUT, per-BIB and multi-BIB runs.
//!
//! Every public operation returns a structured outcome and never fails for
//! ordinary reasons; the outer boundary of [`Orchestrator::run_single`]
//! additionally catches unexpected faults and folds them into the outcome.
//! Cleanup (session close, lease release, workflow-active lowering) runs on
//! every path out and never overwrites the primary result.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};

use crate::cancel::CancelToken;
use crate::config::{
    BibConfig, CommandSequence, ConfigStore, Coordinate, Phase, PortConfig,
};
use crate::error::WorkflowError;
use crate::mapper::DynamicPortMapper;
use crate::outcome::{
    BibOutcome, MultiBibOutcome, PhaseOutcome, UutOutcome, WorkflowOutcome,
};
use crate::pool::PortPool;
use crate::response::{continue_after, triggers_hardware};
use crate::session::{ProtocolRegistry, ProtocolSession};
use crate::signal::{NoopSignal, SideSignal};

/// States of one single-coordinate run, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    Resolving,
    Reserving,
    Opening,
    Starting,
    Testing,
    Stopping,
    Cleanup,
    Done,
}

/// Settle pauses between commands, ports, UUTs and BIBs.
///
/// Defaults are the platform minimums; raising them is always safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettleDelays {
    pub inter_command: Duration,
    pub inter_port: Duration,
    pub inter_uut: Duration,
    pub inter_bib: Duration,
}

impl Default for SettleDelays {
    fn default() -> Self {
        SettleDelays {
            inter_command: Duration::from_millis(100),
            inter_port: Duration::from_millis(500),
            inter_uut: Duration::from_millis(1000),
            inter_bib: Duration::from_millis(2000),
        }
    }
}

impl SettleDelays {
    /// Near-zero delays for tests and simulations.
    pub fn none() -> Self {
        SettleDelays {
            inter_command: Duration::ZERO,
            inter_port: Duration::ZERO,
            inter_uut: Duration::ZERO,
            inter_bib: Duration::ZERO,
        }
    }
}

#[derive(Default)]
struct PhaseRun {
    start: Option<PhaseOutcome>,
    test: Option<PhaseOutcome>,
    stop: Option<PhaseOutcome>,
    error: Option<WorkflowError>,
    cancelled: bool,
}

/// The hierarchical workflow scheduler.
pub struct Orchestrator {
    store: Arc<dyn ConfigStore>,
    mapper: Arc<DynamicPortMapper>,
    pool: Arc<PortPool>,
    registry: ProtocolRegistry,
    signal: Arc<dyn SideSignal>,
    delays: SettleDelays,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        mapper: Arc<DynamicPortMapper>,
        pool: Arc<PortPool>,
        registry: ProtocolRegistry,
    ) -> Self {
        Orchestrator {
            store,
            mapper,
            pool,
            registry,
            signal: Arc::new(NoopSignal),
            delays: SettleDelays::default(),
        }
    }

    pub fn with_signal(mut self, signal: Arc<dyn SideSignal>) -> Self {
        self.signal = signal;
        self
    }

    pub fn with_delays(mut self, delays: SettleDelays) -> Self {
        self.delays = delays;
        self
    }

    pub fn pool(&self) -> &PortPool {
        &self.pool
    }

    pub fn mapper(&self) -> &DynamicPortMapper {
        &self.mapper
    }

    /// Run the full three-phase workflow on one coordinate.
    pub fn run_single(
        &self,
        coord: &Coordinate,
        client_id: &str,
        cancel: &CancelToken,
    ) -> WorkflowOutcome {
        info!(
            "workflow start bib_id={} uut_id={} port_number={} client={}",
            coord.bib_id, coord.uut_id, coord.port_number, client_id
        );
        let outcome = match catch_unwind(AssertUnwindSafe(|| {
            self.run_single_inner(coord, client_id, cancel)
        })) {
            Ok(outcome) => outcome,
            Err(payload) => {
                let msg = panic_message(payload);
                error!("workflow {} internal fault: {}", coord, msg);
                WorkflowOutcome::failed(coord.clone(), format!("InternalFault: {}", msg))
            }
        };
        info!(
            "workflow end bib_id={} uut_id={} port_number={} success={} duration_ms={}",
            coord.bib_id,
            coord.uut_id,
            coord.port_number,
            outcome.success,
            outcome.duration.as_millis()
        );
        outcome
    }

    fn run_single_inner(
        &self,
        coord: &Coordinate,
        client_id: &str,
        cancel: &CancelToken,
    ) -> WorkflowOutcome {
        let started_at = SystemTime::now();
        let timer = Instant::now();

        let fail = |err: WorkflowError, cancelled: bool| {
            let mut wf = WorkflowOutcome::failed(coord.clone(), err.kind().to_string());
            wf.cancelled = cancelled;
            wf.started_at = started_at;
            wf.duration = timer.elapsed();
            wf
        };

        if cancel.is_cancelled() {
            return fail(WorkflowError::Cancelled, true);
        }

        let config = match self.port_config(coord) {
            Ok(config) => config,
            Err(err) => return fail(err, false),
        };

        self.transition(coord, WorkflowState::Idle, WorkflowState::Resolving);
        let endpoint = match self.mapper.resolve(coord) {
            Ok(ep) => ep,
            Err(err) => return fail(err, false),
        };

        if cancel.is_cancelled() {
            return fail(WorkflowError::Cancelled, true);
        }

        self.transition(coord, WorkflowState::Resolving, WorkflowState::Reserving);
        let lease = match self.pool.acquire_specific(&endpoint.name, client_id, None) {
            Some(lease) => lease,
            None => {
                return fail(
                    WorkflowError::ReservationFailed(format!(
                        "endpoint {} is not available",
                        endpoint.name
                    )),
                    false,
                )
            }
        };

        let run = self.run_session_phases(
            coord,
            &config,
            &endpoint.name,
            &[Phase::Start, Phase::Test, Phase::Stop],
            cancel,
        );

        self.transition(coord, WorkflowState::Cleanup, WorkflowState::Done);
        if !self.pool.release(&lease.lease_id, client_id) {
            warn!(
                "cleanup: lease_id={} release failed (already gone?)",
                lease.lease_id
            );
        }

        let mut wf = WorkflowOutcome {
            coordinate: coord.clone(),
            endpoint: Some(endpoint.name),
            lease_id: Some(lease.lease_id),
            start: run.start,
            test: run.test,
            stop: run.stop,
            success: false,
            cancelled: run.cancelled,
            error: run.error.as_ref().map(|e| e.kind().to_string()),
            started_at,
            duration: timer.elapsed(),
        };
        wf.derive_success();
        // A cancelled run is never a success, however far it got.
        if wf.cancelled {
            wf.success = false;
        }
        wf
    }

    /// Production-mode single-phase run: full resolve/reserve/open/close/
    /// release discipline around only `phase`. Success is that phase's.
    pub fn run_phase(
        &self,
        coord: &Coordinate,
        phase: Phase,
        client_id: &str,
        cancel: &CancelToken,
    ) -> WorkflowOutcome {
        let started_at = SystemTime::now();
        let timer = Instant::now();

        let fail = |err: WorkflowError| {
            let mut wf = WorkflowOutcome::failed(coord.clone(), err.kind().to_string());
            wf.cancelled = matches!(err, WorkflowError::Cancelled);
            wf.started_at = started_at;
            wf.duration = timer.elapsed();
            wf
        };

        if cancel.is_cancelled() {
            return fail(WorkflowError::Cancelled);
        }
        let config = match self.port_config(coord) {
            Ok(config) => config,
            Err(err) => return fail(err),
        };
        let endpoint = match self.mapper.resolve(coord) {
            Ok(ep) => ep,
            Err(err) => return fail(err),
        };
        let lease = match self.pool.acquire_specific(&endpoint.name, client_id, None) {
            Some(lease) => lease,
            None => {
                return fail(WorkflowError::ReservationFailed(format!(
                    "endpoint {} is not available",
                    endpoint.name
                )))
            }
        };

        let run = self.run_session_phases(coord, &config, &endpoint.name, &[phase], cancel);

        if !self.pool.release(&lease.lease_id, client_id) {
            warn!(
                "cleanup: lease_id={} release failed (already gone?)",
                lease.lease_id
            );
        }

        let phase_success = match phase {
            Phase::Start => run.start.as_ref().is_some_and(|p| p.is_success),
            Phase::Test => run.test.as_ref().is_some_and(|p| p.is_success),
            Phase::Stop => run.stop.as_ref().is_some_and(|p| p.is_success),
        };
        WorkflowOutcome {
            coordinate: coord.clone(),
            endpoint: Some(endpoint.name),
            lease_id: Some(lease.lease_id),
            start: run.start,
            test: run.test,
            stop: run.stop,
            success: phase_success && run.error.is_none() && !run.cancelled,
            cancelled: run.cancelled,
            error: run.error.as_ref().map(|e| e.kind().to_string()),
            started_at,
            duration: timer.elapsed(),
        }
    }

    /// Fixed-endpoint variant: the caller has already resolved and leased
    /// `endpoint`. Resolution and reservation are skipped; each phase opens
    /// and closes its own session on the endpoint.
    pub fn run_fixed_endpoint(
        &self,
        coord: &Coordinate,
        config: &PortConfig,
        endpoint: &str,
        cancel: &CancelToken,
    ) -> WorkflowOutcome {
        let started_at = SystemTime::now();
        let timer = Instant::now();
        let mut run = PhaseRun::default();

        let start_run = self.run_session_phases(coord, config, endpoint, &[Phase::Start], cancel);
        run.start = start_run.start;
        run.cancelled = start_run.cancelled;
        run.error = start_run.error;

        // A session existed iff START produced a phase outcome; STOP is
        // owed exactly in that case.
        let session_opened = run.start.is_some();
        let start_ok = run.start.as_ref().is_some_and(|p| p.is_success);

        if session_opened && start_ok && !cancel.is_cancelled() {
            let test_run = self.run_session_phases(coord, config, endpoint, &[Phase::Test], cancel);
            run.test = test_run.test;
            run.cancelled |= test_run.cancelled;
            if run.error.is_none() {
                run.error = test_run.error;
            }
        }

        if session_opened {
            let stop_run = self.run_session_phases(coord, config, endpoint, &[Phase::Stop], cancel);
            run.stop = stop_run.stop;
            if run.error.is_none() {
                run.error = stop_run.error;
            }
        }

        let mut wf = WorkflowOutcome {
            coordinate: coord.clone(),
            endpoint: Some(endpoint.to_string()),
            lease_id: None,
            start: run.start,
            test: run.test,
            stop: run.stop,
            success: false,
            cancelled: run.cancelled,
            error: run.error.as_ref().map(|e| e.kind().to_string()),
            started_at,
            duration: timer.elapsed(),
        };
        wf.derive_success();
        if wf.cancelled {
            wf.success = false;
        }
        wf
    }

    /// Try the UUT's ports in ascending order; first success wins.
    ///
    /// On total failure the last attempt's outcome is returned.
    pub fn run_auto_port(
        &self,
        bib_id: &str,
        uut_id: &str,
        client_id: &str,
        cancel: &CancelToken,
    ) -> WorkflowOutcome {
        let ports = match self.uut_ports(bib_id, uut_id) {
            Ok(ports) => ports,
            Err(err) => {
                return WorkflowOutcome::failed(
                    Coordinate::new(bib_id, uut_id, 0),
                    err.kind().to_string(),
                );
            }
        };

        let mut last: Option<WorkflowOutcome> = None;
        for (i, port) in ports.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                cancel.sleep(self.delays.inter_port);
            }
            let coord = Coordinate::new(bib_id, uut_id, *port);
            let outcome = self.run_single(&coord, client_id, cancel);
            let success = outcome.success;
            last = Some(outcome);
            if success {
                break;
            }
            info!(
                "auto-port: bib_id={} uut_id={} port_number={} failed, trying next",
                bib_id, uut_id, port
            );
        }

        last.unwrap_or_else(|| {
            let mut wf = WorkflowOutcome::failed(
                Coordinate::new(bib_id, uut_id, 0),
                WorkflowError::Cancelled.kind().to_string(),
            );
            wf.cancelled = true;
            wf
        })
    }

    /// Run every configured port of one UUT, in ascending order.
    pub fn run_all_ports(
        &self,
        bib_id: &str,
        uut_id: &str,
        client_id: &str,
        cancel: &CancelToken,
    ) -> UutOutcome {
        let ports = match self.uut_ports(bib_id, uut_id) {
            Ok(ports) => ports,
            Err(err) => {
                let wf = WorkflowOutcome::failed(
                    Coordinate::new(bib_id, uut_id, 0),
                    err.kind().to_string(),
                );
                return UutOutcome::new(bib_id.to_string(), uut_id.to_string(), vec![wf]);
            }
        };

        let mut workflows = Vec::with_capacity(ports.len());
        for (i, port) in ports.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                cancel.sleep(self.delays.inter_port);
            }
            let coord = Coordinate::new(bib_id, uut_id, *port);
            workflows.push(self.run_single(&coord, client_id, cancel));
        }
        UutOutcome::new(bib_id.to_string(), uut_id.to_string(), workflows)
    }

    /// One auto-port workflow per UUT of the BIB.
    pub fn run_all_uuts(
        &self,
        bib_id: &str,
        client_id: &str,
        cancel: &CancelToken,
    ) -> BibOutcome {
        let bib = match self.load_bib(bib_id) {
            Ok(bib) => bib,
            Err(err) => return BibOutcome::failed(bib_id.to_string(), err.kind().to_string()),
        };

        let mut uuts = Vec::with_capacity(bib.uuts.len());
        for (i, uut) in bib.uuts.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                cancel.sleep(self.delays.inter_uut);
            }
            let workflow = self.run_auto_port(bib_id, &uut.id, client_id, cancel);
            uuts.push(UutOutcome::new(
                bib_id.to_string(),
                uut.id.clone(),
                vec![workflow],
            ));
        }
        BibOutcome::new(bib_id.to_string(), uuts)
    }

    /// Every port of every UUT of the BIB.
    pub fn run_complete(
        &self,
        bib_id: &str,
        client_id: &str,
        cancel: &CancelToken,
    ) -> BibOutcome {
        let bib = match self.load_bib(bib_id) {
            Ok(bib) => bib,
            Err(err) => return BibOutcome::failed(bib_id.to_string(), err.kind().to_string()),
        };

        info!("bib run start bib_id={} uuts={}", bib_id, bib.uuts.len());
        let mut uuts = Vec::with_capacity(bib.uuts.len());
        for (i, uut) in bib.uuts.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                cancel.sleep(self.delays.inter_uut);
            }
            uuts.push(self.run_all_ports(bib_id, &uut.id, client_id, cancel));
        }
        let outcome = BibOutcome::new(bib_id.to_string(), uuts);
        info!(
            "bib run end bib_id={} ok={}/{}",
            bib_id, outcome.successful_workflows, outcome.total_workflows
        );
        outcome
    }

    /// Complete runs over an explicit BIB list, sequentially.
    pub fn run_multi_bib(
        &self,
        bib_ids: &[String],
        client_id: &str,
        cancel: &CancelToken,
    ) -> MultiBibOutcome {
        let timer = Instant::now();
        let mut bibs = Vec::with_capacity(bib_ids.len());
        for (i, bib_id) in bib_ids.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                cancel.sleep(self.delays.inter_bib);
            }
            bibs.push(self.run_complete(bib_id, client_id, cancel));
        }
        let outcome = MultiBibOutcome::new(bibs, timer.elapsed());
        info!("multi-bib run: {}", outcome.summary());
        outcome
    }

    /// Complete runs over every BIB the store declares.
    pub fn run_all_configured(&self, client_id: &str, cancel: &CancelToken) -> MultiBibOutcome {
        let bib_ids = match self.store.list_configured_bibs() {
            Ok(ids) => ids,
            Err(err) => {
                error!("run_all_configured: listing bibs failed: {}", err);
                return MultiBibOutcome::new(Vec::new(), Duration::ZERO);
            }
        };
        self.run_multi_bib(&bib_ids, client_id, cancel)
    }

    /// Open one session and run the given phases on it, honoring the
    /// continue policy, CRITICAL hardware triggering and cancellation.
    ///
    /// STOP runs whenever the session opened, regardless of earlier phase
    /// failure or cancellation; it is skipped only when no session ever
    /// existed.
    fn run_session_phases(
        &self,
        coord: &Coordinate,
        config: &PortConfig,
        endpoint: &str,
        phases: &[Phase],
        cancel: &CancelToken,
    ) -> PhaseRun {
        let mut run = PhaseRun::default();

        self.transition(coord, WorkflowState::Reserving, WorkflowState::Opening);
        let mut session = match self.registry.open(endpoint, config) {
            Ok(session) => session,
            Err(err) => {
                warn!(
                    "session open failed endpoint={} protocol={}: {}",
                    endpoint, config.protocol, err
                );
                run.error = Some(err.into());
                return run;
            }
        };

        if let Err(e) = self.signal.set_workflow_active(true) {
            warn!("side-signal: workflow-active raise failed: {}", e);
        }

        let mut proceed = true;
        for phase in phases {
            if cancel.is_cancelled() {
                run.cancelled = true;
            }
            // Cancellation and earlier failures skip everything except STOP.
            if *phase != Phase::Stop && (run.cancelled || !proceed) {
                continue;
            }

            let state = match phase {
                Phase::Start => WorkflowState::Starting,
                Phase::Test => WorkflowState::Testing,
                Phase::Stop => WorkflowState::Stopping,
            };
            debug!("workflow {} state={:?}", coord, state);

            let outcome =
                self.run_sequence(&mut session, coord, *phase, config.sequence(*phase), cancel);
            if cancel.is_cancelled() {
                run.cancelled = true;
            }
            if *phase != Phase::Stop && !outcome.is_success {
                proceed = false;
            }
            match phase {
                Phase::Start => run.start = Some(outcome),
                Phase::Test => run.test = Some(outcome),
                Phase::Stop => run.stop = Some(outcome),
            }
        }

        self.transition(coord, WorkflowState::Stopping, WorkflowState::Cleanup);
        session.close();
        if let Err(e) = self.signal.set_workflow_active(false) {
            warn!("side-signal: workflow-active lower failed: {}", e);
        }
        run
    }

    /// Execute one command sequence on an open session.
    fn run_sequence(
        &self,
        session: &mut Box<dyn ProtocolSession>,
        coord: &Coordinate,
        phase: Phase,
        sequence: &CommandSequence,
        cancel: &CancelToken,
    ) -> PhaseOutcome {
        info!(
            "phase start bib_id={} uut_id={} port_number={} phase={} commands={}",
            coord.bib_id,
            coord.uut_id,
            coord.port_number,
            phase,
            sequence.commands.len()
        );
        let continue_on_failure = sequence.continue_on_failure();
        let mut outcomes = Vec::with_capacity(sequence.commands.len());

        for (i, command) in sequence.commands.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            if i > 0 {
                // Hardware settle pause; not charged to the next command's
                // timeout.
                cancel.sleep(self.delays.inter_command);
            }

            let outcome = session.execute(command);
            info!(
                "command result session_id={} phase={} command={:?} verdict={} duration_ms={}",
                session.info().session_id,
                phase,
                command.command.trim_end(),
                outcome.verdict,
                outcome.duration.as_millis()
            );

            if triggers_hardware(command, outcome.verdict) {
                warn!(
                    "CRITICAL verdict on {:?}, raising hardware signal",
                    command.command.trim_end()
                );
                if let Err(e) = self.signal.set_critical_fail(true) {
                    warn!("side-signal: critical raise failed: {}", e);
                }
            }

            let verdict = outcome.verdict;
            outcomes.push(outcome);
            if !continue_after(verdict, continue_on_failure) {
                break;
            }
        }

        let phase_outcome = PhaseOutcome::new(phase, outcomes);
        info!(
            "phase end bib_id={} uut_id={} port_number={} phase={} success={} duration_ms={}",
            coord.bib_id,
            coord.uut_id,
            coord.port_number,
            phase,
            phase_outcome.is_success,
            phase_outcome.duration.as_millis()
        );
        phase_outcome
    }

    fn transition(&self, coord: &Coordinate, from: WorkflowState, to: WorkflowState) {
        debug!("workflow {} state {:?} -> {:?}", coord, from, to);
    }

    fn load_bib(&self, bib_id: &str) -> Result<BibConfig, WorkflowError> {
        match self.store.load_bib(bib_id) {
            Ok(Some(bib)) => Ok(bib),
            Ok(None) => Err(WorkflowError::ConfigurationMissing(format!(
                "bib {} is not declared",
                bib_id
            ))),
            Err(err) => Err(WorkflowError::ConfigurationMissing(format!(
                "bib {}: {}",
                bib_id, err
            ))),
        }
    }

    fn port_config(&self, coord: &Coordinate) -> Result<PortConfig, WorkflowError> {
        let bib = self.load_bib(&coord.bib_id)?;
        bib.port(&coord.uut_id, coord.port_number)
            .cloned()
            .ok_or_else(|| {
                WorkflowError::ConfigurationMissing(format!("{} is not declared", coord))
            })
    }

    fn uut_ports(&self, bib_id: &str, uut_id: &str) -> Result<Vec<u32>, WorkflowError> {
        let bib = self.load_bib(bib_id)?;
        let uut = bib.uut(uut_id).ok_or_else(|| {
            WorkflowError::ConfigurationMissing(format!("uut {}.{} is not declared", bib_id, uut_id))
        })?;
        if uut.ports.is_empty() {
            return Err(WorkflowError::ConfigurationMissing(format!(
                "uut {}.{} has no ports",
                bib_id, uut_id
            )));
        }
        Ok(uut.ports.keys().copied().collect())
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
