//! Protocol sessions: open a configured byte-stream to an endpoint, execute
//! commands with timeout/retry, close on every path out.
//!
//! Handlers are selected by protocol name from a [`ProtocolRegistry`] that
//! is passed around as an explicit dependency. An unknown protocol is a
//! configuration error reported at open time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{PortConfig, ProtocolCommand};
use crate::error::OpenError;
use crate::outcome::CommandOutcome;
use crate::response::{classify_command, CommandVerdict};

pub mod loopback;
pub mod rs232;

pub use loopback::LoopbackHandler;
pub use rs232::Rs232Handler;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Opening,
    Open,
    Closing,
    Closed,
    Errored,
}

/// Identity and state of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub endpoint: String,
    pub protocol: String,
    pub state: SessionState,
}

impl SessionInfo {
    pub fn new(endpoint: &str, protocol: &str) -> Self {
        SessionInfo {
            session_id: Uuid::new_v4().to_string(),
            endpoint: endpoint.to_string(),
            protocol: protocol.to_string(),
            state: SessionState::Opening,
        }
    }
}

/// An open byte-stream session.
pub trait ProtocolSession: Send {
    fn info(&self) -> &SessionInfo;

    /// Execute one command: write, await the response, apply the command's
    /// timeout and retry budget. Never fails; IO trouble is encoded as an
    /// EXECUTION_ERROR outcome.
    fn execute(&mut self, command: &ProtocolCommand) -> CommandOutcome;

    /// Close the stream. Idempotent.
    fn close(&mut self);
}

/// Opens sessions for one protocol name.
pub trait ProtocolHandler: Send + Sync {
    /// Lower-case protocol name this handler serves.
    fn protocol(&self) -> &str;

    fn open(
        &self,
        endpoint: &str,
        config: &PortConfig,
    ) -> Result<Box<dyn ProtocolSession>, OpenError>;
}

/// Handler registry, passed as an explicit dependency (no process-wide
/// singleton).
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl ProtocolRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `rs232` handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Rs232Handler::new()));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn ProtocolHandler>) {
        let name = handler.protocol().to_ascii_lowercase();
        debug!("protocol registry: registered {:?}", name);
        self.handlers.insert(name, handler);
    }

    pub fn contains(&self, protocol: &str) -> bool {
        self.handlers.contains_key(&protocol.to_ascii_lowercase())
    }

    /// Open a session on `endpoint` with the protocol named by `config`.
    pub fn open(
        &self,
        endpoint: &str,
        config: &PortConfig,
    ) -> Result<Box<dyn ProtocolSession>, OpenError> {
        let name = config.protocol.to_ascii_lowercase();
        let handler = self
            .handlers
            .get(&name)
            .ok_or_else(|| OpenError::UnsupportedProtocol(name.clone()))?;
        let session = handler.open(endpoint, config)?;
        debug!(
            "session_id={} endpoint={} protocol={} opened",
            session.info().session_id,
            endpoint,
            name
        );
        Ok(session)
    }
}

/// Drive one command exchange through `attempt`, applying the command's
/// retry budget and classifying the response.
///
/// `attempt` performs a single write-then-read and returns the trimmed
/// response text, or the IO/timeout description. Handlers share this so
/// retry and verdict semantics cannot drift between protocols.
pub(crate) fn run_exchange<F>(command: &ProtocolCommand, mut attempt: F) -> CommandOutcome
where
    F: FnMut() -> Result<String, String>,
{
    let started_at = SystemTime::now();
    let start = Instant::now();
    let mut attempts = 0u32;
    let mut last_error = String::new();

    while attempts <= command.retries {
        attempts += 1;
        match attempt() {
            Ok(response) => {
                let verdict: CommandVerdict = classify_command(command, &response).into();
                return CommandOutcome {
                    command: command.command.clone(),
                    response: Some(response),
                    verdict,
                    duration: start.elapsed(),
                    started_at,
                    finished_at: SystemTime::now(),
                    error: None,
                    attempts,
                };
            }
            Err(err) => {
                warn!(
                    "command={:?} attempt {}/{} failed: {}",
                    command.command.trim_end(),
                    attempts,
                    command.retries + 1,
                    err
                );
                last_error = err;
            }
        }
    }

    CommandOutcome {
        command: command.command.clone(),
        response: None,
        verdict: CommandVerdict::ExecutionError,
        duration: start.elapsed(),
        started_at,
        finished_at: SystemTime::now(),
        error: Some(last_error),
        attempts,
    }
}

/// Outcome for a command attempted on a session that is not open.
pub(crate) fn not_open_outcome(command: &ProtocolCommand, state: SessionState) -> CommandOutcome {
    let now = SystemTime::now();
    CommandOutcome {
        command: command.command.clone(),
        response: None,
        verdict: CommandVerdict::ExecutionError,
        duration: std::time::Duration::ZERO,
        started_at: now,
        finished_at: now,
        error: Some(format!("session is {:?}", state)),
        attempts: 0,
    }
}
