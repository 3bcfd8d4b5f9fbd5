//! Scripted in-memory protocol handler.
//!
//! Serves as the reference implementation of the session contract and as
//! the workhorse of the integration tests: scripted responses per
//! endpoint/command, optional open refusals, and counters tests can assert
//! on (every open must be balanced by a close).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{PortConfig, ProtocolCommand};
use crate::error::OpenError;
use crate::outcome::CommandOutcome;

use super::{
    not_open_outcome, run_exchange, ProtocolHandler, ProtocolSession, SessionInfo, SessionState,
};

#[derive(Default)]
struct LoopbackState {
    /// `(endpoint, command)` → response. An empty endpoint key matches any.
    responses: HashMap<(String, String), String>,
    refuse_open: HashSet<String>,
    sent: Vec<(String, String)>,
    opened: usize,
    closed: usize,
}

/// Shared scripted handler. Clones share the script and the counters.
#[derive(Clone, Default)]
pub struct LoopbackHandler {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a response for one command on one endpoint.
    pub fn respond(&self, endpoint: &str, command: &str, response: &str) {
        self.state.lock().responses.insert(
            (endpoint.to_string(), command.to_string()),
            response.to_string(),
        );
    }

    /// Script a response for one command on every endpoint.
    pub fn respond_any(&self, command: &str, response: &str) {
        self.state
            .lock()
            .responses
            .insert((String::new(), command.to_string()), response.to_string());
    }

    /// Make `open` fail for one endpoint with AccessDenied.
    pub fn refuse_open(&self, endpoint: &str) {
        self.state.lock().refuse_open.insert(endpoint.to_string());
    }

    /// Every `(endpoint, command)` executed so far, in order.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().sent.clone()
    }

    /// `(opened, closed)` session counters.
    pub fn session_counts(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.opened, state.closed)
    }
}

impl ProtocolHandler for LoopbackHandler {
    fn protocol(&self) -> &str {
        "loopback"
    }

    fn open(
        &self,
        endpoint: &str,
        _config: &PortConfig,
    ) -> Result<Box<dyn ProtocolSession>, OpenError> {
        let mut state = self.state.lock();
        if state.refuse_open.contains(endpoint) {
            return Err(OpenError::AccessDenied {
                endpoint: endpoint.to_string(),
                reason: "scripted refusal".to_string(),
            });
        }
        state.opened += 1;
        let mut info = SessionInfo::new(endpoint, "loopback");
        info.state = SessionState::Open;
        Ok(Box::new(LoopbackSession {
            info,
            shared: Arc::clone(&self.state),
        }))
    }
}

struct LoopbackSession {
    info: SessionInfo,
    shared: Arc<Mutex<LoopbackState>>,
}

impl LoopbackSession {
    fn scripted_response(&self, command: &str) -> Result<String, String> {
        let mut state = self.shared.lock();
        state
            .sent
            .push((self.info.endpoint.clone(), command.to_string()));
        let exact = (self.info.endpoint.clone(), command.to_string());
        let any = (String::new(), command.to_string());
        state
            .responses
            .get(&exact)
            .or_else(|| state.responses.get(&any))
            .cloned()
            .ok_or_else(|| "read timeout (no scripted response)".to_string())
    }
}

impl ProtocolSession for LoopbackSession {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn execute(&mut self, command: &ProtocolCommand) -> CommandOutcome {
        if self.info.state != SessionState::Open {
            return not_open_outcome(command, self.info.state);
        }
        run_exchange(command, || self.scripted_response(&command.command))
    }

    fn close(&mut self) {
        if self.info.state == SessionState::Closed {
            return;
        }
        self.info.state = SessionState::Closed;
        self.shared.lock().closed += 1;
    }
}

impl Drop for LoopbackSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::CommandVerdict;

    fn config() -> PortConfig {
        let mut c = PortConfig::rs232(9600);
        c.protocol = "loopback".into();
        c
    }

    #[test]
    fn scripted_exchange_and_counters() {
        let handler = LoopbackHandler::new();
        handler.respond("EP_A", "PING\r", "PONG");

        let mut session = handler.open("EP_A", &config()).unwrap();
        let outcome = session.execute(&ProtocolCommand::literal("PING\r", "PONG"));
        assert_eq!(outcome.verdict, CommandVerdict::Pass);
        assert_eq!(outcome.response.as_deref(), Some("PONG"));

        session.close();
        session.close();
        assert_eq!(handler.session_counts(), (1, 1));
        assert_eq!(handler.sent().len(), 1);
    }

    #[test]
    fn unscripted_command_times_out_as_execution_error() {
        let handler = LoopbackHandler::new();
        let mut session = handler.open("EP_A", &config()).unwrap();
        let outcome = session.execute(&ProtocolCommand::literal("NOPE\r", "OK"));
        assert_eq!(outcome.verdict, CommandVerdict::ExecutionError);
        assert!(outcome.error.unwrap().contains("read timeout"));
    }

    #[test]
    fn refused_open() {
        let handler = LoopbackHandler::new();
        handler.refuse_open("EP_B");
        assert!(matches!(
            handler.open("EP_B", &config()),
            Err(OpenError::AccessDenied { .. })
        ));
        assert_eq!(handler.session_counts(), (0, 0));
    }

    #[test]
    fn execute_after_close_is_an_execution_error() {
        let handler = LoopbackHandler::new();
        handler.respond("EP_A", "PING\r", "PONG");
        let mut session = handler.open("EP_A", &config()).unwrap();
        session.close();
        let outcome = session.execute(&ProtocolCommand::literal("PING\r", "PONG"));
        assert_eq!(outcome.verdict, CommandVerdict::ExecutionError);
        // Close was balanced exactly once.
        assert_eq!(handler.session_counts(), (1, 1));
    }
}
