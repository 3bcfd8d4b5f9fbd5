//! The rs232 stream handler, backed by the OS serial device.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use log::{debug, trace};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::config::{Handshake, PortConfig, ProtocolCommand};
use crate::error::OpenError;
use crate::outcome::CommandOutcome;

use super::{
    not_open_outcome, run_exchange, ProtocolHandler, ProtocolSession, SessionInfo, SessionState,
};

/// Parse a `"n81"`-style data pattern into line settings.
pub fn parse_data_pattern(pattern: &str) -> Result<(Parity, DataBits, StopBits), String> {
    let chars: Vec<char> = pattern.to_ascii_lowercase().chars().collect();
    if chars.len() != 3 {
        return Err(format!("bad data pattern {:?}", pattern));
    }
    let parity = match chars[0] {
        'n' => Parity::None,
        'e' => Parity::Even,
        'o' => Parity::Odd,
        other => return Err(format!("bad parity {:?} in {:?}", other, pattern)),
    };
    let data_bits = match chars[1] {
        '5' => DataBits::Five,
        '6' => DataBits::Six,
        '7' => DataBits::Seven,
        '8' => DataBits::Eight,
        other => return Err(format!("bad data bits {:?} in {:?}", other, pattern)),
    };
    let stop_bits = match chars[2] {
        '1' => StopBits::One,
        '2' => StopBits::Two,
        other => return Err(format!("bad stop bits {:?} in {:?}", other, pattern)),
    };
    Ok((parity, data_bits, stop_bits))
}

fn flow_control(handshake: Handshake) -> FlowControl {
    match handshake {
        Handshake::None => FlowControl::None,
        Handshake::Software => FlowControl::Software,
        Handshake::Hardware => FlowControl::Hardware,
    }
}

fn map_open_error(endpoint: &str, err: serialport::Error) -> OpenError {
    use serialport::ErrorKind;
    let reason = err.to_string();
    match err.kind() {
        ErrorKind::NoDevice => OpenError::NotFound {
            endpoint: endpoint.to_string(),
            reason,
        },
        ErrorKind::InvalidInput => OpenError::Misconfigured {
            endpoint: endpoint.to_string(),
            reason,
        },
        _ => OpenError::AccessDenied {
            endpoint: endpoint.to_string(),
            reason,
        },
    }
}

/// Handler for plain RS-232 byte streams.
#[derive(Debug, Clone, Copy, Default)]
pub struct Rs232Handler;

impl Rs232Handler {
    pub fn new() -> Self {
        Rs232Handler
    }
}

impl ProtocolHandler for Rs232Handler {
    fn protocol(&self) -> &str {
        "rs232"
    }

    fn open(
        &self,
        endpoint: &str,
        config: &PortConfig,
    ) -> Result<Box<dyn ProtocolSession>, OpenError> {
        let (parity, data_bits, stop_bits) =
            parse_data_pattern(&config.data_pattern).map_err(|reason| {
                OpenError::Misconfigured {
                    endpoint: endpoint.to_string(),
                    reason,
                }
            })?;

        let mut info = SessionInfo::new(endpoint, self.protocol());
        let port = serialport::new(endpoint, config.speed)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .flow_control(flow_control(config.handshake))
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| map_open_error(endpoint, e))?;

        info.state = SessionState::Open;
        debug!(
            "session_id={} endpoint={} rs232 {} {} open",
            info.session_id, endpoint, config.speed, config.data_pattern
        );
        Ok(Box::new(Rs232Session {
            info,
            port: Some(port),
        }))
    }
}

/// One open RS-232 stream.
pub struct Rs232Session {
    info: SessionInfo,
    port: Option<Box<dyn SerialPort>>,
}

impl Rs232Session {
    /// Write the command bytes, then collect bytes until CR/LF or the
    /// deadline. Returns the response with the terminator trimmed.
    fn exchange(&mut self, command: &ProtocolCommand) -> Result<String, String> {
        let port = self.port.as_mut().ok_or("port closed")?;

        port.write_all(command.command.as_bytes())
            .and_then(|_| port.flush())
            .map_err(|e| format!("write failed: {}", e))?;

        let deadline = Instant::now() + command.timeout;
        let mut collected: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            // Bounded single-byte reads keep cancellation prompt and make
            // the terminator check exact.
            let _ = port.set_timeout(remaining.min(Duration::from_millis(100)));
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\r' || byte[0] == b'\n' {
                        if !collected.is_empty() {
                            break;
                        }
                        // Leading terminators are leftovers; skip them.
                        continue;
                    }
                    collected.push(byte[0]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(format!("read failed: {}", e)),
            }
        }

        if collected.is_empty() {
            return Err(format!(
                "read timeout after {} ms",
                command.timeout.as_millis()
            ));
        }
        let response = String::from_utf8_lossy(&collected).into_owned();
        trace!(
            "session_id={} command={:?} response={:?}",
            self.info.session_id,
            command.command.trim_end(),
            response
        );
        Ok(response)
    }
}

impl ProtocolSession for Rs232Session {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn execute(&mut self, command: &ProtocolCommand) -> CommandOutcome {
        if self.info.state != SessionState::Open {
            return not_open_outcome(command, self.info.state);
        }
        let outcome = run_exchange(command, || self.exchange(command));
        // A hard IO failure (not a quiet line) means the device is gone.
        if let Some(err) = &outcome.error {
            if !err.starts_with("read timeout") {
                self.port = None;
                self.info.state = SessionState::Errored;
            }
        }
        outcome
    }

    fn close(&mut self) {
        if matches!(self.info.state, SessionState::Closed) {
            return;
        }
        self.info.state = SessionState::Closing;
        self.port = None;
        self.info.state = SessionState::Closed;
        debug!("session_id={} closed", self.info.session_id);
    }
}

impl Drop for Rs232Session {
    fn drop(&mut self) {
        self.close();
    }
}
