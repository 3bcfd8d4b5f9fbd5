//! Multi-level response classification.
//!
//! A command's response is matched against an optional pattern set with one
//! slot per level. Matching order is fixed, CRITICAL → FAIL → WARN → PASS,
//! and the first matching pattern wins. Commands without a pattern set fall
//! back to binary pass/fail through their primary expected-response pattern.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::ProtocolCommand;

/// A response pattern, literal or regex.
///
/// Literal patterns match by case-sensitive substring. A regex pattern that
/// fails to compile is logged once per match attempt and never matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pattern {
    pub text: String,
    pub regex: bool,
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern {
            text: text.into(),
            regex: false,
        }
    }

    pub fn regex(text: impl Into<String>) -> Self {
        Pattern {
            text: text.into(),
            regex: true,
        }
    }

    pub fn matches(&self, response: &str) -> bool {
        if self.regex {
            match regex::Regex::new(&self.text) {
                Ok(re) => re.is_match(response),
                Err(err) => {
                    warn!("invalid response pattern {:?}: {}", self.text, err);
                    false
                }
            }
        } else {
            response.contains(&self.text)
        }
    }
}

/// Per-level patterns for one command. Absent slots never trigger their
/// level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternSet {
    pub pass: Option<Pattern>,
    pub warn: Option<Pattern>,
    pub fail: Option<Pattern>,
    pub critical: Option<Pattern>,
    /// Raise the hardware CRITICAL output when the critical pattern matches.
    pub trigger_hardware: bool,
}

impl PatternSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pass(mut self, pattern: Pattern) -> Self {
        self.pass = Some(pattern);
        self
    }

    pub fn with_warn(mut self, pattern: Pattern) -> Self {
        self.warn = Some(pattern);
        self
    }

    pub fn with_fail(mut self, pattern: Pattern) -> Self {
        self.fail = Some(pattern);
        self
    }

    pub fn with_critical(mut self, pattern: Pattern, trigger_hardware: bool) -> Self {
        self.critical = Some(pattern);
        self.trigger_hardware = trigger_hardware;
        self
    }
}

/// Outcome of matching one response against one command's patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationLevel {
    Pass,
    Warn,
    Fail,
    Critical,
}

/// Verdict recorded on a command outcome. Extends [`ValidationLevel`] with
/// the case where no response was obtained at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandVerdict {
    Pass,
    Warn,
    Fail,
    Critical,
    ExecutionError,
}

impl CommandVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandVerdict::Pass => "PASS",
            CommandVerdict::Warn => "WARN",
            CommandVerdict::Fail => "FAIL",
            CommandVerdict::Critical => "CRITICAL",
            CommandVerdict::ExecutionError => "EXECUTION_ERROR",
        }
    }

    /// PASS and WARN count towards phase success.
    pub fn is_success(&self) -> bool {
        matches!(self, CommandVerdict::Pass | CommandVerdict::Warn)
    }
}

impl From<ValidationLevel> for CommandVerdict {
    fn from(level: ValidationLevel) -> Self {
        match level {
            ValidationLevel::Pass => CommandVerdict::Pass,
            ValidationLevel::Warn => CommandVerdict::Warn,
            ValidationLevel::Fail => CommandVerdict::Fail,
            ValidationLevel::Critical => CommandVerdict::Critical,
        }
    }
}

impl std::fmt::Display for CommandVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a response against explicit level patterns plus the primary
/// expected-response pattern.
///
/// The primary pattern fills the PASS slot when the set has none, which is
/// also how legacy binary commands (no set at all) are handled. If nothing
/// matches, the verdict is FAIL when a PASS pattern was configured but did
/// not match, PASS otherwise (no constraint).
pub fn classify(
    response: &str,
    expected: Option<&Pattern>,
    levels: Option<&PatternSet>,
) -> ValidationLevel {
    let empty = PatternSet::default();
    let set = levels.unwrap_or(&empty);
    let pass = set.pass.as_ref().or(expected);

    if let Some(p) = &set.critical {
        if p.matches(response) {
            return ValidationLevel::Critical;
        }
    }
    if let Some(p) = &set.fail {
        if p.matches(response) {
            return ValidationLevel::Fail;
        }
    }
    if let Some(p) = &set.warn {
        if p.matches(response) {
            return ValidationLevel::Warn;
        }
    }
    match pass {
        Some(p) if p.matches(response) => ValidationLevel::Pass,
        Some(_) => ValidationLevel::Fail,
        None => ValidationLevel::Pass,
    }
}

/// Classify a response for one configured command.
pub fn classify_command(command: &ProtocolCommand, response: &str) -> ValidationLevel {
    classify(response, command.expected.as_ref(), command.levels.as_ref())
}

/// True when the command's CRITICAL pattern both matched and opted into the
/// hardware side-signal.
pub fn triggers_hardware(command: &ProtocolCommand, verdict: CommandVerdict) -> bool {
    verdict == CommandVerdict::Critical
        && command.levels.as_ref().is_some_and(|s| s.trigger_hardware)
}

/// Continue policy applied by the orchestrator after each command.
///
/// CRITICAL always halts the sequence; FAIL and EXECUTION_ERROR halt unless
/// the sequence's continue-on-failure policy is set; WARN and PASS continue.
pub fn continue_after(verdict: CommandVerdict, continue_on_failure: bool) -> bool {
    match verdict {
        CommandVerdict::Pass | CommandVerdict::Warn => true,
        CommandVerdict::Fail | CommandVerdict::ExecutionError => continue_on_failure,
        CommandVerdict::Critical => false,
    }
}
