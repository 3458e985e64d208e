//! Failure taxonomy for a harness run.
//!
//! Every component reports failures through [`HarnessError`]; the
//! orchestrator folds them into a [`TestOutcome`] so the binary only ever has
//! two externally visible results.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors produced while preparing, running or talking to the VM.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// A required firmware or image artifact is missing.
    #[error("{0}")]
    Precondition(String),

    /// The VM executable could not be started.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The control socket could not be reached.
    #[error("control socket {} unreachable after {attempts} attempt(s): {source}", path.display())]
    ControlConnect {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    /// A control-channel message was malformed, missing its acknowledgement,
    /// or never arrived.
    #[error("{0}")]
    Protocol(String),

    /// The overall deadline elapsed before a terminal milestone.
    #[error("no verdict within {0:?}")]
    Timeout(Duration),

    /// The VM process terminated before a terminal milestone.
    #[error("vm process exited early ({0})")]
    ProcessExited(String),
}

impl HarnessError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Precondition(_) => FailureKind::Precondition,
            Self::Launch { .. } => FailureKind::Launch,
            Self::ControlConnect { .. } => FailureKind::ControlConnect,
            Self::Protocol(_) => FailureKind::Protocol,
            Self::Timeout(_) => FailureKind::Timeout,
            Self::ProcessExited(_) => FailureKind::ProcessExited,
        }
    }
}

/// Diagnostic label attached to a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Precondition,
    Launch,
    ControlConnect,
    Protocol,
    Timeout,
    ProcessExited,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Precondition => "PreconditionError",
            Self::Launch => "LaunchError",
            Self::ControlConnect => "ControlConnectError",
            Self::Protocol => "ProtocolError",
            Self::Timeout => "Timeout",
            Self::ProcessExited => "ProcessExited",
        };
        f.write_str(label)
    }
}

/// Terminal verdict of one run.
#[derive(Debug)]
pub enum TestOutcome {
    Pass,
    Fail(HarnessError),
}

impl TestOutcome {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }

    /// The failure label, if the run failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Pass => None,
            Self::Fail(e) => Some(e.kind()),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Fail(_) => 1,
        }
    }
}

impl fmt::Display for TestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pass => f.write_str("PASS"),
            Self::Fail(e) => write!(f, "FAIL ({}): {}", e.kind(), e),
        }
    }
}
