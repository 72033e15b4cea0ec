use std::{fmt, io};

use worker::WorkerErr;

/// A worker that did not finish, as reported by the launcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFailure {
    pub task_id: usize,
    pub reason: String,
}

/// All errors that can occur in the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Invalid configuration, caught before any worker is launched.
    Configuration(String),
    /// This host's address is not in the configured ip list.
    AddressResolution { address: String, ips: Vec<String> },
    /// A sequence of results is not as long as the run says it should be.
    LengthMismatch {
        what: String,
        expected: usize,
        got: usize,
    },
    /// An iteration's distributed output can't be laid against the reference output.
    ShapeMismatch {
        iteration: usize,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// An iteration's distributed output is not close to the reference output.
    NumericMismatch {
        iteration: usize,
        index: usize,
        got: f32,
        expected: f32,
        atol: f32,
        rtol: f32,
    },
    /// Some workers failed, aggregation never started.
    WorkerFailed(Vec<WorkerFailure>),
    /// The reference run or a shard read failed.
    Worker(WorkerErr),
    Io(io::Error),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "invalid config: {msg}"),
            Self::AddressResolution { address, ips } => write!(
                f,
                "cannot find local ip {address} in ips list: [{}]",
                ips.join(", ")
            ),
            Self::LengthMismatch { what, expected, got } => {
                write!(f, "{what} has {got} entries, expected {expected}")
            }
            Self::ShapeMismatch {
                iteration,
                got,
                expected,
            } => write!(
                f,
                "iteration {iteration}: distributed output has shape {got:?}, \
                 the reference output has shape {expected:?}"
            ),
            Self::NumericMismatch {
                iteration,
                index,
                got,
                expected,
                atol,
                rtol,
            } => write!(
                f,
                "iteration {iteration}: element {index} is {got}, the reference is {expected} \
                 (atol {atol}, rtol {rtol})"
            ),
            Self::WorkerFailed(failures) => {
                write!(f, "{} worker(s) failed:", failures.len())?;
                for WorkerFailure { task_id, reason } in failures {
                    write!(f, " [worker {task_id}: {reason}]")?;
                }
                Ok(())
            }
            Self::Worker(e) => write!(f, "{e}"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Worker(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OrchestratorError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<WorkerErr> for OrchestratorError {
    fn from(e: WorkerErr) -> Self {
        match e {
            WorkerErr::AddressResolution { address, ips } => {
                Self::AddressResolution { address, ips }
            }
            e => Self::Worker(e),
        }
    }
}
