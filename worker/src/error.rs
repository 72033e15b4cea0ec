use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;

/// The worker module's result type.
pub type Result<T> = std::result::Result<T, WorkerErr>;

/// Worker runtime failures.
#[derive(Debug)]
pub enum WorkerErr {
    Io(io::Error),
    Ml(MlErr),
    /// A persisted shard is missing pieces or doesn't match the run.
    Shard {
        path: PathBuf,
        detail: String,
    },
    /// This host's address is not in the configured list.
    AddressResolution {
        address: String,
        ips: Vec<String>,
    },
    /// The data loader ran out of batches before the last iteration.
    LoaderStopped {
        iteration: usize,
    },
    GradientLengthMismatch {
        iteration: usize,
        got: usize,
        expected: usize,
    },
}

impl fmt::Display for WorkerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerErr::Io(e) => write!(f, "io error: {e}"),
            WorkerErr::Ml(e) => write!(f, "training error: {e}"),
            WorkerErr::Shard { path, detail } => {
                write!(f, "invalid shard file {}: {detail}", path.display())
            }
            WorkerErr::AddressResolution { address, ips } => write!(
                f,
                "cannot find local ip {address} in ips list: [{}]",
                ips.join(", ")
            ),
            WorkerErr::LoaderStopped { iteration } => {
                write!(f, "the data loader stopped before iteration {iteration}")
            }
            WorkerErr::GradientLengthMismatch {
                iteration,
                got,
                expected,
            } => write!(
                f,
                "gradient length mismatch at iteration {iteration}: got {got}, expected {expected}"
            ),
        }
    }
}

impl Error for WorkerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            WorkerErr::Io(e) => Some(e),
            WorkerErr::Ml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for WorkerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<MlErr> for WorkerErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<WorkerErr> for io::Error {
    fn from(value: WorkerErr) -> Self {
        match value {
            WorkerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
