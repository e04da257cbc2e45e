use std::{error::Error, fmt, io};

use model::ModelErr;

/// The backend module's result type.
pub type Result<T> = std::result::Result<T, BackendErr>;

/// Backend failures.
///
/// `Precondition` marks a caller contract violation that was cheap enough to detect, the backend
/// never retries nor recovers from any of these.
#[derive(Debug)]
pub enum BackendErr {
    Model(ModelErr),
    Io(io::Error),
    InvalidConfig(String),
    DeviceUnavailable {
        requested: i32,
        available: usize,
    },
    ThreadPool(String),
    AlreadyInitialized,
    HandleAlreadyBound,
    Unsupported(String),
    Precondition(String),
}

impl fmt::Display for BackendErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendErr::Model(e) => write!(f, "model error: {e}"),
            BackendErr::Io(e) => write!(f, "io error: {e}"),
            BackendErr::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            BackendErr::DeviceUnavailable {
                requested,
                available,
            } => write!(
                f,
                "device {requested} is unavailable, there are {available} device(s)"
            ),
            BackendErr::ThreadPool(msg) => write!(f, "failed to start device workers: {msg}"),
            BackendErr::AlreadyInitialized => f.write_str("the runtime is already initialized"),
            BackendErr::HandleAlreadyBound => {
                f.write_str("this thread already owns a live compute handle")
            }
            BackendErr::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            BackendErr::Precondition(msg) => write!(f, "precondition violated: {msg}"),
        }
    }
}

impl Error for BackendErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BackendErr::Model(e) => Some(e),
            BackendErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ModelErr> for BackendErr {
    fn from(value: ModelErr) -> Self {
        Self::Model(value)
    }
}

impl From<io::Error> for BackendErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for BackendErr {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidConfig(value.to_string())
    }
}

impl From<rayon::ThreadPoolBuildError> for BackendErr {
    fn from(value: rayon::ThreadPoolBuildError) -> Self {
        Self::ThreadPool(value.to_string())
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<BackendErr> for io::Error {
    fn from(value: BackendErr) -> Self {
        match value {
            BackendErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Fails with a `Precondition` error unless `cond` holds.
pub(crate) fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(BackendErr::Precondition(msg()))
    }
}
