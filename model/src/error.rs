use std::{error::Error, fmt, io};

use safetensors::SafeTensorError;

/// The model module's result type.
pub type Result<T> = std::result::Result<T, ModelErr>;

/// Failures while loading, validating or saving a model artifact.
#[derive(Debug)]
pub enum ModelErr {
    Io(io::Error),
    Corrupt(String),
    WrongFormat {
        got: String,
    },
    UnsupportedVersion {
        got: i32,
        min: i32,
        max: i32,
    },
    MissingTensor {
        name: String,
    },
    TensorShape {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    UnsupportedDtype {
        name: String,
        dtype: String,
    },
    Inconsistent {
        what: String,
        got: usize,
        expected: usize,
    },
    InvalidRules(String),
}

impl fmt::Display for ModelErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelErr::Io(e) => write!(f, "io error: {e}"),
            ModelErr::Corrupt(msg) => write!(f, "corrupt model artifact: {msg}"),
            ModelErr::WrongFormat { got } => {
                write!(f, "not a model artifact: format tag is {got:?}")
            }
            ModelErr::UnsupportedVersion { got, min, max } => write!(
                f,
                "unsupported model version {got}, supported versions are {min}..={max}"
            ),
            ModelErr::MissingTensor { name } => write!(f, "missing tensor {name:?}"),
            ModelErr::TensorShape {
                name,
                got,
                expected,
            } => write!(
                f,
                "tensor {name:?} has shape {got:?}, expected {expected:?}"
            ),
            ModelErr::UnsupportedDtype { name, dtype } => {
                write!(f, "tensor {name:?} has unsupported dtype {dtype}")
            }
            ModelErr::Inconsistent {
                what,
                got,
                expected,
            } => write!(
                f,
                "inconsistent architecture at {what}: got {got}, expected {expected}"
            ),
            ModelErr::InvalidRules(msg) => write!(f, "invalid rule support table: {msg}"),
        }
    }
}

impl Error for ModelErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ModelErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ModelErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SafeTensorError> for ModelErr {
    fn from(value: SafeTensorError) -> Self {
        Self::Corrupt(format!("{value:?}"))
    }
}

impl From<serde_json::Error> for ModelErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Corrupt(value.to_string())
    }
}
