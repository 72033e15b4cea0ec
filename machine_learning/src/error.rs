use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    KeyOutOfRange {
        key: i64,
        vocabulary_size: usize,
    },
    MissingRow {
        key: i64,
    },
    DuplicateRow {
        key: i64,
    },
    NonContiguous {
        what: String,
    },
    InvalidShape(String),
    InvalidDistribution(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(f, "size mismatch in {what}: got {got}, expected {expected}"),
            MlErr::KeyOutOfRange {
                key,
                vocabulary_size,
            } => write!(
                f,
                "key {key} is outside of the vocabulary [0, {vocabulary_size})"
            ),
            MlErr::MissingRow { key } => {
                write!(f, "no rank served the embedding row of key {key}")
            }
            MlErr::DuplicateRow { key } => {
                write!(f, "the embedding row of key {key} was served more than once")
            }
            MlErr::NonContiguous { what } => {
                write!(f, "the storage of {what} is not contiguous")
            }
            MlErr::InvalidShape(detail) => write!(f, "invalid shape: {detail}"),
            MlErr::InvalidDistribution(detail) => write!(f, "invalid distribution: {detail}"),
        }
    }
}

impl Error for MlErr {}

impl From<ndarray::ShapeError> for MlErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::InvalidShape(value.to_string())
    }
}
