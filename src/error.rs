//! Error types for training jobs

use std::path::PathBuf;

/// Error type for every stage of a training job
#[derive(thiserror::Error, Debug)]
pub enum TrainError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    RuntimeFailure(String),
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Coarse classification used by callers deciding how to report a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    RuntimeFailure,
    Other,
}

impl TrainError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        TrainError::InvalidArgument(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        TrainError::RuntimeFailure(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TrainError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TrainError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TrainError::RuntimeFailure(_) => ErrorKind::RuntimeFailure,
            _ => ErrorKind::Other,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;

/// Attach a path to a bare `std::io::Error`
pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| TrainError::io(path, e))
    }
}
