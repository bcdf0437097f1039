use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use serde::Serialize;
use thiserror::Error;

use crate::domain::AmbiguousBinding;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UidLevel {
    Study,
    Series,
    Instance,
}

impl fmt::Display for UidLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UidLevel::Study => write!(f, "study"),
            UidLevel::Series => write!(f, "series"),
            UidLevel::Instance => write!(f, "SOP instance"),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum UploadError {
    #[error("cannot read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("unrecognised input format: {0}")]
    Format(String),

    #[error("{level} UID {uid} is not present in the repository")]
    #[diagnostic(help("archive the referenced images before uploading their derivatives"))]
    Dependency { level: UidLevel, uid: String },

    #[error("input matches {} candidate subjects", .0.len())]
    Ambiguity(Vec<AmbiguousBinding>),

    #[error("cannot map contour onto image: {0}")]
    Geometry(String),

    #[error("repository rejected {step}: {message}")]
    #[diagnostic(help("the remote record may need manual follow-up"))]
    RemoteRejected { step: String, message: String },

    #[error("operation not allowed in this state: {0}")]
    PreconditionFailed(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid DICOM UID: {0}")]
    InvalidUid(String),

    #[error("missing config file assessor-up.json (looked in the current directory and ~/.config/assessor-up)")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("invalid config: {0}")]
    ConfigParse(String),

    #[error("repository request failed: {0}")]
    RepositoryHttp(String),

    #[error("repository returned status {status}: {message}")]
    RepositoryStatus { status: u16, message: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    IoError,
    FormatError,
    DependencyError,
    AmbiguityError,
    GeometryError,
    RemoteRejected,
    PreconditionFailed,
    Cancelled,
    Configuration,
    Transport,
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Io { .. } | UploadError::Filesystem(_) => ErrorKind::IoError,
            UploadError::Format(_) | UploadError::InvalidUid(_) => ErrorKind::FormatError,
            UploadError::Dependency { .. } => ErrorKind::DependencyError,
            UploadError::Ambiguity(_) => ErrorKind::AmbiguityError,
            UploadError::Geometry(_) => ErrorKind::GeometryError,
            UploadError::RemoteRejected { .. } => ErrorKind::RemoteRejected,
            UploadError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::MissingConfig
            | UploadError::ConfigRead(_)
            | UploadError::ConfigParse(_) => ErrorKind::Configuration,
            UploadError::RepositoryHttp(_) | UploadError::RepositoryStatus { .. } => {
                ErrorKind::Transport
            }
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        UploadError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
