//! Error type shared by the packaging pipeline.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("capacity must be greater than zero")]
    InvalidCapacity,

    #[error("nothing to package: no content items were supplied")]
    NoItems,

    #[error("duplicate entry path '{entry}' (from {virtual_path})")]
    DuplicateEntryPath { entry: String, virtual_path: String },

    #[error("cannot derive an archive entry path from '{virtual_path}'")]
    InvalidEntryPath { virtual_path: String },

    #[error("failed to read content of {virtual_path}")]
    ItemReadFailure {
        virtual_path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write archive{}", .virtual_path.as_deref().map(|p| format!(" (while writing {p})")).unwrap_or_default())]
    SinkWriteFailure {
        virtual_path: Option<String>,
        #[source]
        source: io::Error,
    },

    #[error("packaging cancelled")]
    Cancelled,

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("package {index} failed: {source}")]
    PlanFailed {
        index: u32,
        #[source]
        source: Box<PackError>,
    },
}

impl PackError {
    pub(crate) fn sink(virtual_path: Option<&str>, source: io::Error) -> Self {
        Self::SinkWriteFailure {
            virtual_path: virtual_path.map(str::to_string),
            source,
        }
    }

    pub(crate) fn read(virtual_path: &str, source: io::Error) -> Self {
        Self::ItemReadFailure {
            virtual_path: virtual_path.to_string(),
            source,
        }
    }

    pub(crate) fn in_plan(self, index: u32) -> Self {
        match self {
            already @ Self::PlanFailed { .. } => already,
            other => Self::PlanFailed {
                index,
                source: Box::new(other),
            },
        }
    }

    /// Index of the plan that failed, when the error came out of a run.
    pub fn plan_index(&self) -> Option<u32> {
        match self {
            Self::PlanFailed { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// Virtual path of the item being processed when the failure happened.
    pub fn virtual_path(&self) -> Option<&str> {
        match self {
            Self::DuplicateEntryPath { virtual_path, .. }
            | Self::InvalidEntryPath { virtual_path }
            | Self::ItemReadFailure { virtual_path, .. } => Some(virtual_path),
            Self::SinkWriteFailure { virtual_path, .. } => virtual_path.as_deref(),
            Self::PlanFailed { source, .. } => source.virtual_path(),
            _ => None,
        }
    }

    /// The underlying error with any plan wrapper removed.
    pub fn root_cause(&self) -> &PackError {
        match self {
            Self::PlanFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root_cause(), Self::Cancelled)
    }
}

impl From<zip::result::ZipError> for PackError {
    fn from(err: zip::result::ZipError) -> Self {
        let source = match err {
            zip::result::ZipError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::Other, other),
        };
        Self::sink(None, source)
    }
}
