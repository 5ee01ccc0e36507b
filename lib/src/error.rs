//! Error types for cube cleaning operations

use std::fmt;
use std::path::PathBuf;

/// Pipeline stage in progress when an error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Transform,
    FitReal,
    FitImag,
    InverseTransform,
    Write,
    Cleanup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Transform => "transform",
            Stage::FitReal => "fit real component",
            Stage::FitImag => "fit imaginary component",
            Stage::InverseTransform => "inverse transform",
            Stage::Write => "write",
            Stage::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CleanError {
    /// Cube shape inconsistent with a square pixel grid, a mode count above
    /// the channel count, or any other disagreement between array shapes.
    #[error("dimension mismatch: {context}")]
    DimensionMismatch { context: String },

    /// Non-finite values, or a logarithm without a positivity guarantee.
    #[error("domain error: {context}")]
    Domain { context: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("FITS error on {}: {message}", path.display())]
    Fits { path: PathBuf, message: String },

    #[error("invalid {parameter}: {reason}")]
    InvalidConfig { parameter: String, reason: String },

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<CleanError>,
    },
}

impl CleanError {
    pub fn dimension(context: impl Into<String>) -> Self {
        CleanError::DimensionMismatch {
            context: context.into(),
        }
    }

    pub fn domain(context: impl Into<String>) -> Self {
        CleanError::Domain {
            context: context.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CleanError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn fits(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        CleanError::Fits {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn config(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        CleanError::InvalidConfig {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }

    /// Wrap this error with the pipeline stage it occurred in
    pub fn at(self, stage: Stage) -> Self {
        CleanError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Stage the error was raised in, if it has been tagged with one
    pub fn stage(&self) -> Option<Stage> {
        match self {
            CleanError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// The innermost error, with all stage wrappers removed
    pub fn root(&self) -> &CleanError {
        match self {
            CleanError::Stage { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Extension to tag a fallible result with a pipeline stage
pub trait StageContext<T> {
    fn stage(self, stage: Stage) -> Result<T, CleanError>;
}

impl<T> StageContext<T> for Result<T, CleanError> {
    fn stage(self, stage: Stage) -> Result<T, CleanError> {
        self.map_err(|e| e.at(stage))
    }
}
