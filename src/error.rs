//! Error types for model conversion

use std::path::PathBuf;
use thiserror::Error;

pub type ConvertResult<T> = Result<T, ConvertError>;

/// Everything that can stop a conversion. All variants are terminal.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("cannot read source model {}", path.display())]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid source model {}: {reason}", path.display())]
    InvalidSource { path: PathBuf, reason: String },

    #[error("unsupported model structure: {0}")]
    Unsupported(String),

    #[error("cannot write converted model {}", path.display())]
    Destination {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConvertError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn invalid_source(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidSource {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
