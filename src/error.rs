use std::{io, path::PathBuf};
use thiserror::Error;

/// A single log line that could not be decoded into an entry.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is valid JSON but not an object")]
    NotAnObject,
}

/// Failures that abort ingestion of one file. Decode errors never surface here.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read session file {}", path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write to the aggregate store")]
    Store(#[source] anyhow::Error),
}

impl IngestError {
    pub fn file_access(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::FileAccess {
            path: path.into(),
            source,
        }
    }
}
