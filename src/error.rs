use std::time::Duration;

use thiserror::Error;

/// Why a single layer ended up in `LoadState::Error`.
///
/// None of these are fatal to the engine; the affected overlay is left off
/// the map and the rest of the batch carries on.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LayerError {
    #[error("no reachable document for {key:?}: {reason}")]
    Resolution { key: String, reason: String },
    #[error("malformed {format} document: {reason}")]
    Parse { format: &'static str, reason: String },
    #[error("fetching {uri:?} timed out after {after:?}")]
    FetchTimeout { uri: String, after: Duration },
    #[error("fetching {uri:?} failed: {reason}")]
    Fetch { uri: String, reason: String },
    #[error("upload to document host failed: {0}")]
    Upload(String),
}

impl LayerError {
    pub fn parse(format: &'static str, reason: impl ToString) -> Self {
        LayerError::Parse { format, reason: reason.to_string() }
    }
}
