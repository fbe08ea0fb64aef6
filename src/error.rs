// ABOUTME: Error taxonomy for the replication core
// ABOUTME: Distinguishes fatal configuration faults from retryable fetch failures

use std::path::PathBuf;

use crate::resource::ResourceKind;

pub type Result<T, E = ReplicationError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// Missing credential, malformed system identifier or unreadable config.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Incremental replication was requested but no cursor has been stored yet.
    #[error(
        "incremental replication of {resource} requires a stored cursor; run an initial sync first"
    )]
    InvalidMode { resource: ResourceKind },

    #[error("fetch of {url} failed after {attempts} attempts: {message}")]
    TransientFetch {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("malformed response from {url}: {message}")]
    MalformedResponse { url: String, message: String },

    #[error("upstream rejected {url} with HTTP {status}: {body}")]
    UpstreamRejected {
        url: String,
        status: u16,
        body: String,
    },

    #[error("record sink for {resource} was handed an empty batch")]
    EmptyBatch { resource: ResourceKind },

    #[error("failed to persist {path:?}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path:?}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{resource} is already being replicated (lock held at {path:?})")]
    Locked { resource: ResourceKind, path: PathBuf },

    #[error(
        "replication of {resource} failed (last persisted cursor: {}): {source}",
        .last_cursor.as_deref().unwrap_or("unset")
    )]
    RunFailed {
        resource: ResourceKind,
        last_cursor: Option<String>,
        #[source]
        source: Box<ReplicationError>,
    },
}

impl ReplicationError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Serialization {
            path: path.into(),
            source,
        }
    }

    /// The innermost error, looking through a [`ReplicationError::RunFailed`] wrapper.
    pub fn root(&self) -> &ReplicationError {
        match self {
            ReplicationError::RunFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failed_message_includes_cursor() {
        let err = ReplicationError::RunFailed {
            resource: ResourceKind::Office,
            last_cursor: Some("2024-01-01T00:00:00Z".to_string()),
            source: Box::new(ReplicationError::EmptyBatch {
                resource: ResourceKind::Office,
            }),
        };
        let msg = err.to_string();
        assert!(msg.contains("Office"));
        assert!(msg.contains("2024-01-01T00:00:00Z"));
        assert!(matches!(err.root(), ReplicationError::EmptyBatch { .. }));
    }

    #[test]
    fn test_run_failed_message_unset_cursor() {
        let err = ReplicationError::RunFailed {
            resource: ResourceKind::Member,
            last_cursor: None,
            source: Box::new(ReplicationError::Configuration("boom".to_string())),
        };
        assert!(err.to_string().contains("unset"));
    }
}
