use crate::store::LeaseId;

/// Errors produced by the discovery layer.
///
/// Setup-time failures are returned to the caller of [`crate::Registrar::register`]
/// or [`crate::ResolverBuilder::build`]. Inside the background workers the same
/// variants are only logged.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("coordination store unavailable during {op}: {message}")]
    StoreUnavailable { op: &'static str, message: String },

    #[error("lease {lease} lost")]
    LeaseLost { lease: LeaseId },

    #[error("malformed service record: {0}")]
    MalformedRecord(String),

    #[error("malformed registration key '{key}'")]
    MalformedKey { key: String },

    /// `revision` is the store revision the empty read was taken at.
    #[error("no service instances registered under '{prefix}'")]
    EmptyResultSet { prefix: String, revision: i64 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid target '{target}': {reason}")]
    InvalidTarget { target: String, reason: String },

    #[error("no resolver registered for scheme '{scheme}'")]
    UnknownScheme { scheme: String },

    #[error("failed to publish address list: {0}")]
    Publish(String),

    #[error("component already closed")]
    Closed,
}

impl DiscoveryError {
    pub(crate) fn store(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable {
            op,
            message: err.to_string(),
        }
    }

    /// Whether the error is a transient store failure worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. } | Self::LeaseLost { .. })
    }
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
