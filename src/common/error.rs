//! Error types for the segmentation gateway
//!
//! `Error` is the internal error carried through the shard, coordinator and
//! cache layers. Before anything reaches a caller it goes through
//! [`classify`], which maps it onto the closed set of public [`ErrorKind`]s
//! and hides internal details behind an opaque message.

use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Public domain errors ===
    #[error("segment already exists")]
    SegmentAlreadyExists,

    #[error("segment not found")]
    SegmentNotFound,

    #[error("segment distributed")]
    SegmentDistributed,

    #[error("user already exists")]
    UserExists,

    #[error("user not found")]
    UserNotFound,

    #[error("shard {shard} unavailable: {reason}")]
    ShardUnavailable { shard: usize, reason: String },

    // === Boundary validation ===
    #[error("percentage must be an integer in 1..=100, got {0}")]
    InvalidPercentage(i64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // === Shard statement errors ===
    #[error("unique constraint violated on shard {shard}")]
    UniqueViolation { shard: usize },

    #[error("statement failed on shard {shard}: {reason}")]
    Statement { shard: usize, reason: String },

    // === 2PC Errors ===
    #[error("prepare failed on shard {shard} ({tx_id}): {reason}")]
    ShardPrepareFailed {
        shard: usize,
        tx_id: String,
        reason: String,
    },

    #[error(
        "commit of {tx_id} failed on shards {failed:?} after shards {committed:?} committed: {reason}"
    )]
    ShardCommitFailed {
        tx_id: String,
        failed: Vec<usize>,
        committed: Vec<usize>,
        reason: String,
    },

    #[error("rollback failed on shard {shard} ({tx_id}): {reason}")]
    ShardRollbackFailed {
        shard: usize,
        tx_id: String,
        reason: String,
    },

    #[error("no prepared transaction {tx_id} on shard {shard}")]
    UnknownTransaction { shard: usize, tx_id: String },

    // === Cache Errors ===
    #[error("cache error: {0}")]
    Cache(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Public classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::SegmentAlreadyExists => ErrorKind::SegmentAlreadyExists,
            Error::SegmentNotFound => ErrorKind::SegmentNotFound,
            Error::SegmentDistributed => ErrorKind::SegmentDistributed,
            Error::UserExists => ErrorKind::UserExists,
            Error::UserNotFound => ErrorKind::UserNotFound,
            Error::ShardUnavailable { .. } => ErrorKind::ShardUnavailable,
            Error::InvalidPercentage(_) | Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the caller may see this error's message.
    pub fn is_public(&self) -> bool {
        self.kind() != ErrorKind::Internal
    }

    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ShardUnavailable { .. } | Error::Cache(_))
    }

    /// Message that is safe to hand to a caller.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Internal => INTERNAL_MESSAGE.to_string(),
            // Shard details stay internal even though the kind is public.
            ErrorKind::ShardUnavailable => "shard unavailable".to_string(),
            _ => self.to_string(),
        }
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> axum::http::StatusCode {
        self.kind().to_http_status()
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Cache(e.to_string())
    }
}

const INTERNAL_MESSAGE: &str = "internal server error";

/// Closed set of error kinds a caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SegmentAlreadyExists,
    SegmentNotFound,
    SegmentDistributed,
    UserExists,
    UserNotFound,
    ShardUnavailable,
    InvalidArgument,
    Internal,
}

impl ErrorKind {
    /// Stable status code, named after the gRPC codes the RPC layer uses.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::SegmentAlreadyExists
            | ErrorKind::UserExists
            | ErrorKind::SegmentDistributed => "ALREADY_EXISTS",
            ErrorKind::SegmentNotFound | ErrorKind::UserNotFound => "NOT_FOUND",
            ErrorKind::ShardUnavailable => "UNAVAILABLE",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn to_http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            ErrorKind::SegmentAlreadyExists
            | ErrorKind::UserExists
            | ErrorKind::SegmentDistributed => StatusCode::CONFLICT,
            ErrorKind::SegmentNotFound | ErrorKind::UserNotFound => StatusCode::NOT_FOUND,
            ErrorKind::ShardUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// An error as the caller sees it: a public kind and a sanitized message.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct PublicError {
    pub kind: ErrorKind,
    pub message: String,
}

/// Log `err` in full and reduce it to what the caller may see.
pub fn classify(err: Error) -> PublicError {
    match err.kind() {
        ErrorKind::Internal => tracing::error!(error = %err, "internal failure"),
        kind => tracing::warn!(
            error = %err,
            code = kind.code(),
            retryable = err.is_retryable(),
            "request failed"
        ),
    }
    PublicError {
        kind: err.kind(),
        message: err.public_message(),
    }
}

impl From<Error> for PublicError {
    fn from(err: Error) -> Self {
        classify(err)
    }
}
