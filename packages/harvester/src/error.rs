//! Error types for the harvester.
//!
//! Every variant maps onto a [`FailureKind`], the coarse classification that
//! is recorded against work-tree nodes in the crawl report.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::http::StatusClass;

/// Main error type for the harvester library.
#[derive(Debug, Error)]
pub enum HarvesterError {
    /// A work-list row could not be used.
    #[error("Invalid work-list row {row}: {reason}")]
    InvalidRow { row: usize, reason: String },

    /// Server URL could not be parsed.
    #[error("Invalid server URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Server URL cannot carry path segments (e.g. `mailto:`).
    #[error("Server URL '{0}' cannot be used as a base for API paths")]
    NotABaseUrl(String),

    /// The server refused access to a resource.
    #[error("Access forbidden (403) for {url}")]
    Forbidden { url: String },

    /// Transient failures persisted through every allowed attempt.
    #[error("Giving up on {url} after {attempts} attempts: {message}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        message: String,
    },

    /// Status code outside the retry taxonomy.
    #[error("Unexpected HTTP status {status} for {url}")]
    UnexpectedStatus { url: String, status: u16 },

    /// Transport failure that was not retried. `transient` failures (timeouts,
    /// resets) end here only for requests that may not be repeated.
    #[error("HTTP request to {url} failed: {message}")]
    Transport {
        url: String,
        message: String,
        transient: bool,
    },

    /// Response body was not the expected JSON shape.
    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    /// HTTP client could not be built.
    #[error("HTTP client setup failed: {0}")]
    Client(#[from] reqwest::Error),

    /// A repository task panicked or was aborted.
    #[error("Task for {0} did not finish: {1}")]
    Task(String, String),

    /// The run was cancelled before this resource was processed.
    #[error("Cancelled before {0} was processed")]
    Cancelled(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML (de)serialization error.
    #[error("YAML serialization failed: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Work-list file has an extension we cannot read.
    #[error("Unsupported work-list format: {0} (expected .yaml, .yml or .json)")]
    UnsupportedWorkList(String),
}

/// Result type alias for harvester operations.
pub type Result<T> = std::result::Result<T, HarvesterError>;

/// Classification of a failure, recorded in crawl reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Validation,
    TransientNetwork,
    TransientServer,
    NotFound,
    Forbidden,
    RetryExhausted,
    PaginationAnomaly,
    Unexpected,
    Cancelled,
}

impl HarvesterError {
    /// Map this error onto the report taxonomy.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRow { .. }
            | Self::InvalidUrl { .. }
            | Self::NotABaseUrl(_)
            | Self::UnsupportedWorkList(_) => FailureKind::Validation,
            Self::Forbidden { .. } => FailureKind::Forbidden,
            Self::RetriesExhausted { .. } => FailureKind::RetryExhausted,
            Self::Cancelled(_) => FailureKind::Cancelled,
            Self::UnexpectedStatus { status, .. }
                if StatusClass::of(*status) == StatusClass::Transient =>
            {
                FailureKind::TransientServer
            }
            Self::Transport {
                transient: true, ..
            } => FailureKind::TransientNetwork,
            Self::UnexpectedStatus { .. }
            | Self::Transport { .. }
            | Self::Task(..)
            | Self::Decode { .. }
            | Self::Client(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Yaml(_) => FailureKind::Unexpected,
        }
    }
}
