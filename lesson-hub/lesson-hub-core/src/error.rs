//! Error types for lesson-hub-core

use std::path::PathBuf;

use thiserror::Error;

/// The bearer token could not be turned into a principal.
#[derive(Error, Debug)]
pub enum ClaimsError {
    #[error("Access token is malformed: {0}")]
    Malformed(#[from] jsonwebtoken::errors::Error),

    #[error("Access token carries no usable subject or name")]
    Anonymous,
}

/// Failures talking to the identity provider's user-attribute store.
#[derive(Error, Debug)]
pub enum AttributeStoreError {
    #[error("Attribute store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Attribute store rejected the request with status {0}")]
    Rejected(u16),

    #[error("Attribute store returned an unexpected payload: {0}")]
    Payload(String),

    #[error("Attribute store unavailable: {0}")]
    Unavailable(String),
}

/// The stored `config` attribute is not a preference object.
#[derive(Error, Debug)]
#[error("Preference blob is not valid JSON: {0}")]
pub struct PreferenceError(#[from] pub serde_json::Error);

/// Token refresh against the identity provider failed.
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("Principal has no refresh token")]
    NoRefreshToken,

    #[error("Refresh request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Identity provider rejected the refresh with status {0}")]
    Rejected(u16),

    #[error("Refreshed token is unusable: {0}")]
    Claims(#[from] ClaimsError),
}

/// A single entry could not be read while scanning the content tree.
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures raised by a markdown pipeline stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    PermissionDenied(String),

    #[error("Unterminated {kind} fence starting at line {line}")]
    UnterminatedFence { kind: &'static str, line: usize },

    #[error("Failed to encode diagram: {0}")]
    DiagramEncoding(#[from] std::io::Error),
}

/// Callout tables whose alias links do not resolve to a styled type.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CalloutTableError {
    #[error("Callout alias chain starting at '{0}' is cyclic")]
    Cycle(String),

    #[error("Callout '{name}' links to unknown type '{target}'")]
    Dangling { name: String, target: String },
}
