//! Error types for the Tileres resource engine

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the resource engine
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (config file) parse error
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// A data provider failed to produce data
    #[error("Provider '{provider}' failed: {reason}")]
    ProviderFailed { provider: String, reason: String },

    /// A provider was bound to a collection of the wrong kind
    #[error("Provider '{provider}' offers {actual} data but a {expected} collection was requested")]
    ProviderKindMismatch {
        provider: String,
        expected: String,
        actual: String,
    },

    // =========================================================================
    // GPU Errors
    // =========================================================================
    /// Uploading a resource to the GPU failed
    #[error("GPU upload failed for {resource}: {reason}")]
    UploadFailed { resource: String, reason: String },

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// The fetch worker pool no longer accepts tasks
    #[error("Fetch worker pool has been shut down")]
    PoolShutDown,

    /// The engine has been released and no longer accepts work
    #[error("Resource engine has been shut down")]
    EngineShutDown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
