//! Error types for Foundry generation and hosting operations.

use thiserror::Error;

/// Main error type for Foundry operations
#[derive(Error, Debug)]
pub enum FoundryError {
    /// Every port in the configured range is reserved or unbindable
    #[error("no free port in range {0}-{1}")]
    PortExhaustion(u16, u16),

    /// Uploaded document is neither JSON nor YAML, or not a mapping
    #[error("invalid specification: {0}")]
    InvalidSpecification(String),

    /// No base URL was declared and none could be derived from the document
    #[error("no base URL supplied and none resolvable from the specification")]
    MissingBaseUrl,

    /// The operation-to-tool mapping rejected the document
    #[error("tool extraction failed: {0}")]
    ToolExtractionFailed(String),

    /// External generator exited non-zero: (exit code, stderr)
    #[error("code generation failed with exit code {0}: {1}")]
    CodeGenerationFailed(i32, String),

    /// Dependency installation exited non-zero
    #[error("dependency installation failed with exit code {0}")]
    DependencyInstallFailed(i32),

    /// A generation step exceeded its time budget
    #[error("generation step '{0}' timed out")]
    GenerationTimedOut(String),

    /// Generation was cancelled by the caller
    #[error("generation cancelled for target '{0}'")]
    GenerationCancelled(String),

    /// Post-start health check failed for a target
    #[error("health check failed for target '{0}': {1}")]
    HealthCheckFailed(String, String),

    /// The startup script could not be spawned
    #[error("failed to spawn process for target '{0}': {1}")]
    ProcessSpawnError(String, String),

    /// No durable record, or no generated server, for a target
    #[error("no generated server for target '{0}'")]
    ServerNotFound(String),

    /// Target has no live process
    #[error("target '{0}' is not running")]
    NotRunning(String),

    /// Target already has a live process
    #[error("target '{0}' is already running")]
    AlreadyRunning(String),

    /// Target is already suspended
    #[error("target '{0}' is already paused")]
    AlreadyPaused(String),

    /// Target is not suspended
    #[error("target '{0}' is not paused")]
    NotPaused(String),

    /// Sending a signal to a hosted process failed
    #[error("failed to signal process for target '{0}': {1}")]
    SignalFailed(String, String),

    /// Target id is empty or contains characters unsafe for a directory name
    #[error("invalid target id '{0}'")]
    InvalidTargetId(String),

    /// Invalid configuration value: (field, reason)
    #[error("invalid config '{0}': {1}")]
    InvalidConfig(String, String),

    /// Durable status store failure
    #[error("status store error: {0}")]
    Store(String),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Foundry operations
pub type Result<T> = std::result::Result<T, FoundryError>;
