use thiserror::Error;

/// Classified failures raised by the engine.
///
/// Operations return `anyhow::Result`; these values travel inside the
/// `anyhow::Error` so callers can `downcast_ref::<GridwareError>()` when they
/// need to tell, say, an incompatible archive from a network failure.
#[derive(Error, Debug)]
pub enum GridwareError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error("{0}")]
    IncompatibleEnvironment(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Unable to satisfy requirements: {0}")]
    Unresolvable(String),

    #[error("{command} failed: {detail}")]
    ExternalCommandFailure { command: String, detail: String },

    #[error("Ambiguous package definition found: {}", .0.join(", "))]
    Ambiguous(Vec<String>),

    #[error("Depot is not enabled: {0}")]
    DepotDisabled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Relocation failed for {path}: {reason}")]
    Relocation { path: String, reason: String },

    #[error("{0}")]
    Archive(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl GridwareError {
    pub fn command_failed(command: impl Into<String>, detail: impl Into<String>) -> Self {
        GridwareError::ExternalCommandFailure {
            command: command.into(),
            detail: detail.into(),
        }
    }

    /// Find the classified error inside an `anyhow` chain, if any.
    pub fn classify(err: &anyhow::Error) -> Option<&GridwareError> {
        err.chain().find_map(|e| e.downcast_ref::<GridwareError>())
    }
}
