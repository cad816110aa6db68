use thiserror::Error;

/// Core error types for HubMCP operations
#[derive(Error, Debug)]
pub enum HubError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Missing required credential: {0}")]
    MissingCredential(String),

    #[error("Upstream API error: {0}")]
    ApiError(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl HubError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubError::ConnectionFailed(_) | HubError::TransportError(_) | HubError::Timeout(_)
        )
    }

    /// Check if this error indicates a permanent failure
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            HubError::ConfigurationError(_) | HubError::MissingCredential(_)
        )
    }

    /// Timeouts are expected on long-poll endpoints and are not worth a warning
    pub fn is_timeout(&self) -> bool {
        matches!(self, HubError::Timeout(_))
    }
}

/// Why a service could not be brought to `Running`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("service {0} already has a live process")]
    AlreadyRunning(String),

    #[error("failed to spawn {service}: {reason}")]
    SpawnFailed { service: String, reason: String },

    #[error("{service} exited during startup (exit code {code:?}): {diagnostics}")]
    ExitedEarly {
        service: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("startup of {0} was interrupted by shutdown")]
    Aborted(String),
}

impl StartError {
    pub fn service(&self) -> &str {
        match self {
            StartError::AlreadyRunning(service)
            | StartError::SpawnFailed { service, .. }
            | StartError::ExitedEarly { service, .. }
            | StartError::Aborted(service) => service,
        }
    }
}
