use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid arguments: {0}")]
    Validation(String),

    #[error(transparent)]
    Config(#[from] dasgate_core::ConfigError),

    #[error(transparent)]
    Aggregate(dasgate_core::AggregateError),

    /// An aggregation that failed for lack of a usable credential.
    #[error(transparent)]
    Credential(dasgate_core::AggregateError),

    #[error("gateway setup failed: {0}")]
    Core(#[from] dasgate_core::CoreError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<dasgate_core::AggregateError> for CliError {
    fn from(error: dasgate_core::AggregateError) -> Self {
        if error.is_credential_failure() {
            Self::Credential(error)
        } else {
            Self::Aggregate(error)
        }
    }
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Config(_) | Self::Core(_) => 3,
            Self::Aggregate(_) => 4,
            Self::Credential(_) => 5,
            Self::Serialization(_) => 6,
            Self::Io(_) => 10,
        }
    }
}
