use spacehub_core::{ConfigError, CoreError, ValidationError};
use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    InvalidQuery(#[from] spacehub_core::InvalidQuery),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("partial result: {failed} of {total} providers did not succeed")]
    Partial { failed: usize, total: usize },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ValidationError> for CliError {
    fn from(error: ValidationError) -> Self {
        Self::Core(error.into())
    }
}

impl From<ConfigError> for CliError {
    fn from(error: ConfigError) -> Self {
        Self::Core(error.into())
    }
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidQuery(_) | Self::Core(CoreError::Validation(_)) => 2,
            Self::Partial { .. } => 3,
            Self::Core(CoreError::Config(_)) => 4,
            Self::Core(CoreError::Serialization(_)) | Self::Serialization(_) | Self::Io(_) => 10,
        }
    }
}
