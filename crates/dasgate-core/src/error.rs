use thiserror::Error;

use crate::aggregator::AggregateError;
use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Contract violations between a backend payload (or an already-parsed query)
/// and the shape a planner or normalizer relies on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{system} payload for api '{api}' is not valid JSON: {message}")]
    InvalidPayload {
        system: &'static str,
        api: String,
        message: String,
    },

    #[error("field '{field}' is missing")]
    MissingField { field: String },
    #[error("field '{field}' has unexpected type, expected {expected}")]
    UnexpectedType {
        field: String,
        expected: &'static str,
    },

    #[error("spec parameter '{key}' is missing")]
    MissingParameter { key: String },
    #[error("spec parameter '{key}' has unexpected type, expected {expected}")]
    ParameterType {
        key: String,
        expected: &'static str,
    },

    #[error("invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("no normalizer registered for backend '{system}'")]
    NoNormalizer { system: &'static str },
}

impl SchemaError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn unexpected_type(field: impl Into<String>, expected: &'static str) -> Self {
        Self::UnexpectedType {
            field: field.into(),
            expected,
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for callers that want a single error surface.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
