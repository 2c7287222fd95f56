use thiserror::Error;

use crate::crypto::field::CodecError;
use crate::gateway::{ErrorClass, GatewayError, PersistenceGateway};

/// The store layer's error type.
///
/// Backend constraint violations are translated into `NotFound`/`Duplicate`
/// at the store boundary; callers never inspect driver error codes.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record matched the lookup key.
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// A uniqueness constraint fired on `field`.
    #[error("duplicate {entity}: {field} = {value}")]
    Duplicate {
        entity: &'static str,
        field: String,
        value: String,
    },

    /// The credential is unknown or does not match.
    #[error("invalid token")]
    InvalidToken,

    /// The credential exists but its validity window has passed.
    #[error("token expired")]
    ExpiredToken,

    /// A stored encrypted field could not be opened with the configured key.
    #[error("cannot decrypt {entity} {key}: {source}")]
    Decryption {
        entity: &'static str,
        key: String,
        #[source]
        source: CodecError,
    },

    /// A field could not be encrypted, or the key was rejected.
    #[error("encryption error: {0}")]
    Encryption(#[from] CodecError),

    /// A caller-supplied value failed validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A structured blob failed to (de)serialize.
    #[error("cannot (de)serialize {entity}: {source}")]
    Serialization {
        entity: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// The operation exceeded its deadline; any open transaction was rolled back.
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    /// Any other persistence failure.
    #[error("{operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: GatewayError,
    },
}

/// A `Result` type that uses `StoreError` as the error type.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, key: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn backend(operation: &'static str, source: GatewayError) -> Self {
        StoreError::Backend { operation, source }
    }

    /// Translates a gateway failure through the backend's classifier.
    ///
    /// `value_of` maps the offending column to the value the caller tried to
    /// write, so a `Duplicate` names both.
    pub(crate) fn from_gateway<G: PersistenceGateway>(
        gateway: &G,
        operation: &'static str,
        entity: &'static str,
        err: GatewayError,
        value_of: impl FnOnce(&str) -> String,
    ) -> Self {
        match gateway.classify(&err) {
            ErrorClass::Duplicate { field } => {
                let value = value_of(&field);
                StoreError::Duplicate {
                    entity,
                    field,
                    value,
                }
            }
            ErrorClass::NotFound => StoreError::not_found(entity, value_of("id")),
            ErrorClass::Other => StoreError::backend(operation, err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::Duplicate { .. })
    }

    /// The column a `Duplicate` error names.
    pub fn duplicate_field(&self) -> Option<&str> {
        match self {
            StoreError::Duplicate { field, .. } => Some(field),
            _ => None,
        }
    }
}
