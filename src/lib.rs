//! Credential and document persistence for the redactor service.
//!
//! - [`SessionStore`] and [`ApiKeyStore`] back the authentication path.
//! - [`DocumentStore`] keeps document names encrypted at rest and deletes
//!   documents together with their detected entities in one transaction.
//!
//! Every store is generic over a [`PersistenceGateway`]; PostgreSQL and
//! SQLite backends are included.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod observer;

pub mod crypto {
    pub mod aes;
    pub mod field;
    pub mod secret;
}

pub mod models {
    pub mod api_key;
    pub mod document;
    pub mod session;
}

pub mod repositories {
    pub mod api_key;
    pub mod document;
    pub mod session;
}

pub mod services {
    pub mod auth;
    pub mod sweeper;
}

pub mod validation {
    pub mod api_key;
    pub mod document;
}

pub use clock::{Clock, ManualClock, SystemClock};
pub use crypto::field::{decrypt_field, encrypt_field, CodecError, FieldKey};
pub use error::{Result, StoreError};
pub use gateway::postgres::PgGateway;
pub use gateway::sqlite::SqliteGateway;
pub use gateway::{
    ErrorClass, Executor, GatewayError, PersistenceGateway, Row, RowLock, SqlValue, Transaction,
};
pub use models::api_key::ApiKey;
pub use models::document::{
    DetectedEntity, DetectionMethod, Document, DocumentSummary, RedactionAction, RedactionRule,
    RedactionSchema, TextSpan,
};
pub use models::session::Session;
pub use observer::{NoopObserver, StoreObserver, StoreOptions, TracingObserver};
pub use repositories::api_key::ApiKeyStore;
pub use repositories::document::{DocumentStore, NameFailurePolicy, UNREADABLE_NAME};
pub use repositories::session::SessionStore;
