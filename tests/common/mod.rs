#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use redactor_store::{
    ApiKey, ApiKeyStore, DocumentStore, ManualClock, RedactionSchema, Session, SessionStore,
    SqliteGateway,
};

pub const NAME_KEY: [u8; 32] = [0x42; 32];

pub struct TestContext {
    pub gateway: Arc<SqliteGateway>,
    pub clock: Arc<ManualClock>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self {
            gateway: Arc::new(SqliteGateway::in_memory().await.unwrap()),
            clock: Arc::new(ManualClock::new(epoch())),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use redactor_store::Clock;
        self.clock.now()
    }

    pub fn sessions(&self) -> SessionStore<SqliteGateway> {
        SessionStore::new(self.gateway.clone(), self.clock.clone())
    }

    pub fn api_keys(&self) -> ApiKeyStore<SqliteGateway> {
        ApiKeyStore::new(self.gateway.clone(), self.clock.clone())
    }

    pub fn documents(&self) -> DocumentStore<SqliteGateway> {
        DocumentStore::new(self.gateway.clone(), self.clock.clone(), &NAME_KEY).unwrap()
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
}

pub fn session(id: &str, user_id: i64, token_id: &str, expires_at: DateTime<Utc>) -> Session {
    Session {
        id: id.to_string(),
        user_id,
        token_id: token_id.to_string(),
        expires_at,
        created_at: epoch(),
    }
}

pub fn api_key(id: &str, user_id: i64, key_hash: &str, expires_at: DateTime<Utc>) -> ApiKey {
    ApiKey {
        id: id.to_string(),
        user_id,
        key_hash: key_hash.to_string(),
        name: format!("key {id}"),
        expires_at,
        created_at: epoch(),
    }
}

pub fn document(user_id: i64, name: &str, uploaded_at: DateTime<Utc>) -> redactor_store::Document {
    redactor_store::Document {
        id: 0,
        user_id,
        display_name: name.to_string(),
        uploaded_at,
        last_modified: uploaded_at,
        redaction_schema: RedactionSchema::default(),
    }
}

pub fn hours(n: i64) -> TimeDelta {
    TimeDelta::hours(n)
}
