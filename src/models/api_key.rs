use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{GatewayError, Row};

/// A long-lived credential for programmatic access.
///
/// Only the one-way hash of the secret is stored; it is never serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub user_id: i64,
    #[serde(skip_serializing, default)]
    pub key_hash: String,
    /// Owner-chosen label, e.g. "CI deploy".
    pub name: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

impl TryFrom<&Row> for ApiKey {
    type Error = GatewayError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get_string("id")?,
            user_id: row.get_i64("user_id")?,
            key_hash: row.get_string("key_hash")?,
            name: row.get_string("name")?,
            expires_at: row.get_timestamp("expires_at")?,
            created_at: row.get_timestamp("created_at")?,
        })
    }
}
