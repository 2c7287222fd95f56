use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::{GatewayError, Row};

/// A server-side record binding an externally issued token to a user.
///
/// `token_id` is the identifier carried inside the signed token, not the
/// token itself. A session is active iff `expires_at > now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// The session identifier. Left empty, the store generates one on create.
    pub id: String,
    /// The ID of the user this session belongs to.
    pub user_id: i64,
    /// The externally issued token identifier. Globally unique.
    pub token_id: String,
    /// The timestamp when the session expires.
    pub expires_at: DateTime<Utc>,
    /// The timestamp when the session was created.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Strict: a session expiring exactly at `now` is no longer active.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl TryFrom<&Row> for Session {
    type Error = GatewayError;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.get_string("id")?,
            user_id: row.get_i64("user_id")?,
            token_id: row.get_string("token_id")?,
            expires_at: row.get_timestamp("expires_at")?,
            created_at: row.get_timestamp("created_at")?,
        })
    }
}
