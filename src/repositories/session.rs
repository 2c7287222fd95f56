use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::gateway::{Executor, PersistenceGateway};
use crate::models::session::Session;
use crate::observer::StoreOptions;
use crate::params;

const ENTITY: &str = "session";

const SESSION_COLUMNS: &str = "id, user_id, token_id, expires_at, created_at";

/// Persists sessions and answers validity checks for the authentication path.
pub struct SessionStore<G> {
    gateway: Arc<G>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl<G: PersistenceGateway> SessionStore<G> {
    pub fn new(gateway: Arc<G>, clock: Arc<dyn Clock>) -> Self {
        Self {
            gateway,
            clock,
            options: StoreOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    async fn connect(&self, operation: &'static str) -> Result<G::Conn> {
        self.gateway
            .connect()
            .await
            .map_err(|e| StoreError::backend(operation, e))
    }

    /// Inserts a session.
    ///
    /// An empty `session.id` is replaced by a fresh UUID before the insert and
    /// the caller's value is updated. `created_at` and `expires_at` are stored
    /// as given.
    ///
    /// # Errors
    ///
    /// `Duplicate` with `field` set to `"id"` or `"token_id"` depending on
    /// which uniqueness constraint fired.
    pub async fn create(&self, session: &mut Session) -> Result<()> {
        const OP: &str = "session.create";

        if session.id.is_empty() {
            session.id = Uuid::new_v4().to_string();
        }
        let session = &*session;

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                conn.execute(
                    "INSERT INTO sessions (id, user_id, token_id, expires_at, created_at) \
                     VALUES ($1, $2, $3, $4, $5)",
                    params![
                        &session.id,
                        session.user_id,
                        &session.token_id,
                        session.expires_at,
                        session.created_at
                    ],
                )
                .await
                .map_err(|e| {
                    StoreError::from_gateway(&*self.gateway, OP, ENTITY, e, |field| match field {
                        "token_id" => session.token_id.clone(),
                        _ => session.id.clone(),
                    })
                })?;

                tracing::debug!(session_id = %session.id, user_id = session.user_id, "session created");
                Ok(())
            })
            .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Session> {
        self.fetch_one("session.get_by_id", "id", id).await
    }

    pub async fn get_by_token_id(&self, token_id: &str) -> Result<Session> {
        self.fetch_one("session.get_by_token_id", "token_id", token_id)
            .await
    }

    async fn fetch_one(&self, op: &'static str, column: &'static str, key: &str) -> Result<Session> {
        self.options
            .run(op, async {
                let mut conn = self.connect(op).await?;
                let stmt = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE {column} = $1");
                let row = conn
                    .query_opt(&stmt, params![key])
                    .await
                    .map_err(|e| StoreError::backend(op, e))?
                    .ok_or_else(|| StoreError::not_found(ENTITY, key))?;

                Session::try_from(&row).map_err(|e| StoreError::backend(op, e))
            })
            .await
    }

    /// Lists the user's unexpired sessions, most recently created first.
    ///
    /// # Arguments
    ///
    /// * `user_id` - The owner of the sessions.
    ///
    /// # Returns
    ///
    /// A `Result` containing the sessions; empty when the user has none.
    pub async fn get_active_by_user_id(&self, user_id: i64) -> Result<Vec<Session>> {
        const OP: &str = "session.get_active_by_user_id";

        self.options
            .run(OP, async {
                let now = self.clock.now();
                let mut conn = self.connect(OP).await?;
                let rows = conn
                    .query(
                        &format!(
                            "SELECT {SESSION_COLUMNS} FROM sessions \
                             WHERE user_id = $1 AND expires_at > $2 \
                             ORDER BY created_at DESC, id DESC"
                        ),
                        params![user_id, now],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                rows.iter()
                    .map(|row| Session::try_from(row).map_err(|e| StoreError::backend(OP, e)))
                    .collect()
            })
            .await
    }

    /// Deletes one session (single-device logout).
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.delete_one("session.delete", "id", id).await
    }

    /// Deletes the session bound to `token_id`.
    pub async fn delete_by_token_id(&self, token_id: &str) -> Result<()> {
        self.delete_one("session.delete_by_token_id", "token_id", token_id)
            .await
    }

    async fn delete_one(&self, op: &'static str, column: &'static str, key: &str) -> Result<()> {
        self.options
            .run(op, async {
                let mut conn = self.connect(op).await?;
                let affected = conn
                    .execute(
                        &format!("DELETE FROM sessions WHERE {column} = $1"),
                        params![key],
                    )
                    .await
                    .map_err(|e| StoreError::backend(op, e))?;

                if affected == 0 {
                    return Err(StoreError::not_found(ENTITY, key));
                }
                tracing::debug!(column, "session deleted");
                Ok(())
            })
            .await
    }

    /// Deletes every session of the user. Succeeds when there are none.
    pub async fn delete_by_user_id(&self, user_id: i64) -> Result<u64> {
        const OP: &str = "session.delete_by_user_id";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let removed = conn
                    .execute("DELETE FROM sessions WHERE user_id = $1", params![user_id])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                tracing::debug!(user_id, removed, "user sessions deleted");
                Ok(removed)
            })
            .await
    }

    /// Removes sessions whose `expires_at` is strictly before now.
    ///
    /// Concurrent sweepers are safe: the loser of a race deletes nothing.
    pub async fn delete_expired(&self) -> Result<u64> {
        const OP: &str = "session.delete_expired";

        self.options
            .run(OP, async {
                let now = self.clock.now();
                let mut conn = self.connect(OP).await?;
                let removed = conn
                    .execute("DELETE FROM sessions WHERE expires_at < $1", params![now])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if removed > 0 {
                    tracing::debug!(removed, "expired sessions swept");
                }
                Ok(removed)
            })
            .await
    }

    /// True iff a session for `token_id` exists and expires after now.
    ///
    /// Runs a single `EXISTS` query; the record itself is never loaded.
    pub async fn is_valid(&self, token_id: &str) -> Result<bool> {
        const OP: &str = "session.is_valid";

        self.options
            .run(OP, async {
                let now = self.clock.now();
                let mut conn = self.connect(OP).await?;
                let row = conn
                    .query_one(
                        "SELECT EXISTS (\
                             SELECT 1 FROM sessions WHERE token_id = $1 AND expires_at > $2\
                         ) AS valid",
                        params![token_id, now],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                row.get_bool("valid").map_err(|e| StoreError::backend(OP, e))
            })
            .await
    }
}
