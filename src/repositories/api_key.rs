use std::sync::Arc;

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::gateway::{Executor, PersistenceGateway};
use crate::models::api_key::ApiKey;
use crate::observer::StoreOptions;
use crate::params;

const ENTITY: &str = "api_key";

const API_KEY_COLUMNS: &str = "id, user_id, key_hash, name, expires_at, created_at";

/// Persists API keys and verifies presented credentials.
pub struct ApiKeyStore<G> {
    gateway: Arc<G>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

impl<G: PersistenceGateway> ApiKeyStore<G> {
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

    /// Inserts a key record.
    ///
    /// # Errors
    ///
    /// `Duplicate` naming `id` or `key_hash`.
    pub async fn create(&self, key: &ApiKey) -> Result<()> {
        const OP: &str = "api_key.create";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                conn.execute(
                    "INSERT INTO api_keys (id, user_id, key_hash, name, expires_at, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                    params![
                        &key.id,
                        key.user_id,
                        &key.key_hash,
                        &key.name,
                        key.expires_at,
                        key.created_at
                    ],
                )
                .await
                .map_err(|e| {
                    // Never echo the hash back in an error.
                    StoreError::from_gateway(&*self.gateway, OP, ENTITY, e, |field| match field {
                        "key_hash" => "<redacted>".to_string(),
                        _ => key.id.clone(),
                    })
                })?;

                tracing::debug!(key_id = %key.id, user_id = key.user_id, "api key created");
                Ok(())
            })
            .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ApiKey> {
        self.fetch_one("api_key.get_by_id", "id", id).await
    }

    pub async fn get_by_hash(&self, key_hash: &str) -> Result<ApiKey> {
        self.fetch_one("api_key.get_by_hash", "key_hash", key_hash)
            .await
    }

    async fn fetch_one(&self, op: &'static str, column: &'static str, key: &str) -> Result<ApiKey> {
        self.options
            .run(op, async {
                let mut conn = self.connect(op).await?;
                let row = conn
                    .query_opt(
                        &format!("SELECT {API_KEY_COLUMNS} FROM api_keys WHERE {column} = $1"),
                        params![key],
                    )
                    .await
                    .map_err(|e| StoreError::backend(op, e))?
                    .ok_or_else(|| {
                        let shown = if column == "key_hash" { "<redacted>" } else { key };
                        StoreError::not_found(ENTITY, shown)
                    })?;

                ApiKey::try_from(&row).map_err(|e| StoreError::backend(op, e))
            })
            .await
    }

    /// Lists every key of the user, expired ones included, newest first.
    pub async fn get_by_user_id(&self, user_id: i64) -> Result<Vec<ApiKey>> {
        const OP: &str = "api_key.get_by_user_id";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let rows = conn
                    .query(
                        &format!(
                            "SELECT {API_KEY_COLUMNS} FROM api_keys \
                             WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
                        ),
                        params![user_id],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                rows.iter()
                    .map(|row| ApiKey::try_from(row).map_err(|e| StoreError::backend(OP, e)))
                    .collect()
            })
            .await
    }

    /// Checks a presented credential.
    ///
    /// The first query matches id, hash and expiry together. Only when it
    /// misses is the key looked up by id alone, and that second lookup reads
    /// nothing but the expiry, so the caller learns "expired" or "invalid"
    /// and never which half of the credential was wrong.
    ///
    /// # Arguments
    ///
    /// * `id` - The key id from the presented credential.
    /// * `key_hash` - The hash of the presented secret.
    ///
    /// # Returns
    ///
    /// The key record, `ExpiredToken` for a known id whose validity window
    /// has passed, or `InvalidToken` otherwise.
    pub async fn verify_key(&self, id: &str, key_hash: &str) -> Result<ApiKey> {
        const OP: &str = "api_key.verify_key";

        self.options
            .run(OP, async {
                let now = self.clock.now();
                let mut conn = self.connect(OP).await?;

                let matched = conn
                    .query_opt(
                        &format!(
                            "SELECT {API_KEY_COLUMNS} FROM api_keys \
                             WHERE id = $1 AND key_hash = $2 AND expires_at > $3"
                        ),
                        params![id, key_hash, now],
                    )
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if let Some(row) = matched {
                    return ApiKey::try_from(&row).map_err(|e| StoreError::backend(OP, e));
                }

                let expired = conn
                    .query_one(
                        "SELECT EXISTS (\
                             SELECT 1 FROM api_keys WHERE id = $1 AND expires_at <= $2\
                         ) AS expired",
                        params![id, now],
                    )
                    .await
                    .and_then(|row| row.get_bool("expired"))
                    .map_err(|e| StoreError::backend(OP, e))?;

                if expired {
                    Err(StoreError::ExpiredToken)
                } else {
                    Err(StoreError::InvalidToken)
                }
            })
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        const OP: &str = "api_key.delete";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let affected = conn
                    .execute("DELETE FROM api_keys WHERE id = $1", params![id])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if affected == 0 {
                    return Err(StoreError::not_found(ENTITY, id));
                }
                tracing::debug!(key_id = %id, "api key deleted");
                Ok(())
            })
            .await
    }

    /// Deletes every key of the user. Succeeds when there are none.
    pub async fn delete_by_user_id(&self, user_id: i64) -> Result<u64> {
        const OP: &str = "api_key.delete_by_user_id";

        self.options
            .run(OP, async {
                let mut conn = self.connect(OP).await?;
                let removed = conn
                    .execute("DELETE FROM api_keys WHERE user_id = $1", params![user_id])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                tracing::debug!(user_id, removed, "user api keys deleted");
                Ok(removed)
            })
            .await
    }

    /// Removes keys whose `expires_at` is strictly before now.
    pub async fn delete_expired(&self) -> Result<u64> {
        const OP: &str = "api_key.delete_expired";

        self.options
            .run(OP, async {
                let now = self.clock.now();
                let mut conn = self.connect(OP).await?;
                let removed = conn
                    .execute("DELETE FROM api_keys WHERE expires_at < $1", params![now])
                    .await
                    .map_err(|e| StoreError::backend(OP, e))?;

                if removed > 0 {
                    tracing::debug!(removed, "expired api keys swept");
                }
                Ok(removed)
            })
            .await
    }
}
