use std::sync::Arc;

use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::crypto::secret::{generate_api_key, hash_secret, parse_presented};
use crate::error::{Result, StoreError};
use crate::gateway::PersistenceGateway;
use crate::models::api_key::ApiKey;
use crate::models::session::Session;
use crate::repositories::api_key::ApiKeyStore;
use crate::repositories::session::SessionStore;
use crate::validation::api_key::ApiKeyRequest;

/// Claims extracted from a signed token by a [`TokenValidator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: i64,
    /// Unique identifier of the issued token (`jti`).
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
}

/// Verifies a token's signature and extracts its claims.
///
/// Signing and the token wire format live outside this crate. An
/// implementation returns `InvalidToken` for anything it cannot verify.
pub trait TokenValidator: Send + Sync {
    fn claims(&self, token: &str) -> Result<TokenClaims>;
}

/// Session and API key flows for the authentication layer.
pub struct AuthService<G> {
    sessions: SessionStore<G>,
    api_keys: ApiKeyStore<G>,
    validator: Arc<dyn TokenValidator>,
    clock: Arc<dyn Clock>,
}

impl<G: PersistenceGateway> AuthService<G> {
    pub fn new(
        sessions: SessionStore<G>,
        api_keys: ApiKeyStore<G>,
        validator: Arc<dyn TokenValidator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sessions,
            api_keys,
            validator,
            clock,
        }
    }

    pub fn sessions(&self) -> &SessionStore<G> {
        &self.sessions
    }

    pub fn api_keys(&self) -> &ApiKeyStore<G> {
        &self.api_keys
    }

    /// Records a session for a freshly issued token.
    ///
    /// An `id` collision gets one retry with a new id. A `token_id` that is
    /// already bound to a session is a replay and yields `InvalidToken`.
    ///
    /// # Arguments
    ///
    /// * `token` - The signed token handed out at login.
    ///
    /// # Returns
    ///
    /// A `Result` containing the stored `Session`.
    pub async fn start_session(&self, token: &str) -> Result<Session> {
        let claims = self.validator.claims(token)?;
        let now = self.clock.now();
        if claims.expires_at <= now {
            return Err(StoreError::ExpiredToken);
        }

        let mut session = Session {
            id: String::new(),
            user_id: claims.user_id,
            token_id: claims.token_id,
            expires_at: claims.expires_at,
            created_at: now,
        };

        let mut retried = false;
        loop {
            match self.sessions.create(&mut session).await {
                Ok(()) => break,
                Err(err) => match err.duplicate_field().map(str::to_owned).as_deref() {
                    Some("id") if !retried => {
                        tracing::warn!(session_id = %session.id, "session id collision, retrying");
                        session.id.clear();
                        retried = true;
                    }
                    Some("token_id") => {
                        tracing::warn!(user_id = session.user_id, "token replay rejected");
                        return Err(StoreError::InvalidToken);
                    }
                    _ => return Err(err),
                },
            }
        }

        tracing::info!("✅ Session started for user: {}", session.user_id);
        Ok(session)
    }

    /// Resolves a presented token to its claims if its session is active.
    ///
    /// The hot path is one `EXISTS` query. Only a miss pays for a second
    /// lookup that tells an expired session from an unknown one.
    pub async fn authenticate(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.validator.claims(token)?;
        if self.sessions.is_valid(&claims.token_id).await? {
            return Ok(claims);
        }

        match self.sessions.get_by_token_id(&claims.token_id).await {
            Ok(session) if !session.is_active_at(self.clock.now()) => Err(StoreError::ExpiredToken),
            Ok(_) => Err(StoreError::InvalidToken),
            Err(err) if err.is_not_found() => Err(StoreError::InvalidToken),
            Err(err) => Err(err),
        }
    }

    /// Ends the session bound to `token`. Ending an unknown session is not
    /// an error.
    pub async fn logout(&self, token: &str) -> Result<()> {
        let claims = self.validator.claims(token)?;
        match self.sessions.delete_by_token_id(&claims.token_id).await {
            Err(err) if err.is_not_found() => {
                tracing::debug!(user_id = claims.user_id, "logout for unknown session");
                Ok(())
            }
            other => other,
        }
    }

    /// Ends every session of the user. Returns how many were removed.
    pub async fn logout_everywhere(&self, user_id: i64) -> Result<u64> {
        let removed = self.sessions.delete_by_user_id(user_id).await?;
        tracing::info!("🔒 Logged out user {} from {} session(s)", user_id, removed);
        Ok(removed)
    }

    /// Issues a new API key.
    ///
    /// # Returns
    ///
    /// The stored record and the credential string to show the owner once.
    pub async fn issue_api_key(
        &self,
        request: ApiKeyRequest,
    ) -> Result<(ApiKey, Zeroizing<String>)> {
        let request = request.check()?;
        let now = self.clock.now();
        if request.expires_at <= now {
            return Err(StoreError::Validation(
                "API key expiry must be in the future".to_string(),
            ));
        }

        let generated = generate_api_key();
        let key = ApiKey {
            id: generated.id.clone(),
            user_id: request.user_id,
            key_hash: generated.hash.clone(),
            name: request.name,
            expires_at: request.expires_at,
            created_at: now,
        };
        self.api_keys.create(&key).await?;

        tracing::info!("✅ API key {} issued for user: {}", key.id, key.user_id);
        Ok((key, generated.presented()))
    }

    /// Verifies a presented `rsk_<id>.<secret>` credential.
    pub async fn authenticate_api_key(&self, presented: &str) -> Result<ApiKey> {
        let (id, secret) = parse_presented(presented).ok_or(StoreError::InvalidToken)?;
        self.api_keys.verify_key(id, &hash_secret(secret)).await
    }
}
