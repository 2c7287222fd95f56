use crate::error::Result;
use crate::gateway::PersistenceGateway;
use crate::repositories::api_key::ApiKeyStore;
use crate::repositories::session::SessionStore;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub api_keys: u64,
}

/// Deletes expired sessions and API keys.
///
/// Safe to run from several processes at once; overlapping sweeps simply
/// find less to delete.
///
/// # Arguments
///
/// * `sessions` - The session store to sweep.
/// * `api_keys` - The API key store to sweep.
///
/// # Returns
///
/// A `Result` containing the number of rows removed from each store.
pub async fn sweep_expired<G: PersistenceGateway>(
    sessions: &SessionStore<G>,
    api_keys: &ApiKeyStore<G>,
) -> Result<SweepReport> {
    let report = SweepReport {
        sessions: sessions.delete_expired().await?,
        api_keys: api_keys.delete_expired().await?,
    };

    tracing::debug!(
        sessions = report.sessions,
        api_keys = report.api_keys,
        "expired credentials swept"
    );
    Ok(report)
}
