use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::aes::MIN_KEY_MATERIAL;

/// Runtime configuration of the sweeper and of any service embedding the stores.
#[derive(Clone)]
pub struct Config {
    /// The URL of the PostgreSQL database.
    pub database_url: String,
    /// Key material for document names.
    pub document_name_key: Zeroizing<Vec<u8>>,
    /// The maximum number of pooled database connections.
    pub pool_max_size: usize,
    /// Deadline applied to every store operation, if any.
    pub op_timeout: Option<Duration>,
    /// How often expired credentials are swept.
    pub sweep_interval: Duration,
}

impl Config {
    /// Creates a new `Config` from environment variables.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `Config`.
    pub fn from_env() -> Result<Self> {
        let mut key_hex = env::var("DOCUMENT_NAME_KEY")
            .context("DOCUMENT_NAME_KEY must be set (generate with: openssl rand -hex 32)")?;

        let key_bytes = hex::decode(key_hex.trim());
        key_hex.zeroize();
        let key_bytes = Zeroizing::new(
            key_bytes.context("DOCUMENT_NAME_KEY must be valid hexadecimal")?,
        );

        if key_bytes.len() < MIN_KEY_MATERIAL {
            anyhow::bail!(
                "DOCUMENT_NAME_KEY must be at least {} bytes ({} hex characters)",
                MIN_KEY_MATERIAL,
                MIN_KEY_MATERIAL * 2
            );
        }

        let op_timeout = match env::var("STORE_OP_TIMEOUT_MS") {
            Ok(raw) => Some(Duration::from_millis(
                raw.parse().context("Invalid STORE_OP_TIMEOUT_MS")?,
            )),
            Err(_) => None,
        };

        let sweep_secs: u64 = env::var("SWEEP_INTERVAL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .context("Invalid SWEEP_INTERVAL_SECS")?;
        if sweep_secs == 0 {
            anyhow::bail!("SWEEP_INTERVAL_SECS must be greater than zero");
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            document_name_key: key_bytes,
            pool_max_size: env::var("DB_POOL_MAX_SIZE")
                .unwrap_or_else(|_| "16".to_string())
                .parse()
                .context("Invalid DB_POOL_MAX_SIZE")?,
            op_timeout,
            sweep_interval: Duration::from_secs(sweep_secs),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"<redacted>")
            .field("document_name_key", &"<redacted>")
            .field("pool_max_size", &self.pool_max_size)
            .field("op_timeout", &self.op_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .finish()
    }
}
