use chrono::{DateTime, Utc};
use garde::Validate;

use crate::error::{Result, StoreError};

/// What a user asks for when issuing a new API key.
#[derive(Debug, Clone, Validate)]
pub struct ApiKeyRequest {
    #[garde(skip)]
    pub user_id: i64,
    #[garde(length(chars, min = 1, max = 255))]
    pub name: String,
    #[garde(skip)]
    pub expires_at: DateTime<Utc>,
}

impl ApiKeyRequest {
    /// Validates the request and trims the label.
    pub fn check(mut self) -> Result<Self> {
        self.name = self.name.trim().to_string();
        self.validate()
            .map_err(|report| StoreError::Validation(report.to_string()))?;
        Ok(self)
    }
}
