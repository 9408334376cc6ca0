//! Bearer tokens for the upstream purge API.
//!
//! Token issuance belongs to the authorization subsystem; the purge
//! services only ask for a current token through [`TokenProvider`].

use async_trait::async_trait;

use super::error::InfraError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Result<String, InfraError>;
}

/// Token supplied through configuration.
#[derive(Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|token| !token.trim().is_empty()),
        }
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenProvider")
            .field("configured", &self.token.is_some())
            .finish()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn bearer_token(&self) -> Result<String, InfraError> {
        self.token
            .clone()
            .ok_or_else(|| InfraError::authorization("no CDN purge token configured"))
    }
}
