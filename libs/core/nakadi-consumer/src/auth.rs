//! Bearer token supply for broker requests.

use crate::error::ConsumerResult;
use async_trait::async_trait;

/// Supplies the access token sent as `Authorization: Bearer <token>`.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// `None` means the request goes out unauthenticated.
    async fn token(&self) -> ConsumerResult<Option<String>>;
}

/// Fixed token, typically read from configuration.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn token(&self) -> ConsumerResult<Option<String>> {
        Ok(Some(self.token.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_provider() {
        let provider = StaticTokenProvider::new("secret");
        assert_eq!(provider.token().await.unwrap().as_deref(), Some("secret"));
    }
}
