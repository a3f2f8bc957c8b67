// ── Bearer token supply ──
//
// The engine asks for a token before every connection attempt and never
// caches it. Implementations decide whether to refresh.

use async_trait::async_trait;
use secrecy::SecretString;

/// Error type token providers may return.
pub type TokenError = Box<dyn std::error::Error + Send + Sync>;

/// Source of bearer tokens for the realtime service.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self) -> Result<SecretString, TokenError>;
}

/// Always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider(SecretString);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(SecretString::from(token.into()))
    }
}

impl From<SecretString> for StaticTokenProvider {
    fn from(token: SecretString) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<SecretString, TokenError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn static_provider_repeats_its_token() {
        let provider = StaticTokenProvider::new("abc");
        assert_eq!(provider.token().await.unwrap().expose_secret(), "abc");
        assert_eq!(provider.token().await.unwrap().expose_secret(), "abc");
    }
}
