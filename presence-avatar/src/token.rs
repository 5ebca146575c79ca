//! Short-lived access token acquisition

use crate::config::AvatarStreamConfig;
use crate::error::AvatarError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Provider access token. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First few characters followed by an ellipsis, for logs
    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        format!("{}…", prefix)
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccessToken({})", self.redacted())
    }
}

/// Source of provider access tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a fresh token. Implementations must not retry.
    async fn fetch_token(&self) -> Result<AccessToken, AvatarError>;
}

/// Issuance endpoint reply: an object, or a list wrapping one
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenReply {
    Wrapped(Vec<TokenEnvelope>),
    Bare(TokenEnvelope),
}

#[derive(Debug, Default, Deserialize)]
struct TokenEnvelope {
    #[serde(default)]
    data: Option<TokenData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TokenData {
    #[serde(default)]
    token: Option<String>,
}

/// Token source backed by an HTTP issuance endpoint
pub struct HttpTokenProvider {
    client: Client,
    endpoint: Url,
}

impl HttpTokenProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, AvatarError> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| AvatarError::Config(format!("Invalid token endpoint: {}", e)))?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AvatarError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, endpoint })
    }

    pub fn from_config(config: &AvatarStreamConfig) -> Result<Self, AvatarError> {
        Self::new(&config.token_endpoint, config.request_timeout())
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TokenSource for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<AccessToken, AvatarError> {
        debug!("Requesting access token from {}", self.endpoint);

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("Content-Type", "application/json")
            .body("{}")
            .send()
            .await
            .map_err(|e| AvatarError::TokenUnavailable(format!("Token endpoint unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Token endpoint returned {}", status);
            return Err(AvatarError::TokenUnavailable(format!(
                "Failed to get token: {}",
                status.as_u16()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AvatarError::TokenUnavailable(format!("Failed to read token response: {}", e)))?;

        let token = extract_token(&bytes)?;
        info!("Obtained access token {}", token.redacted());
        Ok(token)
    }
}

fn extract_token(body: &[u8]) -> Result<AccessToken, AvatarError> {
    let reply: TokenReply = serde_json::from_slice(body)
        .map_err(|e| AvatarError::TokenUnavailable(format!("Malformed token response: {}", e)))?;

    let envelope = match reply {
        TokenReply::Bare(envelope) => envelope,
        TokenReply::Wrapped(list) => list
            .into_iter()
            .next()
            .ok_or_else(|| AvatarError::TokenUnavailable("Empty token response".to_string()))?,
    };

    match envelope.data.and_then(|d| d.token).filter(|t| !t.is_empty()) {
        Some(token) => Ok(AccessToken::new(token)),
        None => Err(AvatarError::TokenUnavailable(
            envelope
                .message
                .unwrap_or_else(|| "Failed to get access token".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_object() {
        let token = extract_token(br#"{"data":{"token":"abc123"}}"#).unwrap();
        assert_eq!(token.as_str(), "abc123");
    }

    #[test]
    fn test_extract_wrapped_list() {
        let token = extract_token(br#"[{"data":{"token":"xyz"}}]"#).unwrap();
        assert_eq!(token.as_str(), "xyz");
    }

    #[test]
    fn test_missing_field_uses_message() {
        let err = extract_token(br#"{"message":"quota exceeded"}"#).unwrap_err();
        assert_eq!(err, AvatarError::TokenUnavailable("quota exceeded".to_string()));
    }

    #[test]
    fn test_empty_list_and_empty_token() {
        assert!(matches!(extract_token(b"[]"), Err(AvatarError::TokenUnavailable(_))));
        assert!(matches!(
            extract_token(br#"{"data":{"token":""}}"#),
            Err(AvatarError::TokenUnavailable(_))
        ));
        assert!(matches!(extract_token(b"not json"), Err(AvatarError::TokenUnavailable(_))));
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = AccessToken::new("supersecretvalue");
        assert!(!format!("{:?}", token).contains("supersecretvalue"));
    }
}
