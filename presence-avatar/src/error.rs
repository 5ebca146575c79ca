//! Error types for presence-avatar

use thiserror::Error;

/// Avatar session and compositor errors
///
/// Variants carry plain messages; the error is `Clone` because one
/// initialization result is handed to every waiting caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvatarError {
    #[error("Token unavailable: {0}")]
    TokenUnavailable(String),

    #[error("Session creation failed: {0}")]
    SessionCreationFailed(String),

    #[error("Speak failed: {0}")]
    SpeakFailed(String),

    #[error("Avatar not ready: {0}")]
    NotReady(String),

    #[error("Compositor allocation failed: {0}")]
    CompositorAllocationFailed(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AvatarError {
    /// Short, stable identifier
    pub fn kind(&self) -> &'static str {
        match self {
            AvatarError::TokenUnavailable(_) => "token_unavailable",
            AvatarError::SessionCreationFailed(_) => "session_creation_failed",
            AvatarError::SpeakFailed(_) => "speak_failed",
            AvatarError::NotReady(_) => "not_ready",
            AvatarError::CompositorAllocationFailed(_) => "compositor_allocation_failed",
            AvatarError::Provider(_) => "provider",
            AvatarError::Config(_) => "config",
        }
    }
}
