//! Streaming avatar provider surface

use crate::config::{AvatarQuality, TaskMode, TaskType, VoiceEmotion};
use crate::error::AvatarError;
use crate::token::AccessToken;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub mod streaming_api;
pub use streaming_api::StreamingApiProvider;

/// Live media of an active session. Opaque to consumers; the display sink
/// only hands it to whatever plays it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub session_id: String,
    /// Media server URL
    pub url: String,
    /// Media server credential
    pub access_token: AccessToken,
}

/// Parameters for creating a remote session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub quality: AvatarQuality,
    pub avatar_id: String,
    pub voice_id: Option<String>,
}

/// One outbound speak command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakRequest {
    pub text: String,
    pub task_type: TaskType,
    pub task_mode: TaskMode,
    pub emotion: Option<VoiceEmotion>,
}

/// Lifecycle signals raised by the provider for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    StreamReady(StreamHandle),
    StartedTalking,
    StoppedTalking,
    Disconnected,
    Error(String),
}

/// A freshly created remote session
pub struct ProviderSession {
    pub session_id: String,
    pub handle: Box<dyn SessionHandle>,
    /// Provider events in the order the provider raised them
    pub events: mpsc::Receiver<ProviderEvent>,
}

/// Commands against one remote session
#[async_trait]
pub trait SessionHandle: Send + Sync {
    async fn speak(&self, request: &SpeakRequest) -> Result<(), AvatarError>;
    async fn interrupt(&self) -> Result<(), AvatarError>;
    async fn stop(&self) -> Result<(), AvatarError>;
}

/// Trait for streaming avatar providers
#[async_trait]
pub trait AvatarProvider: Send + Sync {
    /// Create and start one remote session. Exactly one creation call per invocation.
    async fn create_session(
        &self,
        token: &AccessToken,
        request: &SessionRequest,
    ) -> Result<ProviderSession, AvatarError>;

    fn provider_name(&self) -> &str;
}
