//! presence-avatar: real-time streaming avatar sessions
//!
//! Provides:
//! - A session controller with single-flight initialization and a strict
//!   lifecycle state machine
//! - A typed event bus for session, stream and speaking events
//! - Token acquisition from an issuance endpoint
//! - A streaming provider backed by the `v1/streaming.*` REST API
//! - A chroma-key frame compositor and a display driver that supervises it

pub mod error;
pub mod config;
pub mod events;
pub mod token;
pub mod providers;
pub mod session;
pub mod compositor;
pub mod display;

pub use error::AvatarError;
pub use config::{
    AvatarQuality, AvatarStreamConfig, ChromaKey, CompositorConfig, TaskMode, TaskType, VoiceEmotion,
};
pub use events::{subscriber, AvatarEvent, EventBus, EventKind, Subscriber};
pub use token::{AccessToken, HttpTokenProvider, TokenSource};
pub use providers::{
    AvatarProvider, ProviderEvent, ProviderSession, SessionHandle, SessionRequest, SpeakRequest,
    StreamHandle, StreamingApiProvider,
};
pub use session::{Session, SessionController, SessionState, SpeakOptions, Transition};
pub use compositor::{allocate_frame, remove_backdrop, FrameCompositor, Surface, VideoSource};
pub use display::{AvatarDisplay, DisplayStatus, VideoSink};
