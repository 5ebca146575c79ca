//! Typed publish/subscribe between the session controller and its consumers

use crate::error::AvatarError;
use crate::session::Session;
use crate::providers::StreamHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Events emitted to consumers
#[derive(Debug, Clone)]
pub enum AvatarEvent {
    SessionReady(Session),
    StreamReady { stream: StreamHandle },
    SpeakingStarted,
    SpeakingStopped,
    SpeakingInterrupted,
    SessionError { error: AvatarError },
    SessionStopped,
    StreamDisconnected,
}

/// Subscription key, one per `AvatarEvent` variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionReady,
    StreamReady,
    SpeakingStarted,
    SpeakingStopped,
    SpeakingInterrupted,
    SessionError,
    SessionStopped,
    StreamDisconnected,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::SessionReady,
        EventKind::StreamReady,
        EventKind::SpeakingStarted,
        EventKind::SpeakingStopped,
        EventKind::SpeakingInterrupted,
        EventKind::SessionError,
        EventKind::SessionStopped,
        EventKind::StreamDisconnected,
    ];

    /// Wire name, e.g. `session:ready`
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::SessionReady => "session:ready",
            EventKind::StreamReady => "stream:ready",
            EventKind::SpeakingStarted => "speaking:start",
            EventKind::SpeakingStopped => "speaking:stop",
            EventKind::SpeakingInterrupted => "speaking:interrupted",
            EventKind::SessionError => "session:error",
            EventKind::SessionStopped => "session:stopped",
            EventKind::StreamDisconnected => "stream:disconnected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AvatarEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            AvatarEvent::SessionReady(_) => EventKind::SessionReady,
            AvatarEvent::StreamReady { .. } => EventKind::StreamReady,
            AvatarEvent::SpeakingStarted => EventKind::SpeakingStarted,
            AvatarEvent::SpeakingStopped => EventKind::SpeakingStopped,
            AvatarEvent::SpeakingInterrupted => EventKind::SpeakingInterrupted,
            AvatarEvent::SessionError { .. } => EventKind::SessionError,
            AvatarEvent::SessionStopped => EventKind::SessionStopped,
            AvatarEvent::StreamDisconnected => EventKind::StreamDisconnected,
        }
    }
}

/// Event callback. Identity (for `unregister`) is the `Arc` allocation.
pub type Subscriber = Arc<dyn Fn(&AvatarEvent) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a `Subscriber`
pub fn subscriber<F>(f: F) -> Subscriber
where
    F: Fn(&AvatarEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Event bus with per-kind ordered subscriber lists
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    sender: broadcast::Sender<AvatarEvent>,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(buffer_size.max(1));
        Self {
            listeners: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Append a subscriber for `kind`. The same subscriber may be registered more than once.
    pub fn register(&self, kind: EventKind, callback: Subscriber) {
        self.listeners.write().entry(kind).or_default().push(callback);
    }

    /// Remove the first registration of `callback` for `kind`
    pub fn unregister(&self, kind: EventKind, callback: &Subscriber) {
        let mut listeners = self.listeners.write();
        if let Some(list) = listeners.get_mut(&kind) {
            if let Some(index) = list.iter().position(|c| Arc::ptr_eq(c, callback)) {
                list.remove(index);
            }
        }
    }

    /// Number of callbacks registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Drop every registered callback
    pub fn clear(&self) {
        self.listeners.write().clear();
    }

    /// Receive every emitted event asynchronously
    pub fn subscribe(&self) -> broadcast::Receiver<AvatarEvent> {
        self.sender.subscribe()
    }

    /// Dispatch `event` to a snapshot of its subscribers.
    ///
    /// The lock is released before any callback runs, so callbacks may
    /// register or unregister freely; such changes apply from the next emit.
    pub fn emit(&self, event: AvatarEvent) {
        let kind = event.kind();
        let snapshot: Vec<Subscriber> = {
            let listeners = self.listeners.read();
            listeners.get(&kind).cloned().unwrap_or_default()
        };

        debug!("Emitting {} to {} listener(s)", kind, snapshot.len());

        for callback in snapshot {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Error in event listener for {}: {}", kind, e);
                }
                Err(_) => {
                    error!("Event listener for {} panicked", kind);
                }
            }
        }

        // No receivers is the common case
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
