//! Shared mocks for presence-avatar integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use presence_avatar::{
    AccessToken, AvatarError, AvatarProvider, EventBus, EventKind, ProviderEvent,
    ProviderSession, SessionHandle, SessionRequest, SpeakRequest, StreamHandle, TokenSource,
    VideoSink, subscriber,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MockTokens {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl MockTokens {
    pub fn failing() -> Self {
        let tokens = Self::default();
        tokens.fail.store(true, Ordering::SeqCst);
        tokens
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for MockTokens {
    async fn fetch_token(&self) -> Result<AccessToken, AvatarError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AvatarError::TokenUnavailable("Failed to get token: 503".to_string()));
        }
        Ok(AccessToken::new(format!("token-{}", n)))
    }
}

/// Everything the mock sessions were asked to do
#[derive(Default)]
pub struct Recorder {
    pub spoken: Mutex<Vec<SpeakRequest>>,
    pub interrupts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_speak: AtomicBool,
}

pub struct MockProvider {
    pub creates: AtomicUsize,
    pub delay: Duration,
    pub fail_create: AtomicBool,
    pub stream_ready: bool,
    pub recorder: Arc<Recorder>,
    senders: Mutex<Vec<mpsc::Sender<ProviderEvent>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            creates: AtomicUsize::new(0),
            delay: Duration::ZERO,
            fail_create: AtomicBool::new(false),
            stream_ready: true,
            recorder: Arc::new(Recorder::default()),
            senders: Mutex::new(Vec::new()),
        }
    }
}

impl MockProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.recorder.stops.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.recorder.interrupts.load(Ordering::SeqCst)
    }

    pub fn spoken(&self) -> Vec<SpeakRequest> {
        self.recorder.spoken.lock().clone()
    }

    /// Sender of the most recently created session
    pub fn sender(&self) -> mpsc::Sender<ProviderEvent> {
        self.senders.lock().last().cloned().expect("no session created")
    }

    pub async fn send(&self, event: ProviderEvent) {
        let _ = self.sender().send(event).await;
    }
}

#[async_trait]
impl AvatarProvider for MockProvider {
    async fn create_session(
        &self,
        token: &AccessToken,
        _request: &SessionRequest,
    ) -> Result<ProviderSession, AvatarError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(AvatarError::SessionCreationFailed("streaming.new returned 500".to_string()));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let (sender, events) = mpsc::channel(16);
        if self.stream_ready {
            let _ = sender.try_send(ProviderEvent::StreamReady(StreamHandle {
                session_id: session_id.clone(),
                url: "wss://media.example/room".to_string(),
                access_token: token.clone(),
            }));
        }
        self.senders.lock().push(sender);

        Ok(ProviderSession {
            session_id,
            handle: Box::new(MockHandle {
                recorder: Arc::clone(&self.recorder),
            }),
            events,
        })
    }

    fn provider_name(&self) -> &str {
        "mock"
    }
}

struct MockHandle {
    recorder: Arc<Recorder>,
}

#[async_trait]
impl SessionHandle for MockHandle {
    async fn speak(&self, request: &SpeakRequest) -> Result<(), AvatarError> {
        if self.recorder.fail_speak.load(Ordering::SeqCst) {
            return Err(AvatarError::SpeakFailed("streaming.task returned 400".to_string()));
        }
        self.recorder.spoken.lock().push(request.clone());
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), AvatarError> {
        self.recorder.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AvatarError> {
        self.recorder.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub stream: Mutex<Option<StreamHandle>>,
    pub plays: AtomicUsize,
}

impl VideoSink for RecordingSink {
    fn set_stream(&self, stream: Option<StreamHandle>) {
        *self.stream.lock() = stream;
    }

    fn play(&self) -> Result<(), AvatarError> {
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Record the kind of every event emitted on `bus`, in order
pub fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<EventKind>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    for kind in EventKind::ALL {
        let seen = Arc::clone(&seen);
        bus.register(
            kind,
            subscriber(move |event| {
                seen.lock().push(event.kind());
                Ok(())
            }),
        );
    }
    seen
}

pub fn count(seen: &Mutex<Vec<EventKind>>, kind: EventKind) -> usize {
    seen.lock().iter().filter(|k| **k == kind).count()
}

/// Poll `condition` until it holds or two seconds pass
pub async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
