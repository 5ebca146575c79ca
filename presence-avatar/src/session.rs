//! Streaming session controller
//!
//! Owns the single remote avatar session and drives it through
//! `Uninitialized -> Initializing -> Ready <-> Speaking`, ending in
//! `Disconnected` or `Failed`. Concurrent `initialize()` calls share one
//! spawned attempt through a `Shared` future. Provider events for a session
//! are applied in arrival order by a pump task that only starts once
//! `session:ready` has been emitted.

use crate::config::{AvatarQuality, AvatarStreamConfig, TaskMode, TaskType, VoiceEmotion};
use crate::display::VideoSink;
use crate::error::AvatarError;
use crate::events::{AvatarEvent, EventBus};
use crate::providers::{
    AvatarProvider, ProviderEvent, ProviderSession, SessionHandle, SessionRequest, SpeakRequest,
    StreamHandle,
};
use crate::token::{AccessToken, TokenSource};
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Speaking,
    Disconnected,
    Failed,
}

/// Triggers of the session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Initialize,
    Reset,
    Established,
    InitFailed,
    TalkingStarted,
    TalkingStopped,
    Interrupted,
    Stopped,
    Disconnected,
    ProviderError,
}

impl SessionState {
    /// Target state for `transition`, or `None` if the edge does not exist
    pub fn next(self, transition: Transition) -> Option<SessionState> {
        use SessionState::*;
        match (self, transition) {
            (Uninitialized, Transition::Initialize) => Some(Initializing),
            (Failed | Disconnected, Transition::Reset) => Some(Uninitialized),
            (Initializing, Transition::Established) => Some(Ready),
            (Initializing, Transition::InitFailed) => Some(Failed),
            (Ready, Transition::TalkingStarted) => Some(Speaking),
            (Speaking, Transition::TalkingStopped) => Some(Ready),
            (Speaking, Transition::Interrupted) => Some(Ready),
            (Initializing | Ready | Speaking, Transition::Stopped | Transition::Disconnected) => {
                Some(Disconnected)
            }
            (_, Transition::ProviderError) => Some(Failed),
            _ => None,
        }
    }

    /// Ready or Speaking: a session exists and accepts commands
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Speaking)
    }
}

/// Snapshot of the active session
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub access_token: AccessToken,
    pub avatar_id: String,
    pub voice_id: Option<String>,
    pub quality: AvatarQuality,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
}

/// Per-call overrides for `speak`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakOptions {
    pub task_type: Option<TaskType>,
    pub emotion: Option<VoiceEmotion>,
}

type InitResult = Result<Session, AvatarError>;
type SharedInit = Shared<BoxFuture<'static, InitResult>>;

struct ActiveSession {
    info: Session,
    handle: Arc<dyn SessionHandle>,
    stream: Option<StreamHandle>,
    pump: Option<JoinHandle<()>>,
}

struct Core {
    state: SessionState,
    /// Bumped on every attempt and every release; stale events and
    /// completions carry an older value and are discarded.
    generation: u64,
    active: Option<ActiveSession>,
    in_flight: Option<SharedInit>,
    display: Option<Arc<dyn VideoSink>>,
}

struct Inner {
    config: AvatarStreamConfig,
    tokens: Arc<dyn TokenSource>,
    provider: Arc<dyn AvatarProvider>,
    events: EventBus,
    core: Mutex<Core>,
    state_tx: watch::Sender<SessionState>,
}

enum SpeakFailure {
    /// Already surfaced as `session:error` by the failed initialization
    Reported(AvatarError),
    Unreported(AvatarError),
}

/// Controller for one streaming avatar session at a time
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        config: AvatarStreamConfig,
        tokens: Arc<dyn TokenSource>,
        provider: Arc<dyn AvatarProvider>,
    ) -> Result<Self, AvatarError> {
        config.validate().map_err(AvatarError::Config)?;
        let (state_tx, _state_rx) = watch::channel(SessionState::Uninitialized);
        let events = EventBus::new(config.event_buffer_size);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tokens,
                provider,
                events,
                core: Mutex::new(Core {
                    state: SessionState::Uninitialized,
                    generation: 0,
                    active: None,
                    in_flight: None,
                    display: None,
                }),
                state_tx,
            }),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &AvatarStreamConfig {
        &self.inner.config
    }

    pub fn state(&self) -> SessionState {
        self.inner.core.lock().state
    }

    /// Receiver that observes every state change
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        let core = self.inner.core.lock();
        core.state.is_active() && core.active.is_some()
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.core.lock().state == SessionState::Speaking
    }

    pub fn current_session(&self) -> Option<Session> {
        let core = self.inner.core.lock();
        core.active.as_ref().map(|active| Session {
            state: core.state,
            ..active.info.clone()
        })
    }

    /// Initialize the avatar session.
    ///
    /// Returns the current session when one is active. While an attempt is in
    /// flight every caller awaits that same attempt. After `Failed` or
    /// `Disconnected` the machine resets and a fresh attempt (with a fresh
    /// token) begins.
    pub async fn initialize(&self) -> Result<Session, AvatarError> {
        let attempt = {
            let mut core = self.inner.core.lock();

            if core.state.is_active() {
                if let Some(ref active) = core.active {
                    debug!("Avatar already initialized");
                    return Ok(Session {
                        state: core.state,
                        ..active.info.clone()
                    });
                }
            }

            let in_flight = core.in_flight.clone();
            match in_flight {
                Some(in_flight) => {
                    debug!("Avatar initialization already in progress, attaching");
                    in_flight
                }
                None => {
                    if matches!(core.state, SessionState::Failed | SessionState::Disconnected) {
                        self.inner.apply(&mut core, Transition::Reset);
                    }
                    if !self.inner.apply(&mut core, Transition::Initialize) {
                        return Err(AvatarError::NotReady(format!(
                            "Cannot initialize from state {:?}",
                            core.state
                        )));
                    }

                    core.generation += 1;
                    let generation = core.generation;
                    let inner = Arc::clone(&self.inner);
                    let task = tokio::spawn(inner.run_attempt(generation));
                    let shared = async move {
                        task.await.unwrap_or_else(|e| {
                            Err(AvatarError::SessionCreationFailed(format!(
                                "Initialization task failed: {}",
                                e
                            )))
                        })
                    }
                    .boxed()
                    .shared();

                    core.in_flight = Some(shared.clone());
                    shared
                }
            }
        };

        attempt.await
    }

    /// Make the avatar speak `text`. Failures are logged, emitted as
    /// `session:error` and reported as `false`.
    pub async fn speak(&self, text: &str, options: SpeakOptions) -> bool {
        match self.speak_request(text, options).await {
            Ok(()) => true,
            Err(SpeakFailure::Reported(e)) => {
                error!("Error making avatar speak: {}", e);
                false
            }
            Err(SpeakFailure::Unreported(e)) => {
                error!("Error making avatar speak: {}", e);
                self.inner.events.emit(AvatarEvent::SessionError { error: e });
                false
            }
        }
    }

    /// `speak` with the failure returned instead of emitted
    pub async fn try_speak(&self, text: &str, options: SpeakOptions) -> Result<(), AvatarError> {
        self.speak_request(text, options).await.map_err(|f| match f {
            SpeakFailure::Reported(e) | SpeakFailure::Unreported(e) => e,
        })
    }

    async fn speak_request(&self, text: &str, options: SpeakOptions) -> Result<(), SpeakFailure> {
        let handle = match self.active_handle() {
            Some(handle) => handle,
            None => {
                if !self.inner.config.auto_initialize_on_speak {
                    return Err(SpeakFailure::Unreported(AvatarError::NotReady(
                        "No active session".to_string(),
                    )));
                }
                warn!("Avatar not initialized, initializing now...");
                self.initialize().await.map_err(|e| {
                    let error = AvatarError::NotReady(format!("Initialization failed: {}", e));
                    if e == superseded() {
                        SpeakFailure::Unreported(error)
                    } else {
                        SpeakFailure::Reported(error)
                    }
                })?;
                self.active_handle().ok_or_else(|| {
                    SpeakFailure::Unreported(AvatarError::NotReady(
                        "Session ended before speaking".to_string(),
                    ))
                })?
            }
        };

        let request = SpeakRequest {
            text: text.to_string(),
            task_type: options.task_type.unwrap_or(self.inner.config.default_task_type),
            task_mode: TaskMode::Sync,
            emotion: options.emotion,
        };

        let preview: String = text.chars().take(50).collect();
        debug!("Making avatar speak: {}...", preview);

        handle.speak(&request).await.map_err(|e| {
            SpeakFailure::Unreported(match e {
                AvatarError::SpeakFailed(_) => e,
                other => AvatarError::SpeakFailed(other.to_string()),
            })
        })?;

        debug!("Avatar speak command sent");
        Ok(())
    }

    /// Interrupt the avatar while it is speaking; a no-op in any other state
    pub async fn interrupt(&self) {
        let target = {
            let core = self.inner.core.lock();
            if core.state != SessionState::Speaking {
                return;
            }
            core.active
                .as_ref()
                .map(|active| (Arc::clone(&active.handle), core.generation))
        };

        let Some((handle, generation)) = target else {
            return;
        };

        match handle.interrupt().await {
            Ok(()) => {
                let applied = {
                    let mut core = self.inner.core.lock();
                    core.generation == generation && self.inner.apply(&mut core, Transition::Interrupted)
                };
                if applied {
                    info!("Avatar interrupted");
                    self.inner.events.emit(AvatarEvent::SpeakingInterrupted);
                }
            }
            Err(e) => {
                error!("Error interrupting avatar: {}", e);
            }
        }
    }

    /// Stop and release the session. A no-op unless initializing or active.
    pub async fn stop(&self) {
        let released = {
            let mut core = self.inner.core.lock();
            if !self.inner.apply(&mut core, Transition::Stopped) {
                debug!("stop() ignored in state {:?}", core.state);
                return;
            }
            self.inner.release(&mut core)
        };

        self.inner.clear_display();

        if let Some(active) = released {
            if let Err(e) = active.handle.stop().await {
                warn!("Error stopping avatar session {}: {}", active.info.session_id, e);
            }
        }

        info!("Avatar stopped");
        self.inner.events.emit(AvatarEvent::SessionStopped);
    }

    /// Bind (or rebind) the video sink. A live stream is attached immediately.
    pub fn bind_display(&self, sink: Arc<dyn VideoSink>) {
        let stream = {
            let mut core = self.inner.core.lock();
            core.display = Some(Arc::clone(&sink));
            core.active.as_ref().and_then(|active| active.stream.clone())
        };
        debug!("Video sink bound");

        if let Some(stream) = stream {
            attach_stream(sink.as_ref(), stream);
        }
    }

    pub fn unbind_display(&self) {
        self.inner.core.lock().display = None;
    }

    /// Stop the session and drop every listener and the bound sink
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.events.clear();
        self.unbind_display();
    }

    fn active_handle(&self) -> Option<Arc<dyn SessionHandle>> {
        let core = self.inner.core.lock();
        if !core.state.is_active() {
            return None;
        }
        core.active.as_ref().map(|active| Arc::clone(&active.handle))
    }

    #[cfg(test)]
    fn handle_provider_event(&self, event: ProviderEvent) {
        let generation = self.inner.core.lock().generation;
        self.inner.handle_provider_event(generation, event);
    }
}

impl Inner {
    /// Apply `transition`; returns false (and changes nothing) for a missing edge
    fn apply(&self, core: &mut Core, transition: Transition) -> bool {
        match core.state.next(transition) {
            Some(next) => {
                debug!("Session {:?} --{:?}--> {:?}", core.state, transition, next);
                core.state = next;
                self.state_tx.send_replace(next);
                true
            }
            None => {
                debug!("Ignoring {:?} in state {:?}", transition, core.state);
                false
            }
        }
    }

    /// Detach the active session and invalidate everything tied to it
    fn release(&self, core: &mut Core) -> Option<ActiveSession> {
        core.generation += 1;
        core.in_flight = None;
        let mut active = core.active.take()?;
        if let Some(pump) = active.pump.take() {
            pump.abort();
        }
        Some(active)
    }

    fn clear_display(&self) {
        let sink = self.core.lock().display.clone();
        if let Some(sink) = sink {
            sink.set_stream(None);
        }
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) -> InitResult {
        match self.negotiate().await {
            Ok((token, created)) => self.establish(generation, token, created),
            Err(error) => self.fail(generation, error),
        }
    }

    /// Token then session creation, each exactly once
    async fn negotiate(&self) -> Result<(AccessToken, ProviderSession), AvatarError> {
        let token = self.tokens.fetch_token().await.map_err(|e| match e {
            AvatarError::TokenUnavailable(_) => e,
            other => AvatarError::TokenUnavailable(other.to_string()),
        })?;

        let request = SessionRequest {
            quality: self.config.quality,
            avatar_id: self.config.avatar_id.clone(),
            voice_id: self.config.voice_id.clone(),
        };

        let created = self
            .provider
            .create_session(&token, &request)
            .await
            .map_err(|e| match e {
                AvatarError::SessionCreationFailed(_) => e,
                other => AvatarError::SessionCreationFailed(other.to_string()),
            })?;

        Ok((token, created))
    }

    fn establish(self: &Arc<Self>, generation: u64, token: AccessToken, created: ProviderSession) -> InitResult {
        let ProviderSession {
            session_id,
            handle,
            events,
        } = created;
        let handle: Arc<dyn SessionHandle> = Arc::from(handle);

        let session = {
            let mut core = self.core.lock();
            if core.generation != generation || core.state != SessionState::Initializing {
                drop(core);
                warn!("Session {} created after stop, releasing it", session_id);
                tokio::spawn(async move {
                    if let Err(e) = handle.stop().await {
                        warn!("Failed to release abandoned session: {}", e);
                    }
                });
                return Err(superseded());
            }

            self.apply(&mut core, Transition::Established);
            let session = Session {
                session_id,
                access_token: token,
                avatar_id: self.config.avatar_id.clone(),
                voice_id: self.config.voice_id.clone(),
                quality: self.config.quality,
                state: SessionState::Ready,
                started_at: Utc::now(),
            };
            core.active = Some(ActiveSession {
                info: session.clone(),
                handle,
                stream: None,
                pump: None,
            });
            core.in_flight = None;
            session
        };

        info!("Avatar session initialized: {}", session.session_id);
        self.events.emit(AvatarEvent::SessionReady(session.clone()));

        // Provider events queued during creation are applied only now
        let mut core = self.core.lock();
        if core.generation != generation {
            debug!("Session {} stopped while becoming ready", session.session_id);
            return Err(superseded());
        }
        if let Some(active) = core.active.as_mut() {
            let weak = Arc::downgrade(self);
            active.pump = Some(tokio::spawn(pump_provider_events(weak, generation, events)));
        }

        Ok(session)
    }

    fn fail(&self, generation: u64, error: AvatarError) -> InitResult {
        let failed = {
            let mut core = self.core.lock();
            if core.generation == generation && self.apply(&mut core, Transition::InitFailed) {
                core.in_flight = None;
                true
            } else {
                false
            }
        };

        if !failed {
            debug!("Discarding failure of superseded attempt: {}", error);
            return Err(superseded());
        }

        error!("Error initializing avatar: {}", error);
        self.events.emit(AvatarEvent::SessionError {
            error: error.clone(),
        });
        Err(error)
    }

    /// Apply one provider event. Returns false once the session has ended.
    fn handle_provider_event(&self, generation: u64, event: ProviderEvent) -> bool {
        let mut core = self.core.lock();
        if core.generation != generation {
            debug!("Discarding stale provider event {:?}", event);
            return false;
        }

        match event {
            ProviderEvent::StreamReady(stream) => {
                info!("Avatar stream ready: {}", stream.session_id);
                if let Some(active) = core.active.as_mut() {
                    active.stream = Some(stream.clone());
                }
                let sink = core.display.clone();
                drop(core);

                match sink {
                    Some(sink) => attach_stream(sink.as_ref(), stream.clone()),
                    None => debug!("No video sink bound, stream kept for later binding"),
                }
                self.events.emit(AvatarEvent::StreamReady { stream });
                true
            }
            ProviderEvent::StartedTalking => {
                let applied = self.apply(&mut core, Transition::TalkingStarted);
                drop(core);
                if applied {
                    debug!("Avatar started talking");
                    self.events.emit(AvatarEvent::SpeakingStarted);
                }
                true
            }
            ProviderEvent::StoppedTalking => {
                let applied = self.apply(&mut core, Transition::TalkingStopped);
                drop(core);
                if applied {
                    debug!("Avatar stopped talking");
                    self.events.emit(AvatarEvent::SpeakingStopped);
                }
                true
            }
            ProviderEvent::Disconnected => {
                if !self.apply(&mut core, Transition::Disconnected) {
                    return true;
                }
                self.release(&mut core);
                drop(core);

                warn!("Avatar stream disconnected");
                self.clear_display();
                self.events.emit(AvatarEvent::StreamDisconnected);
                false
            }
            ProviderEvent::Error(message) => {
                self.apply(&mut core, Transition::ProviderError);
                let released = self.release(&mut core);
                drop(core);

                error!("Avatar error: {}", message);
                if let Some(active) = released {
                    tokio::spawn(async move {
                        if let Err(e) = active.handle.stop().await {
                            debug!("Failed to release failed session: {}", e);
                        }
                    });
                }
                self.clear_display();
                self.events.emit(AvatarEvent::SessionError {
                    error: AvatarError::Provider(message),
                });
                false
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(active) = self.core.get_mut().active.as_mut() {
            if let Some(pump) = active.pump.take() {
                pump.abort();
            }
        }
    }
}

async fn pump_provider_events(
    inner: Weak<Inner>,
    generation: u64,
    mut events: mpsc::Receiver<ProviderEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.handle_provider_event(generation, event) {
            break;
        }
    }
    debug!("Provider event pump for generation {} finished", generation);
}

const SUPERSEDED: &str = "Session stopped during initialization";

/// Result of an attempt overtaken by `stop()`; nothing was emitted for it
fn superseded() -> AvatarError {
    AvatarError::NotReady(SUPERSEDED.to_string())
}

fn attach_stream(sink: &dyn VideoSink, stream: StreamHandle) {
    debug!("Attaching stream to video sink");
    sink.set_stream(Some(stream));
    if let Err(e) = sink.play() {
        error!("Error playing video: {}", e);
    }
}
