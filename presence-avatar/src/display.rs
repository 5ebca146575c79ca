//! Consumer-side avatar display
//!
//! Binds a video sink to the controller, mirrors session events into a
//! `DisplayStatus`, and keeps the compositor running only while the session
//! is live and the display is visible.

use crate::compositor::{FrameCompositor, Surface, VideoSource};
use crate::error::AvatarError;
use crate::events::{subscriber, EventKind, Subscriber};
use crate::providers::StreamHandle;
use crate::session::{SessionController, SessionState};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Playback target for the live stream
pub trait VideoSink: Send + Sync {
    /// Attach the stream, or detach with `None`
    fn set_stream(&self, stream: Option<StreamHandle>);

    /// Request playback of the attached stream
    fn play(&self) -> Result<(), AvatarError>;
}

/// What the display currently shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStatus {
    Loading,
    Ready,
    Speaking,
    Error,
}

pub struct AvatarDisplay {
    controller: Arc<SessionController>,
    compositor: Arc<FrameCompositor>,
    sink: Arc<dyn VideoSink>,
    source: Arc<dyn VideoSource>,
    surface: Arc<dyn Surface>,
    status: Arc<watch::Sender<DisplayStatus>>,
    visible: watch::Sender<bool>,
    listeners: Mutex<Vec<(EventKind, Subscriber)>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    init_requested: AtomicBool,
}

impl AvatarDisplay {
    pub fn new(
        controller: Arc<SessionController>,
        sink: Arc<dyn VideoSink>,
        source: Arc<dyn VideoSource>,
        surface: Arc<dyn Surface>,
    ) -> Self {
        let compositor = Arc::new(FrameCompositor::new(controller.config().compositor.clone()));
        let (status, _) = watch::channel(DisplayStatus::Loading);
        let (visible, _) = watch::channel(false);

        Self {
            controller,
            compositor,
            sink,
            source,
            surface,
            status: Arc::new(status),
            visible,
            listeners: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            init_requested: AtomicBool::new(false),
        }
    }

    /// Make the display visible, mounting it on first call
    pub fn show(&self) {
        self.mount();
        self.visible.send_replace(true);

        if self.controller.is_ready() {
            let status = if self.controller.is_speaking() {
                DisplayStatus::Speaking
            } else {
                DisplayStatus::Ready
            };
            self.status.send_replace(status);
        } else if !self.init_requested.swap(true, Ordering::SeqCst) {
            debug!("Display visible, initializing avatar");
            let controller = Arc::clone(&self.controller);
            tokio::spawn(async move {
                if let Err(e) = controller.initialize().await {
                    error!("Failed to initialize avatar: {}", e);
                }
            });
        }
    }

    /// Hide the display; the compositor stops until shown again
    pub fn hide(&self) {
        self.visible.send_replace(false);
        self.compositor.stop();
    }

    /// Tear the display down and stop the session if one is live
    pub async fn unmount(&self) {
        {
            let mut listeners = self.listeners.lock();
            for (kind, callback) in listeners.drain(..) {
                self.controller.events().unregister(kind, &callback);
            }
        }

        if let Some(supervisor) = self.supervisor.lock().take() {
            supervisor.abort();
        }
        self.visible.send_replace(false);
        self.compositor.stop();
        self.init_requested.store(false, Ordering::SeqCst);

        if self.controller.is_ready() {
            self.controller.stop().await;
        }
        self.controller.unbind_display();
        info!("Avatar display unmounted");
    }

    pub fn status(&self) -> DisplayStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<DisplayStatus> {
        self.status.subscribe()
    }

    pub fn is_visible(&self) -> bool {
        *self.visible.borrow()
    }

    pub fn compositor(&self) -> &FrameCompositor {
        &self.compositor
    }

    fn mount(&self) {
        let mut listeners = self.listeners.lock();
        if !listeners.is_empty() {
            return;
        }

        self.controller.bind_display(Arc::clone(&self.sink));

        let bindings = [
            (EventKind::StreamReady, DisplayStatus::Ready),
            (EventKind::SpeakingStarted, DisplayStatus::Speaking),
            (EventKind::SpeakingStopped, DisplayStatus::Ready),
            (EventKind::SpeakingInterrupted, DisplayStatus::Ready),
            (EventKind::SessionError, DisplayStatus::Error),
            (EventKind::StreamDisconnected, DisplayStatus::Loading),
            (EventKind::SessionStopped, DisplayStatus::Loading),
        ];
        for (kind, next) in bindings {
            let status = Arc::clone(&self.status);
            let callback = subscriber(move |_| {
                status.send_replace(next);
                Ok(())
            });
            self.controller.events().register(kind, callback.clone());
            listeners.push((kind, callback));
        }

        let supervisor = tokio::spawn(supervise(
            self.controller.watch_state(),
            self.visible.subscribe(),
            Arc::clone(&self.compositor),
            Arc::clone(&self.source),
            Arc::clone(&self.surface),
        ));
        *self.supervisor.lock() = Some(supervisor);
        debug!("Avatar display mounted");
    }
}

impl Drop for AvatarDisplay {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.abort();
        }
        self.compositor.stop();
    }
}

/// Run the compositor exactly while the session is live and the display visible
async fn supervise(
    mut state: watch::Receiver<SessionState>,
    mut visible: watch::Receiver<bool>,
    compositor: Arc<FrameCompositor>,
    source: Arc<dyn VideoSource>,
    surface: Arc<dyn Surface>,
) {
    loop {
        let live = state.borrow_and_update().is_active();
        let shown = *visible.borrow_and_update();

        if live && shown {
            if !compositor.is_running() {
                if let Err(e) = compositor.start(Arc::clone(&source), Arc::clone(&surface)) {
                    warn!("Compositor failed to start: {}", e);
                }
            }
        } else if compositor.is_running() {
            compositor.stop();
        }

        tokio::select! {
            changed = state.changed() => if changed.is_err() { break },
            changed = visible.changed() => if changed.is_err() { break },
        }
    }
    compositor.stop();
}
