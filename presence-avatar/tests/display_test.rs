//! Display driver: initialization on show, status tracking, compositor supervision

mod common;

use common::{wait_for, MockProvider, MockTokens, RecordingSink};
use image::RgbaImage;
use presence_avatar::{
    AvatarDisplay, AvatarError, AvatarStreamConfig, DisplayStatus, EventKind, ProviderEvent,
    SessionController, SessionState, Surface, VideoSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct StillSource;

impl VideoSource for StillSource {
    fn dimensions(&self) -> (u32, u32) {
        (2, 2)
    }

    fn is_playing(&self) -> bool {
        true
    }

    fn draw_frame(&self, _frame: &mut RgbaImage) -> Result<(), AvatarError> {
        Ok(())
    }
}

#[derive(Default)]
struct CountingSurface {
    presented: AtomicUsize,
}

impl Surface for CountingSurface {
    fn present(&self, _frame: &RgbaImage) -> Result<(), AvatarError> {
        self.presented.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Fixture {
    provider: Arc<MockProvider>,
    controller: Arc<SessionController>,
    sink: Arc<RecordingSink>,
    display: AvatarDisplay,
}

fn fixture(tokens: MockTokens) -> Fixture {
    let provider = Arc::new(MockProvider::default());
    let mut config = AvatarStreamConfig::default();
    config.compositor.refresh_rate_hz = 200;
    let controller = Arc::new(
        SessionController::new(config, Arc::new(tokens), provider.clone()).unwrap(),
    );
    let sink = Arc::new(RecordingSink::default());
    let display = AvatarDisplay::new(
        controller.clone(),
        sink.clone(),
        Arc::new(StillSource),
        Arc::new(CountingSurface::default()),
    );
    Fixture {
        provider,
        controller,
        sink,
        display,
    }
}

#[tokio::test]
async fn test_show_initializes_once_and_plays_stream() {
    let f = fixture(MockTokens::default());
    assert_eq!(f.display.status(), DisplayStatus::Loading);

    f.display.show();
    f.display.show();

    assert!(wait_for(|| f.display.status() == DisplayStatus::Ready).await);
    assert_eq!(f.provider.creates(), 1);
    assert!(f.sink.stream.lock().is_some());
    assert_eq!(f.sink.plays.load(Ordering::SeqCst), 1);
    assert!(wait_for(|| f.display.compositor().is_running()).await);
}

#[tokio::test]
async fn test_status_tracks_speaking() {
    let f = fixture(MockTokens::default());
    f.display.show();
    assert!(wait_for(|| f.display.status() == DisplayStatus::Ready).await);

    f.provider.send(ProviderEvent::StartedTalking).await;
    assert!(wait_for(|| f.display.status() == DisplayStatus::Speaking).await);

    f.provider.send(ProviderEvent::StoppedTalking).await;
    assert!(wait_for(|| f.display.status() == DisplayStatus::Ready).await);
}

#[tokio::test]
async fn test_initialization_failure_shows_error() {
    let f = fixture(MockTokens::failing());
    f.display.show();

    assert!(wait_for(|| f.display.status() == DisplayStatus::Error).await);
    assert_eq!(f.controller.state(), SessionState::Failed);
    assert!(!f.display.compositor().is_running());
}

#[tokio::test]
async fn test_compositor_runs_only_while_visible_and_live() {
    let f = fixture(MockTokens::default());
    f.display.show();
    assert!(wait_for(|| f.display.compositor().is_running()).await);

    f.display.hide();
    assert!(!f.display.is_visible());
    assert!(!f.display.compositor().is_running());

    f.display.show();
    assert!(wait_for(|| f.display.compositor().is_running()).await);
    assert_eq!(f.provider.creates(), 1);

    f.provider.send(ProviderEvent::Disconnected).await;
    assert!(wait_for(|| !f.display.compositor().is_running()).await);
    assert_eq!(f.display.status(), DisplayStatus::Loading);
}

#[tokio::test]
async fn test_unmount_stops_session_and_unregisters() {
    let f = fixture(MockTokens::default());
    f.display.show();
    assert!(wait_for(|| f.controller.is_ready()).await);

    f.display.unmount().await;

    assert_eq!(f.controller.state(), SessionState::Disconnected);
    assert_eq!(f.provider.stops(), 1);
    assert!(!f.display.compositor().is_running());
    for kind in EventKind::ALL {
        assert_eq!(f.controller.events().listener_count(kind), 0);
    }
}

#[tokio::test]
async fn test_status_returns_to_loading_after_stop() {
    let f = fixture(MockTokens::default());
    f.display.show();
    assert!(wait_for(|| f.display.status() == DisplayStatus::Ready).await);

    f.controller.stop().await;

    assert_eq!(f.display.status(), DisplayStatus::Loading);
    assert!(wait_for(|| !f.display.compositor().is_running()).await);
}
