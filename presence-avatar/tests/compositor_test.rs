//! Frame compositor loop tests

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;
use presence_avatar::{
    AvatarError, ChromaKey, CompositorConfig, FrameCompositor, Surface, VideoSource,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const GREEN: Rgba<u8> = Rgba([10, 200, 10, 255]);
const RED: Rgba<u8> = Rgba([200, 50, 50, 255]);

/// Left half green backdrop, right half red subject
struct TestSource {
    dimensions: Mutex<(u32, u32)>,
    playing: AtomicBool,
}

impl TestSource {
    fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            dimensions: Mutex::new((width, height)),
            playing: AtomicBool::new(true),
        })
    }
}

impl VideoSource for TestSource {
    fn dimensions(&self) -> (u32, u32) {
        *self.dimensions.lock()
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn draw_frame(&self, frame: &mut RgbaImage) -> Result<(), AvatarError> {
        let width = frame.width();
        for (x, _, pixel) in frame.enumerate_pixels_mut() {
            *pixel = if x < width / 2 { GREEN } else { RED };
        }
        Ok(())
    }
}

#[derive(Default)]
struct TestSurface {
    last: Mutex<Option<RgbaImage>>,
    presented: AtomicUsize,
    fail: AtomicBool,
}

impl Surface for TestSurface {
    fn present(&self, frame: &RgbaImage) -> Result<(), AvatarError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AvatarError::Provider("surface detached".to_string()));
        }
        *self.last.lock() = Some(frame.clone());
        self.presented.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn fast_compositor() -> FrameCompositor {
    FrameCompositor::new(CompositorConfig {
        refresh_rate_hz: 200,
        chroma_key: ChromaKey::default(),
    })
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test]
async fn test_loop_presents_keyed_frames() {
    let compositor = fast_compositor();
    let source = TestSource::new(4, 2);
    let surface = Arc::new(TestSurface::default());

    compositor.start(source.clone(), surface.clone()).unwrap();
    assert!(compositor.is_running());
    assert!(wait_for(|| surface.presented.load(Ordering::SeqCst) >= 2).await);
    compositor.stop();

    let frame = surface.last.lock().clone().unwrap();
    assert_eq!(frame.dimensions(), (4, 2));
    assert_eq!(frame.get_pixel(0, 0).0, [10, 200, 10, 0]);
    assert_eq!(frame.get_pixel(3, 1).0, [200, 50, 50, 255]);
    assert!(compositor.frames_presented() >= 2);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let compositor = fast_compositor();
    compositor.stop();

    compositor
        .start(TestSource::new(2, 2), Arc::new(TestSurface::default()))
        .unwrap();
    compositor.stop();
    compositor.stop();

    assert!(!compositor.is_running());
}

#[tokio::test]
async fn test_no_frames_after_stop() {
    let compositor = fast_compositor();
    let surface = Arc::new(TestSurface::default());
    compositor.start(TestSource::new(2, 2), surface.clone()).unwrap();
    assert!(wait_for(|| surface.presented.load(Ordering::SeqCst) >= 1).await);

    compositor.stop();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let presented = surface.presented.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(surface.presented.load(Ordering::SeqCst), presented);
}

#[tokio::test]
async fn test_buffer_follows_source_dimensions() {
    let compositor = fast_compositor();
    let source = TestSource::new(2, 2);
    let surface = Arc::new(TestSurface::default());
    compositor.start(source.clone(), surface.clone()).unwrap();
    assert!(wait_for(|| surface.presented.load(Ordering::SeqCst) >= 1).await);

    *source.dimensions.lock() = (6, 3);
    assert!(
        wait_for(|| {
            surface
                .last
                .lock()
                .as_ref()
                .map(|frame| frame.dimensions() == (6, 3))
                .unwrap_or(false)
        })
        .await
    );
    compositor.stop();
}

#[tokio::test]
async fn test_skips_until_metadata_and_while_paused() {
    let compositor = fast_compositor();
    let source = TestSource::new(0, 0);
    let surface = Arc::new(TestSurface::default());
    compositor.start(source.clone(), surface.clone()).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(surface.presented.load(Ordering::SeqCst), 0);
    assert!(compositor.is_running());

    source.playing.store(false, Ordering::SeqCst);
    *source.dimensions.lock() = (2, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(surface.presented.load(Ordering::SeqCst), 0);

    source.playing.store(true, Ordering::SeqCst);
    assert!(wait_for(|| surface.presented.load(Ordering::SeqCst) >= 1).await);
    compositor.stop();
}

#[tokio::test]
async fn test_surface_failure_ends_loop() {
    let compositor = fast_compositor();
    let surface = Arc::new(TestSurface::default());
    surface.fail.store(true, Ordering::SeqCst);

    compositor.start(TestSource::new(2, 2), surface.clone()).unwrap();
    assert!(wait_for(|| !compositor.is_running()).await);
    assert_eq!(surface.presented.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_restart_replaces_previous_loop() {
    let compositor = fast_compositor();
    let first = Arc::new(TestSurface::default());
    let second = Arc::new(TestSurface::default());

    compositor.start(TestSource::new(2, 2), first.clone()).unwrap();
    compositor.start(TestSource::new(2, 2), second.clone()).unwrap();
    assert!(wait_for(|| second.presented.load(Ordering::SeqCst) >= 2).await);

    let before = first.presented.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(first.presented.load(Ordering::SeqCst), before);
    compositor.stop();
}

#[tokio::test]
async fn test_oversized_source_fails_to_start() {
    let compositor = fast_compositor();
    let result = compositor.start(
        TestSource::new(u32::MAX, u32::MAX),
        Arc::new(TestSurface::default()),
    );

    assert!(matches!(result, Err(AvatarError::CompositorAllocationFailed(_))));
    assert!(!compositor.is_running());
}
