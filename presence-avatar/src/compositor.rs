//! Chroma-key frame compositor
//!
//! Pulls frames from a video source once per refresh tick, makes the solid
//! green backdrop transparent and presents the result on a surface.

use crate::config::{ChromaKey, CompositorConfig};
use crate::error::AvatarError;
use image::RgbaImage;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Decoded video the compositor reads from
pub trait VideoSource: Send + Sync {
    /// Current frame dimensions; `(0, 0)` until metadata has loaded
    fn dimensions(&self) -> (u32, u32);

    /// False while paused or ended
    fn is_playing(&self) -> bool;

    /// Draw the current frame into `frame`, which matches `dimensions()`
    fn draw_frame(&self, frame: &mut RgbaImage) -> Result<(), AvatarError>;
}

/// Presentation target for composited frames
pub trait Surface: Send + Sync {
    fn present(&self, frame: &RgbaImage) -> Result<(), AvatarError>;
}

/// Make every backdrop pixel fully transparent; other pixels are untouched
pub fn remove_backdrop(frame: &mut RgbaImage, key: &ChromaKey) {
    for pixel in frame.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        if key.is_backdrop(r, g, b) {
            pixel.0[3] = 0;
        }
    }
}

/// Allocate a zeroed frame buffer, reporting exhaustion instead of aborting
pub fn allocate_frame(width: u32, height: u32) -> Result<RgbaImage, AvatarError> {
    let len = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| {
            AvatarError::CompositorAllocationFailed(format!("{}x{} frame is too large", width, height))
        })?;

    let mut data = Vec::new();
    data.try_reserve_exact(len).map_err(|e| {
        AvatarError::CompositorAllocationFailed(format!("{}x{} frame: {}", width, height, e))
    })?;
    data.resize(len, 0);

    RgbaImage::from_raw(width, height, data).ok_or_else(|| {
        AvatarError::CompositorAllocationFailed(format!("{}x{} frame buffer mismatch", width, height))
    })
}

/// Owner of the per-frame loop. At most one loop runs per compositor.
pub struct FrameCompositor {
    config: CompositorConfig,
    task: Mutex<Option<JoinHandle<()>>>,
    frames_presented: Arc<AtomicU64>,
}

impl FrameCompositor {
    pub fn new(config: CompositorConfig) -> Self {
        Self {
            config,
            task: Mutex::new(None),
            frames_presented: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start compositing `source` onto `surface`, replacing any running loop
    pub fn start(
        &self,
        source: Arc<dyn VideoSource>,
        surface: Arc<dyn Surface>,
    ) -> Result<(), AvatarError> {
        self.stop();

        let (width, height) = source.dimensions();
        let frame = allocate_frame(width, height)?;
        let period = Duration::from_secs_f64(1.0 / self.config.refresh_rate_hz.max(1) as f64);
        let key = self.config.chroma_key;
        let presented = Arc::clone(&self.frames_presented);

        let handle = tokio::spawn(run_loop(source, surface, frame, period, key, presented));
        *self.task.lock() = Some(handle);

        info!(
            "Compositor started at {} Hz ({}x{})",
            self.config.refresh_rate_hz, width, height
        );
        Ok(())
    }

    /// Cancel the loop. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Compositor loop stopped");
        }
    }

    /// True while a loop is scheduled and has not ended on its own
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Frames presented since construction
    pub fn frames_presented(&self) -> u64 {
        self.frames_presented.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CompositorConfig {
        &self.config
    }
}

impl Drop for FrameCompositor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(
    source: Arc<dyn VideoSource>,
    surface: Arc<dyn Surface>,
    mut frame: RgbaImage,
    period: Duration,
    key: ChromaKey,
    presented: Arc<AtomicU64>,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            continue;
        }

        if frame.dimensions() != (width, height) {
            match allocate_frame(width, height) {
                Ok(resized) => {
                    debug!("Compositor buffer resized to {}x{}", width, height);
                    frame = resized;
                }
                Err(e) => {
                    warn!("Compositor stopped: {}", e);
                    break;
                }
            }
        }

        if !source.is_playing() {
            continue;
        }

        if let Err(e) = source.draw_frame(&mut frame) {
            debug!("Skipping frame: {}", e);
            continue;
        }

        remove_backdrop(&mut frame, &key);

        if let Err(e) = surface.present(&frame) {
            warn!("Compositor stopped, surface unavailable: {}", e);
            break;
        }
        presented.fetch_add(1, Ordering::Relaxed);
    }
}
