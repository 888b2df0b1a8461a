//! Synthetic "waiting for connection" frame producer.
//!
//! While [`FrameSource::Simulated`] is selected on the frame gate, a
//! dedicated thread renders one frame per `frame_interval`: a black frame with
//! a white progress block that moves a step to the right every frame, and the
//! caption `"Waiting for Android Auto connection\nHH:MM:SS"` in local time.
//!
//! The thread listens for selection changes on the gate.  Switching back to
//! `Simulated` wakes it so the first frame appears immediately instead of one
//! interval later.  It never touches the device or the control channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Local};
use headunit_core::{FrameSource, PixelFormat, SurfaceFormat, VideoFrame};
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::application::frame_gate::FrameGate;

/// First line of the fallback caption.
pub const WAITING_MESSAGE: &str = "Waiting for Android Auto connection";

/// Longest the thread sleeps before re-checking its stop flag.
const MAX_WAIT: Duration = Duration::from_millis(100);

const BLACK: u32 = 0xFF00_0000;
const WHITE: u32 = 0xFFFF_FFFF;

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("failed to spawn renderer thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackConfig {
    pub frame_interval: Duration,
    pub format: SurfaceFormat,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(100),
            format: SurfaceFormat::new(800, 480, PixelFormat::Rgb32),
        }
    }
}

/// Owns the renderer thread.  Dropping it stops and joins the thread.
pub struct FallbackRenderer {
    running: Arc<AtomicBool>,
    wake: mpsc::Sender<FrameSource>,
    frames_rendered: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl FallbackRenderer {
    /// Starts the renderer thread on `gate`.
    ///
    /// # Errors
    ///
    /// Returns [`RendererError::Spawn`] if the thread cannot be created.
    pub fn start(gate: Arc<FrameGate>, config: FallbackConfig) -> Result<Self, RendererError> {
        let (wake, wake_rx) = mpsc::channel();
        gate.add_listener(wake.clone());

        let running = Arc::new(AtomicBool::new(true));
        let frames_rendered = Arc::new(AtomicU64::new(0));

        let thread = {
            let running = Arc::clone(&running);
            let frames_rendered = Arc::clone(&frames_rendered);
            std::thread::Builder::new()
                .name("headunit-fallback".to_string())
                .spawn(move || render_loop(gate, config, wake_rx, running, frames_rendered))?
        };

        info!(interval = ?config.frame_interval, "fallback renderer started");
        Ok(Self {
            running,
            wake,
            frames_rendered,
            thread: Some(thread),
        })
    }

    /// Frames that reached the sink so far.
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Acquire)
    }

    /// Stops and joins the thread.  Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        // Any value wakes the loop so it sees the flag without waiting.
        let _ = self.wake.send(FrameSource::Live);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("fallback renderer stopped");
        }
    }
}

impl Drop for FallbackRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn render_loop(
    gate: Arc<FrameGate>,
    config: FallbackConfig,
    wake: mpsc::Receiver<FrameSource>,
    running: Arc<AtomicBool>,
    frames_rendered: Arc<AtomicU64>,
) {
    let mut tick: u64 = 0;
    let mut next_frame = Instant::now();

    while running.load(Ordering::Acquire) {
        let mut wait = MAX_WAIT;

        if gate.selected() == FrameSource::Simulated {
            let now = Instant::now();
            if now >= next_frame {
                let frame = render_waiting_frame(config.format, tick, Local::now());
                match gate.submit(FrameSource::Simulated, &frame) {
                    Ok(true) => {
                        frames_rendered.fetch_add(1, Ordering::AcqRel);
                    }
                    Ok(false) => {}
                    Err(e) => trace!(error = %e, "fallback frame rejected by sink"),
                }
                tick = tick.wrapping_add(1);
                next_frame = now + config.frame_interval;
            }
            wait = next_frame.saturating_duration_since(Instant::now()).min(MAX_WAIT);
        }

        match wake.recv_timeout(wait) {
            Ok(FrameSource::Simulated) => {
                debug!("fallback enabled");
                next_frame = Instant::now();
            }
            Ok(FrameSource::Live) => trace!("fallback disabled"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("fallback renderer thread exiting");
}

/// Renders one "waiting" frame.
///
/// The progress block is a tenth of the frame wide and advances by its own
/// width every tick, wrapping at the right edge.
pub fn render_waiting_frame(format: SurfaceFormat, tick: u64, now: DateTime<Local>) -> VideoFrame {
    let width = format.width as usize;
    let height = format.height as usize;
    let bpp = format.pixel_format.bytes_per_pixel();

    let mut data = Vec::with_capacity(format.frame_len());
    for _ in 0..width * height {
        data.extend_from_slice(&BLACK.to_ne_bytes());
    }

    let block_w = (width / 10).max(1);
    let block_h = (height / 24).max(1);
    let lanes = (width / block_w).max(1) as u64;
    let x0 = (tick % lanes) as usize * block_w;
    let y0 = height.saturating_sub(block_h) * 3 / 4;

    for y in y0..(y0 + block_h).min(height) {
        for x in x0..(x0 + block_w).min(width) {
            let at = (y * width + x) * bpp;
            data[at..at + bpp].copy_from_slice(&WHITE.to_ne_bytes());
        }
    }

    VideoFrame {
        format,
        timestamp: SystemTime::now(),
        data,
        caption: Some(format!("{WAITING_MESSAGE}\n{}", now.format("%H:%M:%S"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::frame_gate::FrameSink;
    use crate::infrastructure::video_surface::VideoSurface;
    use chrono::TimeZone;

    fn small_format() -> SurfaceFormat {
        SurfaceFormat::new(20, 10, PixelFormat::Rgb32)
    }

    fn pixel(frame: &VideoFrame, x: usize, y: usize) -> u32 {
        let at = (y * frame.format.width as usize + x) * 4;
        u32::from_ne_bytes(frame.data[at..at + 4].try_into().unwrap())
    }

    fn white_columns(frame: &VideoFrame) -> Vec<usize> {
        let width = frame.format.width as usize;
        let height = frame.format.height as usize;
        (0..width)
            .filter(|&x| (0..height).any(|y| pixel(frame, x, y) == WHITE))
            .collect()
    }

    #[test]
    fn test_waiting_frame_is_valid_with_caption() {
        // Arrange
        let at = Local.with_ymd_and_hms(2024, 5, 1, 7, 8, 9).unwrap();

        // Act
        let frame = render_waiting_frame(FallbackConfig::default().format, 0, at);

        // Assert
        assert!(frame.is_valid());
        assert_eq!(frame.format.width, 800);
        assert_eq!(frame.caption.as_deref(), Some("Waiting for Android Auto connection\n07:08:09"));
    }

    #[test]
    fn test_progress_block_advances_and_wraps() {
        let now = Local::now();
        let first = white_columns(&render_waiting_frame(small_format(), 0, now));
        let second = white_columns(&render_waiting_frame(small_format(), 1, now));
        let wrapped = white_columns(&render_waiting_frame(small_format(), 10, now));

        assert_eq!(first, vec![0, 1]);
        assert_eq!(second, vec![2, 3]);
        assert_eq!(wrapped, first);
    }

    #[test]
    fn test_background_is_black() {
        let frame = render_waiting_frame(small_format(), 0, Local::now());
        assert_eq!(pixel(&frame, 19, 0), BLACK);
    }

    #[test]
    fn test_renderer_feeds_sink_only_while_simulated() {
        // Arrange
        let surface = Arc::new(VideoSurface::new());
        surface.start(small_format()).unwrap();
        let gate = Arc::new(FrameGate::new(surface.clone(), FrameSource::Simulated));
        let config = FallbackConfig {
            frame_interval: Duration::from_millis(10),
            format: small_format(),
        };

        // Act
        let mut renderer = FallbackRenderer::start(Arc::clone(&gate), config).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        gate.select(FrameSource::Live);
        std::thread::sleep(Duration::from_millis(30));
        let while_live = surface.frames_presented();
        std::thread::sleep(Duration::from_millis(100));

        // Assert
        assert!(while_live >= 3, "expected frames while simulated, got {while_live}");
        assert_eq!(surface.frames_presented(), while_live);
        renderer.stop();
    }

    #[test]
    fn test_reenabling_renders_immediately() {
        // Arrange – a long interval so only the wake-up can explain a new frame
        let surface = Arc::new(VideoSurface::new());
        surface.start(small_format()).unwrap();
        let gate = Arc::new(FrameGate::new(surface.clone(), FrameSource::Live));
        let config = FallbackConfig {
            frame_interval: Duration::from_secs(10),
            format: small_format(),
        };
        let renderer = FallbackRenderer::start(Arc::clone(&gate), config).unwrap();

        // Act
        gate.select(FrameSource::Simulated);
        std::thread::sleep(Duration::from_millis(80));

        // Assert
        assert_eq!(renderer.frames_rendered(), 1);
    }

    #[test]
    fn test_stop_joins_promptly() {
        let surface = Arc::new(VideoSurface::new());
        let gate = Arc::new(FrameGate::new(surface, FrameSource::Simulated));
        let mut renderer = FallbackRenderer::start(gate, FallbackConfig::default()).unwrap();

        let started = Instant::now();
        renderer.stop();
        renderer.stop();

        assert!(started.elapsed() < Duration::from_millis(300));
    }
}
