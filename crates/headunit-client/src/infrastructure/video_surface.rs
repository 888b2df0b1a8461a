//! In-memory video surface.
//!
//! Implements [`FrameSink`] with format negotiation: `start` accepts only the
//! 32-bit RGB layouts, a second `start` restarts the surface with the new
//! format, and `present` rejects frames while stopped or when the buffer does
//! not match the negotiated format.  The most recent frame is kept so the
//! controlling layer (or a test) can inspect what is on screen.

use std::sync::{Mutex, MutexGuard, PoisonError};

use headunit_core::{PixelFormat, SurfaceFormat, VideoFrame};
use tracing::{debug, info};

use crate::application::frame_gate::{FrameSink, FrameSinkError};

const SUPPORTED_FORMATS: [PixelFormat; 3] = [
    PixelFormat::Rgb32,
    PixelFormat::Argb32,
    PixelFormat::Argb32Premultiplied,
];

#[derive(Default)]
struct SurfaceState {
    format: Option<SurfaceFormat>,
    last_frame: Option<VideoFrame>,
    frames_presented: u64,
}

#[derive(Default)]
pub struct VideoSurface {
    state: Mutex<SurfaceState>,
}

impl VideoSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Format negotiated by the last successful `start`.
    pub fn format(&self) -> Option<SurfaceFormat> {
        self.state().format
    }

    pub fn last_frame(&self) -> Option<VideoFrame> {
        self.state().last_frame.clone()
    }

    /// Total frames accepted since construction.
    pub fn frames_presented(&self) -> u64 {
        self.state().frames_presented
    }

    fn state(&self) -> MutexGuard<'_, SurfaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FrameSink for VideoSurface {
    fn supported_formats(&self) -> Vec<PixelFormat> {
        SUPPORTED_FORMATS.to_vec()
    }

    fn start(&self, format: SurfaceFormat) -> Result<(), FrameSinkError> {
        if !SUPPORTED_FORMATS.contains(&format.pixel_format) {
            return Err(FrameSinkError::UnsupportedFormat(format.pixel_format));
        }
        let mut state = self.state();
        if state.format.is_some() {
            debug!("video surface restarting");
        }
        state.format = Some(format);
        state.last_frame = None;
        info!(width = format.width, height = format.height, pixel_format = ?format.pixel_format, "video surface started");
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state();
        if state.format.take().is_some() {
            info!("video surface stopped");
        }
    }

    fn present(&self, frame: &VideoFrame) -> Result<(), FrameSinkError> {
        let mut state = self.state();
        let Some(format) = state.format else {
            return Err(FrameSinkError::NotActive);
        };
        if frame.format != format {
            return Err(FrameSinkError::FormatMismatch {
                expected: format,
                actual: frame.format,
            });
        }
        if !frame.is_valid() {
            return Err(FrameSinkError::InvalidFrame {
                expected: frame.format.frame_len(),
                actual: frame.data.len(),
            });
        }

        state.last_frame = Some(frame.clone());
        state.frames_presented += 1;
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state().format.is_some()
    }
}
