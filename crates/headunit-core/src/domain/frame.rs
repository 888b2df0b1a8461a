//! Video frames and the frame-source selector.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Pixel layouts accepted by the frame sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 32-bit `0xffRRGGBB`.
    Rgb32,
    /// 32-bit `0xAARRGGBB`.
    Argb32,
    /// 32-bit `0xAARRGGBB` with colour channels multiplied by alpha.
    Argb32Premultiplied,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb32 | PixelFormat::Argb32 | PixelFormat::Argb32Premultiplied => 4,
        }
    }
}

/// Frame size and pixel layout negotiated when a sink is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

impl SurfaceFormat {
    pub fn new(width: u32, height: u32, pixel_format: PixelFormat) -> Self {
        Self { width, height, pixel_format }
    }

    /// Number of bytes one frame of this format occupies.
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.pixel_format.bytes_per_pixel()
    }
}

/// One timestamped video frame.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFrame {
    pub format: SurfaceFormat,
    /// Wall-clock time the frame was produced.
    pub timestamp: SystemTime,
    /// Packed pixels, row-major, `format.frame_len()` bytes.
    pub data: Vec<u8>,
    /// Text overlay requested by the producer, if any.
    pub caption: Option<String>,
}

impl VideoFrame {
    /// A frame is valid when it has pixels and its buffer matches its format.
    pub fn is_valid(&self) -> bool {
        let expected = self.format.frame_len();
        expected > 0 && self.data.len() == expected
    }
}

/// The producer currently allowed to feed the frame sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameSource {
    /// Frames decoded from the connected device.
    Live = 0x01,
    /// Synthetic "waiting" frames from the fallback renderer.
    Simulated = 0x02,
}

impl TryFrom<u8> for FrameSource {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameSource::Live),
            0x02 => Ok(FrameSource::Simulated),
            _ => Err(()),
        }
    }
}
