//! Frame sink port and the source gate in front of it.
//!
//! Two producers share one sink: live video from the connected device and the
//! fallback renderer's synthetic frames.  [`FrameGate`] admits frames only from
//! the currently selected [`FrameSource`]; the session manager is the only
//! component that changes the selection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use headunit_core::{FrameSource, PixelFormat, SurfaceFormat, VideoFrame};
use thiserror::Error;
use tracing::{debug, trace};

/// Error type for frame sink operations.
#[derive(Debug, Error, PartialEq)]
pub enum FrameSinkError {
    /// The sink cannot present frames in this pixel format.
    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    /// `present` was called before `start` or after `stop`.
    #[error("frame sink is not active")]
    NotActive,

    /// The frame's buffer does not match its declared format.
    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    /// The frame's format differs from the one the sink was started with.
    #[error("frame format {actual:?} does not match surface format {expected:?}")]
    FormatMismatch {
        expected: SurfaceFormat,
        actual: SurfaceFormat,
    },
}

/// Video presentation surface.
///
/// Implementations must be callable from any thread.
#[cfg_attr(test, mockall::automock)]
pub trait FrameSink: Send + Sync {
    /// Pixel formats accepted by [`start`](Self::start).
    fn supported_formats(&self) -> Vec<PixelFormat>;

    /// Begins accepting frames of `format`.  Restarts the sink if it is
    /// already active.
    fn start(&self, format: SurfaceFormat) -> Result<(), FrameSinkError>;

    /// Stops accepting frames.
    fn stop(&self);

    /// Presents one frame.
    fn present(&self, frame: &VideoFrame) -> Result<(), FrameSinkError>;

    fn is_active(&self) -> bool;
}

/// Routes frames from exactly one selected source into a [`FrameSink`].
pub struct FrameGate {
    sink: Arc<dyn FrameSink>,
    selected: AtomicU8,
    listeners: Mutex<Vec<mpsc::Sender<FrameSource>>>,
}

impl FrameGate {
    pub fn new(sink: Arc<dyn FrameSink>, initial: FrameSource) -> Self {
        Self {
            sink,
            selected: AtomicU8::new(initial as u8),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// The source currently allowed to feed the sink.
    pub fn selected(&self) -> FrameSource {
        FrameSource::try_from(self.selected.load(Ordering::Acquire)).unwrap_or(FrameSource::Simulated)
    }

    /// Switches the admitted source.
    ///
    /// Listeners are notified only when the selection actually changes.
    /// Returns `true` in that case.
    pub fn select(&self, source: FrameSource) -> bool {
        let previous = self.selected.swap(source as u8, Ordering::AcqRel);
        if previous == source as u8 {
            return false;
        }

        debug!(?source, "frame source switched");
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|tx| tx.send(source).is_ok());
        }
        true
    }

    /// Returns a receiver that is sent every new selection.
    pub fn subscribe(&self) -> mpsc::Receiver<FrameSource> {
        let (tx, rx) = mpsc::channel();
        self.add_listener(tx);
        rx
    }

    /// Registers `tx` to be sent every new selection.
    pub fn add_listener(&self, tx: mpsc::Sender<FrameSource>) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(tx);
        }
    }

    /// Presents `frame` if `source` is the selected source and the sink is
    /// ready.  Returns `Ok(true)` if the frame reached the sink.
    ///
    /// # Errors
    ///
    /// Propagates the sink's error for an admitted frame.
    pub fn submit(&self, source: FrameSource, frame: &VideoFrame) -> Result<bool, FrameSinkError> {
        if source != self.selected() {
            trace!(?source, "frame from deselected source dropped");
            return Ok(false);
        }
        if !self.sink.is_active() {
            trace!(?source, "frame sink not ready; frame dropped");
            return Ok(false);
        }
        self.sink.present(frame)?;
        Ok(true)
    }

    pub fn sink(&self) -> &Arc<dyn FrameSink> {
        &self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn frame() -> VideoFrame {
        VideoFrame {
            format: SurfaceFormat::new(1, 1, PixelFormat::Rgb32),
            timestamp: SystemTime::now(),
            data: vec![0; 4],
            caption: None,
        }
    }

    #[test]
    fn test_submit_from_selected_source_reaches_sink() {
        // Arrange
        let mut sink = MockFrameSink::new();
        sink.expect_is_active().return_const(true);
        sink.expect_present().times(1).returning(|_| Ok(()));
        let gate = FrameGate::new(Arc::new(sink), FrameSource::Simulated);

        // Act
        let presented = gate.submit(FrameSource::Simulated, &frame()).unwrap();

        // Assert
        assert!(presented);
    }

    #[test]
    fn test_submit_from_other_source_is_dropped() {
        let mut sink = MockFrameSink::new();
        sink.expect_present().never();
        let gate = FrameGate::new(Arc::new(sink), FrameSource::Simulated);

        assert_eq!(gate.submit(FrameSource::Live, &frame()), Ok(false));
    }

    #[test]
    fn test_submit_to_inactive_sink_is_dropped_silently() {
        let mut sink = MockFrameSink::new();
        sink.expect_is_active().return_const(false);
        sink.expect_present().never();
        let gate = FrameGate::new(Arc::new(sink), FrameSource::Live);

        assert_eq!(gate.submit(FrameSource::Live, &frame()), Ok(false));
    }

    #[test]
    fn test_sink_error_is_propagated() {
        let mut sink = MockFrameSink::new();
        sink.expect_is_active().return_const(true);
        sink.expect_present().returning(|_| Err(FrameSinkError::NotActive));
        let gate = FrameGate::new(Arc::new(sink), FrameSource::Live);

        assert_eq!(gate.submit(FrameSource::Live, &frame()), Err(FrameSinkError::NotActive));
    }

    #[test]
    fn test_select_notifies_listeners_only_on_change() {
        // Arrange
        let gate = FrameGate::new(Arc::new(MockFrameSink::new()), FrameSource::Simulated);
        let rx = gate.subscribe();

        // Act
        assert!(!gate.select(FrameSource::Simulated));
        assert!(gate.select(FrameSource::Live));
        assert!(gate.select(FrameSource::Simulated));

        // Assert
        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(seen, vec![FrameSource::Live, FrameSource::Simulated]);
        assert_eq!(gate.selected(), FrameSource::Simulated);
    }
}
