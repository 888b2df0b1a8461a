//! Composition root: one head unit with its executor, session manager,
//! frame gate, fallback renderer and (optionally) a device watcher.
//!
//! # Lifetime
//!
//! ```text
//! new:   executor ─> strand ─> sink.start ─> gate ─> renderer ─> session manager
//! drop:  watcher ─> event pump ─> session teardown ─> renderer ─> sink.stop ─> executor
//! ```
//!
//! The executor is created first and shut down last, so every strand job and
//! every bring-up future has a runtime to run on for as long as the session
//! manager exists.  `HeadUnit` must be dropped outside any async context
//! because dropping it shuts that runtime down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use headunit_core::{FrameSource, SurfaceFormat};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::application::bring_up::SessionBackend;
use crate::application::executor::{AsyncExecutor, ExecutorError};
use crate::application::frame_gate::{FrameGate, FrameSink, FrameSinkError};
use crate::application::session_manager::SessionManager;
use crate::infrastructure::config::HeadUnitConfig;
use crate::infrastructure::device_watcher::{DeviceWatcher, WatcherError, WatcherEvent};
use crate::infrastructure::fallback_renderer::{FallbackRenderer, RendererError};

/// How often the event pump re-checks its stop flag.
const PUMP_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum HeadUnitError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("frame sink rejected the fallback format: {0}")]
    Sink(#[from] FrameSinkError),

    #[error(transparent)]
    Renderer(#[from] RendererError),

    #[error(transparent)]
    Watcher(#[from] WatcherError),

    #[error("failed to spawn event pump: {0}")]
    Pump(#[source] std::io::Error),

    /// Detection was requested before a watcher was installed.
    #[error("no device watcher installed")]
    NoWatcher,
}

pub struct HeadUnit {
    session: SessionManager,
    gate: Arc<FrameGate>,
    renderer: Option<FallbackRenderer>,
    watcher: Mutex<Option<DeviceWatcher>>,
    pumps: Mutex<Vec<EventPump>>,
    surface_format: SurfaceFormat,
    shutdown_timeout: Duration,
    // Dropped last: everything above may still post to its runtime.
    executor: AsyncExecutor,
}

struct EventPump {
    running: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl HeadUnit {
    /// Builds and starts every component except the device watcher.
    ///
    /// The sink is started with the fallback surface format and the fallback
    /// renderer begins producing frames at once.
    ///
    /// # Errors
    ///
    /// Returns the first component that fails to start.  Components already
    /// started are stopped again.
    pub fn new(
        config: &HeadUnitConfig,
        backend: Arc<dyn SessionBackend>,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self, HeadUnitError> {
        let shutdown_timeout = config.shutdown_timeout();
        let executor = AsyncExecutor::new(config.executor.worker_threads, shutdown_timeout)?;
        let strand = executor.strand();

        let fallback = config.fallback_config();
        sink.start(fallback.format)?;
        let gate = Arc::new(FrameGate::new(Arc::clone(&sink), FrameSource::Simulated));

        let renderer = match FallbackRenderer::start(Arc::clone(&gate), fallback) {
            Ok(renderer) => renderer,
            Err(e) => {
                sink.stop();
                return Err(e.into());
            }
        };

        let session = SessionManager::new(backend, strand, executor.handle(), Arc::clone(&gate), config.session);
        info!(
            revision = ?config.session.protocol_revision,
            rearm = ?config.session.rearm_policy,
            "head unit ready"
        );

        Ok(Self {
            session,
            gate,
            renderer: Some(renderer),
            watcher: Mutex::new(None),
            pumps: Mutex::new(Vec::new()),
            surface_format: fallback.format,
            shutdown_timeout,
            executor,
        })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Gate in front of the sink; live video is submitted here as
    /// [`FrameSource::Live`](headunit_core::FrameSource::Live).
    pub fn frame_gate(&self) -> &Arc<FrameGate> {
        &self.gate
    }

    /// Handle of the background runtime, for callers that need to block on a
    /// future from a plain thread.
    pub fn runtime(&self) -> Handle {
        self.executor.handle()
    }

    pub fn surface_format(&self) -> SurfaceFormat {
        self.surface_format
    }

    /// Frames the fallback renderer has delivered to the sink.
    pub fn fallback_frames(&self) -> u64 {
        self.renderer.as_ref().map_or(0, FallbackRenderer::frames_rendered)
    }

    /// Forwards watcher events from `events` to the session manager on a
    /// dedicated thread.
    ///
    /// # Errors
    ///
    /// Returns [`HeadUnitError::Pump`] if the thread cannot be spawned.
    pub fn attach_watcher(&self, events: mpsc::Receiver<WatcherEvent>) -> Result<(), HeadUnitError> {
        let running = Arc::new(AtomicBool::new(true));
        let session = self.session.clone();
        let thread = {
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("headunit-events".to_string())
                .spawn(move || pump_events(events, session, running))
                .map_err(HeadUnitError::Pump)?
        };
        self.lock_pumps().push(EventPump { running, thread });
        Ok(())
    }

    /// Installs `watcher` (replacing any previous one) and starts it.
    ///
    /// The watcher's event receiver must have been passed to
    /// [`attach_watcher`](Self::attach_watcher).
    ///
    /// # Errors
    ///
    /// Returns [`HeadUnitError::Watcher`] if the watcher thread cannot start.
    pub fn start_detection(&self, mut watcher: DeviceWatcher) -> Result<(), HeadUnitError> {
        watcher.start()?;
        let previous = self.lock_watcher().replace(watcher);
        drop(previous);
        Ok(())
    }

    /// Starts the installed watcher again after a stop or an error.
    ///
    /// # Errors
    ///
    /// Returns [`HeadUnitError::NoWatcher`] if none was installed.
    pub fn resume_detection(&self) -> Result<(), HeadUnitError> {
        let mut watcher = self.lock_watcher();
        let watcher = watcher.as_mut().ok_or(HeadUnitError::NoWatcher)?;
        watcher.start()?;
        Ok(())
    }

    pub fn stop_detection(&self) {
        if let Some(watcher) = self.lock_watcher().as_mut() {
            watcher.stop();
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.lock_watcher().as_ref().is_some_and(DeviceWatcher::is_detecting)
    }

    fn lock_watcher(&self) -> MutexGuard<'_, Option<DeviceWatcher>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pumps(&self) -> MutexGuard<'_, Vec<EventPump>> {
        self.pumps.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HeadUnit {
    fn drop(&mut self) {
        info!("head unit shutting down");
        if let Some(mut watcher) = self.lock_watcher().take() {
            watcher.stop();
        }
        for pump in self.lock_pumps().drain(..) {
            pump.running.store(false, Ordering::Release);
            if pump.thread.join().is_err() {
                warn!("event pump panicked");
            }
        }

        if !self.session.shutdown(self.shutdown_timeout) {
            warn!(timeout = ?self.shutdown_timeout, "session teardown not confirmed in time");
        }
        if let Some(mut renderer) = self.renderer.take() {
            renderer.stop();
        }
        self.gate.sink().stop();
        self.executor.shutdown();
    }
}

fn pump_events(events: mpsc::Receiver<WatcherEvent>, session: SessionManager, running: Arc<AtomicBool>) {
    while running.load(Ordering::Acquire) {
        match events.recv_timeout(PUMP_WAIT) {
            Ok(WatcherEvent::Attached(identity)) => session.on_device_attached(identity),
            Ok(WatcherEvent::Detached(identity)) => session.on_device_detached(identity),
            Ok(WatcherEvent::Error(message)) => session.report_watcher_error(message),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("event pump exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session_manager::SessionSignal;
    use crate::infrastructure::backend::ScriptedBackend;
    use crate::infrastructure::device_watcher::mock::MockUsbBus;
    use crate::infrastructure::video_surface::VideoSurface;
    use headunit_core::SessionState;

    fn fast_config() -> HeadUnitConfig {
        let mut config = HeadUnitConfig::default();
        config.fallback.frame_interval_ms = 10;
        config.fallback.width = 40;
        config.fallback.height = 24;
        config
    }

    #[test]
    fn test_new_head_unit_is_idle_and_simulating() {
        // Arrange
        let surface = Arc::new(VideoSurface::new());

        // Act
        let head_unit = HeadUnit::new(&fast_config(), Arc::new(ScriptedBackend::new()), surface.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(80));

        // Assert
        assert_eq!(head_unit.session().state(), SessionState::Idle);
        assert!(!head_unit.session().is_connected());
        assert_eq!(head_unit.frame_gate().selected(), FrameSource::Simulated);
        assert!(surface.frames_presented() > 0);
        assert_eq!(surface.format(), Some(head_unit.surface_format()));
    }

    #[test]
    fn test_watcher_events_reach_the_session() {
        // Arrange
        let bus = MockUsbBus::with_hotplug();
        let head_unit =
            HeadUnit::new(&fast_config(), Arc::new(ScriptedBackend::new()), Arc::new(VideoSurface::new())).unwrap();
        let signals = head_unit.session().subscribe();
        let (watcher, events) = DeviceWatcher::new(bus.factory(), Default::default());
        head_unit.attach_watcher(events).unwrap();
        head_unit.start_detection(watcher).unwrap();

        // Act
        std::thread::sleep(Duration::from_millis(50));
        bus.plug(0x18d1, 0x4ee1);

        // Assert
        let connected = std::iter::from_fn(|| signals.recv_timeout(Duration::from_secs(2)).ok())
            .find(|s| matches!(s, SessionSignal::ConnectedChanged(_)));
        assert_eq!(connected, Some(SessionSignal::ConnectedChanged(true)));
        assert_eq!(head_unit.session().current_device().unwrap().as_str(), "18d1:4ee1");
        assert!(head_unit.is_detecting());
    }

    #[test]
    fn test_resume_without_watcher_fails() {
        let head_unit =
            HeadUnit::new(&fast_config(), Arc::new(ScriptedBackend::new()), Arc::new(VideoSurface::new())).unwrap();

        assert!(matches!(head_unit.resume_detection(), Err(HeadUnitError::NoWatcher)));
        head_unit.stop_detection();
        assert!(!head_unit.is_detecting());
    }

    #[test]
    fn test_drop_stops_the_sink() {
        let surface = Arc::new(VideoSurface::new());
        let head_unit = HeadUnit::new(&fast_config(), Arc::new(ScriptedBackend::new()), surface.clone()).unwrap();
        assert!(surface.is_active());

        drop(head_unit);

        assert!(!surface.is_active());
    }
}
