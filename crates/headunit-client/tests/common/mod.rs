//! Shared harness for the headunit-client integration tests.
//!
//! Builds a real [`HeadUnit`] (executor, strand, renderer, session manager)
//! around a [`ScriptedBackend`] and an in-memory [`VideoSurface`], and offers
//! polling helpers so tests never depend on exact thread timing.

#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use headunit_client::application::protocol_handler::ProtocolSettings;
use headunit_client::application::session_manager::{SessionManager, SessionSignal};
use headunit_client::infrastructure::backend::{MockControlChannel, ScriptedBackend};
use headunit_client::infrastructure::config::HeadUnitConfig;
use headunit_client::infrastructure::video_surface::VideoSurface;
use headunit_client::HeadUnit;
use headunit_core::{DeviceIdentity, SessionState};

/// Generous upper bound for anything that should happen "soon".
pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Fallback cadence used by the harness.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(10);

pub struct Harness {
    pub backend: ScriptedBackend,
    pub surface: Arc<VideoSurface>,
    pub signals: mpsc::Receiver<SessionSignal>,
    pub head_unit: HeadUnit,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(ProtocolSettings::default())
    }

    pub fn with_settings(settings: ProtocolSettings) -> Self {
        let mut config = HeadUnitConfig::default();
        config.session = settings;
        config.executor.worker_threads = 2;
        config.fallback.frame_interval_ms = FRAME_INTERVAL.as_millis() as u64;
        config.fallback.width = 40;
        config.fallback.height = 24;

        let backend = ScriptedBackend::new();
        let surface = Arc::new(VideoSurface::new());
        let head_unit =
            HeadUnit::new(&config, Arc::new(backend.clone()), surface.clone()).expect("head unit starts");
        let signals = head_unit.session().subscribe();

        Self {
            backend,
            surface,
            signals,
            head_unit,
        }
    }

    pub fn session(&self) -> &SessionManager {
        self.head_unit.session()
    }

    pub fn attach(&self, id: &str) {
        self.session().on_device_attached(DeviceIdentity::new(id));
    }

    pub fn detach(&self, id: &str) {
        self.session().on_device_detached(DeviceIdentity::new(id));
    }

    /// Attaches `id`, waits for the session to become active with one receive
    /// armed, and returns its control channel.
    pub fn connect(&self, id: &str) -> Arc<MockControlChannel> {
        self.attach(id);
        let identity = DeviceIdentity::new(id);
        assert!(
            wait_until(TIMEOUT, || {
                self.session().is_connected() && self.session().current_device().as_ref() == Some(&identity)
            }),
            "session for {id} never became active; events: {:?}",
            self.backend.events()
        );
        let channel = self.backend.channel_for(&identity).expect("control channel created");
        assert!(wait_until(TIMEOUT, || channel.pending_receives() == 1));
        channel
    }

    pub fn wait_for_state(&self, state: SessionState) -> bool {
        wait_until(TIMEOUT, || self.session().state() == state)
    }

    /// Waits for the first signal matching `pred`, discarding the others.
    pub fn wait_for_signal(&self, pred: impl Fn(&SessionSignal) -> bool) -> Option<SessionSignal> {
        let deadline = Instant::now() + TIMEOUT;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.signals.recv_timeout(left) {
                Ok(signal) if pred(&signal) => return Some(signal),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    /// Everything signalled so far, after letting in-flight work settle.
    pub fn drain_signals(&self) -> Vec<SessionSignal> {
        std::thread::sleep(Duration::from_millis(50));
        self.signals.try_iter().collect()
    }
}

/// Polls `check` every few milliseconds until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// Counts `ConnectedChanged(value)` signals in `signals`.
pub fn connected_changes(signals: &[SessionSignal], value: bool) -> usize {
    signals
        .iter()
        .filter(|s| **s == SessionSignal::ConnectedChanged(value))
        .count()
}
