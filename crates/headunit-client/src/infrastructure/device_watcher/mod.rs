//! USB device watcher.
//!
//! Runs on its own thread and turns the enumerator's view of the bus into a
//! stream of [`WatcherEvent`]s.  Two modes, picked per run from the
//! enumerator's capabilities:
//!
//! - **Hot-plug**: the enumerator delivers arrive/leave notifications.  The
//!   loop waits at most `event_wait` per iteration so `stop()` is seen
//!   promptly.  Events carry a `vvvv:pppp` identity.
//! - **Polling**: every `poll_interval` the device count is compared with the
//!   previous count (initially 0).  Any change emits `Attached("generic")`.
//!   This mode only knows *that* something changed, not what.
//!
//! Any enumerator error is reported once as [`WatcherEvent::Error`] and ends
//! the thread; the watcher does not retry on its own.

pub mod mock;
pub mod sysfs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use headunit_core::DeviceIdentity;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest single wait of either loop between stop-flag checks.
pub const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Error type for device detection.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WatcherError {
    #[error("failed to initialise USB context: {0}")]
    Init(String),

    #[error("failed to get device list: {0}")]
    DeviceList(String),

    #[error("failed to register hotplug callback: {0}")]
    HotplugRegistration(String),

    #[error("failed to handle USB events: {0}")]
    EventHandling(String),

    #[error("failed to spawn watcher thread: {0}")]
    Spawn(String),
}

/// A raw hot-plug notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived { vendor_id: u16, product_id: u16 },
    Left { vendor_id: u16, product_id: u16 },
}

/// Normalized watcher output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Attached(DeviceIdentity),
    Detached(DeviceIdentity),
    Error(String),
}

/// Access to the USB bus.
///
/// One enumerator is created per watcher run, on the watcher thread.
pub trait UsbEnumerator: Send {
    fn supports_hotplug(&self) -> bool;

    /// Number of devices currently on the bus.
    fn device_count(&mut self) -> Result<usize, WatcherError>;

    fn register_hotplug(&mut self) -> Result<(), WatcherError>;

    /// Waits up to `timeout` for hot-plug notifications.
    fn poll_hotplug(&mut self, timeout: Duration) -> Result<Vec<HotplugEvent>, WatcherError>;

    fn deregister_hotplug(&mut self);
}

/// Creates a fresh enumerator for each watcher run.
pub type EnumeratorFactory = Arc<dyn Fn() -> Result<Box<dyn UsbEnumerator>, WatcherError> + Send + Sync>;

/// Timing of the watcher loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceWatcherConfig {
    pub poll_interval: Duration,
    pub event_wait: Duration,
}

impl Default for DeviceWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            event_wait: Duration::from_millis(100),
        }
    }
}

/// Owns the watcher thread.  Dropping the watcher stops it.
pub struct DeviceWatcher {
    factory: EnumeratorFactory,
    config: DeviceWatcherConfig,
    events: mpsc::Sender<WatcherEvent>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWatcher {
    /// Creates a stopped watcher and the receiver its events are sent to.
    pub fn new(factory: EnumeratorFactory, config: DeviceWatcherConfig) -> (Self, mpsc::Receiver<WatcherEvent>) {
        let (events, rx) = mpsc::channel();
        let watcher = Self {
            factory,
            config,
            events,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        };
        (watcher, rx)
    }

    /// Starts detection.  A no-op while already detecting.
    ///
    /// # Errors
    ///
    /// Returns [`WatcherError::Spawn`] if the thread cannot be created.
    /// Enumerator failures are reported on the event stream instead.
    pub fn start(&mut self) -> Result<(), WatcherError> {
        if self.is_detecting() {
            debug!("device watcher already running");
            return Ok(());
        }
        // Reap a thread that ended on its own after an error.
        self.join();

        self.running.store(true, Ordering::Release);
        let factory = Arc::clone(&self.factory);
        let config = self.config;
        let events = self.events.clone();
        let running = Arc::clone(&self.running);

        let spawned = std::thread::Builder::new()
            .name("headunit-usb".to_string())
            .spawn(move || watch(factory, config, events, running));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                info!("device detection started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(WatcherError::Spawn(e.to_string()))
            }
        }
    }

    /// Stops detection and joins the thread.  A no-op while stopped.
    pub fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.join();
        if was_running {
            info!("device detection stopped");
        }
    }

    pub fn is_detecting(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("device watcher thread panicked");
            }
        }
    }
}

impl Drop for DeviceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Watcher thread ────────────────────────────────────────────────────────────

fn watch(
    factory: EnumeratorFactory,
    config: DeviceWatcherConfig,
    events: mpsc::Sender<WatcherEvent>,
    running: Arc<AtomicBool>,
) {
    let result = factory().and_then(|mut enumerator| {
        if enumerator.supports_hotplug() {
            debug!("watching for hot-plug events");
            let wait = config.event_wait.clamp(Duration::from_millis(1), STOP_CHECK_INTERVAL);
            hotplug_loop(enumerator.as_mut(), wait, &events, &running)
        } else {
            debug!(interval = ?config.poll_interval, "hot-plug unsupported; polling device count");
            poll_loop(enumerator.as_mut(), config.poll_interval, &events, &running)
        }
    });

    if let Err(e) = result {
        warn!(error = %e, "device detection failed");
        let _ = events.send(WatcherEvent::Error(e.to_string()));
    }
    running.store(false, Ordering::Release);
    debug!("device watcher thread exiting");
}

fn hotplug_loop(
    enumerator: &mut dyn UsbEnumerator,
    wait: Duration,
    events: &mpsc::Sender<WatcherEvent>,
    running: &AtomicBool,
) -> Result<(), WatcherError> {
    enumerator.register_hotplug()?;

    let result = (|| -> Result<(), WatcherError> {
        while running.load(Ordering::Acquire) {
            for event in enumerator.poll_hotplug(wait)? {
                let normalized = match event {
                    HotplugEvent::Arrived { vendor_id, product_id } => {
                        WatcherEvent::Attached(DeviceIdentity::from_usb_ids(vendor_id, product_id))
                    }
                    HotplugEvent::Left { vendor_id, product_id } => {
                        WatcherEvent::Detached(DeviceIdentity::from_usb_ids(vendor_id, product_id))
                    }
                };
                debug!(event = ?normalized, "hot-plug event");
                if events.send(normalized).is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    })();

    enumerator.deregister_hotplug();
    result
}

fn poll_loop(
    enumerator: &mut dyn UsbEnumerator,
    interval: Duration,
    events: &mpsc::Sender<WatcherEvent>,
    running: &AtomicBool,
) -> Result<(), WatcherError> {
    let mut previous = 0;

    while running.load(Ordering::Acquire) {
        let count = enumerator.device_count()?;
        if count != previous {
            debug!(previous, count, "device count changed");
            previous = count;
            if events.send(WatcherEvent::Attached(DeviceIdentity::generic())).is_err() {
                return Ok(());
            }
        }
        sleep_unless_stopped(interval, running);
    }
    Ok(())
}

/// Sleeps for `total`, waking every 100 ms to check the stop flag.
fn sleep_unless_stopped(total: Duration, running: &AtomicBool) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
    }
}
