//! Scripted USB bus for tests and the simulated binary mode.
//!
//! [`MockUsbBus`] is the shared, test-driven state: plug and unplug devices,
//! change the device count, or make the next enumerator fail at a chosen
//! step.  Each watcher run gets its own [`MockUsbEnumerator`] from
//! [`MockUsbBus::factory`], reading the same bus.
//!
//! ```ignore
//! let bus = MockUsbBus::with_hotplug();
//! let (mut watcher, rx) = DeviceWatcher::new(bus.factory(), DeviceWatcherConfig::default());
//! watcher.start()?;
//! bus.plug(0x18d1, 0x4ee1);
//! assert_eq!(rx.recv()?, WatcherEvent::Attached("18d1:4ee1".into()));
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{EnumeratorFactory, HotplugEvent, UsbEnumerator, WatcherError};

#[derive(Default)]
struct BusState {
    hotplug: bool,
    device_count: usize,
    pending: VecDeque<HotplugEvent>,
    registered: bool,
    enumerators_created: usize,
    fail_init: Option<String>,
    fail_device_list: bool,
    fail_registration: bool,
    fail_events: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BusState>,
    changed: Condvar,
}

/// Test-controlled USB bus.  Clones share the same bus.
#[derive(Clone, Default)]
pub struct MockUsbBus {
    shared: Arc<Shared>,
}

impl MockUsbBus {
    /// A bus whose enumerators support hot-plug notification.
    pub fn with_hotplug() -> Self {
        let bus = Self::default();
        bus.state().hotplug = true;
        bus
    }

    /// A bus whose enumerators only support device-count polling.
    pub fn polling() -> Self {
        Self::default()
    }

    /// Returns a factory producing enumerators over this bus.
    pub fn factory(&self) -> EnumeratorFactory {
        let bus = self.clone();
        Arc::new(move || {
            let mut state = bus.state();
            state.enumerators_created += 1;
            if let Some(reason) = state.fail_init.clone() {
                return Err(WatcherError::Init(reason));
            }
            drop(state);
            Ok(Box::new(MockUsbEnumerator { bus: bus.clone() }) as Box<dyn UsbEnumerator>)
        })
    }

    /// Adds a device and queues its arrival notification.
    pub fn plug(&self, vendor_id: u16, product_id: u16) {
        let mut state = self.state();
        state.device_count += 1;
        state.pending.push_back(HotplugEvent::Arrived { vendor_id, product_id });
        self.shared.changed.notify_all();
    }

    /// Removes a device and queues its leave notification.
    pub fn unplug(&self, vendor_id: u16, product_id: u16) {
        let mut state = self.state();
        state.device_count = state.device_count.saturating_sub(1);
        state.pending.push_back(HotplugEvent::Left { vendor_id, product_id });
        self.shared.changed.notify_all();
    }

    /// Sets the count seen by polling enumerators without queuing events.
    pub fn set_device_count(&self, count: usize) {
        self.state().device_count = count;
    }

    pub fn fail_init(&self, reason: &str) {
        self.state().fail_init = Some(reason.to_string());
    }

    pub fn fail_device_list(&self) {
        self.state().fail_device_list = true;
    }

    pub fn fail_registration(&self) {
        self.state().fail_registration = true;
    }

    /// Makes the next `poll_hotplug` fail.
    pub fn fail_events(&self) {
        self.state().fail_events = true;
        self.shared.changed.notify_all();
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_init = None;
        state.fail_device_list = false;
        state.fail_registration = false;
        state.fail_events = false;
    }

    /// Number of enumerators the factory has been asked for.
    pub fn enumerators_created(&self) -> usize {
        self.state().enumerators_created
    }

    /// `true` while a hot-plug callback is registered.
    pub fn is_registered(&self) -> bool {
        self.state().registered
    }

    fn state(&self) -> MutexGuard<'_, BusState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Enumerator over a [`MockUsbBus`].
pub struct MockUsbEnumerator {
    bus: MockUsbBus,
}

impl UsbEnumerator for MockUsbEnumerator {
    fn supports_hotplug(&self) -> bool {
        self.bus.state().hotplug
    }

    fn device_count(&mut self) -> Result<usize, WatcherError> {
        let state = self.bus.state();
        if state.fail_device_list {
            return Err(WatcherError::DeviceList("mock bus failure".into()));
        }
        Ok(state.device_count)
    }

    fn register_hotplug(&mut self) -> Result<(), WatcherError> {
        let mut state = self.bus.state();
        if state.fail_registration {
            return Err(WatcherError::HotplugRegistration("mock bus failure".into()));
        }
        state.registered = true;
        Ok(())
    }

    fn poll_hotplug(&mut self, timeout: Duration) -> Result<Vec<HotplugEvent>, WatcherError> {
        let state = self.bus.state();
        let (mut state, _) = self
            .bus
            .shared
            .changed
            .wait_timeout_while(state, timeout, |s| s.pending.is_empty() && !s.fail_events)
            .unwrap_or_else(PoisonError::into_inner);

        if state.fail_events {
            state.fail_events = false;
            return Err(WatcherError::EventHandling("mock bus failure".into()));
        }
        Ok(state.pending.drain(..).collect())
    }

    fn deregister_hotplug(&mut self) {
        self.bus.state().registered = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_returns_queued_events_in_order() {
        // Arrange
        let bus = MockUsbBus::with_hotplug();
        let mut enumerator = (bus.factory())().unwrap();
        bus.plug(1, 1);
        bus.unplug(1, 1);

        // Act
        let events = enumerator.poll_hotplug(Duration::from_millis(10)).unwrap();

        // Assert
        assert_eq!(
            events,
            vec![
                HotplugEvent::Arrived { vendor_id: 1, product_id: 1 },
                HotplugEvent::Left { vendor_id: 1, product_id: 1 },
            ]
        );
        assert_eq!(enumerator.device_count().unwrap(), 0);
    }

    #[test]
    fn test_poll_times_out_with_no_events() {
        let bus = MockUsbBus::with_hotplug();
        let mut enumerator = (bus.factory())().unwrap();
        assert!(enumerator.poll_hotplug(Duration::from_millis(5)).unwrap().is_empty());
    }

    #[test]
    fn test_event_failure_is_one_shot() {
        let bus = MockUsbBus::with_hotplug();
        let mut enumerator = (bus.factory())().unwrap();
        bus.fail_events();
        assert!(enumerator.poll_hotplug(Duration::from_millis(5)).is_err());
        assert!(enumerator.poll_hotplug(Duration::from_millis(5)).is_ok());
    }
}
