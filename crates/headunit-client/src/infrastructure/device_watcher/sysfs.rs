//! Polling-only enumerator backed by the Linux sysfs USB tree.
//!
//! Every entry under `/sys/bus/usb/devices` that exposes both `idVendor` and
//! `idProduct` is a device (interfaces and root-hub ports lack them).  There
//! is no hot-plug source here, so the watcher runs in polling mode.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use headunit_core::DeviceIdentity;
use tracing::trace;

use super::{EnumeratorFactory, HotplugEvent, UsbEnumerator, WatcherError};

/// Default sysfs location of USB devices.
pub const SYSFS_USB_DEVICES: &str = "/sys/bus/usb/devices";

pub struct SysfsUsbEnumerator {
    root: PathBuf,
}

impl SysfsUsbEnumerator {
    /// Reads devices from `root` (a directory laid out like
    /// `/sys/bus/usb/devices`).
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// A factory for enumerators over `root`.  Fails at watcher start if the
    /// directory does not exist.
    pub fn factory(root: impl Into<PathBuf>) -> EnumeratorFactory {
        let root = root.into();
        std::sync::Arc::new(move || {
            if !root.is_dir() {
                return Err(WatcherError::Init(format!("{} is not a directory", root.display())));
            }
            Ok(Box::new(SysfsUsbEnumerator::new(root.clone())) as Box<dyn UsbEnumerator>)
        })
    }

    /// Identities of every device currently listed, sorted.
    pub fn devices(&self) -> Result<Vec<DeviceIdentity>, WatcherError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| WatcherError::DeviceList(format!("{}: {e}", self.root.display())))?;

        let mut devices: Vec<DeviceIdentity> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| read_identity(&entry.path()))
            .collect();
        devices.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(devices)
    }
}

fn read_identity(dir: &Path) -> Option<DeviceIdentity> {
    let vendor = read_hex_id(&dir.join("idVendor"))?;
    let product = read_hex_id(&dir.join("idProduct"))?;
    Some(DeviceIdentity::from_usb_ids(vendor, product))
}

fn read_hex_id(path: &Path) -> Option<u16> {
    let text = fs::read_to_string(path).ok()?;
    u16::from_str_radix(text.trim(), 16).ok()
}

impl UsbEnumerator for SysfsUsbEnumerator {
    fn supports_hotplug(&self) -> bool {
        false
    }

    fn device_count(&mut self) -> Result<usize, WatcherError> {
        let devices = self.devices()?;
        trace!(count = devices.len(), "sysfs device scan");
        Ok(devices.len())
    }

    fn register_hotplug(&mut self) -> Result<(), WatcherError> {
        Err(WatcherError::HotplugRegistration("sysfs has no hot-plug source".into()))
    }

    fn poll_hotplug(&mut self, _timeout: Duration) -> Result<Vec<HotplugEvent>, WatcherError> {
        Ok(Vec::new())
    }

    fn deregister_hotplug(&mut self) {}
}
