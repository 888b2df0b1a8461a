//! Identity of a physically attached candidate device.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity reported by polling-mode watchers, which only know that the
/// device set changed and not which device it was.
pub const GENERIC_DEVICE_ID: &str = "generic";

/// Opaque key identifying an attached device.
///
/// Event-driven watchers produce `vvvv:pppp` (lowercase hex vendor and
/// product id).  The value carries no ownership; two identities are the same
/// device when their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Wraps an arbitrary identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the `vvvv:pppp` identity from a USB vendor/product pair.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use headunit_core::DeviceIdentity;
    ///
    /// let id = DeviceIdentity::from_usb_ids(0x18d1, 0x4ee1);
    /// assert_eq!(id.as_str(), "18d1:4ee1");
    /// ```
    pub fn from_usb_ids(vendor_id: u16, product_id: u16) -> Self {
        Self(format!("{vendor_id:04x}:{product_id:04x}"))
    }

    /// The identity emitted by the degraded polling mode.
    pub fn generic() -> Self {
        Self(GENERIC_DEVICE_ID.to_string())
    }

    /// Returns `true` for the polling-mode placeholder identity.
    pub fn is_generic(&self) -> bool {
        self.0 == GENERIC_DEVICE_ID
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceIdentity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
