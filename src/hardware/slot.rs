//! Device slots: a connected device or a placeholder.
//!
//! Connecting a device that does not answer in time must not abort a whole
//! beamline session. [`connect_slot`] logs a warning and stores an
//! `Unavailable` placeholder instead; code that needs the device calls
//! [`DeviceSlot::require`] and gets `DeviceUnavailable` back.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::ChannelAccess;
use crate::error::{FlyscanError, FlyscanResult};
use crate::hardware::capabilities::Device;

/// A device that connected, or a record of why it did not
pub enum DeviceSlot<T: ?Sized> {
    /// All channels connected
    Connected(Arc<T>),
    /// Placeholder kept in place of a device that failed to connect
    Unavailable {
        /// Device name
        name: String,
        /// Connection failure
        reason: String,
    },
}

impl<T: ?Sized> Clone for DeviceSlot<T> {
    fn clone(&self) -> Self {
        match self {
            DeviceSlot::Connected(device) => DeviceSlot::Connected(device.clone()),
            DeviceSlot::Unavailable { name, reason } => DeviceSlot::Unavailable {
                name: name.clone(),
                reason: reason.clone(),
            },
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for DeviceSlot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSlot::Connected(_) => f.write_str("DeviceSlot::Connected"),
            DeviceSlot::Unavailable { name, reason } => f
                .debug_struct("DeviceSlot::Unavailable")
                .field("name", name)
                .field("reason", reason)
                .finish(),
        }
    }
}

impl<T: ?Sized> DeviceSlot<T> {
    /// Placeholder for a device that is not there
    pub fn unavailable(name: impl Into<String>, reason: impl Into<String>) -> Self {
        DeviceSlot::Unavailable {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether the device connected
    pub fn is_available(&self) -> bool {
        matches!(self, DeviceSlot::Connected(_))
    }

    /// The device, or `DeviceUnavailable` for a placeholder
    pub fn require(&self) -> FlyscanResult<Arc<T>> {
        match self {
            DeviceSlot::Connected(device) => Ok(device.clone()),
            DeviceSlot::Unavailable { name, reason } => Err(FlyscanError::DeviceUnavailable {
                name: name.clone(),
                reason: reason.clone(),
            }),
        }
    }

    /// Convert the device handle, e.g. to a trait object
    pub fn map<U: ?Sized>(self, f: impl FnOnce(Arc<T>) -> Arc<U>) -> DeviceSlot<U> {
        match self {
            DeviceSlot::Connected(device) => DeviceSlot::Connected(f(device)),
            DeviceSlot::Unavailable { name, reason } => DeviceSlot::Unavailable { name, reason },
        }
    }
}

impl<T: Device + ?Sized> DeviceSlot<T> {
    /// Device name, for either state
    pub fn name(&self) -> &str {
        match self {
            DeviceSlot::Connected(device) => device.name(),
            DeviceSlot::Unavailable { name, .. } => name,
        }
    }
}

/// Connect every channel of `device`; on failure keep a placeholder
pub async fn connect_slot<T: Device + ?Sized>(
    device: Arc<T>,
    layer: &dyn ChannelAccess,
    timeout: Duration,
) -> DeviceSlot<T> {
    for pv in device.channel_names() {
        if let Err(e) = layer.connect(&pv, timeout).await {
            warn!(device = device.name(), pv = %pv, error = %e, "Device unavailable, using placeholder");
            return DeviceSlot::Unavailable {
                name: device.name().to_string(),
                reason: e.to_string(),
            };
        }
    }
    debug!(device = device.name(), "Device connected");
    DeviceSlot::Connected(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannelLayer;

    struct Shutter {
        pv: String,
    }

    impl Device for Shutter {
        fn name(&self) -> &str {
            "shutter"
        }

        fn channel_names(&self) -> Vec<String> {
            vec![self.pv.clone()]
        }
    }

    #[tokio::test]
    async fn missing_channel_yields_placeholder() {
        let sim = SimChannelLayer::new();
        let slot = connect_slot(
            Arc::new(Shutter {
                pv: "shutter:Open".into(),
            }),
            &sim,
            Duration::from_millis(10),
        )
        .await;

        assert!(!slot.is_available());
        assert_eq!(slot.name(), "shutter");
        assert!(matches!(
            slot.require(),
            Err(FlyscanError::DeviceUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn connected_device_is_returned() {
        let sim = SimChannelLayer::new();
        sim.set("shutter:Open", 0_i64);
        let slot = connect_slot(
            Arc::new(Shutter {
                pv: "shutter:Open".into(),
            }),
            &sim,
            Duration::from_millis(10),
        )
        .await;

        assert!(slot.is_available());
        assert_eq!(slot.require().unwrap().name(), "shutter");
    }
}
