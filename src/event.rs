//! Platform events and their classification.

use zbus::zvariant::Value;

use crate::{address::Address, device::DeviceRecord, Result};

/// An asynchronous notification from the platform.
///
/// Adapter and bond state changes carry no state themselves; the
/// [`Coordinator`][crate::Coordinator] re-queries it from the [`AdapterFacade`][crate::AdapterFacade].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Discovery surfaced a device.
    DeviceFound(DeviceRecord),
    /// The platform stopped discovering on its own.
    DiscoveryFinished,
    /// The adapter's power state changed.
    AdapterStateChanged,
    /// The bond state of the given device changed.
    BondStateChanged(Address),
}

/// A subscription to platform [`Event`]s.
///
/// The subscription is established when the source is created and released when it is dropped.
#[allow(async_fn_in_trait)]
pub trait EventSource {
    /// Waits for the next [`Event`].
    ///
    /// Events are yielded in delivery order. Platform notifications that do not map to one of
    /// the [`Event`] kinds are dropped.
    ///
    /// # Errors
    ///
    /// An error means the source has ended and will not yield further events. The caller should
    /// treat it as permanent.
    async fn next_event(&mut self) -> Result<Event>;
}

/// What a `PropertiesChanged` signal on a device object means to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceSignal {
    /// The device's pairing state moved.
    BondChanged,
    /// The device was heard from again during discovery, or told us its name.
    Seen,
}

/// Classifies a change to `org.bluez.Device1` properties.
pub(crate) fn classify_device_change<'a>(
    changed: impl IntoIterator<Item = &'a str>,
) -> Option<DeviceSignal> {
    let mut seen = false;
    for property in changed {
        match property {
            "Paired" | "Bonded" => return Some(DeviceSignal::BondChanged),
            "RSSI" | "Name" | "Alias" => seen = true,
            _ => {}
        }
    }
    seen.then_some(DeviceSignal::Seen)
}

/// Classifies a change to `org.bluez.Adapter1` properties into zero or more [`Event`]s.
///
/// Discovery starting is not reported; the [`Coordinator`][crate::Coordinator] already knows
/// when it started one.
pub(crate) fn classify_adapter_change<'a, 'v: 'a>(
    changed: impl IntoIterator<Item = (&'a str, &'a Value<'v>)>,
) -> Vec<Event> {
    let mut power = false;
    let mut finished = false;
    for (property, value) in changed {
        match (property, value) {
            ("Powered" | "PowerState", _) => power = true,
            ("Discovering", Value::Bool(false)) => finished = true,
            _ => {}
        }
    }

    let mut events = Vec::new();
    if power {
        events.push(Event::AdapterStateChanged);
    }
    if finished {
        events.push(Event::DiscoveryFinished);
    }
    events
}
