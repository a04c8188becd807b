//! Observer interfaces notified by the [`Coordinator`][crate::Coordinator].
//!
//! All methods are one-way notifications with empty default implementations, so implementors
//! only override what they care about. `()` implements both traits and ignores everything.

use crate::{
    coordinator::PairingState,
    device::{DeviceDetails, DeviceRecord},
    facade::AdapterStatus,
};

/// Receives updates about discovered devices, discovery sessions and pairing outcomes.
pub trait DiscoveryListener {
    /// A device was added to the discovery list.
    fn on_device_discovered(&mut self, device: &DeviceRecord) {
        let _ = device;
    }

    /// A discovery session started. The discovery list has just been cleared.
    fn on_device_discovery_started(&mut self) {}

    /// Discovery ended, was cancelled, or could not be started.
    ///
    /// This is also delivered when cancelling while no discovery was running.
    fn on_device_discovery_end(&mut self) {}

    /// The adapter's power state changed.
    fn on_bluetooth_status_changed(&mut self, status: AdapterStatus) {
        let _ = status;
    }

    /// The adapter is powering up to carry out a scheduled discovery.
    fn on_bluetooth_turning_on(&mut self) {}

    /// The adapter powered off while a discovery was scheduled, so it was dropped.
    fn on_bluetooth_enable_failed(&mut self) {}

    /// The in-flight pairing finished, either [`PairingState::Bonded`] or
    /// [`PairingState::BondFailed`].
    fn on_device_pairing_ended(&mut self, device: &DeviceRecord, outcome: PairingState) {
        let _ = (device, outcome);
    }
}

/// Drives a busy indicator and the transition to a device detail view.
pub trait ProgressListener {
    fn start_loading(&mut self) {}

    fn end_loading(&mut self) {}

    /// Pairing with a device succeeded; `details` describes it.
    fn connected_device_info(&mut self, details: &DeviceDetails) {
        let _ = details;
    }
}

impl DiscoveryListener for () {}

impl ProgressListener for () {}

impl<L: DiscoveryListener + ?Sized> DiscoveryListener for &mut L {
    fn on_device_discovered(&mut self, device: &DeviceRecord) {
        (**self).on_device_discovered(device)
    }

    fn on_device_discovery_started(&mut self) {
        (**self).on_device_discovery_started()
    }

    fn on_device_discovery_end(&mut self) {
        (**self).on_device_discovery_end()
    }

    fn on_bluetooth_status_changed(&mut self, status: AdapterStatus) {
        (**self).on_bluetooth_status_changed(status)
    }

    fn on_bluetooth_turning_on(&mut self) {
        (**self).on_bluetooth_turning_on()
    }

    fn on_bluetooth_enable_failed(&mut self) {
        (**self).on_bluetooth_enable_failed()
    }

    fn on_device_pairing_ended(&mut self, device: &DeviceRecord, outcome: PairingState) {
        (**self).on_device_pairing_ended(device, outcome)
    }
}

impl<P: ProgressListener + ?Sized> ProgressListener for &mut P {
    fn start_loading(&mut self) {
        (**self).start_loading()
    }

    fn end_loading(&mut self) {
        (**self).end_loading()
    }

    fn connected_device_info(&mut self, details: &DeviceDetails) {
        (**self).connected_device_info(details)
    }
}
