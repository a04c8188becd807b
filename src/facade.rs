//! The platform boundary the [`Coordinator`][crate::Coordinator] talks to.

use std::collections::HashSet;

use crate::{address::Address, device::BondState, uuid::Uuid};

/// Power state of the local Bluetooth adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterStatus {
    Off,
    On,
    TurningOn,
    TurningOff,
}

impl AdapterStatus {
    /// Maps a BlueZ `PowerState` property value.
    ///
    /// A radio blocked by rfkill (`off-blocked`) is reported as [`AdapterStatus::Off`].
    pub(crate) fn from_power_state(s: &str) -> Option<Self> {
        Some(match s {
            "on" => Self::On,
            "off" | "off-blocked" => Self::Off,
            "off-enabling" => Self::TurningOn,
            "on-disabling" => Self::TurningOff,
            _ => return None,
        })
    }
}

/// Direct pass-through to the platform's Bluetooth adapter.
///
/// Implementations perform no retries and impose no timeouts. Commands report whether the
/// platform accepted them; platform errors are logged by the implementation and reported as
/// refusal, an empty set, or [`AdapterStatus::Off`].
///
/// The futures are expected to resolve once the platform has accepted (or refused) a request;
/// outcomes that take longer, such as a finished discovery or a completed pairing, are delivered
/// later through an [`EventSource`][crate::EventSource].
#[allow(async_fn_in_trait)]
pub trait AdapterFacade {
    async fn is_discovering(&self) -> bool;

    /// Requests a discovery session. Returns `false` if the platform refused (eg. the radio is
    /// off).
    async fn start_discovery(&self) -> bool;

    async fn cancel_discovery(&self);

    /// Returns the addresses of all devices bonded with this adapter.
    async fn bonded_devices(&self) -> HashSet<Address>;

    /// Initiates pairing with `device`. Returns `false` if the platform refused.
    async fn create_bond(&self, device: Address) -> bool;

    async fn adapter_state(&self) -> AdapterStatus;

    /// Re-queries the current bond state of `device`.
    async fn bond_state(&self, device: Address) -> BondState;

    /// Returns the services `device` is known to offer.
    async fn service_uuids(&self, device: Address) -> Vec<Uuid>;

    /// Asks the platform to power up the adapter. Returns `false` if the platform refused.
    async fn power_on(&self) -> bool;
}
