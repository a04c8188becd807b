//! Bluetooth device discovery and pairing.
//!
//! The heart of this crate is the [`Coordinator`], a small state machine that runs discovery
//! sessions, keeps the list of discovered devices and tracks a single in-flight pairing. It talks
//! to the platform through the [`AdapterFacade`] trait, learns about platform outcomes from an
//! [`EventSource`], and reports to a [`DiscoveryListener`] and a [`ProgressListener`].
//!
//! A BlueZ backend (via D-Bus) is included: [`Adapter`] implements [`AdapterFacade`], and
//! [`Adapter::events`] returns an [`EventSource`].

mod adapter;
pub mod address;
mod coordinator;
pub mod device;
mod error;
mod event;
mod facade;
mod listener;
pub mod uuid;

pub use adapter::{Adapter, AdapterEvents};
pub use coordinator::{
    Config, Coordinator, DiscoveryState, PairingAttempt, PairingPolicy, PairingState,
};
pub use error::{Error, Result};
pub use event::{Event, EventSource};
pub use facade::{AdapterFacade, AdapterStatus};
pub use listener::{DiscoveryListener, ProgressListener};

use zbus::{fdo::ObjectManagerProxy, Connection};

/// A cloneable handle to a D-Bus connection.
///
/// This type is used to construct various objects in this library.
#[derive(Clone)]
pub struct Session {
    conn: Connection,
}

impl Session {
    /// Connects to the D-Bus system bus, where BlueZ lives.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            conn: Connection::system().await.map_err(Error::from)?,
        })
    }

    /// Connects to the BlueZ D-Bus object manager.
    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        ObjectManagerProxy::builder(&self.conn)
            .destination("org.bluez")
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)
    }
}
