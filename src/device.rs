//! Remote devices: what the [`Coordinator`][crate::Coordinator] records about them, and BlueZ
//! access to them.

use core::fmt;
use std::borrow::Cow;

use zbus::zvariant::{ObjectPath, Value};

use crate::{address::Address, uuid::Uuid, Error, Result, Session};

/// The bond (pairing) state of a remote device, as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BondState {
    /// The device is not bonded with the local adapter.
    #[default]
    None,
    /// Pairing with the device is in progress.
    Bonding,
    /// The device is bonded (paired).
    Bonded,
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    address: Address,
    name: Option<String>,
    bond_state: BondState,
}

impl DeviceRecord {
    pub fn new(address: Address, name: Option<String>, bond_state: BondState) -> Self {
        Self {
            address,
            name,
            bond_state,
        }
    }

    /// Builds a record from a set of `org.bluez.Device1` properties.
    ///
    /// The user-assigned `Alias` takes precedence over the remote `Name`. BlueZ substitutes the
    /// address for a missing alias, so an alias that merely spells out the address is treated as
    /// absent.
    pub(crate) fn from_properties<'a, 'v: 'a>(
        address: Address,
        properties: impl IntoIterator<Item = (&'a str, &'a Value<'v>)>,
    ) -> Self {
        let mut alias = None;
        let mut name = None;
        let mut paired = false;
        for (key, value) in properties {
            match (key, value) {
                ("Alias", Value::Str(s)) => alias = Some(s.as_str().to_owned()),
                ("Name", Value::Str(s)) => name = Some(s.as_str().to_owned()),
                ("Paired", Value::Bool(b)) => paired = *b,
                _ => {}
            }
        }

        let placeholder = address.to_string().replace(':', "-");
        let alias = alias.filter(|alias| *alias != placeholder);
        let bond_state = if paired {
            BondState::Bonded
        } else {
            BondState::None
        };
        Self::new(address, alias.or(name), bond_state)
    }

    /// Returns the hardware [`Address`] of the device.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the name the device advertised, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Returns the device name, falling back to its address when no name is known.
    pub fn display_name(&self) -> Cow<'_, str> {
        match &self.name {
            Some(name) => Cow::Borrowed(name),
            None => Cow::Owned(self.address.to_string()),
        }
    }

    pub fn bond_state(&self) -> BondState {
        self.bond_state
    }

    pub(crate) fn set_bond_state(&mut self, bond_state: BondState) {
        self.bond_state = bond_state;
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[Address: {}, Name: ", self.address)?;
        match &self.name {
            Some(name) => write!(f, "{}]", name),
            None => f.write_str("<unknown>]"),
        }
    }
}

/// Metadata shown for a device after pairing with it succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDetails {
    pub name: String,
    pub address: Address,
    pub service_uuids: Vec<Uuid>,
}

impl fmt::Display for DeviceDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Name: {}", self.name)?;
        writeln!(f, "MAC: {}", self.address)?;
        writeln!(f, "UUIDs:")?;
        for uuid in &self.service_uuids {
            writeln!(f, "{}", uuid)?;
        }
        Ok(())
    }
}

mod private {
    use zbus::dbus_proxy;

    #[dbus_proxy(
        interface = "org.bluez.Device1",
        default_service = "org.bluez",
        assume_defaults = false
    )]
    trait Device {
        async fn pair(&self) -> zbus::Result<()>;

        #[dbus_proxy(property)]
        fn address(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn alias(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn name(&self) -> zbus::Result<String>;

        #[dbus_proxy(property)]
        fn paired(&self) -> zbus::Result<bool>;

        #[dbus_proxy(property, name = "UUIDs")]
        fn uuids(&self) -> zbus::Result<Vec<String>>;
    }
}

use private::DeviceProxy;

/// A BlueZ device object, addressed by its object path.
#[derive(Clone)]
pub(crate) struct RemoteDevice {
    proxy: DeviceProxy<'static>,
}

impl RemoteDevice {
    pub(crate) async fn new(session: &Session, path: ObjectPath<'static>) -> Result<Self> {
        let proxy = DeviceProxy::builder(&session.conn)
            .path(path)
            .map_err(Error::from)?
            // Bond state is re-queried after every change notification, so a stale cached value
            // would make us miss the outcome of a pairing.
            .cache_properties(zbus::CacheProperties::No)
            .build()
            .await
            .map_err(Error::from)?;
        Ok(Self { proxy })
    }

    /// Pairs with the device. Resolves once BlueZ has completed or aborted the procedure,
    /// which may take as long as the user needs to confirm it.
    pub(crate) async fn pair(&self) -> Result<()> {
        self.proxy.pair().await.map_err(Error::from)
    }

    pub(crate) async fn is_paired(&self) -> Result<bool> {
        self.proxy.paired().await.map_err(Error::from)
    }

    /// Fetches the current properties and builds a [`DeviceRecord`] from them.
    pub(crate) async fn record(&self) -> Result<DeviceRecord> {
        let address = self
            .proxy
            .address()
            .await
            .map_err(Error::from)?
            .parse::<Address>()
            .map_err(Error::from)?;
        let paired = self.is_paired().await?;
        // `Alias` is always present, `Name` only once the remote end told us.
        let name = self.proxy.name().await.ok();
        let alias = self.proxy.alias().await.ok();

        let mut properties = Vec::new();
        if let Some(alias) = &alias {
            properties.push(("Alias", Value::from(alias.as_str())));
        }
        if let Some(name) = &name {
            properties.push(("Name", Value::from(name.as_str())));
        }
        properties.push(("Paired", Value::from(paired)));

        Ok(DeviceRecord::from_properties(
            address,
            properties.iter().map(|(k, v)| (*k, v)),
        ))
    }

    /// Returns the list of service [`Uuid`]s the device is offering.
    ///
    /// The list is typically truncated until the device has been paired or connected.
    pub(crate) async fn service_uuids(&self) -> Result<Vec<Uuid>> {
        self.proxy
            .uuids()
            .await
            .map_err(Error::from)?
            .into_iter()
            .map(|s| s.parse::<Uuid>().map_err(Error::from))
            .collect::<Result<Vec<_>>>()
    }
}

impl fmt::Debug for RemoteDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteDevice")
            .field("path", self.proxy.path())
            .finish()
    }
}
