use std::{
    collections::{HashSet, VecDeque},
    future::ready,
    pin::pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Poll,
};

use futures_util::{
    future::BoxFuture,
    stream::{select, FuturesUnordered},
    FutureExt, StreamExt,
};
use zbus::{
    dbus_proxy,
    fdo::{InterfacesAdded, InterfacesRemoved, PropertiesChanged, PropertiesChangedStream, PropertiesProxy},
    zvariant::{ObjectPath, Value},
    Message, SignalStream,
};

use crate::{
    address::Address,
    device::{BondState, DeviceRecord, RemoteDevice},
    event::{classify_adapter_change, classify_device_change, DeviceSignal, Event, EventSource},
    facade::{AdapterFacade, AdapterStatus},
    uuid::Uuid,
    Error, Result, Session,
};

#[dbus_proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Adapter {
    async fn start_discovery(&self) -> zbus::Result<()>;
    async fn stop_discovery(&self) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn address(&self) -> zbus::Result<String>;

    #[dbus_proxy(property)]
    fn discovering(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn powered(&self) -> zbus::Result<bool>;

    #[dbus_proxy(property)]
    fn set_powered(&self, value: bool) -> zbus::Result<()>;

    #[dbus_proxy(property)]
    fn power_state(&self) -> zbus::Result<String>;
}

/// Returns the address of the device at `path` if it is a device object directly below the
/// adapter at `adapter_path`.
fn device_address(adapter_path: &str, path: &str) -> Option<Address> {
    let rest = path.strip_prefix(adapter_path)?.strip_prefix('/')?;
    if rest.contains('/') {
        return None;
    }
    Address::from_device_path(rest)
}

/// Opens a stream of `PropertiesChanged` signals emitted by the BlueZ object at `path`.
async fn properties_changed(
    session: &Session,
    path: ObjectPath<'static>,
) -> Result<PropertiesChangedStream<'static>> {
    let proxy = PropertiesProxy::builder(&session.conn)
        .path(path)
        .map_err(Error::from)?
        .destination("org.bluez")
        .map_err(Error::from)?
        .build()
        .await
        .map_err(Error::from)?;
    proxy
        .receive_properties_changed()
        .await
        .map_err(Error::from)
}

/// Maps the `Paired` property of a device, and whether a `Pair` call to it is still waiting for
/// its reply, to a [`BondState`].
fn bond_state_of(paired: bool, pair_call_outstanding: bool) -> BondState {
    if paired {
        BondState::Bonded
    } else if pair_call_outstanding {
        BondState::Bonding
    } else {
        BondState::None
    }
}

type PairCall = BoxFuture<'static, Result<()>>;

/// `Device1.Pair` calls sent by an [`Adapter`] whose reply has not arrived yet.
///
/// The [`Adapter`] sends the calls and its [`AdapterEvents`] wait for the replies, so pairing
/// (which may involve the user entering a PIN) never holds up a command.
#[derive(Clone, Default)]
struct PairCalls(Arc<Mutex<PairCallsInner>>);

#[derive(Default)]
struct PairCallsInner {
    outstanding: HashSet<Address>,
    unclaimed: Vec<(Address, PairCall)>,
}

impl PairCalls {
    fn lock(&self) -> MutexGuard<'_, PairCallsInner> {
        // No code panics while holding the lock, so a poisoned state is still consistent.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, device: Address, call: PairCall) {
        let mut inner = self.lock();
        inner.outstanding.insert(device);
        inner.unclaimed.push((device, call));
    }

    fn is_outstanding(&self, device: Address) -> bool {
        self.lock().outstanding.contains(&device)
    }

    /// Takes the calls no event source is waiting on yet.
    fn claim(&self) -> Vec<(Address, PairCall)> {
        std::mem::take(&mut self.lock().unclaimed)
    }

    fn answered(&self, device: Address) {
        self.lock().outstanding.remove(&device);
    }

    fn abandon(&self) {
        let mut inner = self.lock();
        inner.outstanding.clear();
        inner.unclaimed.clear();
    }
}

/// A BlueZ Bluetooth adapter.
///
/// Implements [`AdapterFacade`], so it can drive a [`Coordinator`][crate::Coordinator]. Platform
/// events for the coordinator are obtained from [`Adapter::events`].
pub struct Adapter {
    session: Session,
    name: String,
    proxy: AdapterProxy<'static>,
    pair_calls: PairCalls,
}

impl Adapter {
    const PATH_PREFIX: &'static str = "/org/bluez/";

    /// Opens the system's default Bluetooth adapter.
    pub async fn open(session: &Session) -> Result<Self> {
        let mut adapters = Self::enumerate(session).await?.collect::<Vec<_>>();
        adapters.sort_by(|a, b| a.name.cmp(&b.name));

        adapters
            .into_iter()
            .next()
            .ok_or_else(|| Error::from("no adapter found"))
    }

    /// Returns an iterator yielding all Bluetooth adapters on the system.
    pub async fn enumerate(session: &Session) -> Result<impl Iterator<Item = Self>> {
        log::debug!(
            "enumerating BlueZ adapters on connection {}",
            session.conn.server_guid()
        );

        let manager = session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        let mut hci_names = Vec::new();
        for (obj_path, intfs) in &objects {
            if intfs.contains_key("org.bluez.Adapter1") {
                if let Some(name) = obj_path.strip_prefix(Self::PATH_PREFIX) {
                    log::debug!("found BlueZ adapter at path {}", obj_path);
                    hci_names.push(name.to_string());
                } else {
                    log::warn!("skipping adapter with unexpected path {}", obj_path);
                }
            }
        }

        let mut adapters = Vec::new();
        for name in hci_names {
            let path = format!("{}{}", Self::PATH_PREFIX, name);
            match AdapterProxy::new(&session.conn, path).await {
                Ok(proxy) => adapters.push(Adapter {
                    proxy,
                    name,
                    session: session.clone(),
                    pair_calls: PairCalls::default(),
                }),
                Err(e) => log::error!("failed to open adapter {}: {}", name, e),
            }
        }

        Ok(adapters.into_iter())
    }

    /// Returns the adapter's device name (eg. `hci0`).
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Returns the Bluetooth device [`Address`] of this [`Adapter`].
    pub async fn address(&self) -> Result<Address> {
        let string = self.proxy.address().await.map_err(Error::from)?;
        string.parse().map_err(Error::from)
    }

    /// Subscribes to the platform events concerning this adapter and its devices.
    ///
    /// The subscription lasts until the returned [`AdapterEvents`] is dropped.
    pub async fn events(&self) -> Result<AdapterEvents> {
        AdapterEvents::subscribe(self).await
    }

    fn path(&self) -> &str {
        self.proxy.path().as_str()
    }

    async fn remote_device(&self, device: Address) -> Result<RemoteDevice> {
        let path = ObjectPath::try_from(device.device_path(self.path()))
            .map_err(|e| Error::from(zbus::Error::from(e)))?;
        RemoteDevice::new(&self.session, path).await
    }

    async fn paired_devices(&self) -> Result<HashSet<Address>> {
        let manager = self.session.object_manager().await?;
        let objects = manager.get_managed_objects().await.map_err(Error::from)?;

        let mut paired = HashSet::new();
        for (path, intfs) in &objects {
            let Some(address) = device_address(self.path(), path.as_str()) else {
                continue;
            };
            let Some(props) = intfs.get("org.bluez.Device1") else {
                continue;
            };
            if let Some(Value::Bool(true)) = props.get("Paired").map(|v| &**v) {
                paired.insert(address);
            }
        }
        Ok(paired)
    }
}

impl AdapterFacade for Adapter {
    async fn is_discovering(&self) -> bool {
        match self.proxy.discovering().await {
            Ok(discovering) => discovering,
            Err(e) => {
                log::warn!("failed to query discovery state of {}: {}", self.name, e);
                false
            }
        }
    }

    async fn start_discovery(&self) -> bool {
        match self.proxy.start_discovery().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{} refused to start discovery: {}", self.name, e);
                false
            }
        }
    }

    async fn cancel_discovery(&self) {
        // BlueZ complains when no discovery is running; that is fine.
        if let Err(e) = self.proxy.stop_discovery().await {
            log::debug!("stopping discovery on {}: {}", self.name, e);
        }
    }

    async fn bonded_devices(&self) -> HashSet<Address> {
        match self.paired_devices().await {
            Ok(paired) => paired,
            Err(e) => {
                log::warn!("failed to enumerate paired devices: {}", e);
                HashSet::new()
            }
        }
    }

    /// Sends a `Pair` call and returns without waiting for its reply.
    ///
    /// The reply is picked up by the [`AdapterEvents`] of this adapter, which then report a
    /// bond state change for `device`. Until then [`AdapterFacade::bond_state`] reports
    /// [`BondState::Bonding`].
    ///
    /// Pairing needs an agent to be registered with BlueZ (such as the one `bluetoothctl`
    /// provides) if the remote device requires confirmation or a PIN.
    async fn create_bond(&self, device: Address) -> bool {
        if self.pair_calls.is_outstanding(device) {
            log::debug!("pairing with {} already under way", device);
            return true;
        }

        let remote = match self.remote_device(device).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("cannot pair with {}: {}", device, e);
                return false;
            }
        };

        let mut call: PairCall = async move { remote.pair().await }.boxed();
        // Polling once puts the call on the bus.
        match futures_util::poll!(&mut call) {
            Poll::Pending => self.pair_calls.submit(device, call),
            Poll::Ready(Ok(())) => self.pair_calls.submit(device, ready(Ok(())).boxed()),
            Poll::Ready(Err(e)) => {
                log::warn!("{} refused to pair with {}: {}", self.name, device, e);
                return false;
            }
        }
        log::debug!("pairing request sent to {}", device);
        true
    }

    async fn adapter_state(&self) -> AdapterStatus {
        // `PowerState` needs BlueZ 5.64 or newer, `Powered` is always there.
        match self.proxy.power_state().await {
            Ok(state) => match AdapterStatus::from_power_state(&state) {
                Some(status) => return status,
                None => log::warn!("unknown adapter power state '{}'", state),
            },
            Err(e) => log::trace!("`PowerState` unavailable: {}", e),
        }

        match self.proxy.powered().await {
            Ok(true) => AdapterStatus::On,
            Ok(false) => AdapterStatus::Off,
            Err(e) => {
                log::warn!("failed to query power state of {}: {}", self.name, e);
                AdapterStatus::Off
            }
        }
    }

    async fn bond_state(&self, device: Address) -> BondState {
        let paired = match self.remote_device(device).await {
            Ok(remote) => remote.is_paired().await,
            Err(e) => Err(e),
        };
        let paired = paired.unwrap_or_else(|e| {
            log::warn!("failed to query bond state of {}: {}", device, e);
            false
        });
        bond_state_of(paired, self.pair_calls.is_outstanding(device))
    }

    async fn service_uuids(&self, device: Address) -> Vec<Uuid> {
        let uuids = match self.remote_device(device).await {
            Ok(remote) => remote.service_uuids().await,
            Err(e) => Err(e),
        };
        uuids.unwrap_or_else(|e| {
            log::warn!("failed to fetch services of {}: {}", device, e);
            Vec::new()
        })
    }

    async fn power_on(&self) -> bool {
        match self.proxy.set_powered(true).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("failed to power up {}: {}", self.name, e);
                false
            }
        }
    }
}

enum Signal {
    Object(Arc<Message>),
    Adapter(PropertiesChanged),
    Device(Address, PropertiesChanged),
    PairReply(Address, Result<()>),
}

struct DeviceWatch {
    address: Address,
    device: RemoteDevice,
    changes: PropertiesChangedStream<'static>,
}

/// The BlueZ [`EventSource`] of an [`Adapter`].
///
/// Returned by [`Adapter::events`]. Listens to objects being added to and removed from BlueZ,
/// and to property changes of the adapter and of every device known to it.
pub struct AdapterEvents {
    session: Session,
    adapter_path: ObjectPath<'static>,
    object_signals: SignalStream<'static>,
    adapter_changes: PropertiesChangedStream<'static>,
    devices: Vec<DeviceWatch>,
    pair_calls: PairCalls,
    pair_replies: FuturesUnordered<BoxFuture<'static, (Address, Result<()>)>>,
    queue: VecDeque<Event>,
}

impl AdapterEvents {
    async fn subscribe(adapter: &Adapter) -> Result<Self> {
        let adapter_path = adapter.proxy.path().to_owned();
        log::debug!("subscribing to BlueZ signals for {}", adapter_path);

        // Subscribe before enumerating, so that no device can slip through in between.
        let manager = adapter.session.object_manager().await?;
        let object_signals = manager.receive_all_signals().await.map_err(Error::from)?;
        let adapter_changes = properties_changed(&adapter.session, adapter_path.clone()).await?;

        let mut this = Self {
            session: adapter.session.clone(),
            adapter_path,
            object_signals,
            adapter_changes,
            devices: Vec::new(),
            pair_calls: adapter.pair_calls.clone(),
            pair_replies: FuturesUnordered::new(),
            queue: VecDeque::new(),
        };

        let objects = manager.get_managed_objects().await.map_err(Error::from)?;
        for (path, intfs) in objects {
            if !intfs.contains_key("org.bluez.Device1") {
                continue;
            }
            let Some(address) = device_address(this.adapter_path.as_str(), path.as_str()) else {
                continue;
            };
            if let Err(e) = this.watch(address, (*path).to_owned()).await {
                log::warn!("not watching device at {}: {}", path, e);
            }
        }

        Ok(this)
    }

    async fn watch(&mut self, address: Address, path: ObjectPath<'static>) -> Result<()> {
        let device = RemoteDevice::new(&self.session, path.clone()).await?;
        let changes = properties_changed(&self.session, path).await?;
        self.devices.retain(|watch| watch.address != address);
        self.devices.push(DeviceWatch {
            address,
            device,
            changes,
        });
        Ok(())
    }

    async fn next_signal(&mut self) -> Option<Signal> {
        let objects = self.object_signals.by_ref().map(Signal::Object);
        let adapter = self.adapter_changes.by_ref().map(Signal::Adapter);
        let devices: FuturesUnordered<_> = self
            .devices
            .iter_mut()
            .map(|watch| {
                let address = watch.address;
                watch
                    .changes
                    .next()
                    .map(move |change| change.map(|change| Signal::Device(address, change)))
            })
            .collect();

        let replies = self
            .pair_replies
            .by_ref()
            .map(|(address, result)| Signal::PairReply(address, result));

        let mut stream = pin!(select(
            select(objects, adapter),
            select(devices.filter_map(ready), replies)
        ));
        stream.next().await
    }

    async fn classify(&mut self, signal: Signal) {
        match signal {
            Signal::Object(message) => self.on_object_signal(message).await,
            Signal::Adapter(changed) => {
                let Ok(args) = changed.args() else {
                    log::trace!("malformed adapter `PropertiesChanged` signal");
                    return;
                };
                if args.interface_name.as_str() != "org.bluez.Adapter1" {
                    return;
                }
                let events = classify_adapter_change(
                    args.changed_properties.iter().map(|(name, value)| (*name, value)),
                );
                self.queue.extend(events);
            }
            Signal::Device(address, changed) => {
                let Ok(args) = changed.args() else {
                    log::trace!("malformed `PropertiesChanged` signal from {}", address);
                    return;
                };
                if args.interface_name.as_str() != "org.bluez.Device1" {
                    return;
                }
                let names = args
                    .changed_properties
                    .keys()
                    .copied()
                    .chain(args.invalidated_properties.iter().copied());
                match classify_device_change(names) {
                    Some(DeviceSignal::BondChanged) => {
                        self.queue.push_back(Event::BondStateChanged(address))
                    }
                    Some(DeviceSignal::Seen) => self.announce(address).await,
                    None => {}
                }
            }
            Signal::PairReply(address, result) => {
                self.pair_calls.answered(address);
                match result {
                    Ok(()) => log::debug!("pairing with {} completed", address),
                    Err(e) => log::debug!("pairing with {} failed: {}", address, e),
                }
                self.queue.push_back(Event::BondStateChanged(address));
            }
        }
    }

    /// Starts waiting for the replies of `Pair` calls sent since the last event.
    fn claim_pair_calls(&mut self) {
        for (address, call) in self.pair_calls.claim() {
            self.pair_replies
                .push(call.map(move |result| (address, result)).boxed());
        }
    }

    async fn on_object_signal(&mut self, message: Arc<Message>) {
        if let Some(added) = InterfacesAdded::from_message(message.clone()) {
            let Ok(args) = added.args() else {
                return;
            };
            let Some(props) = args.interfaces_and_properties.get("org.bluez.Device1") else {
                return;
            };
            let Some(address) =
                device_address(self.adapter_path.as_str(), args.object_path.as_str())
            else {
                return;
            };

            let record =
                DeviceRecord::from_properties(address, props.iter().map(|(k, v)| (*k, v)));
            if let Err(e) = self.watch(address, args.object_path.to_owned()).await {
                log::warn!("not watching device {}: {}", address, e);
            }
            self.queue.push_back(Event::DeviceFound(record));
        } else if let Some(removed) = InterfacesRemoved::from_message(message) {
            let Ok(args) = removed.args() else {
                return;
            };
            if !args.interfaces.contains(&"org.bluez.Device1") {
                return;
            }
            if let Some(address) =
                device_address(self.adapter_path.as_str(), args.object_path.as_str())
            {
                log::trace!("{} removed, no longer watching it", address);
                self.devices.retain(|watch| watch.address != address);
            }
        } else {
            log::trace!("dropping unrelated object manager signal");
        }
    }

    /// Re-reads a device that was heard from again and queues it as found.
    async fn announce(&mut self, address: Address) {
        let Some(device) = self
            .devices
            .iter()
            .find(|watch| watch.address == address)
            .map(|watch| watch.device.clone())
        else {
            return;
        };

        match device.record().await {
            Ok(record) => self.queue.push_back(Event::DeviceFound(record)),
            Err(e) => log::warn!("failed to read device {}: {}", address, e),
        }
    }
}

impl EventSource for AdapterEvents {
    async fn next_event(&mut self) -> Result<Event> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Ok(event);
            }

            self.claim_pair_calls();
            match self.next_signal().await {
                Some(signal) => self.classify(signal).await,
                None => return Err(Error::closed()),
            }
        }
    }
}

impl Drop for AdapterEvents {
    fn drop(&mut self) {
        log::debug!("releasing BlueZ signal subscriptions for {}", self.adapter_path);
        // Replies to pending `Pair` calls can no longer be received.
        self.pair_calls.abandon();
    }
}
