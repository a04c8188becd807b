//! The discovery and pairing state machine.
//!
//! A [`Coordinator`] sits between three parties: the caller issuing commands (start or cancel
//! discovery, pair with a device), the platform reached through an [`AdapterFacade`], and the
//! observers implementing [`DiscoveryListener`] and [`ProgressListener`]. Platform outcomes arrive
//! asynchronously from an [`EventSource`] and are fed to [`Coordinator::handle_event`], either
//! directly or via [`Coordinator::process_next_event`].
//!
//! # Threading
//!
//! The coordinator is single-threaded and does no locking. Commands and events must be issued
//! from the task that drives the event source, and are processed strictly in the order they are
//! issued or delivered.
//!
//! # Pairing
//!
//! Only one pairing is tracked at a time:
//!
//! ```text
//! NoPairing --pair()--> Bonding --Bonded--> (notify) --> NoPairing
//!                       Bonding --None----> (notify) --> NoPairing
//!                       Bonding --Bonding-> Bonding
//! ```
//!
//! The [`ProgressListener`] sees one `start_loading` when the coordinator becomes busy with a
//! discovery or a pairing, and one `end_loading` once neither is in flight anymore.
//!
//! There is no timeout. If the platform never reports a terminal bond state, the attempt stays
//! in flight until another [`Coordinator::pair`] replaces it (see [`PairingPolicy`]).

use crate::{
    address::Address,
    device::{BondState, DeviceDetails, DeviceRecord},
    event::{Event, EventSource},
    facade::{AdapterFacade, AdapterStatus},
    listener::{DiscoveryListener, ProgressListener},
    Error, Result,
};

/// Whether the coordinator has a discovery session running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Idle,
    Discovering,
}

/// State of the pairing tracked by a [`Coordinator`].
///
/// [`Coordinator::pairing_state`] only ever reports [`PairingState::NoPairing`] or
/// [`PairingState::Bonding`]. The terminal states are reported to listeners and by
/// [`Coordinator::pairing_status`], after which the coordinator is back to `NoPairing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    NoPairing,
    Bonding,
    Bonded,
    BondFailed,
}

/// The single device a [`Coordinator`] is currently pairing with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingAttempt {
    target: Address,
    started_at: u64,
}

impl PairingAttempt {
    pub fn target(&self) -> Address {
        self.target
    }

    /// Logical start time: the number of successful [`Coordinator::pair`] calls up to and
    /// including the one that created this attempt.
    pub fn started_at(&self) -> u64 {
        self.started_at
    }
}

/// What to do when [`Coordinator::pair`] is called while another pairing is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingPolicy {
    /// Start the new pairing and stop tracking the old one. Bond state changes of the old
    /// target are ignored from then on.
    #[default]
    Overwrite,
    /// Refuse the new pairing with an error for which [`Error::is_conflict`] returns `true`.
    Reject,
}

/// [`Coordinator`] settings.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pairing_policy: PairingPolicy,
}

/// A command held back until the adapter reports a power state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingCommand {
    StartDiscovery,
}

/// Coordinates device discovery and pairing.
///
/// Owns the ordered list of discovered devices, the discovery state and the in-flight
/// [`PairingAttempt`], and notifies `L` and `P` about every transition.
pub struct Coordinator<A, S, L, P> {
    adapter: A,
    events: S,
    listener: L,
    progress: P,
    config: Config,
    discovery: DiscoveryState,
    devices: Vec<DeviceRecord>,
    attempt: Option<PairingAttempt>,
    attempts_started: u64,
    pending: Option<PendingCommand>,
    busy: bool,
}

impl<A, S, L, P> Coordinator<A, S, L, P>
where
    A: AdapterFacade,
    S: EventSource,
    L: DiscoveryListener,
    P: ProgressListener,
{
    /// Creates a [`Coordinator`] that receives platform events from `events`.
    ///
    /// The subscription is held until [`Coordinator::shutdown`].
    pub fn new(adapter: A, events: S, listener: L, progress: P) -> Self {
        Self {
            adapter,
            events,
            listener,
            progress,
            config: Config::default(),
            discovery: DiscoveryState::Idle,
            devices: Vec::new(),
            attempt: None,
            attempts_started: 0,
            pending: None,
            busy: false,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn progress(&self) -> &P {
        &self.progress
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery
    }

    /// Returns the devices found by the current discovery session, in the order they were found.
    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    /// Starts a new discovery session, restarting it if one is already running.
    ///
    /// On success the device list is cleared and listeners are told that discovery started.
    ///
    /// # Errors
    ///
    /// Fails if the platform refuses (typically because the adapter is powered off). Listeners
    /// then receive a discovery-ended notification. The command is not retried.
    pub async fn start_discovery(&mut self) -> Result<()> {
        if self.adapter.is_discovering().await {
            log::debug!("discovery already running, restarting it");
            self.adapter.cancel_discovery().await;
        }

        log::debug!("starting discovery");
        if !self.adapter.start_discovery().await {
            log::debug!("platform refused to start discovery, is the adapter powered?");
            self.discovery = DiscoveryState::Idle;
            self.update_progress();
            self.listener.on_device_discovery_end();
            return Err(Error::rejected("start discovery"));
        }

        self.devices.clear();
        self.discovery = DiscoveryState::Discovering;
        self.listener.on_device_discovery_started();
        self.update_progress();
        Ok(())
    }

    /// Cancels discovery.
    ///
    /// Listeners are told that discovery ended even if none was running.
    pub async fn cancel_discovery(&mut self) {
        log::debug!("cancelling discovery");
        self.adapter.cancel_discovery().await;
        self.discovery = DiscoveryState::Idle;
        self.update_progress();
        self.listener.on_device_discovery_end();
    }

    /// Starts pairing with `device`.
    ///
    /// A running discovery is cancelled first, since it slows down pairing considerably. This
    /// does not produce a discovery-ended notification. The final outcome is reported to the
    /// listeners once the platform delivers a terminal [`Event::BondStateChanged`].
    ///
    /// # Errors
    ///
    /// Fails if the platform refuses to initiate pairing, or if another pairing is in flight and
    /// the [`PairingPolicy`] is [`PairingPolicy::Reject`]. No [`PairingAttempt`] is recorded in
    /// either case.
    pub async fn pair(&mut self, device: Address) -> Result<()> {
        if let Some(attempt) = &self.attempt {
            match self.config.pairing_policy {
                PairingPolicy::Reject => {
                    log::debug!(
                        "refusing to pair with {} while pairing with {}",
                        device,
                        attempt.target
                    );
                    return Err(Error::conflict(attempt.target));
                }
                PairingPolicy::Overwrite => log::warn!(
                    "pairing with {} replaces unfinished pairing with {}",
                    device,
                    attempt.target
                ),
            }
        }

        if self.adapter.is_discovering().await {
            log::debug!("cancelling discovery before pairing");
            self.adapter.cancel_discovery().await;
        }
        self.discovery = DiscoveryState::Idle;

        log::debug!("bonding with {}", device);
        if !self.adapter.create_bond(device).await {
            log::debug!("platform refused to bond with {}", device);
            self.update_progress();
            return Err(Error::rejected("create bond"));
        }

        self.attempts_started += 1;
        self.attempt = Some(PairingAttempt {
            target: device,
            started_at: self.attempts_started,
        });
        self.update_progress();
        Ok(())
    }

    /// Returns whether `device` is already bonded with the adapter.
    pub async fn is_already_paired(&self, device: Address) -> bool {
        self.adapter.bonded_devices().await.contains(&device)
    }

    pub fn is_pairing_in_progress(&self) -> bool {
        self.attempt.is_some()
    }

    pub fn current_pairing_target(&self) -> Option<PairingAttempt> {
        self.attempt
    }

    pub fn pairing_state(&self) -> PairingState {
        match self.attempt {
            Some(_) => PairingState::Bonding,
            None => PairingState::NoPairing,
        }
    }

    /// Re-queries the bond state of the device being paired.
    ///
    /// If pairing has finished, the attempt is cleared and [`PairingState::Bonded`] or
    /// [`PairingState::BondFailed`] is returned. Listeners are not notified; that only happens
    /// in response to an [`Event::BondStateChanged`].
    ///
    /// # Panics
    ///
    /// Panics if no pairing is in flight. Check [`Coordinator::is_pairing_in_progress`] first.
    pub async fn pairing_status(&mut self) -> PairingState {
        let target = match &self.attempt {
            Some(attempt) => attempt.target,
            None => panic!("pairing status queried while no device is pairing"),
        };

        let status = match self.adapter.bond_state(target).await {
            BondState::Bonding => return PairingState::Bonding,
            BondState::Bonded => PairingState::Bonded,
            BondState::None => PairingState::BondFailed,
        };
        self.attempt = None;
        self.update_progress();
        status
    }

    /// Makes the next adapter power state change to [`AdapterStatus::On`] start a discovery.
    ///
    /// If the adapter reports [`AdapterStatus::Off`] instead, the scheduled discovery is dropped
    /// and listeners receive [`DiscoveryListener::on_bluetooth_enable_failed`].
    pub fn schedule_discovery_on_power_on(&mut self) {
        log::debug!("discovery scheduled for when the adapter is powered");
        self.pending = Some(PendingCommand::StartDiscovery);
    }

    /// Starts discovery, powering up the adapter first if necessary.
    ///
    /// # Errors
    ///
    /// Fails if the adapter is powered and refuses to discover, or if it is not powered and
    /// refuses to power up.
    pub async fn enable_and_discover(&mut self) -> Result<()> {
        if self.adapter.adapter_state().await == AdapterStatus::On {
            return self.start_discovery().await;
        }

        self.schedule_discovery_on_power_on();
        if !self.adapter.power_on().await {
            log::debug!("platform refused to power up the adapter");
            self.pending = None;
            return Err(Error::rejected("power on"));
        }
        Ok(())
    }

    /// Waits for the next platform event and handles it.
    ///
    /// # Errors
    ///
    /// Returns the event source's error if it has ended.
    pub async fn process_next_event(&mut self) -> Result<()> {
        let event = self.events.next_event().await?;
        self.handle_event(event).await;
        Ok(())
    }

    /// Updates state in response to a platform event and notifies listeners.
    pub async fn handle_event(&mut self, event: Event) {
        log::debug!("incoming event: {:?}", event);
        match event {
            Event::DeviceFound(device) => self.on_device_found(device),
            Event::DiscoveryFinished => self.on_discovery_finished().await,
            Event::AdapterStateChanged => self.on_adapter_state_changed().await,
            Event::BondStateChanged(device) => self.on_bond_state_changed(device).await,
        }
    }

    fn on_device_found(&mut self, device: DeviceRecord) {
        if let Some(listed) = self
            .devices
            .iter_mut()
            .find(|d| d.address() == device.address())
        {
            if device.name().is_some() && device.name() != listed.name() {
                log::debug!("{} is now called {}", listed, device.display_name());
                *listed = DeviceRecord::new(
                    device.address(),
                    device.name().map(str::to_string),
                    listed.bond_state(),
                );
            } else {
                log::trace!("{} already listed", device);
            }
            return;
        }

        log::debug!("device discovered: {}", device);
        self.devices.push(device);
        if let Some(device) = self.devices.last() {
            self.listener.on_device_discovered(device);
        }
    }

    async fn on_discovery_finished(&mut self) {
        // Restarting a discovery makes the platform report the end of the session it stopped.
        if self.discovery == DiscoveryState::Discovering && self.adapter.is_discovering().await {
            log::debug!("discovery ended, but the adapter is still discovering");
        } else {
            log::debug!("discovery ended");
            self.discovery = DiscoveryState::Idle;
        }
        self.update_progress();
        self.listener.on_device_discovery_end();
    }

    /// Re-queries the adapter power state and carries out a scheduled discovery.
    pub async fn on_adapter_state_changed(&mut self) {
        let status = self.adapter.adapter_state().await;
        log::debug!("adapter state changed: {:?}", status);
        self.listener.on_bluetooth_status_changed(status);

        let Some(command) = self.pending else {
            return;
        };
        match (command, status) {
            (PendingCommand::StartDiscovery, AdapterStatus::On) => {
                log::debug!("adapter powered, starting scheduled discovery");
                self.pending = None;
                if let Err(e) = self.start_discovery().await {
                    log::warn!("scheduled discovery failed: {}", e);
                }
            }
            (PendingCommand::StartDiscovery, AdapterStatus::Off) => {
                log::debug!("adapter failed to power up, dropping scheduled discovery");
                self.pending = None;
                self.listener.on_bluetooth_enable_failed();
            }
            (PendingCommand::StartDiscovery, AdapterStatus::TurningOn) => {
                self.listener.on_bluetooth_turning_on();
            }
            (PendingCommand::StartDiscovery, AdapterStatus::TurningOff) => {}
        }
    }

    /// Re-queries the bond state of `device` and advances the in-flight pairing if it targets
    /// `device`.
    pub async fn on_bond_state_changed(&mut self, device: Address) {
        let state = self.adapter.bond_state(device).await;
        if let Some(record) = self.devices.iter_mut().find(|d| d.address() == device) {
            record.set_bond_state(state);
        }

        let Some(attempt) = self.attempt else {
            log::trace!("bond state of {} changed, no pairing in flight", device);
            return;
        };
        if attempt.target != device {
            log::debug!(
                "ignoring bond state change of {} while pairing with {}",
                device,
                attempt.target
            );
            return;
        }

        match state {
            BondState::Bonding => log::debug!("still bonding with {}", device),
            BondState::Bonded => self.finish_pairing(device, PairingState::Bonded).await,
            BondState::None => self.finish_pairing(device, PairingState::BondFailed).await,
        }
    }

    async fn finish_pairing(&mut self, device: Address, outcome: PairingState) {
        log::debug!("pairing with {} ended: {:?}", device, outcome);
        self.attempt = None;
        self.update_progress();

        let record = match self.devices.iter().find(|d| d.address() == device) {
            Some(record) => record.clone(),
            None => {
                let bond_state = match outcome {
                    PairingState::Bonded => BondState::Bonded,
                    _ => BondState::None,
                };
                DeviceRecord::new(device, None, bond_state)
            }
        };

        if outcome == PairingState::Bonded {
            let details = DeviceDetails {
                name: record.display_name().into_owned(),
                address: device,
                service_uuids: self.adapter.service_uuids(device).await,
            };
            self.progress.connected_device_info(&details);
        }
        self.listener.on_device_pairing_ended(&record, outcome);
    }

    /// Starts or ends the progress indicator when the coordinator becomes busy or idle.
    fn update_progress(&mut self) {
        let busy = self.discovery == DiscoveryState::Discovering || self.attempt.is_some();
        if busy == self.busy {
            return;
        }
        self.busy = busy;
        if busy {
            self.progress.start_loading();
        } else {
            self.progress.end_loading();
        }
    }

    /// Releases the event subscription.
    pub fn shutdown(self) {
        log::debug!("coordinator shutting down, releasing event subscription");
        drop(self.events);
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        collections::{HashMap, HashSet, VecDeque},
    };

    use pollster::block_on;

    use super::*;
    use crate::uuid::Uuid;

    struct FakeAdapter {
        status: Cell<AdapterStatus>,
        discovering: Cell<bool>,
        refuse_discovery: Cell<bool>,
        refuse_bond: Cell<bool>,
        refuse_power: Cell<bool>,
        bonds: RefCell<HashMap<Address, BondState>>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeAdapter {
        fn new() -> Self {
            Self {
                status: Cell::new(AdapterStatus::On),
                discovering: Cell::new(false),
                refuse_discovery: Cell::new(false),
                refuse_bond: Cell::new(false),
                refuse_power: Cell::new(false),
                bonds: RefCell::new(HashMap::new()),
                calls: RefCell::new(Vec::new()),
            }
        }

        fn set_bond(&self, device: Address, state: BondState) {
            self.bonds.borrow_mut().insert(device, state);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn log(&self, call: String) {
            self.calls.borrow_mut().push(call);
        }
    }

    impl AdapterFacade for FakeAdapter {
        async fn is_discovering(&self) -> bool {
            self.discovering.get()
        }

        async fn start_discovery(&self) -> bool {
            self.log("start_discovery".into());
            if self.refuse_discovery.get() {
                return false;
            }
            self.discovering.set(true);
            true
        }

        async fn cancel_discovery(&self) {
            self.log("cancel_discovery".into());
            self.discovering.set(false);
        }

        async fn bonded_devices(&self) -> HashSet<Address> {
            self.bonds
                .borrow()
                .iter()
                .filter(|(_, state)| **state == BondState::Bonded)
                .map(|(addr, _)| *addr)
                .collect()
        }

        async fn create_bond(&self, device: Address) -> bool {
            self.log(format!("create_bond {}", device));
            if self.refuse_bond.get() {
                return false;
            }
            self.set_bond(device, BondState::Bonding);
            true
        }

        async fn adapter_state(&self) -> AdapterStatus {
            self.status.get()
        }

        async fn bond_state(&self, device: Address) -> BondState {
            self.bonds
                .borrow()
                .get(&device)
                .copied()
                .unwrap_or_default()
        }

        async fn service_uuids(&self, _device: Address) -> Vec<Uuid> {
            vec![Uuid::from_u16(0x110b)]
        }

        async fn power_on(&self) -> bool {
            self.log("power_on".into());
            if self.refuse_power.get() {
                return false;
            }
            self.status.set(AdapterStatus::TurningOn);
            true
        }
    }

    #[derive(Default)]
    struct ScriptedEvents(VecDeque<Event>);

    impl EventSource for ScriptedEvents {
        async fn next_event(&mut self) -> Result<Event> {
            self.0.pop_front().ok_or_else(Error::closed)
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Note {
        Discovered(Address),
        Started,
        Ended,
        Status(AdapterStatus),
        TurningOn,
        EnableFailed,
        PairingEnded(Address, PairingState),
    }

    #[derive(Default)]
    struct Recorder(Vec<Note>);

    impl DiscoveryListener for Recorder {
        fn on_device_discovered(&mut self, device: &DeviceRecord) {
            self.0.push(Note::Discovered(device.address()));
        }

        fn on_device_discovery_started(&mut self) {
            self.0.push(Note::Started);
        }

        fn on_device_discovery_end(&mut self) {
            self.0.push(Note::Ended);
        }

        fn on_bluetooth_status_changed(&mut self, status: AdapterStatus) {
            self.0.push(Note::Status(status));
        }

        fn on_bluetooth_turning_on(&mut self) {
            self.0.push(Note::TurningOn);
        }

        fn on_bluetooth_enable_failed(&mut self) {
            self.0.push(Note::EnableFailed);
        }

        fn on_device_pairing_ended(&mut self, device: &DeviceRecord, outcome: PairingState) {
            self.0.push(Note::PairingEnded(device.address(), outcome));
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Busy {
        Start,
        End,
        Details(DeviceDetails),
    }

    #[derive(Default)]
    struct Spinner(Vec<Busy>);

    impl ProgressListener for Spinner {
        fn start_loading(&mut self) {
            self.0.push(Busy::Start);
        }

        fn end_loading(&mut self) {
            self.0.push(Busy::End);
        }

        fn connected_device_info(&mut self, details: &DeviceDetails) {
            self.0.push(Busy::Details(details.clone()));
        }
    }

    type TestCoordinator = Coordinator<FakeAdapter, ScriptedEvents, Recorder, Spinner>;

    fn coordinator() -> TestCoordinator {
        Coordinator::new(
            FakeAdapter::new(),
            ScriptedEvents::default(),
            Recorder::default(),
            Spinner::default(),
        )
    }

    fn addr(last: u8) -> Address {
        Address::from_bytes([0xAA, 0xBB, 0xCC, 0x00, 0x00, last])
    }

    fn found(last: u8, name: &str) -> Event {
        Event::DeviceFound(DeviceRecord::new(
            addr(last),
            Some(name.to_string()),
            BondState::None,
        ))
    }

    fn notes(c: &TestCoordinator) -> &[Note] {
        &c.listener().0
    }

    fn listed(c: &TestCoordinator) -> Vec<Address> {
        c.devices().iter().map(|d| d.address()).collect()
    }

    #[test]
    fn discovery_list_keeps_discovery_order() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            assert!(c.devices().is_empty());

            c.handle_event(found(3, "C")).await;
            assert_eq!(listed(&c), [addr(3)]);
            c.handle_event(found(1, "A")).await;
            c.handle_event(found(2, "B")).await;
            assert_eq!(listed(&c), [addr(3), addr(1), addr(2)]);
            assert_eq!(
                notes(&c),
                [
                    Note::Started,
                    Note::Discovered(addr(3)),
                    Note::Discovered(addr(1)),
                    Note::Discovered(addr(2)),
                ]
            );
        });
    }

    #[test]
    fn repeated_sightings_are_listed_once() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(1, "A")).await;
            c.handle_event(found(1, "A")).await;
            assert_eq!(listed(&c), [addr(1)]);
            assert_eq!(notes(&c), [Note::Started, Note::Discovered(addr(1))]);
        });
    }

    #[test]
    fn late_name_updates_listed_device() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(Event::DeviceFound(DeviceRecord::new(
                addr(1),
                None,
                BondState::None,
            )))
            .await;
            assert_eq!(c.devices()[0].display_name(), "AA:BB:CC:00:00:01");

            c.handle_event(found(1, "Speaker")).await;
            assert_eq!(listed(&c), [addr(1)]);
            assert_eq!(c.devices()[0].display_name(), "Speaker");

            // A sighting without a name keeps the known one.
            c.handle_event(Event::DeviceFound(DeviceRecord::new(
                addr(1),
                None,
                BondState::None,
            )))
            .await;
            assert_eq!(c.devices()[0].name(), Some("Speaker"));
            assert_eq!(notes(&c), [Note::Started, Note::Discovered(addr(1))]);
        });
    }

    #[test]
    fn discovery_session_scenario() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            assert_eq!(c.discovery_state(), DiscoveryState::Discovering);

            c.handle_event(found(1, "A")).await;
            c.handle_event(found(2, "B")).await;
            c.adapter().discovering.set(false);
            c.handle_event(Event::DiscoveryFinished).await;

            assert_eq!(listed(&c), [addr(1), addr(2)]);
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);
            assert_eq!(c.pairing_state(), PairingState::NoPairing);
            let ended = notes(&c).iter().filter(|n| **n == Note::Ended).count();
            assert_eq!(ended, 1);
            assert_eq!(c.progress().0, [Busy::Start, Busy::End]);
        });
    }

    #[test]
    fn new_discovery_clears_list_after_finish() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(1, "A")).await;
            c.adapter().discovering.set(false);
            c.handle_event(Event::DiscoveryFinished).await;

            c.start_discovery().await.unwrap();
            assert!(c.devices().is_empty());
        });
    }

    #[test]
    fn new_discovery_clears_list_after_cancel() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(1, "A")).await;
            c.cancel_discovery().await;
            assert_eq!(listed(&c), [addr(1)]);

            c.start_discovery().await.unwrap();
            assert!(c.devices().is_empty());
        });
    }

    #[test]
    fn restarting_discovery_cancels_running_one() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(1, "A")).await;
            c.start_discovery().await.unwrap();

            assert_eq!(
                c.adapter().calls(),
                ["start_discovery", "cancel_discovery", "start_discovery"]
            );
            assert!(c.devices().is_empty());
            assert_eq!(
                notes(&c),
                [Note::Started, Note::Discovered(addr(1)), Note::Started]
            );
        });
    }

    #[test]
    fn finish_of_replaced_session_keeps_discovering() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.start_discovery().await.unwrap();

            // The platform reports the end of the first session after the restart.
            c.handle_event(Event::DiscoveryFinished).await;
            assert_eq!(c.discovery_state(), DiscoveryState::Discovering);
            assert_eq!(notes(&c), [Note::Started, Note::Started, Note::Ended]);
            assert_eq!(c.progress().0, [Busy::Start]);

            c.adapter().discovering.set(false);
            c.handle_event(Event::DiscoveryFinished).await;
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);
            assert_eq!(c.progress().0, [Busy::Start, Busy::End]);
        });
    }

    #[test]
    fn finish_after_cancel_stays_idle() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.cancel_discovery().await;
            // Someone else started discovering in the meantime.
            c.adapter().discovering.set(true);
            c.handle_event(Event::DiscoveryFinished).await;
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);
            assert_eq!(c.progress().0, [Busy::Start, Busy::End]);
        });
    }

    #[test]
    fn refused_discovery_reports_end() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(1, "A")).await;
            c.adapter().discovering.set(false);
            c.adapter().refuse_discovery.set(true);

            let err = c.start_discovery().await.unwrap_err();
            assert!(err.is_rejected());
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);
            assert_eq!(notes(&c).last(), Some(&Note::Ended));
            assert!(!notes(&c)[2..].contains(&Note::Started));
            // The previous session's results stay until a discovery actually starts.
            assert_eq!(listed(&c), [addr(1)]);
            // No retry.
            assert_eq!(c.adapter().calls(), ["start_discovery", "start_discovery"]);
        });
    }

    #[test]
    fn cancel_without_discovery_still_notifies() {
        block_on(async {
            let mut c = coordinator();
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);
            c.cancel_discovery().await;
            assert_eq!(notes(&c), [Note::Ended]);
            assert_eq!(c.adapter().calls(), ["cancel_discovery"]);
        });
    }

    #[test]
    fn successful_pairing_scenario() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(1, "Headphones")).await;

            c.pair(addr(1)).await.unwrap();
            assert!(c.is_pairing_in_progress());
            assert_eq!(c.pairing_state(), PairingState::Bonding);
            assert_eq!(c.current_pairing_target().map(|a| a.target()), Some(addr(1)));
            assert_eq!(c.discovery_state(), DiscoveryState::Idle);

            let before = notes(&c).len();
            c.handle_event(Event::BondStateChanged(addr(1))).await;
            assert_eq!(notes(&c).len(), before);
            assert!(c.is_pairing_in_progress());
            assert_eq!(c.devices()[0].bond_state(), BondState::Bonding);

            c.adapter().set_bond(addr(1), BondState::Bonded);
            c.handle_event(Event::BondStateChanged(addr(1))).await;

            assert!(!c.is_pairing_in_progress());
            assert_eq!(c.current_pairing_target(), None);
            assert_eq!(c.pairing_state(), PairingState::NoPairing);
            assert_eq!(
                notes(&c).last(),
                Some(&Note::PairingEnded(addr(1), PairingState::Bonded))
            );
            assert_eq!(c.devices()[0].bond_state(), BondState::Bonded);
            assert_eq!(
                c.progress().0.last(),
                Some(&Busy::Details(DeviceDetails {
                    name: "Headphones".into(),
                    address: addr(1),
                    service_uuids: vec![Uuid::from_u16(0x110b)],
                }))
            );
            assert!(c.is_already_paired(addr(1)).await);
        });
    }

    #[test]
    fn failed_pairing_is_reported() {
        block_on(async {
            let mut c = coordinator();
            c.pair(addr(1)).await.unwrap();

            c.adapter().set_bond(addr(1), BondState::None);
            c.handle_event(Event::BondStateChanged(addr(1))).await;

            assert!(!c.is_pairing_in_progress());
            assert_eq!(
                notes(&c),
                [Note::PairingEnded(addr(1), PairingState::BondFailed)]
            );
            assert_eq!(c.progress().0, [Busy::Start, Busy::End]);
            assert!(!c.is_already_paired(addr(1)).await);
        });
    }

    #[test]
    fn refused_bond_creates_no_attempt() {
        block_on(async {
            let mut c = coordinator();
            c.adapter().refuse_bond.set(true);

            let err = c.pair(addr(1)).await.unwrap_err();
            assert!(err.is_rejected());
            assert!(!c.is_pairing_in_progress());
            assert_eq!(c.current_pairing_target(), None);
            assert!(c.progress().0.is_empty());
        });
    }

    #[test]
    fn pairing_cancels_discovery_silently() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.pair(addr(1)).await.unwrap();

            assert_eq!(
                c.adapter().calls(),
                [
                    "start_discovery",
                    "cancel_discovery",
                    "create_bond AA:BB:CC:00:00:01"
                ]
            );
            assert!(!notes(&c).contains(&Note::Ended));
            // Still busy: the pairing took over from the discovery.
            assert_eq!(c.progress().0, [Busy::Start]);

            // The platform reports the cancelled discovery as finished.
            c.handle_event(Event::DiscoveryFinished).await;
            assert_eq!(c.progress().0, [Busy::Start]);

            c.adapter().set_bond(addr(1), BondState::None);
            c.handle_event(Event::BondStateChanged(addr(1))).await;
            assert_eq!(c.progress().0, [Busy::Start, Busy::End]);
        });
    }

    #[test]
    fn second_pair_overwrites_attempt() {
        block_on(async {
            let mut c = coordinator();
            c.pair(addr(1)).await.unwrap();
            let first = c.current_pairing_target().unwrap();
            assert_eq!(first.started_at(), 1);

            c.pair(addr(2)).await.unwrap();
            let second = c.current_pairing_target().unwrap();
            assert_eq!(second.target(), addr(2));
            assert_eq!(second.started_at(), 2);

            // The first target finishing no longer matters.
            c.adapter().set_bond(addr(1), BondState::Bonded);
            c.handle_event(Event::BondStateChanged(addr(1))).await;
            assert_eq!(c.current_pairing_target(), Some(second));
            assert!(notes(&c).is_empty());
            assert_eq!(c.progress().0, [Busy::Start]);

            c.adapter().set_bond(addr(2), BondState::Bonded);
            c.handle_event(Event::BondStateChanged(addr(2))).await;
            let ends = c.progress().0.iter().filter(|b| **b == Busy::End).count();
            assert_eq!(ends, 1);
            assert_eq!(c.progress().0[..2], [Busy::Start, Busy::End]);
        });
    }

    #[test]
    fn reject_policy_refuses_second_pair() {
        block_on(async {
            let mut c = coordinator().with_config(Config {
                pairing_policy: PairingPolicy::Reject,
            });
            c.pair(addr(1)).await.unwrap();

            let err = c.pair(addr(2)).await.unwrap_err();
            assert!(err.is_conflict());
            assert_eq!(c.current_pairing_target().map(|a| a.target()), Some(addr(1)));
            assert_eq!(c.adapter().calls(), ["create_bond AA:BB:CC:00:00:01"]);
        });
    }

    #[test]
    fn bond_change_of_other_device_is_ignored() {
        block_on(async {
            let mut c = coordinator();
            c.start_discovery().await.unwrap();
            c.handle_event(found(2, "B")).await;
            c.pair(addr(1)).await.unwrap();
            let before = notes(&c).to_vec();

            c.adapter().set_bond(addr(2), BondState::Bonded);
            c.handle_event(Event::BondStateChanged(addr(2))).await;

            assert_eq!(c.pairing_state(), PairingState::Bonding);
            assert_eq!(c.current_pairing_target().map(|a| a.target()), Some(addr(1)));
            assert_eq!(notes(&c), before);
            // The listed device still picks up its new bond state.
            assert_eq!(c.devices()[0].bond_state(), BondState::Bonded);
        });
    }

    #[test]
    fn bond_change_without_attempt_is_ignored() {
        block_on(async {
            let mut c = coordinator();
            c.adapter().set_bond(addr(1), BondState::Bonded);
            c.handle_event(Event::BondStateChanged(addr(1))).await;
            assert!(notes(&c).is_empty());
            assert!(c.progress().0.is_empty());
        });
    }

    #[test]
    fn pairing_without_terminal_event_never_times_out() {
        block_on(async {
            let mut c = coordinator();
            c.pair(addr(1)).await.unwrap();

            for _ in 0..100 {
                c.handle_event(Event::BondStateChanged(addr(1))).await;
                c.handle_event(Event::AdapterStateChanged).await;
            }
            assert_eq!(c.pairing_state(), PairingState::Bonding);
            assert_eq!(c.pairing_status().await, PairingState::Bonding);
            assert!(c.is_pairing_in_progress());
        });
    }

    #[test]
    fn pairing_status_clears_finished_attempt() {
        block_on(async {
            let mut c = coordinator();
            c.pair(addr(1)).await.unwrap();
            assert_eq!(c.pairing_status().await, PairingState::Bonding);
            assert!(c.is_pairing_in_progress());

            c.adapter().set_bond(addr(1), BondState::Bonded);
            assert_eq!(c.pairing_status().await, PairingState::Bonded);
            assert!(!c.is_pairing_in_progress());
            assert!(notes(&c).is_empty());
        });
    }

    #[test]
    #[should_panic(expected = "no device is pairing")]
    fn pairing_status_without_attempt_panics() {
        let mut c = coordinator();
        block_on(c.pairing_status());
    }

    #[test]
    fn power_state_change_without_schedule_only_notifies() {
        block_on(async {
            let mut c = coordinator();
            c.adapter().status.set(AdapterStatus::Off);
            c.handle_event(Event::AdapterStateChanged).await;
            c.adapter().status.set(AdapterStatus::On);
            c.handle_event(Event::AdapterStateChanged).await;

            assert_eq!(
                notes(&c),
                [
                    Note::Status(AdapterStatus::Off),
                    Note::Status(AdapterStatus::On)
                ]
            );
            assert!(c.adapter().calls().is_empty());
        });
    }

    #[test]
    fn scheduled_discovery_starts_when_powered() {
        block_on(async {
            let mut c = coordinator();
            c.adapter().status.set(AdapterStatus::Off);
            c.enable_and_discover().await.unwrap();
            assert_eq!(c.adapter().calls(), ["power_on"]);

            c.handle_event(Event::AdapterStateChanged).await;
            c.adapter().status.set(AdapterStatus::On);
            c.handle_event(Event::AdapterStateChanged).await;

            assert_eq!(
                notes(&c),
                [
                    Note::Status(AdapterStatus::TurningOn),
                    Note::TurningOn,
                    Note::Status(AdapterStatus::On),
                    Note::Started,
                ]
            );
            assert_eq!(c.discovery_state(), DiscoveryState::Discovering);

            // The schedule is consumed.
            c.handle_event(Event::AdapterStateChanged).await;
            assert_eq!(c.adapter().calls(), ["power_on", "start_discovery"]);
        });
    }

    #[test]
    fn scheduled_discovery_dropped_when_power_fails() {
        block_on(async {
            let mut c = coordinator();
            c.schedule_discovery_on_power_on();
            c.adapter().status.set(AdapterStatus::TurningOff);
            c.handle_event(Event::AdapterStateChanged).await;
            c.adapter().status.set(AdapterStatus::Off);
            c.handle_event(Event::AdapterStateChanged).await;
            c.adapter().status.set(AdapterStatus::On);
            c.handle_event(Event::AdapterStateChanged).await;

            assert_eq!(
                notes(&c),
                [
                    Note::Status(AdapterStatus::TurningOff),
                    Note::Status(AdapterStatus::Off),
                    Note::EnableFailed,
                    Note::Status(AdapterStatus::On),
                ]
            );
            assert!(c.adapter().calls().is_empty());
        });
    }

    #[test]
    fn enable_and_discover_on_powered_adapter() {
        block_on(async {
            let mut c = coordinator();
            c.enable_and_discover().await.unwrap();
            assert_eq!(c.adapter().calls(), ["start_discovery"]);
            assert_eq!(notes(&c), [Note::Started]);
        });
    }

    #[test]
    fn refused_power_on_drops_schedule() {
        block_on(async {
            let mut c = coordinator();
            c.adapter().status.set(AdapterStatus::Off);
            c.adapter().refuse_power.set(true);
            assert!(c.enable_and_discover().await.unwrap_err().is_rejected());

            c.adapter().status.set(AdapterStatus::On);
            c.handle_event(Event::AdapterStateChanged).await;
            assert_eq!(c.adapter().calls(), ["power_on"]);
        });
    }

    #[test]
    fn events_are_pulled_in_delivery_order() {
        block_on(async {
            let events = ScriptedEvents(VecDeque::from([
                found(2, "B"),
                found(1, "A"),
                Event::DiscoveryFinished,
            ]));
            let mut c = Coordinator::new(
                FakeAdapter::new(),
                events,
                Recorder::default(),
                Spinner::default(),
            );

            while c.process_next_event().await.is_ok() {}
            assert_eq!(listed(&c), [addr(2), addr(1)]);
            assert_eq!(notes(&c).last(), Some(&Note::Ended));

            let err = c.process_next_event().await.unwrap_err();
            assert!(err.is_closed());
            c.shutdown();
        });
    }
}
