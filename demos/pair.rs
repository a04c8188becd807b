use std::{env, process};

use bluepair::{
    address::Address,
    device::{DeviceDetails, DeviceRecord},
    Adapter, Coordinator, DiscoveryListener, PairingState, ProgressListener,
    Session,
};

#[derive(Default)]
struct Outcome {
    ended: Option<PairingState>,
}

impl DiscoveryListener for Outcome {
    fn on_device_discovered(&mut self, device: &DeviceRecord) {
        log::info!("saw {}", device);
    }

    fn on_device_pairing_ended(&mut self, device: &DeviceRecord, outcome: PairingState) {
        log::info!("pairing with {} ended: {:?}", device.display_name(), outcome);
        self.ended = Some(outcome);
    }
}

struct Details;

impl ProgressListener for Details {
    fn start_loading(&mut self) {
        log::info!("working...");
    }

    fn connected_device_info(&mut self, details: &DeviceDetails) {
        print!("{}", details);
    }
}

#[pollster::main]
async fn main() -> bluepair::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .filter_module(env!("CARGO_CRATE_NAME"), log::LevelFilter::Debug)
        .init();

    let target: Address = match env::args().nth(1).map(|arg| arg.parse()) {
        Some(Ok(addr)) => addr,
        Some(Err(e)) => {
            eprintln!("invalid device address: {}", e);
            process::exit(1);
        }
        None => {
            eprintln!("usage: pair <AA:BB:CC:DD:EE:FF>");
            process::exit(1);
        }
    };

    let session = Session::new().await?;
    let adapter = Adapter::open(&session).await?;
    let events = adapter.events().await?;
    let mut coordinator = Coordinator::new(adapter, events, Outcome::default(), Details);
    if coordinator.is_already_paired(target).await {
        println!("device {} already paired!", target);
        return Ok(());
    }

    coordinator.enable_and_discover().await?;

    while !coordinator.devices().iter().any(|d| d.address() == target) {
        coordinator.process_next_event().await?;
    }

    if let Err(e) = coordinator.pair(target).await {
        eprintln!("error while pairing with device {}: {}", target, e);
        process::exit(1);
    }

    while coordinator.listener().ended.is_none() {
        coordinator.process_next_event().await?;
    }

    let failed = coordinator.listener().ended == Some(PairingState::BondFailed);
    coordinator.shutdown();
    if failed {
        process::exit(1);
    }
    Ok(())
}
