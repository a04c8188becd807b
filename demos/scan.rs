use bluepair::{
    device::DeviceRecord, Adapter, AdapterStatus, Coordinator, DiscoveryListener, DiscoveryState,
    Session,
};

struct Printer;

impl DiscoveryListener for Printer {
    fn on_device_discovered(&mut self, device: &DeviceRecord) {
        println!(
            "saw {} ({:?}): {}",
            device.address(),
            device.bond_state(),
            device.display_name(),
        );
    }

    fn on_device_discovery_started(&mut self) {
        println!("device discovery started...");
    }

    fn on_bluetooth_status_changed(&mut self, status: AdapterStatus) {
        println!("adapter is {:?}", status);
    }

    fn on_bluetooth_enable_failed(&mut self) {
        eprintln!("adapter could not be powered up");
    }
}

#[pollster::main]
async fn main() -> bluepair::Result<()> {
    env_logger::builder()
        .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
        .init();

    let session = Session::new().await?;
    let adapter = Adapter::open(&session).await?;
    println!(
        "adapter {} address: {}",
        adapter.device_name(),
        adapter.address().await?
    );

    let events = adapter.events().await?;
    let mut coordinator = Coordinator::new(adapter, events, Printer, ());
    coordinator.enable_and_discover().await?;

    let mut started = false;
    loop {
        coordinator.process_next_event().await?;

        match coordinator.discovery_state() {
            DiscoveryState::Discovering => started = true,
            DiscoveryState::Idle if started => {
                eprintln!("discovery stopped externally, exiting");
                break;
            }
            DiscoveryState::Idle => {}
        }
    }

    println!("{} devices found", coordinator.devices().len());
    coordinator.shutdown();
    Ok(())
}
