use std::sync::Arc;
use std::time::Duration;

use modbus_supervisor::prelude::*;

/// Polls an emulated boiler for a few seconds and flips its setpoint once.
#[tokio::main]
async fn main() {
    env_logger::init();

    let bus = EmulatedBus::new();
    bus.set_input(5, 7, 650);
    bus.set_holding(5, 100, 1234);

    let supervisor = Arc::new(Supervisor::new(
        Some(Box::new(bus.clone())),
        EngineConfig::default(),
        PollingConfig::default(),
        Box::new(MemoryStore::new()),
    ));

    supervisor
        .add_device(
            Device::new(5, "Boiler")
                .with_poll_interval(500)
                .with_register(
                    Register::new(7, RegisterKind::InputRegister, "Temperature")
                        .with_scaling(0.1, -40.0)
                        .with_unit("C"),
                )
                .with_register(Register::new(100, RegisterKind::HoldingRegister, "Setpoint").writable()),
        )
        .expect("Failed to add device");

    let mut updates = supervisor.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            println!(
                "device {} register {} => raw {} scaled {}",
                update.device_id, update.address, update.raw, update.scaled
            );
        }
    });

    supervisor.start_polling().await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    supervisor
        .write(5, 100, 4321)
        .await
        .expect("Failed to write setpoint");
    println!("Subscribe to: {:?}", supervisor.writable_topics("plant/modbus"));

    tokio::time::sleep(Duration::from_secs(2)).await;
    supervisor.stop_polling().await;
}
