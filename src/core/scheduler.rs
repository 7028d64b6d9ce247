//! Background sweep over the registry.
//!
//! Each sweep works from a [`DeviceSnapshot`] of the registry so no registry
//! lock is held across bus traffic. Devices are visited in registry order
//! and registers in insertion order, one single-register read each.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::registry::DeviceSnapshot;
use crate::core::supervisor::Supervisor;

pub const IDLE_BACKOFF_MS: u64 = 1000;
pub const REGISTER_SPACING_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct PollingConfig {
    /// Pause between sweeps while there is nothing to poll.
    pub idle_backoff: Duration,
    /// Pause after every register read.
    pub register_spacing: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            idle_backoff: Duration::from_millis(IDLE_BACKOFF_MS),
            register_spacing: Duration::from_millis(REGISTER_SPACING_MS),
        }
    }
}

/// Handle to a running scheduler task.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn(supervisor: Arc<Supervisor>, config: PollingConfig) -> Scheduler {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            info!("Polling started");
            run(&supervisor, &config, shutdown_rx).await;
            info!("Polling stopped");
        });

        Scheduler { shutdown_tx, task }
    }

    /// Signals the task and waits for it to finish its current transaction.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);

        if let Err(err) = self.task.await {
            warn!("Polling task ended abnormally: {err}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn run(supervisor: &Supervisor, config: &PollingConfig, mut stop: watch::Receiver<bool>) {
    while !stopped(&stop) {
        let snapshot = supervisor.snapshot();

        let paced = match sweep(supervisor, config, &snapshot, &mut stop).await {
            Some(paced) => paced,
            None => return,
        };

        // Nothing slept this sweep: empty registry, or nothing enabled
        // with registers.
        if !paced {
            debug!("Nothing to poll, backing off for {:?}", config.idle_backoff);
            if pause(&mut stop, config.idle_backoff).await {
                return;
            }
        }
    }
}

/// Returns `None` when stopped mid-sweep, otherwise whether any device
/// interval was waited out.
async fn sweep(
    supervisor: &Supervisor,
    config: &PollingConfig,
    snapshot: &[DeviceSnapshot],
    stop: &mut watch::Receiver<bool>,
) -> Option<bool> {
    let mut paced = false;

    for device in snapshot {
        if stopped(stop) {
            return None;
        }

        if !device.enabled {
            continue;
        }

        for &(address, kind) in &device.registers {
            if stopped(stop) {
                return None;
            }

            supervisor.poll_register(device.device_id, address, kind).await;

            if pause(stop, config.register_spacing).await {
                return None;
            }
        }

        if !device.registers.is_empty() {
            paced = true;
            let interval = Duration::from_millis(u64::from(device.poll_interval_ms));
            if pause(stop, interval).await {
                return None;
            }
        }
    }

    Some(paced)
}

fn stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Sleeps for `duration` unless stopped first. Returns true when stopped.
async fn pause(stop: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop.wait_for(|stopped| *stopped) => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::device::{Device, DeviceStatus, Register, RegisterKind};
    use crate::core::modbus::transports::{Behaviour, EmulatedBus};
    use crate::core::modbus::EngineConfig;
    use crate::core::store::MemoryStore;

    fn supervisor(bus: &EmulatedBus) -> Arc<Supervisor> {
        let _ = env_logger::builder().is_test(true).try_init();

        Arc::new(Supervisor::new(
            Some(Box::new(bus.clone())),
            EngineConfig {
                timeout: Duration::from_millis(20),
                retry_attempts: 1,
            },
            PollingConfig {
                idle_backoff: Duration::from_millis(5),
                register_spacing: Duration::from_millis(1),
            },
            Box::new(MemoryStore::new()),
        ))
    }

    #[tokio::test]
    async fn single_sweep_refreshes_register() {
        let bus = EmulatedBus::new();
        bus.set_holding(5, 100, 1234);
        let supervisor = supervisor(&bus);
        supervisor
            .add_device(
                Device::new(5, "Boiler")
                    .with_poll_interval(60_000)
                    .with_register(Register::new(100, RegisterKind::HoldingRegister, "Setpoint")),
            )
            .unwrap();
        let mut updates = supervisor.subscribe();

        supervisor.start_polling().await;
        let update = updates.recv().await.unwrap();
        // The device interval is long, so exactly one sweep has run.
        supervisor.stop_polling().await;

        assert_eq!((update.device_id, update.address, update.raw), (5, 100, 1234));

        let device = supervisor.get_device(5).unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.poll_count, 1);
        assert_eq!(device.error_count, 0);
        assert_eq!(device.registers[0].last_raw_value, 1234);
        assert_eq!(supervisor.raw_value(5, 100), 1234);
    }

    #[tokio::test]
    async fn failures_are_recorded_and_sweep_continues() {
        let bus = EmulatedBus::new();
        bus.set_behaviour(2, Behaviour::Exception(0x02));
        bus.set_input(3, 8, 650);
        let supervisor = supervisor(&bus);
        supervisor
            .add_device(
                Device::new(2, "Broken")
                    .with_poll_interval(1)
                    .with_register(Register::new(1, RegisterKind::HoldingRegister, "A"))
                    .with_register(Register::new(2, RegisterKind::Coil, "B")),
            )
            .unwrap();
        supervisor
            .add_device(
                Device::new(3, "Sensor").with_poll_interval(60_000).with_register(
                    Register::new(8, RegisterKind::InputRegister, "Temperature")
                        .with_scaling(0.1, -40.0),
                ),
            )
            .unwrap();
        let mut updates = supervisor.subscribe();

        supervisor.start_polling().await;
        let update = updates.recv().await.unwrap();
        supervisor.stop_polling().await;

        assert_eq!(update.device_id, 3);
        assert!((update.scaled - 25.0).abs() < 1e-4);

        let broken = supervisor.get_device(2).unwrap();
        assert_eq!(broken.status, DeviceStatus::Error);
        assert_eq!(broken.poll_count, 2);
        assert_eq!(broken.error_count, 2);
        assert_eq!(broken.last_error_code, 0x02);
    }

    #[tokio::test]
    async fn disabled_devices_are_skipped() {
        let bus = EmulatedBus::new().with_slave(4);
        let supervisor = supervisor(&bus);
        let mut device = Device::new(4, "Idle")
            .with_register(Register::new(0, RegisterKind::HoldingRegister, "R"));
        device.enabled = false;
        supervisor.add_device(device).unwrap();

        supervisor.start_polling().await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        supervisor.stop_polling().await;

        assert_eq!(bus.writes(), 0);
        assert_eq!(supervisor.get_device(4).unwrap().poll_count, 0);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_interrupts_sleep() {
        let bus = EmulatedBus::new();
        let supervisor = supervisor(&bus);

        supervisor.start_polling().await;
        supervisor.start_polling().await;
        assert!(supervisor.is_polling().await);

        tokio::time::timeout(Duration::from_millis(500), supervisor.stop_polling())
            .await
            .unwrap();
        assert!(!supervisor.is_polling().await);

        // Stopping twice is harmless.
        supervisor.stop_polling().await;
    }
}
