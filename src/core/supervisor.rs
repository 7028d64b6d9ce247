use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::core::device::{Device, Register, RegisterKind};
use crate::core::error::WriteError;
use crate::core::modbus::{Address, Engine, EngineConfig, TransactionError, Transport, Value};
use crate::core::registry::{DeviceSnapshot, LoadOutcome, Registry, RegistryError, NAMESPACE};
use crate::core::scheduler::{PollingConfig, Scheduler};
use crate::core::store::{Store, StoreError};

/// Store key of the frame tracing toggle.
pub const LOGGING_ENABLED_KEY: &str = "logging_enabled";

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Published after every successful poll or write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterUpdate {
    pub device_id: u8,
    pub address: Address,
    pub raw: Value,
    pub scaled: f32,
}

/// Owns the registry, the bus engine and the store for one RTU bus and is
/// shared behind an [`Arc`] by the scheduler and every caller.
pub struct Supervisor {
    registry: RwLock<Registry>,
    engine: Engine,
    store: Mutex<Box<dyn Store>>,
    tracing: Arc<AtomicBool>,
    updates: broadcast::Sender<RegisterUpdate>,
    polling: tokio::sync::Mutex<Option<Scheduler>>,
    polling_config: PollingConfig,
    load_outcome: LoadOutcome,
}

impl Supervisor {
    /// Restores the registry and the tracing toggle from `store`. Without a
    /// transport the engine starts detached; see [`Engine::attach`].
    pub fn new(
        transport: Option<Box<dyn Transport>>,
        engine_config: EngineConfig,
        polling_config: PollingConfig,
        store: Box<dyn Store>,
    ) -> Supervisor {
        let (registry, load_outcome) = Registry::load(&*store);

        let tracing = match store.get_u8(NAMESPACE, LOGGING_ENABLED_KEY) {
            Ok(flag) => flag.unwrap_or(0) != 0,
            Err(err) => {
                warn!("Unreadable {LOGGING_ENABLED_KEY} ({err}), tracing disabled");
                false
            }
        };
        let tracing = Arc::new(AtomicBool::new(tracing));

        let engine = match transport {
            Some(transport) => Engine::new(transport, engine_config, tracing.clone()),
            None => Engine::detached(engine_config, tracing.clone()),
        };

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        info!(
            "Supervisor ready: {} devices ({load_outcome:?}), tracing {}",
            registry.device_count(),
            if tracing.load(Ordering::Relaxed) { "on" } else { "off" }
        );

        Supervisor {
            registry: RwLock::new(registry),
            engine,
            store: Mutex::new(store),
            tracing,
            updates,
            polling: tokio::sync::Mutex::new(None),
            polling_config,
            load_outcome,
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn load_outcome(&self) -> LoadOutcome {
        self.load_outcome
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegisterUpdate> {
        self.updates.subscribe()
    }

    /// Applies `mutation` to a copy of the registry and commits the copy only
    /// once it has been saved.
    ///
    /// The store lock serializes structural changes. The registry lock is
    /// only taken to copy and to swap, so polls continue during the save;
    /// their results are carried over on the swap.
    fn mutate<T>(
        &self,
        mutation: impl FnOnce(&mut Registry) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut store = self.store.lock();
        let mut staged = self.registry.read().clone();

        let output = mutation(&mut staged)?;
        persist(&mut **store, |store| staged.save(store))?;

        let mut registry = self.registry.write();
        staged.adopt_runtime(&registry);
        *registry = staged;
        Ok(output)
    }

    pub fn add_device(&self, device: Device) -> Result<(), RegistryError> {
        self.mutate(|registry| registry.add_device(device))
    }

    pub fn update_device(&self, device_id: u8, device: Device) -> Result<(), RegistryError> {
        self.mutate(|registry| registry.update_device(device_id, device))
    }

    pub fn remove_device(&self, device_id: u8) -> Result<Device, RegistryError> {
        self.mutate(|registry| registry.remove_device(device_id))
    }

    pub fn add_register(&self, device_id: u8, register: Register) -> Result<(), RegistryError> {
        self.mutate(|registry| registry.add_register(device_id, register))
    }

    pub fn update_register(
        &self,
        device_id: u8,
        address: Address,
        register: Register,
    ) -> Result<(), RegistryError> {
        self.mutate(|registry| registry.update_register(device_id, address, register))
    }

    pub fn remove_register(&self, device_id: u8, address: Address) -> Result<Register, RegistryError> {
        self.mutate(|registry| registry.remove_register(device_id, address))
    }

    /// Drops every device and erases the persisted configuration. The
    /// tracing toggle survives.
    pub fn clear_all(&self) -> Result<(), RegistryError> {
        let mut store = self.store.lock();
        let tracing = self.trace_enabled() as u8;

        persist(&mut **store, |store| {
            store.erase_namespace(NAMESPACE)?;
            store.set_u8(NAMESPACE, LOGGING_ENABLED_KEY, tracing)?;
            store.commit()
        })?;

        self.registry.write().clear();
        Ok(())
    }

    pub fn get_device(&self, device_id: u8) -> Option<Device> {
        self.registry.read().get_device(device_id).cloned()
    }

    pub fn get_register(&self, device_id: u8, address: Address) -> Option<Register> {
        self.registry.read().get_register(device_id, address).cloned()
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.registry.read().list_devices().to_vec()
    }

    pub fn device_exists(&self, device_id: u8) -> bool {
        self.registry.read().device_exists(device_id)
    }

    pub fn device_count(&self) -> usize {
        self.registry.read().device_count()
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.registry.read().snapshot()
    }

    /// Last scaled value, `0.0` for an unknown register.
    pub fn scaled_value(&self, device_id: u8, address: Address) -> f32 {
        self.registry
            .read()
            .get_register(device_id, address)
            .map(Register::scaled_value)
            .unwrap_or(0.0)
    }

    /// Last raw value, `0` for an unknown register.
    pub fn raw_value(&self, device_id: u8, address: Address) -> Value {
        self.registry
            .read()
            .get_register(device_id, address)
            .map(|r| r.last_raw_value)
            .unwrap_or(0)
    }

    /// Enables hex dumps of every frame and persists the choice.
    pub fn set_trace(&self, enabled: bool) -> Result<(), StoreError> {
        persist(&mut **self.store.lock(), |store| {
            store.set_u8(NAMESPACE, LOGGING_ENABLED_KEY, enabled as u8)?;
            store.commit()
        })?;

        self.tracing.store(enabled, Ordering::Relaxed);
        info!("Frame tracing {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn trace_enabled(&self) -> bool {
        self.tracing.load(Ordering::Relaxed)
    }

    /// Writes `value` to a writable coil (non-zero is on) or holding
    /// register. Refused writes never reach the bus.
    pub async fn write(&self, device_id: u8, address: Address, value: Value) -> Result<(), WriteError> {
        let register = self
            .get_register(device_id, address)
            .ok_or(WriteError::NotFound { device_id, address })?;

        if !register.kind.is_writable_kind() {
            return Err(WriteError::ReadOnlyKind {
                device_id,
                address,
                kind: register.kind,
            });
        }

        if !register.writable {
            return Err(WriteError::NotWritable { device_id, address });
        }

        let raw = match register.kind {
            RegisterKind::Coil => {
                let on = value != 0;
                self.engine.write_single_coil(device_id, address, on).await?;
                on as Value
            }
            _ => {
                self.engine
                    .write_single_register(device_id, address, value)
                    .await?;
                value
            }
        };

        info!("Wrote {raw} to register {address} on device {device_id}");
        self.store_value(device_id, address, raw);
        Ok(())
    }

    /// One scheduler read of a single register, with its outcome recorded.
    pub(crate) async fn poll_register(&self, device_id: u8, address: Address, kind: RegisterKind) {
        let result = self.read_register(device_id, address, kind).await;

        let recorded = match result {
            Ok(raw) => {
                self.store_value(device_id, address, raw);
                self.registry.write().record_poll_success(device_id)
            }
            Err(err) => {
                debug!("Poll of {address} on device {device_id} failed: {err}");
                self.registry
                    .write()
                    .record_poll_failure(device_id, err.error_code())
            }
        };

        if let Err(err) = recorded {
            debug!("Device {device_id} left the registry mid-sweep: {err}");
        }
    }

    async fn read_register(
        &self,
        device_id: u8,
        address: Address,
        kind: RegisterKind,
    ) -> Result<Value, TransactionError> {
        let first_bit = |bits: Vec<bool>| bits.first().copied().unwrap_or(false) as Value;
        let first_word = |words: Vec<Value>| words.first().copied().unwrap_or(0);

        match kind {
            RegisterKind::Coil => self.engine.read_coils(device_id, address, 1).await.map(first_bit),
            RegisterKind::DiscreteInput => self
                .engine
                .read_discrete_inputs(device_id, address, 1)
                .await
                .map(first_bit),
            RegisterKind::HoldingRegister => self
                .engine
                .read_holding_registers(device_id, address, 1)
                .await
                .map(first_word),
            RegisterKind::InputRegister => self
                .engine
                .read_input_registers(device_id, address, 1)
                .await
                .map(first_word),
        }
    }

    /// Caches `raw` and publishes it. Registers removed in the meantime are
    /// skipped.
    fn store_value(&self, device_id: u8, address: Address, raw: Value) {
        let scaled = {
            let mut registry = self.registry.write();
            if registry.update_register_value(device_id, address, raw).is_err() {
                return;
            }
            registry
                .get_register(device_id, address)
                .map(Register::scaled_value)
                .unwrap_or(0.0)
        };

        // No subscribers is not an error.
        let _ = self.updates.send(RegisterUpdate {
            device_id,
            address,
            raw,
            scaled,
        });
    }

    /// Starts the scheduler. A second call while running is a no-op.
    pub async fn start_polling(self: &Arc<Self>) {
        let mut polling = self.polling.lock().await;

        if polling.as_ref().is_some_and(|s| !s.is_finished()) {
            warn!("Polling already running");
            return;
        }

        *polling = Some(Scheduler::spawn(self.clone(), self.polling_config.clone()));
    }

    /// Stops the scheduler and waits for its in-flight transaction.
    pub async fn stop_polling(&self) {
        let scheduler = self.polling.lock().await.take();

        match scheduler {
            Some(scheduler) => scheduler.stop().await,
            None => debug!("Polling not running"),
        }
    }

    pub async fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| !s.is_finished())
    }
}

/// Runs `write` against `store`, dropping whatever it staged if it fails so
/// a later commit cannot make the rejected change durable.
fn persist(
    store: &mut dyn Store,
    write: impl FnOnce(&mut dyn Store) -> Result<(), StoreError>,
) -> Result<(), StoreError> {
    let result = write(&mut *store);

    if let Err(err) = &result {
        warn!("Store update failed ({err}), discarding staged changes");
        store.discard();
    }

    result
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::core::modbus::transports::{Behaviour, EmulatedBus};
    use crate::core::store::MemoryStore;

    fn supervisor(bus: &EmulatedBus, store: MemoryStore) -> Arc<Supervisor> {
        let _ = env_logger::builder().is_test(true).try_init();

        Arc::new(Supervisor::new(
            Some(Box::new(bus.clone())),
            EngineConfig {
                timeout: Duration::from_millis(20),
                retry_attempts: 2,
            },
            PollingConfig {
                idle_backoff: Duration::from_millis(5),
                register_spacing: Duration::from_millis(1),
            },
            Box::new(store),
        ))
    }

    fn boiler() -> Device {
        Device::new(5, "Boiler")
            .with_register(Register::new(100, RegisterKind::HoldingRegister, "Setpoint").writable())
            .with_register(Register::new(101, RegisterKind::HoldingRegister, "Limit"))
            .with_register(Register::new(3, RegisterKind::Coil, "Pump").writable())
            .with_register(Register::new(7, RegisterKind::InputRegister, "Temperature"))
    }

    #[tokio::test]
    async fn rejected_writes_never_touch_the_bus() {
        let bus = EmulatedBus::new().with_slave(5);
        let supervisor = supervisor(&bus, MemoryStore::new());
        supervisor.add_device(boiler()).unwrap();

        assert_eq!(
            supervisor.write(5, 101, 1).await,
            Err(WriteError::NotWritable {
                device_id: 5,
                address: 101
            })
        );
        assert!(matches!(
            supervisor.write(5, 7, 1).await,
            Err(WriteError::ReadOnlyKind { .. })
        ));
        assert!(matches!(
            supervisor.write(5, 999, 1).await,
            Err(WriteError::NotFound { .. })
        ));
        assert_eq!(bus.writes(), 0);
    }

    #[tokio::test]
    async fn successful_write_updates_cache_and_publishes() {
        let bus = EmulatedBus::new().with_slave(5);
        let supervisor = supervisor(&bus, MemoryStore::new());
        supervisor.add_device(boiler()).unwrap();
        let mut updates = supervisor.subscribe();

        supervisor.write(5, 100, 321).await.unwrap();
        supervisor.write(5, 3, 42).await.unwrap();

        assert_eq!(bus.holding(5, 100), Some(321));
        assert_eq!(bus.coil(5, 3), Some(true));
        assert_eq!(supervisor.raw_value(5, 100), 321);
        assert_eq!(supervisor.raw_value(5, 3), 1);

        let first = updates.recv().await.unwrap();
        assert_eq!((first.device_id, first.address, first.raw), (5, 100, 321));
        assert_eq!(updates.recv().await.unwrap().raw, 1);
    }

    #[tokio::test]
    async fn failed_write_keeps_cached_value() {
        let bus = EmulatedBus::new();
        bus.set_behaviour(5, Behaviour::Exception(0x04));
        let supervisor = supervisor(&bus, MemoryStore::new());
        supervisor.add_device(boiler()).unwrap();

        let err = supervisor.write(5, 100, 9).await.unwrap_err();

        assert_eq!(err, WriteError::Transaction(TransactionError::Exception(0x04)));
        assert_eq!(supervisor.raw_value(5, 100), 0);
    }

    #[tokio::test]
    async fn failed_save_leaves_registry_unchanged() {
        let mut store = MemoryStore::new();
        store.set_read_only(true);
        let supervisor = supervisor(&EmulatedBus::new(), store);

        let err = supervisor.add_device(boiler()).unwrap_err();

        assert!(matches!(err, RegistryError::Store(StoreError::ReadOnly)));
        assert_eq!(supervisor.device_count(), 0);
    }

    #[tokio::test]
    async fn rejected_save_is_not_committed_later() {
        let mut store = MemoryStore::new();
        store.fail_commits(1);
        let supervisor = supervisor(&EmulatedBus::new(), store);

        let err = supervisor.add_device(boiler()).unwrap_err();
        assert!(matches!(err, RegistryError::Store(StoreError::ReadOnly)));

        // The next commit must not carry the rejected device along.
        supervisor.set_trace(true).unwrap();

        let supervisor = Arc::try_unwrap(supervisor).ok().unwrap();
        let store = supervisor.store.into_inner();
        assert_eq!(store.get_u8(NAMESPACE, "device_count").unwrap(), None);

        let restored = Supervisor::new(None, EngineConfig::default(), PollingConfig::default(), store);
        assert_eq!(restored.device_count(), 0);
        assert!(restored.trace_enabled());
    }

    #[tokio::test]
    async fn configuration_and_trace_flag_survive_restart() {
        let bus = EmulatedBus::new();
        let store = {
            let supervisor = supervisor(&bus, MemoryStore::new());
            supervisor.add_device(boiler()).unwrap();
            supervisor.remove_register(5, 101).unwrap();
            supervisor.set_trace(true).unwrap();

            let supervisor = Arc::try_unwrap(supervisor).ok().unwrap();
            supervisor.store.into_inner()
        };

        let restored = Supervisor::new(None, EngineConfig::default(), PollingConfig::default(), store);

        assert_eq!(restored.load_outcome(), LoadOutcome::Loaded);
        assert!(restored.trace_enabled());
        assert_eq!(restored.get_device(5).unwrap().registers.len(), 3);
        assert!(restored.get_register(5, 101).is_none());
    }

    #[tokio::test]
    async fn clear_all_keeps_trace_flag() {
        let supervisor = supervisor(&EmulatedBus::new(), MemoryStore::new());
        supervisor.add_device(boiler()).unwrap();
        supervisor.set_trace(true).unwrap();

        supervisor.clear_all().unwrap();

        assert_eq!(supervisor.device_count(), 0);
        let store = supervisor.store.lock();
        assert_eq!(store.get_u8(NAMESPACE, "device_count").unwrap(), None);
        assert_eq!(store.get_u8(NAMESPACE, LOGGING_ENABLED_KEY).unwrap(), Some(1));
    }

    #[tokio::test]
    async fn unknown_values_read_as_zero() {
        let supervisor = supervisor(&EmulatedBus::new(), MemoryStore::new());

        assert_eq!(supervisor.raw_value(1, 1), 0);
        assert_eq!(supervisor.scaled_value(1, 1), 0.0);
    }
}
