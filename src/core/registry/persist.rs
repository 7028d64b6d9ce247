//! Flat key layout of the registry in the store.
//!
//! Everything lives in the [`NAMESPACE`] namespace:
//!
//! | key            | type | field                     |
//! |----------------|------|---------------------------|
//! | `device_count` | u8   | number of devices         |
//! | `d{i}_id`      | u8   | device id                 |
//! | `d{i}_name`    | str  | name                      |
//! | `d{i}_desc`    | str  | description               |
//! | `d{i}_poll`    | u32  | poll interval in ms       |
//! | `d{i}_en`      | u8   | enabled                   |
//! | `d{i}_baud`    | u32  | baud rate                 |
//! | `d{i}_rc`      | u8   | register count            |
//! | `d{i}r{j}a`    | u16  | register address          |
//! | `d{i}r{j}t`    | u8   | register kind             |
//! | `d{i}r{j}n`    | str  | register name             |
//! | `d{i}r{j}u`    | str  | unit                      |
//! | `d{i}r{j}s`    | u32  | scale, IEEE-754 bits      |
//! | `d{i}r{j}o`    | u32  | offset, IEEE-754 bits     |
//! | `d{i}r{j}w`    | u8   | writable                  |
//! | `d{i}r{j}d`    | str  | description               |
//!
//! Runtime fields are never written.

use log::{info, warn};

use super::Registry;
use crate::core::device::{
    Device, Register, RegisterKind, DEFAULT_BAUDRATE, DEFAULT_POLL_INTERVAL_MS,
    MAX_MODBUS_DEVICES, MAX_REGISTERS_PER_DEVICE,
};
use crate::core::store::{scale_from_bits, scale_to_bits, Store, StoreError};

pub const NAMESPACE: &str = "modbus_config";
pub const DEVICE_COUNT_KEY: &str = "device_count";

const DEFAULT_DEVICE_NAME: &str = "Unnamed Device";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Nothing stored yet.
    Empty,
    Loaded,
    /// At least one field was missing or unreadable and took its default,
    /// or an entry had to be dropped.
    LoadedWithDefaults,
}

/// Collects per-field fallbacks while reading.
struct Loader<'a> {
    store: &'a dyn Store,
    defaulted: bool,
}

impl Loader<'_> {
    fn field<T>(
        &mut self,
        key: &str,
        read: impl Fn(&dyn Store, &str, &str) -> Result<Option<T>, StoreError>,
        default: T,
    ) -> T {
        match read(self.store, NAMESPACE, key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                warn!("Missing {key}, using default");
                self.defaulted = true;
                default
            }
            Err(err) => {
                warn!("Unreadable {key} ({err}), using default");
                self.defaulted = true;
                default
            }
        }
    }

    fn u8(&mut self, key: &str, default: u8) -> u8 {
        self.field(key, |s, ns, k| s.get_u8(ns, k), default)
    }

    fn u16(&mut self, key: &str, default: u16) -> u16 {
        self.field(key, |s, ns, k| s.get_u16(ns, k), default)
    }

    fn u32(&mut self, key: &str, default: u32) -> u32 {
        self.field(key, |s, ns, k| s.get_u32(ns, k), default)
    }

    fn string(&mut self, key: &str, default: &str) -> String {
        self.field(key, |s, ns, k| s.get_str(ns, k), default.to_string())
    }

    fn register(&mut self, i: usize, j: usize) -> Register {
        let key = |field: &str| format!("d{i}r{j}{field}");
        let defaults = Register::default();

        let kind = self.u8(&key("t"), defaults.kind.code());
        let kind = RegisterKind::from_code(kind).unwrap_or_else(|| {
            warn!("Unknown register kind {kind} for {}, using default", key("t"));
            self.defaulted = true;
            defaults.kind
        });

        Register {
            address: self.u16(&key("a"), defaults.address),
            kind,
            name: self.string(&key("n"), &defaults.name),
            unit: self.string(&key("u"), &defaults.unit),
            scale: scale_from_bits(self.u32(&key("s"), scale_to_bits(defaults.scale))),
            offset: scale_from_bits(self.u32(&key("o"), scale_to_bits(defaults.offset))),
            writable: self.u8(&key("w"), defaults.writable as u8) != 0,
            description: self.string(&key("d"), &defaults.description),
            ..defaults
        }
    }

    fn device(&mut self, i: usize) -> Device {
        let key = |field: &str| format!("d{i}_{field}");

        let mut device = Device::new(self.u8(&key("id"), i as u8), DEFAULT_DEVICE_NAME);
        device.name = self.string(&key("name"), DEFAULT_DEVICE_NAME);
        device.description = self.string(&key("desc"), "");
        device.poll_interval_ms = self.u32(&key("poll"), DEFAULT_POLL_INTERVAL_MS);
        device.enabled = self.u8(&key("en"), 1) != 0;
        device.baudrate = self.u32(&key("baud"), DEFAULT_BAUDRATE);

        let count = self.u8(&key("rc"), 0) as usize;
        if count > MAX_REGISTERS_PER_DEVICE {
            warn!("Device {i} lists {count} registers, keeping {MAX_REGISTERS_PER_DEVICE}");
            self.defaulted = true;
        }

        for j in 0..count.min(MAX_REGISTERS_PER_DEVICE) {
            let register = self.register(i, j);
            if device.register(register.address).is_some() {
                warn!(
                    "Dropping duplicate register {} on device {}",
                    register.address, device.device_id
                );
                self.defaulted = true;
                continue;
            }
            device.registers.push(register);
        }

        device
    }
}

impl Registry {
    /// Writes the structural configuration and commits the store.
    pub fn save(&self, store: &mut dyn Store) -> Result<(), StoreError> {
        store.set_u8(NAMESPACE, DEVICE_COUNT_KEY, self.devices.len() as u8)?;

        for (i, device) in self.devices.iter().enumerate() {
            let key = |field: &str| format!("d{i}_{field}");

            store.set_u8(NAMESPACE, &key("id"), device.device_id)?;
            store.set_str(NAMESPACE, &key("name"), &device.name)?;
            store.set_str(NAMESPACE, &key("desc"), &device.description)?;
            store.set_u32(NAMESPACE, &key("poll"), device.poll_interval_ms)?;
            store.set_u8(NAMESPACE, &key("en"), device.enabled as u8)?;
            store.set_u32(NAMESPACE, &key("baud"), device.baudrate)?;
            store.set_u8(NAMESPACE, &key("rc"), device.registers.len() as u8)?;

            for (j, register) in device.registers.iter().enumerate() {
                let key = |field: &str| format!("d{i}r{j}{field}");

                store.set_u16(NAMESPACE, &key("a"), register.address)?;
                store.set_u8(NAMESPACE, &key("t"), register.kind.code())?;
                store.set_str(NAMESPACE, &key("n"), &register.name)?;
                store.set_str(NAMESPACE, &key("u"), &register.unit)?;
                store.set_u32(NAMESPACE, &key("s"), scale_to_bits(register.scale))?;
                store.set_u32(NAMESPACE, &key("o"), scale_to_bits(register.offset))?;
                store.set_u8(NAMESPACE, &key("w"), register.writable as u8)?;
                store.set_str(NAMESPACE, &key("d"), &register.description)?;
            }
        }

        store.commit()?;
        info!("Saved {} devices", self.devices.len());
        Ok(())
    }

    /// Reads the registry back, degrading field by field to defaults.
    /// Never fails; a store that cannot be read at all yields an empty
    /// registry.
    pub fn load(store: &dyn Store) -> (Registry, LoadOutcome) {
        let count = match store.get_u8(NAMESPACE, DEVICE_COUNT_KEY) {
            Ok(Some(count)) => count as usize,
            Ok(None) => {
                info!("No stored configuration");
                return (Registry::new(), LoadOutcome::Empty);
            }
            Err(err) => {
                warn!("Unreadable device count ({err}), starting empty");
                return (Registry::new(), LoadOutcome::Empty);
            }
        };

        let mut loader = Loader {
            store,
            defaulted: false,
        };

        if count > MAX_MODBUS_DEVICES {
            warn!("Store lists {count} devices, keeping {MAX_MODBUS_DEVICES}");
            loader.defaulted = true;
        }

        let mut registry = Registry::new();
        for i in 0..count.min(MAX_MODBUS_DEVICES) {
            let device = loader.device(i);
            if let Err(err) = registry.add_device(device) {
                warn!("Dropping stored device {i}: {err}");
                loader.defaulted = true;
            }
        }

        info!("Loaded {} devices", registry.device_count());
        let outcome = match loader.defaulted {
            true => LoadOutcome::LoadedWithDefaults,
            false => LoadOutcome::Loaded,
        };
        (registry, outcome)
    }

    /// Erases the whole namespace and commits.
    pub fn erase(store: &mut dyn Store) -> Result<(), StoreError> {
        store.erase_namespace(NAMESPACE)?;
        store.commit()
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::*;
    use crate::core::store::{FileStore, MemoryStore, StoredValue};

    fn populated() -> Registry {
        let mut registry = Registry::new();
        registry
            .add_device(
                Device::new(5, "Boiler")
                    .with_poll_interval(250)
                    .with_register(
                        Register::new(100, RegisterKind::InputRegister, "Temperature")
                            .with_scaling(0.1, -40.0)
                            .with_unit("°C"),
                    )
                    .with_register(Register::new(3, RegisterKind::Coil, "Pump").writable()),
            )
            .unwrap();
        registry.add_device(Device::new(9, "Meter")).unwrap();
        registry
    }

    #[test]
    fn empty_store_loads_empty() {
        let store = MemoryStore::new();
        let (registry, outcome) = Registry::load(&store);

        assert_eq!(outcome, LoadOutcome::Empty);
        assert!(registry.is_empty());
    }

    #[test]
    fn saved_configuration_loads_back() {
        let mut store = MemoryStore::new();
        let mut original = populated();
        original.update_register_value(5, 100, 650).unwrap();
        original.save(&mut store).unwrap();

        let (registry, outcome) = Registry::load(&store);
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert_eq!(registry.device_count(), 2);

        let device = registry.get_device(5).unwrap();
        assert_eq!(device.poll_interval_ms, 250);
        assert_eq!(device.registers.len(), 2);
        assert_eq!(device.registers[1].address, 3);

        let register = &device.registers[0];
        assert_eq!(register.kind, RegisterKind::InputRegister);
        assert_eq!(register.scale, 0.1);
        assert_eq!(register.offset, -40.0);
        assert_eq!(register.unit, "°C");
        // Runtime state is never persisted.
        assert_eq!(register.last_raw_value, 0);

        assert!(device.registers[1].writable);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let mut store = MemoryStore::new();
        populated().save(&mut store).unwrap();
        store.remove(NAMESPACE, "d0_name");
        store.remove(NAMESPACE, "d0r0s");
        store
            .set(NAMESPACE, "d1_poll", StoredValue::Str("fast".into()))
            .unwrap();

        let (registry, outcome) = Registry::load(&store);
        assert_eq!(outcome, LoadOutcome::LoadedWithDefaults);

        let boiler = registry.get_device(5).unwrap();
        assert_eq!(boiler.name, "Unnamed Device");
        assert_eq!(boiler.registers[0].scale, 1.0);
        assert_eq!(boiler.registers[0].offset, -40.0);
        assert_eq!(registry.get_device(9).unwrap().poll_interval_ms, 5000);
    }

    #[test]
    fn corrupt_file_entry_takes_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut store = FileStore::open(&path).unwrap();
        populated().save(&mut store).unwrap();

        let mut json: serde_json::Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        json[NAMESPACE]["d0r0s"] = serde_json::json!({ "type": "u32", "value": -1 });
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        let store = FileStore::open(&path).unwrap();
        let (registry, outcome) = Registry::load(&store);

        assert_eq!(outcome, LoadOutcome::LoadedWithDefaults);
        assert_eq!(registry.device_count(), 2);
        let register = registry.get_register(5, 100).unwrap();
        assert_eq!(register.scale, 1.0);
        assert_eq!(register.offset, -40.0);
    }

    #[test]
    fn missing_id_defaults_to_index() {
        let mut store = MemoryStore::new();
        store.set_u8(NAMESPACE, DEVICE_COUNT_KEY, 1).unwrap();

        let (registry, outcome) = Registry::load(&store);
        assert_eq!(outcome, LoadOutcome::LoadedWithDefaults);

        let device = registry.get_device(0).unwrap();
        assert_eq!(device.baudrate, 9600);
        assert!(device.enabled);
        assert!(device.registers.is_empty());
    }

    #[test]
    fn counts_are_clamped_to_capacity() {
        let mut store = MemoryStore::new();
        store.set_u8(NAMESPACE, DEVICE_COUNT_KEY, 200).unwrap();
        for i in 0..200u8 {
            store.set_u8(NAMESPACE, &format!("d{i}_id"), i + 1).unwrap();
        }

        let (registry, outcome) = Registry::load(&store);
        assert_eq!(outcome, LoadOutcome::LoadedWithDefaults);
        assert_eq!(registry.device_count(), MAX_MODBUS_DEVICES);
    }

    #[test]
    fn erase_clears_namespace() {
        let mut store = MemoryStore::new();
        populated().save(&mut store).unwrap();

        Registry::erase(&mut store).unwrap();

        let (_, outcome) = Registry::load(&store);
        assert_eq!(outcome, LoadOutcome::Empty);
    }
}
