//! The in-memory table of devices and their registers.
//!
//! Devices are keyed by `device_id`, registers by `address` within their
//! device. Both tables are bounded and keep insertion order, which is the
//! order the scheduler polls in.

pub mod error;
pub mod persist;

pub use error::*;
pub use persist::*;

use std::time::Instant;

use log::info;

use crate::core::device::{
    Device, DeviceStatus, Register, RegisterKind, MAX_MODBUS_DEVICES, MAX_REGISTERS_PER_DEVICE,
};
use crate::core::modbus::{Address, Value};

/// Everything the scheduler needs to sweep one device, copied out so the
/// registry lock is not held across bus traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSnapshot {
    pub device_id: u8,
    pub enabled: bool,
    pub poll_interval_ms: u32,
    pub registers: Vec<(Address, RegisterKind)>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    devices: Vec<Device>,
    epoch: Instant,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            devices: Vec::with_capacity(MAX_MODBUS_DEVICES),
            epoch: Instant::now(),
        }
    }

    /// Milliseconds since the registry was created.
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn add_device(&mut self, mut device: Device) -> Result<(), RegistryError> {
        if self.device_exists(device.device_id) {
            return Err(RegistryError::DeviceExists(device.device_id));
        }

        if self.devices.len() >= MAX_MODBUS_DEVICES {
            return Err(RegistryError::RegistryFull(MAX_MODBUS_DEVICES));
        }

        check_registers(&device)?;
        device.truncate_strings();
        device.reset_runtime();

        info!("Added device {device}");
        self.devices.push(device);
        Ok(())
    }

    /// Replaces the configuration of device `device_id` with `update`.
    ///
    /// Runtime state is kept: device counters and status stay as they were
    /// and registers whose address survives the update keep their last value.
    pub fn update_device(&mut self, device_id: u8, mut update: Device) -> Result<(), RegistryError> {
        let index = self.index_of(device_id)?;

        if update.device_id != device_id && self.device_exists(update.device_id) {
            return Err(RegistryError::DeviceExists(update.device_id));
        }

        check_registers(&update)?;
        update.truncate_strings();

        let current = &mut self.devices[index];
        for register in update.registers.iter_mut() {
            match current.register(register.address) {
                Some(old) => {
                    register.last_raw_value = old.last_raw_value;
                    register.last_update_timestamp = old.last_update_timestamp;
                }
                None => register.reset_runtime(),
            }
        }

        current.device_id = update.device_id;
        current.name = update.name;
        current.description = update.description;
        current.baudrate = update.baudrate;
        current.poll_interval_ms = update.poll_interval_ms;
        current.enabled = update.enabled;
        current.registers = update.registers;

        info!("Updated device {device_id}");
        Ok(())
    }

    pub fn remove_device(&mut self, device_id: u8) -> Result<Device, RegistryError> {
        let index = self.index_of(device_id)?;
        let device = self.devices.remove(index);

        info!("Removed device {device_id}");
        Ok(device)
    }

    pub fn add_register(&mut self, device_id: u8, mut register: Register) -> Result<(), RegistryError> {
        let device = self.device_mut(device_id)?;

        if device.registers.len() >= MAX_REGISTERS_PER_DEVICE {
            return Err(RegistryError::DeviceFull {
                device_id,
                capacity: MAX_REGISTERS_PER_DEVICE,
            });
        }

        if device.register(register.address).is_some() {
            return Err(RegistryError::DuplicateAddress {
                device_id,
                address: register.address,
            });
        }

        register.truncate_strings();
        register.reset_runtime();

        info!("Added register {register} to device {device_id}");
        device.registers.push(register);
        Ok(())
    }

    /// Replaces the configuration of the register at `address`, keeping its
    /// last value and timestamp.
    pub fn update_register(
        &mut self,
        device_id: u8,
        address: Address,
        mut update: Register,
    ) -> Result<(), RegistryError> {
        let device = self.device_mut(device_id)?;

        if update.address != address && device.register(update.address).is_some() {
            return Err(RegistryError::DuplicateAddress {
                device_id,
                address: update.address,
            });
        }

        let register = device
            .register_mut(address)
            .ok_or(RegistryError::RegisterNotFound { device_id, address })?;

        update.truncate_strings();
        update.last_raw_value = register.last_raw_value;
        update.last_update_timestamp = register.last_update_timestamp;
        *register = update;

        info!("Updated register {address} on device {device_id}");
        Ok(())
    }

    pub fn remove_register(&mut self, device_id: u8, address: Address) -> Result<Register, RegistryError> {
        let device = self.device_mut(device_id)?;
        let index = device
            .registers
            .iter()
            .position(|r| r.address == address)
            .ok_or(RegistryError::RegisterNotFound { device_id, address })?;

        info!("Removed register {address} from device {device_id}");
        Ok(device.registers.remove(index))
    }

    pub fn get_device(&self, device_id: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn get_register(&self, device_id: u8, address: Address) -> Option<&Register> {
        self.get_device(device_id)?.register(address)
    }

    pub fn list_devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_exists(&self, device_id: u8) -> bool {
        self.get_device(device_id).is_some()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn clear(&mut self) {
        self.devices.clear();
        info!("Cleared all devices");
    }

    /// Stores a freshly observed value and stamps it in one step.
    pub fn update_register_value(
        &mut self,
        device_id: u8,
        address: Address,
        raw: Value,
    ) -> Result<(), RegistryError> {
        let now = self.now_ms();
        let register = self
            .device_mut(device_id)?
            .register_mut(address)
            .ok_or(RegistryError::RegisterNotFound { device_id, address })?;

        register.last_raw_value = raw;
        register.last_update_timestamp = now;
        Ok(())
    }

    pub fn record_poll_success(&mut self, device_id: u8) -> Result<(), RegistryError> {
        let now = self.now_ms();
        let device = self.device_mut(device_id)?;

        device.poll_count = device.poll_count.wrapping_add(1);
        device.status = DeviceStatus::Online;
        device.last_seen_timestamp = now;
        Ok(())
    }

    /// `error_code` is the exception code, or `0` for transport failures.
    pub fn record_poll_failure(&mut self, device_id: u8, error_code: u8) -> Result<(), RegistryError> {
        let device = self.device_mut(device_id)?;

        device.poll_count = device.poll_count.wrapping_add(1);
        device.error_count = device.error_count.wrapping_add(1);
        device.last_error_code = error_code;
        device.status = DeviceStatus::Error;
        Ok(())
    }

    /// Copies runtime state from `live` into the devices and registers both
    /// registries share, matched by device id and register address.
    pub fn adopt_runtime(&mut self, live: &Registry) {
        for device in self.devices.iter_mut() {
            let Some(current) = live.get_device(device.device_id) else {
                continue;
            };

            device.status = current.status;
            device.last_seen_timestamp = current.last_seen_timestamp;
            device.last_error_code = current.last_error_code;
            device.poll_count = current.poll_count;
            device.error_count = current.error_count;

            for register in device.registers.iter_mut() {
                if let Some(old) = current.register(register.address) {
                    register.last_raw_value = old.last_raw_value;
                    register.last_update_timestamp = old.last_update_timestamp;
                }
            }
        }
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        self.devices
            .iter()
            .map(|device| DeviceSnapshot {
                device_id: device.device_id,
                enabled: device.enabled,
                poll_interval_ms: device.poll_interval_ms,
                registers: device
                    .registers
                    .iter()
                    .map(|r| (r.address, r.kind))
                    .collect(),
            })
            .collect()
    }

    fn index_of(&self, device_id: u8) -> Result<usize, RegistryError> {
        self.devices
            .iter()
            .position(|d| d.device_id == device_id)
            .ok_or(RegistryError::DeviceNotFound(device_id))
    }

    fn device_mut(&mut self, device_id: u8) -> Result<&mut Device, RegistryError> {
        self.devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
            .ok_or(RegistryError::DeviceNotFound(device_id))
    }
}

/// Capacity and address uniqueness of a device's register list.
fn check_registers(device: &Device) -> Result<(), RegistryError> {
    if device.registers.len() > MAX_REGISTERS_PER_DEVICE {
        return Err(RegistryError::DeviceFull {
            device_id: device.device_id,
            capacity: MAX_REGISTERS_PER_DEVICE,
        });
    }

    for (i, register) in device.registers.iter().enumerate() {
        if device.registers[..i]
            .iter()
            .any(|r| r.address == register.address)
        {
            return Err(RegistryError::DuplicateAddress {
                device_id: device.device_id,
                address: register.address,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn boiler() -> Device {
        Device::new(5, "Boiler")
            .with_register(Register::new(100, RegisterKind::HoldingRegister, "Setpoint"))
            .with_register(Register::new(1, RegisterKind::Coil, "Pump"))
    }

    #[test]
    fn duplicate_device_is_rejected_and_registry_unchanged() {
        let mut registry = Registry::new();
        registry.add_device(boiler()).unwrap();

        let err = registry.add_device(Device::new(5, "Other")).unwrap_err();

        assert!(matches!(err, RegistryError::DeviceExists(5)));
        assert_eq!(registry.device_count(), 1);
        assert_eq!(registry.get_device(5).unwrap().name, "Boiler");
    }

    #[test]
    fn add_device_resets_runtime_fields() {
        let mut device = boiler();
        device.poll_count = 9;
        device.status = DeviceStatus::Online;
        device.registers[0].last_raw_value = 77;

        let mut registry = Registry::new();
        registry.add_device(device).unwrap();

        let stored = registry.get_device(5).unwrap();
        assert_eq!(stored.poll_count, 0);
        assert_eq!(stored.status, DeviceStatus::Unknown);
        assert_eq!(stored.registers[0].last_raw_value, 0);
    }

    #[test]
    fn registry_capacity_is_enforced() {
        let mut registry = Registry::new();
        for id in 1..=MAX_MODBUS_DEVICES as u8 {
            registry.add_device(Device::new(id, "Node")).unwrap();
        }

        let err = registry.add_device(Device::new(200, "Extra")).unwrap_err();
        assert!(matches!(err, RegistryError::RegistryFull(_)));
    }

    #[test]
    fn register_capacity_and_duplicates() {
        let mut registry = Registry::new();
        registry.add_device(Device::new(1, "Node")).unwrap();

        for address in 0..MAX_REGISTERS_PER_DEVICE as u16 {
            registry
                .add_register(1, Register::new(address, RegisterKind::InputRegister, "R"))
                .unwrap();
        }

        let full = registry
            .add_register(1, Register::new(500, RegisterKind::InputRegister, "R"))
            .unwrap_err();
        assert!(matches!(full, RegistryError::DeviceFull { .. }));

        registry.remove_register(1, 0).unwrap();
        let duplicate = registry
            .add_register(1, Register::new(3, RegisterKind::Coil, "R"))
            .unwrap_err();
        assert!(matches!(
            duplicate,
            RegistryError::DuplicateAddress { address: 3, .. }
        ));
    }

    #[test]
    fn update_register_preserves_last_value() {
        let mut registry = Registry::new();
        registry.add_device(boiler()).unwrap();
        registry.update_register_value(5, 100, 1234).unwrap();

        let update = Register::new(100, RegisterKind::HoldingRegister, "Target")
            .with_scaling(0.5, 0.0)
            .writable();
        registry.update_register(5, 100, update).unwrap();

        let register = registry.get_register(5, 100).unwrap();
        assert_eq!(register.name, "Target");
        assert_eq!(register.last_raw_value, 1234);
        assert_eq!(register.scaled_value(), 617.0);
    }

    #[test]
    fn update_register_rejects_address_collision() {
        let mut registry = Registry::new();
        registry.add_device(boiler()).unwrap();

        let err = registry
            .update_register(5, 100, Register::new(1, RegisterKind::HoldingRegister, "X"))
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAddress { address: 1, .. }));
    }

    #[test]
    fn update_device_keeps_runtime_state() {
        let mut registry = Registry::new();
        registry.add_device(boiler()).unwrap();
        registry.update_register_value(5, 100, 42).unwrap();
        registry.record_poll_success(5).unwrap();

        let update = Device::new(5, "Boiler 2")
            .with_poll_interval(250)
            .with_register(Register::new(100, RegisterKind::HoldingRegister, "Setpoint"))
            .with_register(Register::new(7, RegisterKind::InputRegister, "Flow"));
        registry.update_device(5, update).unwrap();

        let device = registry.get_device(5).unwrap();
        assert_eq!(device.name, "Boiler 2");
        assert_eq!(device.poll_interval_ms, 250);
        assert_eq!(device.poll_count, 1);
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.register(100).unwrap().last_raw_value, 42);
        assert!(device.register(1).is_none());
    }

    #[test]
    fn adopt_runtime_takes_newer_values() {
        let mut live = Registry::new();
        live.add_device(boiler()).unwrap();
        let mut staged = live.clone();
        staged
            .add_register(5, Register::new(9, RegisterKind::Coil, "Pump"))
            .unwrap();

        live.update_register_value(5, 100, 77).unwrap();
        live.record_poll_failure(5, 0x02).unwrap();
        staged.adopt_runtime(&live);

        let device = staged.get_device(5).unwrap();
        assert_eq!(device.status, DeviceStatus::Error);
        assert_eq!(device.error_count, 1);
        assert_eq!(device.register(100).unwrap().last_raw_value, 77);
        assert_eq!(device.register(9).unwrap().last_raw_value, 0);
    }

    #[test]
    fn remove_device_compacts_in_order() {
        let mut registry = Registry::new();
        for id in [1, 2, 3] {
            registry.add_device(Device::new(id, "Node")).unwrap();
        }

        registry.remove_device(2).unwrap();
        let ids: Vec<u8> = registry.list_devices().iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec![1, 3]);

        assert!(registry.remove_device(2).unwrap_err().is_not_found());
    }

    #[test]
    fn poll_results_update_counters() {
        let mut registry = Registry::new();
        registry.add_device(boiler()).unwrap();

        registry.record_poll_failure(5, 0x02).unwrap();
        registry.record_poll_success(5).unwrap();

        let device = registry.get_device(5).unwrap();
        assert_eq!(device.poll_count, 2);
        assert_eq!(device.error_count, 1);
        assert_eq!(device.last_error_code, 0x02);
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[test]
    fn missing_targets_are_not_found() {
        let mut registry = Registry::new();
        registry.add_device(boiler()).unwrap();

        assert!(registry.update_register_value(9, 100, 1).unwrap_err().is_not_found());
        assert!(registry.update_register_value(5, 999, 1).unwrap_err().is_not_found());
        assert!(registry.record_poll_success(9).unwrap_err().is_not_found());
    }
}
