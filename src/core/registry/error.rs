use thiserror::Error;

use crate::core::modbus::Address;
use crate::core::store::StoreError;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Device {0} not found")]
    DeviceNotFound(u8),

    #[error("Register {address} not found on device {device_id}")]
    RegisterNotFound { device_id: u8, address: Address },

    #[error("Device {0} already exists")]
    DeviceExists(u8),

    #[error("Registry is full ({0} devices)")]
    RegistryFull(usize),

    #[error("Device {device_id} is full ({capacity} registers)")]
    DeviceFull { device_id: u8, capacity: usize },

    #[error("Device {device_id} already has a register at address {address}")]
    DuplicateAddress { device_id: u8, address: Address },

    #[error("Failed to persist registry: {0}")]
    Store(#[from] StoreError),
}

impl RegistryError {
    /// Device or register lookups that came up empty.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::DeviceNotFound(_) | RegistryError::RegisterNotFound { .. }
        )
    }
}
