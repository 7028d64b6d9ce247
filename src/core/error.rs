use std::io;

use thiserror::Error;

use crate::core::config::ConfigError;
use crate::core::device::RegisterKind;
use crate::core::modbus::{Address, TransactionError};

/// Why an on-demand write was refused or failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    #[error("No register {address} on device {device_id}")]
    NotFound { device_id: u8, address: Address },

    #[error("Register {address} on device {device_id} is a read-only {kind}")]
    ReadOnlyKind {
        device_id: u8,
        address: Address,
        kind: RegisterKind,
    },

    #[error("Register {address} on device {device_id} is not writable")]
    NotWritable { device_id: u8, address: Address },

    #[error("Write failed: {0}")]
    Transaction(#[from] TransactionError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to open serial port {port}: {source}")]
    SerialPort { port: String, source: io::Error },
}
