use std::fmt::{Display, Formatter};

use enum_primitive::FromPrimitive;
use serde::{Deserialize, Serialize};

use crate::core::modbus::{Address, Value};

pub const MAX_MODBUS_DEVICES: usize = 16;
pub const MAX_REGISTERS_PER_DEVICE: usize = 32;

pub const MAX_NAME_LEN: usize = 32;
pub const MAX_UNIT_LEN: usize = 16;
pub const MAX_DESCRIPTION_LEN: usize = 64;

pub const DEFAULT_POLL_INTERVAL_MS: u32 = 5000;
pub const DEFAULT_BAUDRATE: u32 = 9600;

enum_from_primitive! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum RegisterKind {
        Coil            = 0,
        DiscreteInput   = 1,
        HoldingRegister = 2,
        InputRegister   = 3
    }
}

impl RegisterKind {
    /// Single-bit kinds, read back as `0`/`1`.
    pub fn is_boolean(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::DiscreteInput)
    }

    /// Kinds a master may write at all, irrespective of the register's
    /// `writable` flag.
    pub fn is_writable_kind(&self) -> bool {
        matches!(self, RegisterKind::Coil | RegisterKind::HoldingRegister)
    }

    pub fn from_code(code: u8) -> Option<RegisterKind> {
        RegisterKind::from_u8(code)
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }
}

impl Default for RegisterKind {
    fn default() -> Self {
        RegisterKind::HoldingRegister
    }
}

impl Display for RegisterKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegisterKind::Coil => "Coil",
            RegisterKind::DiscreteInput => "Discrete Input",
            RegisterKind::HoldingRegister => "Holding Register",
            RegisterKind::InputRegister => "Input Register",
        };
        write!(f, "{name}")
    }
}

pub fn is_boolean_kind(kind: RegisterKind) -> bool {
    kind.is_boolean()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Error,
}

impl Display for DeviceStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Unknown => write!(f, "unknown"),
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Error => write!(f, "error"),
        }
    }
}

/// One point on a remote device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub address: Address,
    pub kind: RegisterKind,
    pub name: String,
    pub unit: String,
    pub description: String,
    pub scale: f32,
    pub offset: f32,
    pub writable: bool,

    /// Last value seen on the wire. Never persisted.
    #[serde(skip)]
    pub last_raw_value: Value,
    /// Monotonic milliseconds at which `last_raw_value` was stored.
    #[serde(skip)]
    pub last_update_timestamp: u64,
}

impl Default for Register {
    fn default() -> Self {
        Register {
            address: 0,
            kind: RegisterKind::HoldingRegister,
            name: "Unnamed".to_string(),
            unit: String::new(),
            description: String::new(),
            scale: 1.0,
            offset: 0.0,
            writable: false,
            last_raw_value: 0,
            last_update_timestamp: 0,
        }
    }
}

impl Register {
    pub fn new(address: Address, kind: RegisterKind, name: impl Into<String>) -> Register {
        Register {
            address,
            kind,
            name: name.into(),
            ..Register::default()
        }
    }

    pub fn with_scaling(mut self, scale: f32, offset: f32) -> Register {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Register {
        self.unit = unit.into();
        self
    }

    pub fn writable(mut self) -> Register {
        self.writable = true;
        self
    }

    /// `raw * scale + offset`, unrounded.
    pub fn scaled_value(&self) -> f32 {
        self.last_raw_value as f32 * self.scale + self.offset
    }

    pub(crate) fn truncate_strings(&mut self) {
        truncate(&mut self.name, MAX_NAME_LEN);
        truncate(&mut self.unit, MAX_UNIT_LEN);
        truncate(&mut self.description, MAX_DESCRIPTION_LEN);
    }

    pub(crate) fn reset_runtime(&mut self) {
        self.last_raw_value = 0;
        self.last_update_timestamp = 0;
    }
}

impl Display for Register {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {} ({})", self.name, self.address, self.kind)
    }
}

pub fn scaled_value(register: &Register) -> f32 {
    register.scaled_value()
}

/// A remote slave on the bus and the registers polled from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: u8,
    pub name: String,
    pub description: String,
    pub baudrate: u32,
    pub poll_interval_ms: u32,
    pub enabled: bool,
    /// Insertion order is polling order.
    pub registers: Vec<Register>,

    #[serde(skip)]
    pub status: DeviceStatus,
    #[serde(skip)]
    pub last_seen_timestamp: u64,
    #[serde(skip)]
    pub last_error_code: u8,
    #[serde(skip)]
    pub poll_count: u32,
    #[serde(skip)]
    pub error_count: u32,
}

impl Device {
    pub fn new(device_id: u8, name: impl Into<String>) -> Device {
        Device {
            device_id,
            name: name.into(),
            description: String::new(),
            baudrate: DEFAULT_BAUDRATE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            enabled: true,
            registers: Vec::new(),
            status: DeviceStatus::Unknown,
            last_seen_timestamp: 0,
            last_error_code: 0,
            poll_count: 0,
            error_count: 0,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval_ms: u32) -> Device {
        self.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn with_register(mut self, register: Register) -> Device {
        self.registers.push(register);
        self
    }

    pub fn register(&self, address: Address) -> Option<&Register> {
        self.registers.iter().find(|r| r.address == address)
    }

    pub fn register_mut(&mut self, address: Address) -> Option<&mut Register> {
        self.registers.iter_mut().find(|r| r.address == address)
    }

    pub(crate) fn truncate_strings(&mut self) {
        truncate(&mut self.name, MAX_NAME_LEN);
        truncate(&mut self.description, MAX_DESCRIPTION_LEN);
        self.registers.iter_mut().for_each(Register::truncate_strings);
    }

    pub(crate) fn reset_runtime(&mut self) {
        self.status = DeviceStatus::Unknown;
        self.last_seen_timestamp = 0;
        self.last_error_code = 0;
        self.poll_count = 0;
        self.error_count = 0;
        self.registers.iter_mut().for_each(Register::reset_runtime);
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (ID {}) @ {} baud, every {} ms [{}]",
            self.name, self.device_id, self.baudrate, self.poll_interval_ms, self.status
        )
    }
}

/// Shortens `value` to at most `max` characters on a char boundary.
fn truncate(value: &mut String, max: usize) {
    if let Some((index, _)) = value.char_indices().nth(max) {
        value.truncate(index);
    }
}
