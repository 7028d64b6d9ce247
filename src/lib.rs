#[macro_use]
extern crate enum_primitive;

pub mod core;

pub mod prelude {
    pub use crate::core::modbus::transports::{Behaviour, EmulatedBus, SerialTransport};
    pub use crate::core::modbus::{Engine, EngineConfig, Function, TransactionError, Transport};
    pub use crate::core::store::{FileStore, MemoryStore, Store};
    pub use crate::core::*;
}
