pub mod bridge;
pub mod config;
pub mod device;
pub mod error;
pub mod modbus;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod supervisor;

pub use bridge::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use registry::*;
pub use scheduler::*;
pub use supervisor::*;
