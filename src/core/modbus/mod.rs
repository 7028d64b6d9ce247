pub mod composite;
pub mod crc;
pub mod engine;
pub mod error;
pub mod function;
pub mod trace;
pub mod transport;
pub mod transports;

pub use composite::*;
pub use engine::*;
pub use error::*;
pub use function::*;
pub use transport::*;
