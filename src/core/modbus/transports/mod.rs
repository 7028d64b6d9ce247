pub mod emulated;
pub mod serial;

pub use emulated::{Behaviour, EmulatedBus};
pub use serial::{ControlLine, SerialSettings, SerialTransport};
