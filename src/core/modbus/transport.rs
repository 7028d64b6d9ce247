use std::io;

use async_trait::async_trait;

/// State of the half-duplex transceiver enable lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Transmit,
    Receive,
}

/// A half-duplex serial line together with the lines that switch the
/// transceiver between driving and listening to the bus.
///
/// The engine brackets every request as:
/// `set_direction(Transmit)`, `clear_input`, `write`, `drain`,
/// `set_direction(Receive)`, followed by any number of `read`s.
#[async_trait]
pub trait Transport: Send {
    async fn set_direction(&mut self, direction: Direction) -> io::Result<()>;

    /// Discards any bytes received before the request was sent.
    async fn clear_input(&mut self) -> io::Result<()>;

    /// Returns the number of bytes accepted by the driver.
    async fn write(&mut self, frame: &[u8]) -> io::Result<usize>;

    /// Resolves once the last written byte has left the wire.
    async fn drain(&mut self) -> io::Result<()>;

    /// Pends until at least one byte is available. Cancellation safe.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}
