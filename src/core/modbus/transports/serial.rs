use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use crate::core::modbus::{Direction, Transport};

/// Bits on the wire per RTU character: start, 8 data, parity or stop, stop.
const BITS_PER_CHAR: u64 = 11;

/// Modem line wired to a transceiver enable pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLine {
    Rts,
    Dtr,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    pub baudrate: u32,
    /// Driver enable, asserted while transmitting.
    pub de_line: ControlLine,
    /// Receiver enable, asserted while listening.
    pub re_line: ControlLine,
    pub active_high: bool,
}

/// RS-485 line on a local serial port, 8N1, with the transceiver direction
/// driven through the modem control lines.
pub struct SerialTransport {
    stream: SerialStream,
    settings: SerialSettings,
    in_flight: usize,
}

impl SerialTransport {
    pub fn open(settings: SerialSettings) -> io::Result<SerialTransport> {
        let stream = tokio_serial::new(&settings.port, settings.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;

        let mut transport = SerialTransport {
            stream,
            settings,
            in_flight: 0,
        };
        transport.apply(Direction::Receive)?;

        info!(
            "Opened {} at {} baud (DE={:?}, RE={:?})",
            transport.settings.port,
            transport.settings.baudrate,
            transport.settings.de_line,
            transport.settings.re_line
        );
        Ok(transport)
    }

    fn apply(&mut self, direction: Direction) -> io::Result<()> {
        // DE and the active-low RE pin switch together.
        let level = (direction == Direction::Transmit) == self.settings.active_high;

        self.drive(self.settings.de_line, level)?;
        self.drive(self.settings.re_line, level)
    }

    fn drive(&mut self, line: ControlLine, level: bool) -> io::Result<()> {
        match line {
            ControlLine::Rts => self.stream.write_request_to_send(level)?,
            ControlLine::Dtr => self.stream.write_data_terminal_ready(level)?,
            ControlLine::None => {}
        }
        Ok(())
    }

    /// Time for `len` characters to leave the shift register.
    fn wire_time(&self, len: usize) -> Duration {
        let baud = u64::from(self.settings.baudrate.max(1));
        Duration::from_micros(len as u64 * BITS_PER_CHAR * 1_000_000 / baud)
    }
}

/// Keeps writing until the whole frame is queued. Short only when `port`
/// stops accepting bytes.
async fn write_frame<W: AsyncWrite + Unpin>(port: &mut W, frame: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < frame.len() {
        match port.write(&frame[written..]).await? {
            0 => break,
            n => written += n,
        }
    }
    Ok(written)
}

#[async_trait]
impl Transport for SerialTransport {
    async fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        self.apply(direction)
    }

    async fn clear_input(&mut self) -> io::Result<()> {
        self.stream.clear(ClearBuffer::Input)?;
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> io::Result<usize> {
        let written = write_frame(&mut self.stream, frame).await?;
        self.in_flight = written;
        debug!("Wrote {written}/{} bytes", frame.len());
        Ok(written)
    }

    async fn drain(&mut self) -> io::Result<()> {
        self.stream.flush().await?;
        // flush only empties the user space buffer; the UART still holds the
        // tail of the frame until it has been shifted out.
        tokio::time::sleep(self.wire_time(self.in_flight)).await;
        self.in_flight = 0;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }
}
