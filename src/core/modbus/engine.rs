//! The bus transaction engine.
//!
//! Every logical transaction runs under the bus lock for its complete
//! request, response and retry cycle:
//!
//! ```text
//! Idle -> Transmitting -> AwaitingResponse -> Validating -> Success
//!              ^                                   |
//!              +----------- retryable -------------+--> Failed
//! ```
//!
//! Only the terminal outcome is visible to callers.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::Mutex;
use tokio::time::timeout_at;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::composite::{Compositor, RtuCodec, MODBUS_MAX_FRAME_LEN, MODBUS_MIN_FRAME_LEN};
use super::trace::hex_dump;
use super::{crc, Address, Direction, Function, Reply, Transport, TransactionError, Value};

pub const MODBUS_DEFAULT_TIMEOUT_MS: u64 = 1000;
pub const MODBUS_MAX_RETRY_ATTEMPTS: u8 = 3;

/// Upper bound on how long the driver may take to push a frame out.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Length of the read window opened after each request.
    pub timeout: Duration,
    /// Full request/response cycles per logical transaction, at least one.
    pub retry_attempts: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(MODBUS_DEFAULT_TIMEOUT_MS),
            retry_attempts: MODBUS_MAX_RETRY_ATTEMPTS,
        }
    }
}

type Bus = Option<Box<dyn Transport>>;

/// Serialises all traffic on one RTU bus.
pub struct Engine {
    bus: Mutex<Bus>,
    config: EngineConfig,
    tracing: Arc<AtomicBool>,
    last_exception: AtomicU8,
}

impl Engine {
    /// An engine with no bus attached; every transaction fails with
    /// [`TransactionError::NotInitialized`] until [`Engine::attach`].
    pub fn detached(config: EngineConfig, tracing: Arc<AtomicBool>) -> Engine {
        Engine {
            bus: Mutex::new(None),
            config: EngineConfig {
                retry_attempts: config.retry_attempts.max(1),
                ..config
            },
            tracing,
            last_exception: AtomicU8::new(0),
        }
    }

    pub fn new(
        transport: Box<dyn Transport>,
        config: EngineConfig,
        tracing: Arc<AtomicBool>,
    ) -> Engine {
        Engine {
            bus: Mutex::new(Some(transport)),
            ..Engine::detached(config, tracing)
        }
    }

    /// Waits for any in-flight transaction before swapping the bus.
    pub async fn attach(&self, transport: Box<dyn Transport>) {
        *self.bus.lock().await = Some(transport);
        info!("Bus attached");
    }

    pub async fn detach(&self) -> Option<Box<dyn Transport>> {
        let transport = self.bus.lock().await.take();
        info!("Bus detached");
        transport
    }

    pub async fn is_initialized(&self) -> bool {
        self.bus.lock().await.is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Exception code of the most recent transaction, `0` after a success.
    pub fn last_exception_code(&self) -> u8 {
        self.last_exception.load(Ordering::Relaxed)
    }

    pub async fn read_coils(
        &self,
        device_id: u8,
        addr: Address,
        quantity: u16,
    ) -> Result<Vec<bool>, TransactionError> {
        match self
            .execute(device_id, Function::ReadCoils(addr, quantity))
            .await?
        {
            Reply::Bits(bits) => Ok(bits),
            _ => Err(TransactionError::InvalidResponse(
                super::Reason::UnexpectedReplySize,
            )),
        }
    }

    pub async fn read_discrete_inputs(
        &self,
        device_id: u8,
        addr: Address,
        quantity: u16,
    ) -> Result<Vec<bool>, TransactionError> {
        match self
            .execute(device_id, Function::ReadDiscreteInputs(addr, quantity))
            .await?
        {
            Reply::Bits(bits) => Ok(bits),
            _ => Err(TransactionError::InvalidResponse(
                super::Reason::UnexpectedReplySize,
            )),
        }
    }

    pub async fn read_holding_registers(
        &self,
        device_id: u8,
        addr: Address,
        quantity: u16,
    ) -> Result<Vec<Value>, TransactionError> {
        match self
            .execute(device_id, Function::ReadHoldingRegisters(addr, quantity))
            .await?
        {
            Reply::Registers(values) => Ok(values),
            _ => Err(TransactionError::InvalidResponse(
                super::Reason::UnexpectedReplySize,
            )),
        }
    }

    pub async fn read_input_registers(
        &self,
        device_id: u8,
        addr: Address,
        quantity: u16,
    ) -> Result<Vec<Value>, TransactionError> {
        match self
            .execute(device_id, Function::ReadInputRegisters(addr, quantity))
            .await?
        {
            Reply::Registers(values) => Ok(values),
            _ => Err(TransactionError::InvalidResponse(
                super::Reason::UnexpectedReplySize,
            )),
        }
    }

    pub async fn write_single_coil(
        &self,
        device_id: u8,
        addr: Address,
        value: bool,
    ) -> Result<(), TransactionError> {
        self.execute(device_id, Function::WriteSingleCoil(addr, value))
            .await
            .map(|_| ())
    }

    pub async fn write_single_register(
        &self,
        device_id: u8,
        addr: Address,
        value: Value,
    ) -> Result<(), TransactionError> {
        self.execute(device_id, Function::WriteSingleRegister(addr, value))
            .await
            .map(|_| ())
    }

    pub async fn write_multiple_coils(
        &self,
        device_id: u8,
        addr: Address,
        values: &[bool],
    ) -> Result<(), TransactionError> {
        self.execute(device_id, Function::WriteMultipleCoils(addr, values.to_vec()))
            .await
            .map(|_| ())
    }

    pub async fn write_multiple_registers(
        &self,
        device_id: u8,
        addr: Address,
        values: &[Value],
    ) -> Result<(), TransactionError> {
        self.execute(
            device_id,
            Function::WriteMultipleRegisters(addr, values.to_vec()),
        )
        .await
        .map(|_| ())
    }

    /// Runs one logical transaction, retrying transient failures.
    pub async fn execute(
        &self,
        device_id: u8,
        function: Function,
    ) -> Result<Reply, TransactionError> {
        let started = Instant::now();

        // Held until return; dropping the guard is the only release path.
        let mut bus = self.bus.lock().await;
        let transport = bus.as_mut().ok_or_else(|| {
            error!("Bus not initialized, dropping {function}");
            TransactionError::NotInitialized
        })?;

        debug!("TRANSACTION START: DevID={device_id}, {function}");

        let mut codec = RtuCodec::new(device_id);
        let mut request = BytesMut::new();
        codec.encode(&function, &mut request)?;

        let compositor = Compositor::new(device_id);
        let attempts = self.config.retry_attempts;
        let mut outcome = TransactionError::Timeout;

        for attempt in 1..=attempts {
            let result = self
                .attempt(&mut **transport, &mut codec, &request)
                .await
                .and_then(|frame| compositor.interpret(&function, &frame));

            match result {
                Ok(reply) => {
                    self.last_exception.store(0, Ordering::Relaxed);
                    debug!(
                        "TRANSACTION SUCCESS: DevID={device_id}, FC=0x{:02X}, Attempts={attempt}, Total Time={} ms",
                        function.code(),
                        started.elapsed().as_millis()
                    );
                    return Ok(reply);
                }
                Err(err) if !err.is_retryable() => {
                    self.last_exception
                        .store(err.error_code(), Ordering::Relaxed);
                    warn!(
                        "ATTEMPT {attempt}/{attempts}: DevID={device_id}, FC=0x{:02X}, Addr={}, Result={err}",
                        function.code(),
                        function.address()
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        "ATTEMPT {attempt}/{attempts}: DevID={device_id}, FC=0x{:02X}, Addr={}, Result={err}",
                        function.code(),
                        function.address()
                    );
                    outcome = err;
                }
            }
        }

        error!(
            "TRANSACTION FAILED: DevID={device_id}, FC=0x{:02X}, Attempts={attempts}, Total Time={} ms",
            function.code(),
            started.elapsed().as_millis()
        );
        Err(outcome)
    }

    /// One `Transmitting -> AwaitingResponse -> Validating` cycle. Returns the
    /// CRC-checked frame.
    async fn attempt(
        &self,
        transport: &mut dyn Transport,
        codec: &mut RtuCodec,
        request: &[u8],
    ) -> Result<Vec<u8>, TransactionError> {
        self.transmit(transport, request).await?;

        let frame = self.receive(transport, codec).await?;
        if frame.len() < MODBUS_MIN_FRAME_LEN {
            return Err(TransactionError::Timeout);
        }

        if !crc::validate(&frame) {
            self.trace("RECEIVED (bad CRC)", &frame);
            return Err(TransactionError::CrcError);
        }

        debug!(
            "RECEIVED: {} bytes, DevID={}, FC=0x{:02X}",
            frame.len(),
            frame[0],
            frame[1]
        );
        self.trace("FRAME", &frame);
        Ok(frame)
    }

    async fn transmit(
        &self,
        transport: &mut dyn Transport,
        request: &[u8],
    ) -> Result<(), TransactionError> {
        let started = Instant::now();

        transport.set_direction(Direction::Transmit).await?;
        let sent = Engine::send(transport, request).await;
        // Back to listening on every path, or the next reply is lost.
        let released = transport.set_direction(Direction::Receive).await;

        sent?;
        released?;

        debug!("TX completed in {} ms", started.elapsed().as_millis());
        Ok(())
    }

    async fn send(transport: &mut dyn Transport, request: &[u8]) -> Result<(), TransactionError> {
        transport.clear_input().await?;

        let written = transport.write(request).await?;
        if written != request.len() {
            return Err(TransactionError::BusWriteError {
                written,
                expected: request.len(),
            });
        }

        match tokio::time::timeout(DRAIN_TIMEOUT, transport.drain()).await {
            Ok(drained) => drained?,
            Err(_) => warn!("Transmit did not complete within {DRAIN_TIMEOUT:?}"),
        }

        Ok(())
    }

    /// Collects bytes until a complete frame is framed or the read window
    /// closes, whichever is first.
    async fn receive(
        &self,
        transport: &mut dyn Transport,
        codec: &mut RtuCodec,
    ) -> Result<Vec<u8>, TransactionError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut received = BytesMut::with_capacity(MODBUS_MAX_FRAME_LEN);
        let mut chunk = [0u8; MODBUS_MAX_FRAME_LEN];

        loop {
            if let Some(frame) = codec.decode(&mut received)? {
                debug!("RX completed in {} ms", started.elapsed().as_millis());
                return Ok(frame);
            }

            match timeout_at(deadline, transport.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => received.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => {
                    warn!("Read failed: {err}");
                    break;
                }
                Err(_) => break,
            }
        }

        match codec.decode_eof(&mut received)? {
            Some(frame) if frame.len() >= MODBUS_MIN_FRAME_LEN => Ok(frame),
            partial => {
                warn!(
                    "Timeout waiting for response: {} bytes",
                    partial.map(|f| f.len()).unwrap_or(0)
                );
                Err(TransactionError::Timeout)
            }
        }
    }

    fn trace(&self, label: &str, data: &[u8]) {
        if self.tracing.load(Ordering::Relaxed) {
            info!("{label}: {}", hex_dump(data));
        }
    }
}
