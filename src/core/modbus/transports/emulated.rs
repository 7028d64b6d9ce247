use std::collections::{HashMap, VecDeque};
use std::io::{self, Cursor};
use std::sync::Arc;

use async_trait::async_trait;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use crate::core::modbus::composite::{pack_bits, unpack_bits};
use crate::core::modbus::{crc, Address, Direction, Transport, Value, EXCEPTION_FLAG};

/// How an emulated slave answers the frames addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behaviour {
    #[default]
    Normal,
    /// Never answers.
    Silent,
    /// Answers with a corrupted checksum.
    Garbled,
    /// Answers every request with the given exception code.
    Exception(u8),
    /// The driver accepts one byte less than the frame, nothing is sent.
    ShortWrite,
}

#[derive(Debug, Default)]
struct Slave {
    coils: HashMap<Address, bool>,
    discrete_inputs: HashMap<Address, bool>,
    holding: HashMap<Address, Value>,
    input: HashMap<Address, Value>,
    behaviour: Behaviour,
}

#[derive(Debug)]
struct BusState {
    slaves: HashMap<u8, Slave>,
    pending: VecDeque<u8>,
    requests: Vec<Vec<u8>>,
    direction: Direction,
    direction_switches: usize,
}

/// An in-memory RS-485 segment populated with scriptable slaves.
///
/// Clones share the same segment, so a test can keep one handle to script
/// slaves and inspect traffic while the engine owns another.
#[derive(Debug, Clone)]
pub struct EmulatedBus {
    state: Arc<Mutex<BusState>>,
}

impl Default for EmulatedBus {
    fn default() -> Self {
        EmulatedBus::new()
    }
}

impl EmulatedBus {
    pub fn new() -> EmulatedBus {
        EmulatedBus {
            state: Arc::new(Mutex::new(BusState {
                slaves: HashMap::new(),
                pending: VecDeque::new(),
                requests: Vec::new(),
                direction: Direction::Receive,
                direction_switches: 0,
            })),
        }
    }

    /// Adds a slave answering at `unit_id` with all tables zeroed.
    pub fn with_slave(self, unit_id: u8) -> EmulatedBus {
        self.state.lock().slaves.entry(unit_id).or_default();
        self
    }

    pub fn set_behaviour(&self, unit_id: u8, behaviour: Behaviour) {
        self.state.lock().slaves.entry(unit_id).or_default().behaviour = behaviour;
    }

    pub fn set_holding(&self, unit_id: u8, addr: Address, value: Value) {
        self.state.lock().slaves.entry(unit_id).or_default().holding.insert(addr, value);
    }

    pub fn set_input(&self, unit_id: u8, addr: Address, value: Value) {
        self.state.lock().slaves.entry(unit_id).or_default().input.insert(addr, value);
    }

    pub fn set_coil(&self, unit_id: u8, addr: Address, value: bool) {
        self.state.lock().slaves.entry(unit_id).or_default().coils.insert(addr, value);
    }

    pub fn set_discrete_input(&self, unit_id: u8, addr: Address, value: bool) {
        self.state
            .lock()
            .slaves
            .entry(unit_id)
            .or_default()
            .discrete_inputs
            .insert(addr, value);
    }

    pub fn holding(&self, unit_id: u8, addr: Address) -> Option<Value> {
        let state = self.state.lock();
        state.slaves.get(&unit_id)?.holding.get(&addr).copied()
    }

    pub fn coil(&self, unit_id: u8, addr: Address) -> Option<bool> {
        let state = self.state.lock();
        state.slaves.get(&unit_id)?.coils.get(&addr).copied()
    }

    /// Every frame handed to the driver so far, in order.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state.lock().requests.clone()
    }

    pub fn writes(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    pub fn direction_switches(&self) -> usize {
        self.state.lock().direction_switches
    }
}

impl Slave {
    fn answer(&mut self, request: &[u8]) -> Option<Vec<u8>> {
        let unit_id = request[0];
        let code = request[1];

        let mut reply = match self.behaviour {
            Behaviour::Silent | Behaviour::ShortWrite => return None,
            Behaviour::Exception(exception) => vec![unit_id, code | EXCEPTION_FLAG, exception],
            Behaviour::Normal | Behaviour::Garbled => self
                .execute(&request[..request.len() - 2])
                .unwrap_or_else(|| vec![unit_id, code | EXCEPTION_FLAG, 0x03]),
        };

        crc::append_crc(&mut reply);
        if self.behaviour == Behaviour::Garbled {
            let last = reply.len() - 1;
            reply[last] ^= 0xFF;
        }

        Some(reply)
    }

    /// Returns `None` for malformed or unsupported requests.
    fn execute(&mut self, body: &[u8]) -> Option<Vec<u8>> {
        let mut rdr = Cursor::new(&body[2..]);
        let addr = rdr.read_u16::<BigEndian>().ok()?;
        let arg = rdr.read_u16::<BigEndian>().ok()?;

        let mut reply = vec![body[0], body[1]];
        match body[1] {
            0x01 | 0x02 => {
                let table = if body[1] == 0x01 {
                    &self.coils
                } else {
                    &self.discrete_inputs
                };
                let bits = (0..arg)
                    .map(|i| table.get(&addr.wrapping_add(i)).copied().unwrap_or(false))
                    .collect::<Vec<_>>();
                let packed = pack_bits(&bits);
                reply.push(packed.len() as u8);
                reply.extend_from_slice(&packed);
            }
            0x03 | 0x04 => {
                let table = if body[1] == 0x03 {
                    &self.holding
                } else {
                    &self.input
                };
                reply.push((arg * 2) as u8);
                for i in 0..arg {
                    let value = table.get(&addr.wrapping_add(i)).copied().unwrap_or(0);
                    reply.write_u16::<BigEndian>(value).ok()?;
                }
            }
            0x05 => {
                self.coils.insert(addr, arg == 0xFF00);
                reply.extend_from_slice(&body[2..6]);
            }
            0x06 => {
                self.holding.insert(addr, arg);
                reply.extend_from_slice(&body[2..6]);
            }
            0x0F => {
                let count = rdr.read_u8().ok()? as usize;
                let data = body.get(7..7 + count)?;
                for (i, on) in unpack_bits(data, arg as usize).into_iter().enumerate() {
                    self.coils.insert(addr.wrapping_add(i as u16), on);
                }
                reply.extend_from_slice(&body[2..6]);
            }
            0x10 => {
                rdr.read_u8().ok()?;
                for i in 0..arg {
                    let value = rdr.read_u16::<BigEndian>().ok()?;
                    self.holding.insert(addr.wrapping_add(i), value);
                }
                reply.extend_from_slice(&body[2..6]);
            }
            _ => return None,
        }

        Some(reply)
    }
}

#[async_trait]
impl Transport for EmulatedBus {
    async fn set_direction(&mut self, direction: Direction) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.direction != direction {
            state.direction = direction;
            state.direction_switches += 1;
        }
        Ok(())
    }

    async fn clear_input(&mut self) -> io::Result<()> {
        self.state.lock().pending.clear();
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        state.requests.push(frame.to_vec());

        // A frame sent with the driver disabled never reaches the segment.
        if state.direction != Direction::Transmit || !crc::validate(frame) || frame.len() < 4 {
            return Ok(frame.len());
        }

        let Some(slave) = state.slaves.get_mut(&frame[0]) else {
            return Ok(frame.len());
        };

        if slave.behaviour == Behaviour::ShortWrite {
            return Ok(frame.len() - 1);
        }

        if let Some(reply) = slave.answer(frame) {
            state.pending.extend(reply);
        }
        Ok(frame.len())
    }

    async fn drain(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = {
            let mut state = self.state.lock();
            let n = buf.len().min(state.pending.len());
            for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
                *slot = byte;
            }
            n
        };

        if read == 0 {
            // Silence on the wire; the caller's read window ends this.
            std::future::pending::<()>().await;
        }

        Ok(read)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::modbus::Compositor;
    use crate::core::modbus::Function;

    async fn exchange(bus: &mut EmulatedBus, request: &[u8]) -> Vec<u8> {
        bus.set_direction(Direction::Transmit).await.unwrap();
        bus.write(request).await.unwrap();
        bus.set_direction(Direction::Receive).await.unwrap();
        let mut buf = [0u8; 256];
        let n = bus.read(&mut buf).await.unwrap();
        buf[..n].to_vec()
    }

    #[tokio::test]
    async fn answers_holding_reads() {
        let mut bus = EmulatedBus::new();
        bus.set_holding(5, 100, 1234);

        let request = Compositor::new(5)
            .compose(&Function::ReadHoldingRegisters(100, 1))
            .unwrap();
        let reply = exchange(&mut bus, &request).await;

        assert!(crc::validate(&reply));
        assert_eq!(&reply[..5], &[0x05, 0x03, 0x02, 0x04, 0xD2]);
        assert_eq!(bus.direction_switches(), 2);
    }

    #[tokio::test]
    async fn single_writes_update_tables() {
        let mut bus = EmulatedBus::new().with_slave(2);

        let request = Compositor::new(2)
            .compose(&Function::WriteSingleCoil(7, true))
            .unwrap();
        let reply = exchange(&mut bus, &request).await;

        assert_eq!(reply, request);
        assert_eq!(bus.coil(2, 7), Some(true));
    }

    #[tokio::test]
    async fn frames_sent_while_receiving_are_lost() {
        let mut bus = EmulatedBus::new().with_slave(1);
        let request = Compositor::new(1)
            .compose(&Function::ReadInputRegisters(0, 1))
            .unwrap();

        bus.write(&request).await.unwrap();
        assert_eq!(bus.writes(), 1);
        assert!(bus.state.lock().pending.is_empty());
    }
}
