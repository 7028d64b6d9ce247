use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::crc;
use super::{
    Function, Reason, Reply, TransactionError, EXCEPTION_FLAG, MAX_READ_BITS, MAX_READ_REGISTERS,
    MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
};

/// Largest RTU frame: address, 253 byte PDU, CRC.
pub const MODBUS_MAX_FRAME_LEN: usize = 256;

/// Smallest frame the engine will try to interpret: address, function, one byte.
pub const MODBUS_MIN_FRAME_LEN: usize = 3;

const CRC_LEN: usize = 2;
const EXCEPTION_FRAME_LEN: usize = 5;
const WRITE_ACK_FRAME_LEN: usize = 8;

const COIL_ON: u16 = 0xFF00;
const COIL_OFF: u16 = 0x0000;

/// Ephemeral structure created per transaction to compose the request frame
/// and interpret the reply addressed to a single device.
#[derive(Debug, Clone, Copy)]
pub struct Compositor {
    pub unit_id: u8,
}

impl Compositor {
    pub fn new(unit_id: u8) -> Self {
        Self { unit_id }
    }

    /// Builds the complete RTU frame, CRC included.
    pub fn compose(&self, function: &Function) -> Result<Vec<u8>, TransactionError> {
        Compositor::check_quantity(function)?;

        let mut frame = Vec::with_capacity(MODBUS_MAX_FRAME_LEN);
        frame.write_u8(self.unit_id)?;
        frame.write_u8(function.code())?;
        frame.write_u16::<BigEndian>(function.address())?;

        match function {
            Function::ReadCoils(_, quantity)
            | Function::ReadDiscreteInputs(_, quantity)
            | Function::ReadHoldingRegisters(_, quantity)
            | Function::ReadInputRegisters(_, quantity) => {
                frame.write_u16::<BigEndian>(*quantity)?;
            }
            Function::WriteSingleCoil(_, on) => {
                let value = if *on { COIL_ON } else { COIL_OFF };
                frame.write_u16::<BigEndian>(value)?;
            }
            Function::WriteSingleRegister(_, value) => {
                frame.write_u16::<BigEndian>(*value)?;
            }
            Function::WriteMultipleCoils(_, values) => {
                let packed = pack_bits(values);
                frame.write_u16::<BigEndian>(values.len() as u16)?;
                frame.write_u8(packed.len() as u8)?;
                frame.extend_from_slice(&packed);
            }
            Function::WriteMultipleRegisters(_, values) => {
                frame.write_u16::<BigEndian>(values.len() as u16)?;
                frame.write_u8((values.len() * 2) as u8)?;
                for value in values {
                    frame.write_u16::<BigEndian>(*value)?;
                }
            }
        }

        crc::append_crc(&mut frame);
        Ok(frame)
    }

    /// Interprets a reply whose CRC has already been validated.
    pub fn interpret(&self, function: &Function, frame: &[u8]) -> Result<Reply, TransactionError> {
        if frame.len() < MODBUS_MIN_FRAME_LEN + CRC_LEN {
            return Err(Reason::UnexpectedReplySize.into());
        }

        let body = &frame[..frame.len() - CRC_LEN];
        let (unit_id, code) = (body[0], body[1]);

        if unit_id != self.unit_id {
            return Err(Reason::SlaveMismatch {
                expected: self.unit_id,
                given: unit_id,
            }
            .into());
        }

        if code & EXCEPTION_FLAG != 0 {
            return Err(TransactionError::Exception(body[2]));
        }

        if code != function.code() {
            return Err(Reason::FunctionMismatch {
                expected: function.code(),
                given: code,
            }
            .into());
        }

        match function.expected_bytes() {
            Some(expected) => Compositor::read_reply(function, body, expected),
            None => Compositor::write_ack(function, body),
        }
    }

    fn read_reply(
        function: &Function,
        body: &[u8],
        expected: usize,
    ) -> Result<Reply, TransactionError> {
        let given = body[2] as usize;
        if given != expected {
            return Err(Reason::BytecountMismatch { expected, given }.into());
        }

        let data = body
            .get(3..)
            .filter(|data| data.len() == expected)
            .ok_or(Reason::UnexpectedReplySize)?;

        match *function {
            Function::ReadCoils(_, quantity) | Function::ReadDiscreteInputs(_, quantity) => {
                Ok(Reply::Bits(unpack_bits(data, quantity as usize)))
            }
            _ => {
                let mut rdr = Cursor::new(data);
                let registers = (0..function.quantity())
                    .map(|_| rdr.read_u16::<BigEndian>())
                    .collect::<Result<Vec<_>, io::Error>>()
                    .map_err(|_| Reason::UnexpectedReplySize)?;
                Ok(Reply::Registers(registers))
            }
        }
    }

    fn write_ack(function: &Function, body: &[u8]) -> Result<Reply, TransactionError> {
        if body.len() != WRITE_ACK_FRAME_LEN - CRC_LEN {
            return Err(Reason::UnexpectedReplySize.into());
        }

        let mut rdr = Cursor::new(&body[2..]);
        let address = rdr
            .read_u16::<BigEndian>()
            .map_err(|_| Reason::UnexpectedReplySize)?;
        let value = rdr
            .read_u16::<BigEndian>()
            .map_err(|_| Reason::UnexpectedReplySize)?;

        let echoed = match *function {
            Function::WriteSingleCoil(_, on) => value == if on { COIL_ON } else { COIL_OFF },
            Function::WriteSingleRegister(_, expected) => value == expected,
            _ => value == function.quantity(),
        };

        if address != function.address() || !echoed {
            return Err(Reason::EchoMismatch.into());
        }

        Ok(Reply::WriteAck(address, value))
    }

    fn check_quantity(function: &Function) -> Result<(), TransactionError> {
        let limit = match function {
            Function::ReadCoils(..) | Function::ReadDiscreteInputs(..) => MAX_READ_BITS,
            Function::ReadHoldingRegisters(..) | Function::ReadInputRegisters(..) => {
                MAX_READ_REGISTERS
            }
            Function::WriteMultipleCoils(..) => MAX_WRITE_BITS,
            Function::WriteMultipleRegisters(..) => MAX_WRITE_REGISTERS,
            Function::WriteSingleCoil(..) | Function::WriteSingleRegister(..) => return Ok(()),
        };

        let quantity = function.quantity();
        if quantity == 0 || quantity > limit {
            return Err(Reason::QuantityOutOfRange(quantity).into());
        }

        Ok(())
    }
}

/// Coils are packed least significant bit first.
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (bit, on)| acc | ((*on as u8) << bit))
        })
        .collect()
}

pub fn unpack_bits(bytes: &[u8], quantity: usize) -> Vec<bool> {
    (0..quantity)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Frames RTU replies for one outstanding request. RTU has no length prefix,
/// so the frame length is derived from the function byte and, for reads, the
/// byte count.
#[derive(Debug)]
pub struct RtuCodec {
    compositor: Compositor,
}

impl RtuCodec {
    pub fn new(unit_id: u8) -> Self {
        Self {
            compositor: Compositor::new(unit_id),
        }
    }

    fn frame_len(src: &[u8]) -> Option<usize> {
        let code = *src.get(1)?;

        if code & EXCEPTION_FLAG != 0 {
            return Some(EXCEPTION_FRAME_LEN);
        }

        match code {
            0x01..=0x04 => src.get(2).map(|count| 3 + *count as usize + CRC_LEN),
            0x05 | 0x06 | 0x0F | 0x10 => Some(WRITE_ACK_FRAME_LEN),
            // Unknown function: the read window decides where the frame ends.
            _ => None,
        }
    }
}

impl Decoder for RtuCodec {
    type Item = Vec<u8>;
    type Error = TransactionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let expected_size = match RtuCodec::frame_len(src) {
            Some(size) => size.min(MODBUS_MAX_FRAME_LEN),
            None if src.len() >= MODBUS_MAX_FRAME_LEN => MODBUS_MAX_FRAME_LEN,
            None => return Ok(None),
        };

        if src.len() < expected_size {
            src.reserve(expected_size - src.len());
            return Ok(None);
        }

        let data = src
            .get(..expected_size)
            .ok_or(Reason::UnexpectedReplySize)?
            .to_vec();
        src.advance(expected_size);

        Ok(Some(data))
    }

    /// At the end of the read window whatever arrived is handed over as-is.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let rest = src.to_vec();
                src.clear();
                Ok(Some(rest))
            }
        }
    }
}

impl Encoder<&Function> for RtuCodec {
    type Error = TransactionError;

    fn encode(&mut self, item: &Function, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = self.compositor.compose(item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
