use std::fmt::{Display, Formatter};

pub type Address = u16;
pub type Quantity = u16;
pub type Value = u16;

/// Highest bit of the function byte, set by a device answering with an exception.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Read quantities permitted by the protocol for bits and registers.
pub const MAX_READ_BITS: Quantity = 2000;
pub const MAX_READ_REGISTERS: Quantity = 125;
pub const MAX_WRITE_BITS: Quantity = 1968;
pub const MAX_WRITE_REGISTERS: Quantity = 123;

/// A single logical Modbus request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Function {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),

    WriteSingleCoil(Address, bool),
    WriteSingleRegister(Address, Value),
    WriteMultipleCoils(Address, Vec<bool>),
    WriteMultipleRegisters(Address, Vec<Value>),
}

impl Function {
    pub fn code(&self) -> u8 {
        match *self {
            Function::ReadCoils(..) => 0x01,
            Function::ReadDiscreteInputs(..) => 0x02,
            Function::ReadHoldingRegisters(..) => 0x03,
            Function::ReadInputRegisters(..) => 0x04,

            Function::WriteSingleCoil(..) => 0x05,
            Function::WriteSingleRegister(..) => 0x06,
            Function::WriteMultipleCoils(..) => 0x0F,
            Function::WriteMultipleRegisters(..) => 0x10,
        }
    }

    pub fn address(&self) -> Address {
        match *self {
            Function::ReadCoils(a, _)
            | Function::ReadDiscreteInputs(a, _)
            | Function::ReadHoldingRegisters(a, _)
            | Function::ReadInputRegisters(a, _)
            | Function::WriteSingleCoil(a, _)
            | Function::WriteSingleRegister(a, _)
            | Function::WriteMultipleCoils(a, _)
            | Function::WriteMultipleRegisters(a, _) => a,
        }
    }

    /// Number of coils or registers touched by the request.
    pub fn quantity(&self) -> Quantity {
        match self {
            Function::ReadCoils(_, q)
            | Function::ReadDiscreteInputs(_, q)
            | Function::ReadHoldingRegisters(_, q)
            | Function::ReadInputRegisters(_, q) => *q,
            Function::WriteSingleCoil(..) | Function::WriteSingleRegister(..) => 1,
            Function::WriteMultipleCoils(_, values) => values.len() as Quantity,
            Function::WriteMultipleRegisters(_, values) => values.len() as Quantity,
        }
    }

    /// Size of the data section of a successful read reply.
    pub fn expected_bytes(&self) -> Option<usize> {
        match *self {
            Function::ReadCoils(_, q) | Function::ReadDiscreteInputs(_, q) => {
                Some((q as usize).div_ceil(8))
            }
            Function::ReadHoldingRegisters(_, q) | Function::ReadInputRegisters(_, q) => {
                Some(2 * q as usize)
            }
            _ => None,
        }
    }

    pub fn name(code: u8) -> &'static str {
        match code & !EXCEPTION_FLAG {
            0x01 => "Read Coils",
            0x02 => "Read Discrete Inputs",
            0x03 => "Read Holding Registers",
            0x04 => "Read Input Registers",
            0x05 => "Write Single Coil",
            0x06 => "Write Single Register",
            0x0F => "Write Multiple Coils",
            0x10 => "Write Multiple Registers",
            _ => "Unknown",
        }
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "FC=0x{:02X} ({}), Addr={}, Qty={}",
            self.code(),
            Function::name(self.code()),
            self.address(),
            self.quantity()
        )
    }
}

/// Decoded payload of a successful transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Bits(Vec<bool>),
    Registers(Vec<Value>),
    /// Echo of a write request: address and value (single) or quantity (multiple).
    WriteAck(Address, u16),
}
