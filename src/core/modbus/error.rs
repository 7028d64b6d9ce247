use std::fmt::{Display, Formatter};
use std::io;

use enum_primitive::FromPrimitive;
use thiserror::Error;

enum_from_primitive! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Modbus exception codes returned from a remote device.
    pub enum ExceptionCode {
        IllegalFunction         = 0x01,
        IllegalDataAddress      = 0x02,
        IllegalDataValue        = 0x03,
        SlaveOrServerFailure    = 0x04,
        Acknowledge             = 0x05,
        SlaveOrServerBusy       = 0x06,
        NegativeAcknowledge     = 0x07,
        MemoryParity            = 0x08,
        NotDefined              = 0x09,
        GatewayPath             = 0x0a,
        GatewayTarget           = 0x0b
    }
}

impl Display for ExceptionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExceptionCode::IllegalFunction => "Illegal Function",
            ExceptionCode::IllegalDataAddress => "Illegal Data Address",
            ExceptionCode::IllegalDataValue => "Illegal Data Value",
            ExceptionCode::SlaveOrServerFailure => "Slave Device Failure",
            ExceptionCode::Acknowledge => "Acknowledge",
            ExceptionCode::SlaveOrServerBusy => "Slave Device Busy",
            ExceptionCode::NegativeAcknowledge => "Negative Acknowledge",
            ExceptionCode::MemoryParity => "Memory Parity Error",
            ExceptionCode::NotDefined => "Not Defined",
            ExceptionCode::GatewayPath => "Gateway Path Unavailable",
            ExceptionCode::GatewayTarget => "Gateway Target Failed to Respond",
        };

        write!(f, "{name}")
    }
}

/// Why a structurally valid (CRC-correct) frame was still rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    UnexpectedReplySize,
    BytecountMismatch { expected: usize, given: usize },
    SlaveMismatch { expected: u8, given: u8 },
    FunctionMismatch { expected: u8, given: u8 },
    EchoMismatch,
    QuantityOutOfRange(u16),
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Reason::UnexpectedReplySize => write!(f, "unexpected reply size"),
            Reason::BytecountMismatch { expected, given } => {
                write!(f, "byte count {given} (expected {expected})")
            }
            Reason::SlaveMismatch { expected, given } => {
                write!(f, "reply from device {given} (expected {expected})")
            }
            Reason::FunctionMismatch { expected, given } => {
                write!(f, "function 0x{given:02X} (expected 0x{expected:02X})")
            }
            Reason::EchoMismatch => write!(f, "write echo does not match request"),
            Reason::QuantityOutOfRange(quantity) => write!(f, "quantity {quantity} out of range"),
        }
    }
}

/// Terminal outcome of a failed logical transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("Timeout")]
    Timeout,
    #[error("CRC Error")]
    CrcError,
    #[error("Exception: {}", describe_exception(.0))]
    Exception(u8),
    #[error("Invalid Response: {0}")]
    InvalidResponse(Reason),
    #[error("Bus Write Error: {written}/{expected} bytes")]
    BusWriteError { written: usize, expected: usize },
    #[error("Not Initialized")]
    NotInitialized,
    #[error("I/O Error: {0}")]
    Io(io::ErrorKind),
}

fn describe_exception(code: &u8) -> String {
    let code = *code;
    match ExceptionCode::from_u8(code) {
        Some(known) => format!("{known} (0x{code:02X})"),
        None => format!("0x{code:02X}"),
    }
}

impl TransactionError {
    /// Exceptions and a missing bus are final; every other failure starts
    /// a new attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            TransactionError::Exception(_) | TransactionError::NotInitialized
        )
    }

    /// Code recorded against a device when a poll fails. Exception codes
    /// are reported as-is, transport failures as `0`.
    pub fn error_code(&self) -> u8 {
        match self {
            TransactionError::Exception(code) => *code,
            _ => 0,
        }
    }
}

impl From<Reason> for TransactionError {
    fn from(reason: Reason) -> TransactionError {
        TransactionError::InvalidResponse(reason)
    }
}

impl From<io::Error> for TransactionError {
    fn from(err: io::Error) -> TransactionError {
        match err.kind() {
            io::ErrorKind::TimedOut => TransactionError::Timeout,
            kind => TransactionError::Io(kind),
        }
    }
}

impl From<ExceptionCode> for TransactionError {
    fn from(code: ExceptionCode) -> TransactionError {
        TransactionError::Exception(code as u8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exceptions_are_terminal() {
        assert!(!TransactionError::Exception(0x02).is_retryable());
        assert!(TransactionError::Timeout.is_retryable());
        assert!(TransactionError::CrcError.is_retryable());
        assert!(TransactionError::InvalidResponse(Reason::EchoMismatch).is_retryable());
        assert!(TransactionError::BusWriteError { written: 0, expected: 8 }.is_retryable());
    }

    #[test]
    fn exception_display_names_known_codes() {
        let err = TransactionError::from(ExceptionCode::IllegalDataAddress);
        assert_eq!(err.to_string(), "Exception: Illegal Data Address (0x02)");
        assert_eq!(err.error_code(), 0x02);
        assert_eq!(
            TransactionError::Exception(0x42).to_string(),
            "Exception: 0x42"
        );
    }
}
