/// A fatal engine fault. Faults are distinct from language-level
/// exceptions: they indicate a corrupted module or a compiler bug, are
/// reported and terminate execution, and can never be caught by
/// `try`/`catch`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    DivisionByZero,
    StackOverflow { limit: usize },
    StackUnderflow,
    CallStackOverflow { limit: usize },
    ExceptionStackOverflow { limit: usize },
    UnknownOpcode { byte: u8, at: usize },
    TruncatedCode { at: usize },
    UnknownNative { id: u32 },
    BadStringIndex { index: i64 },
    /// A heap handle that never existed or was already freed.
    BadHandle,
    IndexOutOfBounds { index: i64, len: usize },
    BadStructId { id: u32 },
    BadArrayLength { len: i64 },
    BadLocalSlot { slot: usize },
    /// A `throw` with no active protected region. Carries the payload.
    UncaughtException(String),
    Io(String),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::DivisionByZero => write!(f, "fault: division by zero"),
            Fault::StackOverflow { limit } => {
                write!(f, "fault: operand stack overflow (limit {})", limit)
            }
            Fault::StackUnderflow => write!(f, "fault: operand stack underflow"),
            Fault::CallStackOverflow { limit } => {
                write!(f, "fault: call stack overflow (limit {})", limit)
            }
            Fault::ExceptionStackOverflow { limit } => {
                write!(f, "fault: exception stack overflow (limit {})", limit)
            }
            Fault::UnknownOpcode { byte, at } => {
                write!(f, "fault: unknown opcode {:#04x} at offset {}", byte, at)
            }
            Fault::TruncatedCode { at } => {
                write!(f, "fault: instruction stream truncated at offset {}", at)
            }
            Fault::UnknownNative { id } => {
                write!(f, "fault: unknown native function id {}", id)
            }
            Fault::BadStringIndex { index } => {
                write!(f, "fault: string pool index {} out of range", index)
            }
            Fault::BadHandle => write!(f, "fault: invalid heap handle"),
            Fault::IndexOutOfBounds { index, len } => {
                write!(
                    f,
                    "fault: index {} out of bounds for allocation of {} cells",
                    index, len
                )
            }
            Fault::BadStructId { id } => {
                write!(f, "fault: struct id {} not present in the module", id)
            }
            Fault::BadArrayLength { len } => {
                write!(f, "fault: invalid array length {}", len)
            }
            Fault::BadLocalSlot { slot } => {
                write!(f, "fault: local slot {} outside the operand stack", slot)
            }
            Fault::UncaughtException(payload) => {
                write!(f, "uncaught exception: {}", payload)
            }
            Fault::Io(message) => write!(f, "fault: i/o error: {}", message),
        }
    }
}

impl std::error::Error for Fault {}

impl From<std::io::Error> for Fault {
    fn from(err: std::io::Error) -> Self {
        Fault::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_division_by_zero() {
        assert_eq!(Fault::DivisionByZero.to_string(), "fault: division by zero");
    }

    #[test]
    fn test_display_uncaught_exception_carries_payload() {
        let fault = Fault::UncaughtException("boom".to_string());
        assert_eq!(fault.to_string(), "uncaught exception: boom");
    }

    #[test]
    fn test_display_unknown_opcode_is_hex() {
        let fault = Fault::UnknownOpcode { byte: 0xAB, at: 12 };
        let msg = fault.to_string();
        assert!(msg.contains("0xab"));
        assert!(msg.contains("12"));
    }
}
