use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of stream")]
    UnexpectedEof,
    #[error("command size {size} is invalid ({remaining} bytes remaining)")]
    BadCommandSize { size: u32, remaining: usize },
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("invalid value {value} for {kind}")]
    InvalidEnum { kind: &'static str, value: u32 },
    #[error("invalid bool byte {0}")]
    InvalidBool(u8),
    #[error("invalid UTF-8 in string argument")]
    InvalidUtf8,
    #[error("length {len} x {elem_size} exceeds the {remaining} bytes remaining")]
    LengthOverflow {
        len: u32,
        elem_size: usize,
        remaining: usize,
    },
    #[error("unknown bits {bits:#x} in {kind}")]
    InvalidFlags { kind: &'static str, bits: u32 },
    #[error("{0} trailing bytes after command payload")]
    TrailingBytes(usize),
}
