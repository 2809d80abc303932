use thiserror::Error;

/// Errors produced while encoding/decoding the wire-level structures in this
/// crate (entries, log headers, RPC envelopes). These mirror the "Storage"
/// and "Protocol-violation" categories from the error taxonomy: malformed
/// data is reported precisely enough for the caller to distinguish a torn
/// write from a genuine bug.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("entry payload of {0} bytes exceeds the maximum of {1} bytes")]
    E2Big(usize, usize),

    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    #[error("bad magic: expected {expected:#x}, found {found:#x}")]
    BadMagic { expected: u64, found: u64 },

    #[error("crc mismatch: expected {expected:#x}, computed {computed:#x}")]
    CrcMismatch { expected: u32, computed: u32 },

    #[error("entry index {embedded} does not match physical slot {slot}")]
    BadSlot { embedded: i64, slot: i64 },

    #[error("entry identity mismatch: expected self={expected_self} group={expected_group}, found self={found_self} group={found_group}")]
    WrongIdentity {
        expected_self: uuid::Uuid,
        expected_group: uuid::Uuid,
        found_self: uuid::Uuid,
        found_group: uuid::Uuid,
    },

    #[error("unknown RPC payload kind tag {0}")]
    UnknownPayloadKind(u8),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
