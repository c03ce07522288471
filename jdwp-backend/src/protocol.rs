// JDWP protocol definitions: framing constants, error codes and transport errors
//
// Reference: https://docs.oracle.com/javase/8/docs/platform/jpda/jdwp/jdwp-protocol.html

use thiserror::Error;

// JDWP uses big-endian (network byte order) for all multi-byte values

pub type JdwpResult<T> = Result<T, JdwpError>;

/// Session-level failures: anything that ends the current debugger connection.
#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid handshake")]
    InvalidHandshake,

    #[error("JDWP error code {}: {}", .0.code(), .0.name())]
    JdwpErrorCode(ErrorCode),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl From<ErrorCode> for JdwpError {
    fn from(code: ErrorCode) -> Self {
        JdwpError::JdwpErrorCode(code)
    }
}

// JDWP handshake string
pub const JDWP_HANDSHAKE: &[u8] = b"JDWP-Handshake";

// Packet structure:
// length (4 bytes) - includes header
// id (4 bytes)
// flags (1 byte) - 0x00 = command, 0x80 = reply
// [Command packet: command set (1 byte) + command (1 byte)]
// [Reply packet: error code (2 bytes)]
// data (variable)

pub const HEADER_SIZE: usize = 11;
pub const REPLY_FLAG: u8 = 0x80;

/// Maximum allowed JDWP packet size (10MB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Protocol error codes carried in reply headers.
///
/// Core components report failures with these values directly; the command
/// loop copies them into the reply's error field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u16)]
pub enum ErrorCode {
    #[error("INVALID_THREAD")]
    InvalidThread = 10,
    #[error("INVALID_THREAD_GROUP")]
    InvalidThreadGroup = 11,
    #[error("THREAD_NOT_SUSPENDED")]
    ThreadNotSuspended = 13,
    #[error("THREAD_SUSPENDED")]
    ThreadSuspended = 14,
    #[error("INVALID_OBJECT")]
    InvalidObject = 20,
    #[error("INVALID_CLASS")]
    InvalidClass = 21,
    #[error("CLASS_NOT_PREPARED")]
    ClassNotPrepared = 22,
    #[error("INVALID_METHODID")]
    InvalidMethodId = 23,
    #[error("INVALID_LOCATION")]
    InvalidLocation = 24,
    #[error("INVALID_FIELDID")]
    InvalidFieldId = 25,
    #[error("INVALID_FRAMEID")]
    InvalidFrameId = 30,
    #[error("NO_MORE_FRAMES")]
    NoMoreFrames = 31,
    #[error("OPAQUE_FRAME")]
    OpaqueFrame = 32,
    #[error("TYPE_MISMATCH")]
    TypeMismatch = 34,
    #[error("DUPLICATE")]
    Duplicate = 40,
    #[error("NOT_FOUND")]
    NotFound = 41,
    #[error("INTERRUPT")]
    Interrupt = 52,
    #[error("NOT_IMPLEMENTED")]
    NotImplemented = 99,
    #[error("NULL_POINTER")]
    NullPointer = 100,
    #[error("ABSENT_INFORMATION")]
    AbsentInformation = 101,
    #[error("INVALID_EVENT_TYPE")]
    InvalidEventType = 102,
    #[error("ILLEGAL_ARGUMENT")]
    IllegalArgument = 103,
    #[error("OUT_OF_MEMORY")]
    OutOfMemory = 110,
    #[error("ACCESS_DENIED")]
    AccessDenied = 111,
    #[error("VM_DEAD")]
    VmDead = 112,
    #[error("INTERNAL")]
    Internal = 113,
    #[error("UNATTACHED_THREAD")]
    UnattachedThread = 115,
    #[error("INVALID_TAG")]
    InvalidTag = 500,
    #[error("ALREADY_INVOKING")]
    AlreadyInvoking = 502,
    #[error("INVALID_INDEX")]
    InvalidIndex = 503,
    #[error("INVALID_LENGTH")]
    InvalidLength = 504,
    #[error("INVALID_STRING")]
    InvalidString = 506,
    #[error("INVALID_ARRAY")]
    InvalidArray = 508,
    #[error("TRANSPORT_INIT")]
    TransportInit = 510,
    #[error("INVALID_COUNT")]
    InvalidCount = 512,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        error_message(self as u16)
    }

    pub fn from_code(code: u16) -> Option<Self> {
        use ErrorCode::*;
        let known = [
            InvalidThread,
            InvalidThreadGroup,
            ThreadNotSuspended,
            ThreadSuspended,
            InvalidObject,
            InvalidClass,
            ClassNotPrepared,
            InvalidMethodId,
            InvalidLocation,
            InvalidFieldId,
            InvalidFrameId,
            NoMoreFrames,
            OpaqueFrame,
            TypeMismatch,
            Duplicate,
            NotFound,
            Interrupt,
            NotImplemented,
            NullPointer,
            AbsentInformation,
            InvalidEventType,
            IllegalArgument,
            OutOfMemory,
            AccessDenied,
            VmDead,
            Internal,
            UnattachedThread,
            InvalidTag,
            AlreadyInvoking,
            InvalidIndex,
            InvalidLength,
            InvalidString,
            InvalidArray,
            TransportInit,
            InvalidCount,
        ];
        known.into_iter().find(|e| e.code() == code)
    }
}

/// Human readable name for any numeric error code, including ones the engine
/// never produces itself.
pub fn error_message(code: u16) -> &'static str {
    match code {
        0 => "NONE",
        10 => "INVALID_THREAD",
        11 => "INVALID_THREAD_GROUP",
        12 => "INVALID_PRIORITY",
        13 => "THREAD_NOT_SUSPENDED",
        14 => "THREAD_SUSPENDED",
        20 => "INVALID_OBJECT",
        21 => "INVALID_CLASS",
        22 => "CLASS_NOT_PREPARED",
        23 => "INVALID_METHODID",
        24 => "INVALID_LOCATION",
        25 => "INVALID_FIELDID",
        30 => "INVALID_FRAMEID",
        31 => "NO_MORE_FRAMES",
        32 => "OPAQUE_FRAME",
        33 => "NOT_CURRENT_FRAME",
        34 => "TYPE_MISMATCH",
        35 => "INVALID_SLOT",
        40 => "DUPLICATE",
        41 => "NOT_FOUND",
        50 => "INVALID_MONITOR",
        51 => "NOT_MONITOR_OWNER",
        52 => "INTERRUPT",
        99 => "NOT_IMPLEMENTED",
        100 => "NULL_POINTER",
        101 => "ABSENT_INFORMATION",
        102 => "INVALID_EVENT_TYPE",
        103 => "ILLEGAL_ARGUMENT",
        110 => "OUT_OF_MEMORY",
        111 => "ACCESS_DENIED",
        112 => "VM_DEAD",
        113 => "INTERNAL",
        115 => "UNATTACHED_THREAD",
        500 => "INVALID_TAG",
        502 => "ALREADY_INVOKING",
        503 => "INVALID_INDEX",
        504 => "INVALID_LENGTH",
        506 => "INVALID_STRING",
        507 => "INVALID_CLASS_LOADER",
        508 => "INVALID_ARRAY",
        509 => "TRANSPORT_LOAD",
        510 => "TRANSPORT_INIT",
        511 => "NATIVE_METHOD",
        512 => "INVALID_COUNT",
        _ => "UNKNOWN_ERROR",
    }
}
