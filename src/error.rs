//! Unified error types for the host-link services.
//!
//! A single `HeciError` enum is what every client-facing call returns.
//! Subsystem errors (transport, wire decoding, DMA, configuration) convert
//! into it. All variants are `Copy` so they can be passed through the
//! driver and logged without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Client-facing driver error
// ---------------------------------------------------------------------------

/// Every fallible HECI client operation funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeciError {
    /// Connection id out of range or not in a state that allows the call.
    BadConnection,
    /// Message or declared size exceeds the protocol/client limits.
    Oversize,
    /// Malformed argument (empty segment chain, zero-sized buffer, ...).
    InvalidParam,
    /// A client with the same protocol GUID is already registered.
    Duplicate,
    /// No free client slot.
    TableFull,
    /// A bounded wait expired (flow-control credit or DMA completion).
    Timeout,
    /// A bounded queue was full and the item was dropped.
    QueueFull,
    /// The raw transport refused a packet.
    Transport(TransportError),
    /// The DMA offload path failed after pages were reserved.
    Dma(DmaError),
}

impl fmt::Display for HeciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadConnection => write!(f, "bad connection"),
            Self::Oversize => write!(f, "message too large"),
            Self::InvalidParam => write!(f, "invalid parameter"),
            Self::Duplicate => write!(f, "client already registered"),
            Self::TableFull => write!(f, "client table full"),
            Self::Timeout => write!(f, "timed out"),
            Self::QueueFull => write!(f, "queue full"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Dma(e) => write!(f, "dma: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Doorbell still busy, peer has not consumed the previous packet.
    Busy,
    /// Host side is not powered or not accessible.
    HostUnavailable,
    /// Packet longer than the transport's fixed maximum.
    TooLong,
    /// Generic I/O failure reported by the IPC layer.
    Io,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "doorbell busy"),
            Self::HostUnavailable => write!(f, "host unavailable"),
            Self::TooLong => write!(f, "packet too long"),
            Self::Io => write!(f, "I/O error"),
        }
    }
}

impl From<TransportError> for HeciError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

// ---------------------------------------------------------------------------
// Wire (protocol-format) errors
// ---------------------------------------------------------------------------

/// Protocol-format errors. These never reach a client: the dispatcher logs
/// them and drops the packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    /// Fewer bytes than a packet header.
    Truncated,
    /// Header length field disagrees with the received byte count.
    LengthMismatch { declared: usize, actual: usize },
    /// Sub-message has the wrong size for its opcode.
    BadMessageLength { command: u8, len: usize },
    /// Bus message with no opcode byte.
    Empty,
    /// Opcode the driver does not handle.
    UnknownCommand(u8),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated packet"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "header len {declared} but {actual} payload bytes")
            }
            Self::BadMessageLength { command, len } => {
                write!(f, "wrong length {len} for command 0x{command:02x}")
            }
            Self::Empty => write!(f, "empty bus message"),
            Self::UnknownCommand(c) => write!(f, "unknown command 0x{c:02x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// DMA errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// Host has not donated a DMA window yet.
    NotReady,
    /// Donated window is empty or not page aligned.
    BadWindow,
    /// No run of contiguous free pages large enough.
    NoPages,
    /// The copy engine refused or faulted.
    EngineFault,
    /// The copy engine did not signal completion in time.
    Timeout,
}

impl fmt::Display for DmaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "no DMA window"),
            Self::BadWindow => write!(f, "window not page aligned"),
            Self::NoPages => write!(f, "no contiguous pages"),
            Self::EngineFault => write!(f, "engine fault"),
            Self::Timeout => write!(f, "completion timeout"),
        }
    }
}

impl From<DmaError> for HeciError {
    fn from(e: DmaError) -> Self {
        match e {
            // Timeouts stay a distinct failure kind for the caller.
            DmaError::Timeout => Self::Timeout,
            other => Self::Dma(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Stored blob failed deserialization.
    Corrupted,
    /// A field failed range validation.
    /// The `&'static str` names the field and the rule.
    ValidationFailed(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Corrupted => write!(f, "config corrupted"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Driver-wide `Result` alias.
pub type Result<T> = core::result::Result<T, HeciError>;
