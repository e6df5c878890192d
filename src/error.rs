//! Error types for the mixnet router.
//!
//! Per-circuit failures are reported back toward the origin as ERROR
//! directives and never tear down unrelated circuits sharing the same
//! connection. Connection-fatal errors tear down every circuit riding
//! that connection.

use thiserror::Error;

/// Core error type for router operations.
#[derive(Error, Debug)]
pub enum RouterError {
    /// The type byte of a cell is neither MSG nor DIR.
    #[error("unrecognized cell type {0}")]
    BadCellType(u8),

    /// A DIR cell body could not be deserialized, or a directive is
    /// malformed (bad path, bad key length, oversized payload).
    #[error("malformed directive: {0}")]
    BadDirective(String),

    /// A DESTROY named a circuit that does not ride on the connection
    /// it arrived on.
    #[error("circuit {0:#x} does not belong to this connection")]
    NotOwned(u64),

    /// An outbound dial to a next-hop router or a final destination failed.
    #[error("dial to {addr} failed: {reason}")]
    DialFailed { addr: String, reason: String },

    /// Onion-open failed at the exit hop. Misauthenticated ciphertext is
    /// an adversarial event; callers treat this as fatal during circuit
    /// creation.
    #[error("misauthenticated onion ciphertext")]
    AuthFail,

    /// An assembled message or a destination response exceeds the cap.
    #[error("message exceeds maximum size")]
    MsgTooLarge,

    /// A buffer does not hold a whole cell.
    #[error("short cell of {0} bytes")]
    ShortCell(usize),

    /// A queue flush could not write to its destination.
    #[error("write to peer failed: {0}")]
    WriteFailed(String),

    /// A socket read, write, or dial missed its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The peer closed the connection. Silent; triggers connection teardown.
    #[error("peer closed connection")]
    PeerClosed,
}

impl RouterError {
    /// True when the error indicates an adversarial event the process
    /// must not paper over.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RouterError::AuthFail)
    }
}

/// Result type alias using the router's error.
pub type Result<T> = std::result::Result<T, RouterError>;

impl From<std::io::Error> for RouterError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::BrokenPipe => RouterError::PeerClosed,
            std::io::ErrorKind::TimedOut => RouterError::Timeout,
            _ => RouterError::WriteFailed(e.to_string()),
        }
    }
}
