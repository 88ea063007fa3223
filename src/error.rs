//! Error types for caravel.
//!
//! Two layers exist: [`Error`] covers failures of API calls themselves
//! (connecting, driving the event loop), while [`ErrorCode`] is the
//! per-operation status delivered to callbacks, mirroring the status
//! field of the wire protocol.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for caravel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for caravel.
#[derive(Error, Debug)]
pub enum Error {
    /// Wire protocol violations while parsing the response stream
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// SASL negotiation failures
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Problems with the vbucket configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Failures while fetching the bootstrap configuration
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Connection-level failures with no working address left
    #[error("network error: {0}")]
    Network(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Protocol-level errors in the binary packet stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Magic byte is neither a request nor a response
    #[error("invalid magic byte: {0:#04x}")]
    InvalidMagic(u8),

    /// Declared body length exceeds the sanity limit
    #[error("body length {len} exceeds maximum {max}")]
    BodyTooLarge {
        /// Declared total body length in bytes
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Extras and key lengths overrun the declared body length
    #[error("extras and key exceed declared body length")]
    InvalidBodyLayout,

    /// Response carries an opaque with no matching logged request
    #[error("response opaque {0:#010x} matches no outstanding request")]
    UnknownOpaque(u32),

    /// Incomplete packet - need more data
    #[error("incomplete packet, need more data")]
    Incomplete,
}

/// SASL negotiation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Server offered no mechanism the client implements
    #[error("no mutually supported SASL mechanism in {0:?}")]
    NoMechanism(String),

    /// Credentials rejected by the server
    #[error("credentials rejected by server")]
    Rejected,

    /// Server continued an exchange the mechanism considers complete
    #[error("unexpected SASL challenge for mechanism {0}")]
    UnexpectedChallenge(&'static str),

    /// SASL response arrived outside the authentication phase
    #[error("SASL response outside authentication phase")]
    OutOfPhase,
}

/// Errors in the vbucket configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// VBucket count must be a nonzero power of two for mask hashing
    #[error("vbucket count {0} is not a nonzero power of two")]
    BadVbucketCount(usize),

    /// The server list is empty
    #[error("configuration has an empty server list")]
    NoServers,

    /// A vbucket row names a server index outside the server list
    #[error("vbucket {vbucket} references server {index} out of {len}")]
    BadServerIndex {
        /// VBucket id with the bad reference
        vbucket: u16,
        /// Referenced server index
        index: i32,
        /// Length of the server list
        len: usize,
    },

    /// The vbucket has no master assigned
    #[error("vbucket {0} has no master server")]
    NoMaster(u16),

    /// The configuration document did not parse
    #[error("malformed configuration document: {0}")]
    Malformed(String),
}

/// Per-operation status delivered to callbacks.
///
/// `Success` flows through the same channel so that a callback sees
/// exactly one code per request, including the synthetic results the
/// client manufactures for quiet commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Operation completed normally
    Success,
    /// SASL wants another round; internal, never surfaced to callbacks
    AuthContinue,
    /// Credentials rejected
    AuthError,
    /// Arithmetic on a non-numeric value
    DeltaBadval,
    /// Value exceeds the server's size limit
    TooBig,
    /// Server or client out of memory
    OutOfMemory,
    /// CAS mismatch, or ADD on an existing key
    KeyExists,
    /// Missing key, including synthetic misses for quiet gets
    KeyNotFound,
    /// Connect/read/write failure with no working address
    NetworkError,
    /// The configuration is stale; refetch and retry
    NotMyVbucket,
    /// APPEND/PREPEND precondition failed
    NotStored,
    /// Invariant violation in the response stream
    ProtocolError,
    /// Server did not recognise the opcode
    UnknownCommand,
}

impl ErrorCode {
    /// Returns true for `Success`.
    #[inline]
    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Map a wire status (the response header's vbucket/status field)
    /// to an operation code. Unknown statuses collapse to
    /// `ProtocolError`.
    pub(crate) fn from_status(status: u16) -> Self {
        use crate::protocol::status;
        match status {
            status::SUCCESS => ErrorCode::Success,
            status::KEY_ENOENT => ErrorCode::KeyNotFound,
            status::KEY_EEXISTS => ErrorCode::KeyExists,
            status::E2BIG => ErrorCode::TooBig,
            status::NOT_STORED => ErrorCode::NotStored,
            status::DELTA_BADVAL => ErrorCode::DeltaBadval,
            status::NOT_MY_VBUCKET => ErrorCode::NotMyVbucket,
            status::AUTH_ERROR => ErrorCode::AuthError,
            status::AUTH_CONTINUE => ErrorCode::AuthContinue,
            status::UNKNOWN_COMMAND => ErrorCode::UnknownCommand,
            status::ENOMEM => ErrorCode::OutOfMemory,
            _ => ErrorCode::ProtocolError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Success => "success",
            ErrorCode::AuthContinue => "authentication continue",
            ErrorCode::AuthError => "authentication error",
            ErrorCode::DeltaBadval => "arithmetic on non-numeric value",
            ErrorCode::TooBig => "value too big",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::KeyExists => "key exists",
            ErrorCode::KeyNotFound => "key not found",
            ErrorCode::NetworkError => "network error",
            ErrorCode::NotMyVbucket => "vbucket belongs to another server",
            ErrorCode::NotStored => "not stored",
            ErrorCode::ProtocolError => "protocol error",
            ErrorCode::UnknownCommand => "unknown command",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::status;

    #[test]
    fn status_mapping_covers_wire_table() {
        assert_eq!(ErrorCode::from_status(status::SUCCESS), ErrorCode::Success);
        assert_eq!(
            ErrorCode::from_status(status::KEY_ENOENT),
            ErrorCode::KeyNotFound
        );
        assert_eq!(
            ErrorCode::from_status(status::NOT_MY_VBUCKET),
            ErrorCode::NotMyVbucket
        );
        assert_eq!(
            ErrorCode::from_status(status::AUTH_CONTINUE),
            ErrorCode::AuthContinue
        );
        // Anything unknown is a protocol error, not a panic.
        assert_eq!(ErrorCode::from_status(0x7f7f), ErrorCode::ProtocolError);
    }

    #[test]
    fn error_display() {
        let err = Error::Network("no reachable address for node0:11210".into());
        assert_eq!(
            err.to_string(),
            "network error: no reachable address for node0:11210"
        );
        assert!(!ErrorCode::KeyNotFound.is_success());
        assert!(ErrorCode::Success.is_success());
    }
}
