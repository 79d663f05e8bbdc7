//! Error taxonomy.
//!
//! # Responsibilities
//! - Transport error codes reported by the network stack (`ErrorCode`)
//! - Connection-level outcomes delivered to `on_error` (`ConnectionError`)
//! - API failures returned synchronously from public operations (`Error`)
//!
//! # Design Decisions
//! - Numeric codes are stable so applications can log and compare them
//! - Name-resolution failure uses a dedicated sentinel outside the transport space
//! - TLS failures reuse the transport space shifted by `TLS_ERROR_OFFSET`

use std::fmt;

use crate::net::tls::TlsSetupError;

/// Offset added to transport codes when a failure originates in the TLS engine.
pub const TLS_ERROR_OFFSET: i32 = 64;

/// Code reported when a hostname cannot be resolved.
pub const DNS_FAILED_CODE: i32 = -55;

/// Transport error reported by the network stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum ErrorCode {
    /// Out of memory.
    Mem = -1,
    /// Buffer error.
    Buf = -2,
    /// Timeout.
    Timeout = -3,
    /// Routing problem.
    Rte = -4,
    /// Operation in progress.
    InProgress = -5,
    /// Illegal value.
    Val = -6,
    /// Operation would block.
    WouldBlock = -7,
    /// Address in use.
    Use = -8,
    /// Already connecting.
    Already = -9,
    /// Connection already established.
    IsConn = -10,
    /// Not connected.
    Conn = -11,
    /// Low-level netif error.
    If = -12,
    /// Connection aborted.
    Abrt = -13,
    /// Connection reset.
    Rst = -14,
    /// Connection closed.
    Clsd = -15,
    /// Illegal argument.
    Arg = -16,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn code(self) -> i32 {
        self as i8 as i32
    }

    /// Look up a transport code by number.
    pub fn from_code(code: i32) -> Option<Self> {
        use ErrorCode::*;
        let found = match code {
            -1 => Mem,
            -2 => Buf,
            -3 => Timeout,
            -4 => Rte,
            -5 => InProgress,
            -6 => Val,
            -7 => WouldBlock,
            -8 => Use,
            -9 => Already,
            -10 => IsConn,
            -11 => Conn,
            -12 => If,
            -13 => Abrt,
            -14 => Rst,
            -15 => Clsd,
            -16 => Arg,
            _ => return None,
        };
        Some(found)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", error_to_string(self.code()), self.code())
    }
}

impl std::error::Error for ErrorCode {}

/// Map an `io::Error` from a socket into the transport space.
pub fn io_error_code(err: &std::io::Error) -> ErrorCode {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => ErrorCode::Rst,
        ErrorKind::ConnectionAborted => ErrorCode::Abrt,
        ErrorKind::NotConnected => ErrorCode::Conn,
        ErrorKind::AddrInUse => ErrorCode::Use,
        ErrorKind::AddrNotAvailable => ErrorCode::Rte,
        ErrorKind::TimedOut => ErrorCode::Timeout,
        ErrorKind::WouldBlock => ErrorCode::WouldBlock,
        ErrorKind::InvalidInput => ErrorCode::Arg,
        ErrorKind::OutOfMemory => ErrorCode::Mem,
        ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => ErrorCode::Clsd,
        _ => ErrorCode::If,
    }
}

/// Outcome delivered to a connection's error callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// Failure reported by the network stack.
    Transport(ErrorCode),
    /// The hostname did not resolve to an address.
    DnsFailed,
    /// Failure reported by the TLS engine, expressed in the transport space.
    Tls(ErrorCode),
}

impl ConnectionError {
    /// Signed code as seen by applications.
    pub fn code(&self) -> i32 {
        match self {
            ConnectionError::Transport(e) => e.code(),
            ConnectionError::DnsFailed => DNS_FAILED_CODE,
            ConnectionError::Tls(e) => e.code() + TLS_ERROR_OFFSET,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::Transport(e) => write!(f, "{}", e),
            ConnectionError::DnsFailed => write!(f, "DNS failed ({})", DNS_FAILED_CODE),
            ConnectionError::Tls(e) => write!(f, "TLS error: {} ({})", error_to_string(e.code()), self.code()),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Render a numeric code as text.
pub fn error_to_string(code: i32) -> &'static str {
    match code {
        0 => "OK",
        -1 => "Out of memory error",
        -2 => "Buffer error",
        -3 => "Timeout",
        -4 => "Routing problem",
        -5 => "Operation in progress",
        -6 => "Illegal value",
        -7 => "Operation would block",
        -8 => "Address in use",
        -9 => "Already connected",
        -11 => "Not connected",
        -12 => "Low-level netif error",
        -13 => "Connection aborted",
        -14 => "Connection reset",
        -15 => "Connection closed",
        -16 => "Illegal argument",
        DNS_FAILED_CODE => "DNS failed",
        _ => "UNKNOWN",
    }
}

/// Failure returned synchronously by a public operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection is already bound to a raw handle")]
    AlreadyConnected,

    #[error("failed to start event worker: {0}")]
    Worker(#[source] std::io::Error),

    #[error("network stack could not allocate a connection")]
    NoPcb,

    #[error("network stack rejected the request: {0}")]
    Stack(ErrorCode),

    #[error("name resolution for {host} failed: {code}")]
    Resolve { host: String, code: ErrorCode },

    #[error(transparent)]
    Tls(#[from] TlsSetupError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tls_codes_are_shifted_out_of_transport_space() {
        let err = ConnectionError::Tls(ErrorCode::Val);
        assert_eq!(err.code(), 58);
        assert!(ErrorCode::from_code(err.code()).is_none());
    }

    #[test]
    fn renders_known_and_unknown_codes() {
        assert_eq!(error_to_string(0), "OK");
        assert_eq!(error_to_string(ErrorCode::Rst.code()), "Connection reset");
        assert_eq!(error_to_string(-55), "DNS failed");
        assert_eq!(error_to_string(ErrorCode::IsConn.code()), "UNKNOWN");
        assert_eq!(error_to_string(42), "UNKNOWN");
    }

    #[test]
    fn codes_round_trip_by_number() {
        for code in -16..=-1 {
            let parsed = ErrorCode::from_code(code).unwrap();
            assert_eq!(parsed.code(), code);
        }
    }

    #[test]
    fn dns_failure_has_sentinel_code() {
        assert_eq!(ConnectionError::DnsFailed.code(), -55);
        assert_eq!(ConnectionError::DnsFailed.to_string(), "DNS failed (-55)");
    }
}
