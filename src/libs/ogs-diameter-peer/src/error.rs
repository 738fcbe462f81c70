//! Diameter error types

use std::time::Duration;

use thiserror::Error;

use crate::connection::ConnectionState;

/// Codec, framing and dictionary errors
#[derive(Error, Debug)]
pub enum DiameterError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Invalid AVP: {0}")]
    InvalidAvp(String),

    #[error("Missing mandatory AVP: {0}")]
    MissingAvp(String),

    #[error("Buffer too small: need {needed}, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    #[error("Unknown command code: {0}")]
    UnknownCommand(u32),

    #[error("Unknown application ID: {0}")]
    UnknownApplication(u32),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Diameter result type
pub type DiameterResult<T> = Result<T, DiameterError>;

/// Errors surfaced by the peer state machine and the correlator
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("no capabilities-exchange answer after {retransmits} retransmissions")]
    HandshakeTimeout { retransmits: u32 },

    #[error("capabilities exchange rejected with Result-Code {result_code}")]
    HandshakeRejected { result_code: u32 },

    #[error("no common application with peer {peer}")]
    NoCommonApplication { peer: String },

    #[error("watchdog failure: {0}")]
    WatchdogFailure(String),

    #[error("peer metadata unavailable (connection is {state})")]
    PeerMetadataUnavailable { state: ConnectionState },

    #[error("no answer for session {session_id} within {timeout:?}")]
    Timeout {
        session_id: String,
        timeout: Duration,
    },

    #[error("failed to send message: {0}")]
    Send(#[source] DiameterError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection is not open (state {state})")]
    NotOpen { state: ConnectionState },

    #[error("invalid message: {0}")]
    InvalidMessage(#[source] DiameterError),

    #[error("session {0} already has a pending exchange")]
    DuplicateSession(String),

    #[error("unknown command name: {0}")]
    UnknownCommand(String),
}

/// Peer result type
pub type PeerResult<T> = Result<T, PeerError>;

/// Diameter Result-Code values (RFC 6733)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ResultCode {
    // Success (2xxx)
    Success = 2001,
    LimitedSuccess = 2002,

    // Protocol Errors (3xxx)
    CommandUnsupported = 3001,
    UnableToDeliver = 3002,
    RealmNotServed = 3003,
    TooBusy = 3004,
    LoopDetected = 3005,
    ApplicationUnsupported = 3007,
    InvalidHdrBits = 3008,
    InvalidAvpBits = 3009,
    UnknownPeer = 3010,

    // Transient Failures (4xxx)
    ElectionLost = 4003,

    // Permanent Failures (5xxx)
    AvpUnsupported = 5001,
    UnknownSessionId = 5002,
    InvalidAvpValue = 5004,
    MissingAvp = 5005,
    AvpOccursTooManyTimes = 5009,
    NoCommonApplication = 5010,
    UnsupportedVersion = 5011,
    UnableToComply = 5012,
    InvalidMessageLength = 5015,
    NoCommonSecurity = 5017,
}

impl ResultCode {
    /// Check if result code indicates success
    pub fn is_success(&self) -> bool {
        is_success_code(*self as u32)
    }

    /// Check if result code indicates protocol error
    pub fn is_protocol_error(&self) -> bool {
        (3000..4000).contains(&(*self as u32))
    }

    /// Check if result code indicates transient failure
    pub fn is_transient_failure(&self) -> bool {
        (4000..5000).contains(&(*self as u32))
    }

    /// Check if result code indicates permanent failure
    pub fn is_permanent_failure(&self) -> bool {
        (5000..6000).contains(&(*self as u32))
    }
}

/// 2xxx class check on a raw Result-Code value
pub fn is_success_code(code: u32) -> bool {
    (2000..3000).contains(&code)
}

impl From<u32> for ResultCode {
    fn from(value: u32) -> Self {
        match value {
            2001 => ResultCode::Success,
            2002 => ResultCode::LimitedSuccess,
            3001 => ResultCode::CommandUnsupported,
            3002 => ResultCode::UnableToDeliver,
            3003 => ResultCode::RealmNotServed,
            3004 => ResultCode::TooBusy,
            3005 => ResultCode::LoopDetected,
            3007 => ResultCode::ApplicationUnsupported,
            3008 => ResultCode::InvalidHdrBits,
            3009 => ResultCode::InvalidAvpBits,
            3010 => ResultCode::UnknownPeer,
            4003 => ResultCode::ElectionLost,
            5001 => ResultCode::AvpUnsupported,
            5002 => ResultCode::UnknownSessionId,
            5004 => ResultCode::InvalidAvpValue,
            5005 => ResultCode::MissingAvp,
            5009 => ResultCode::AvpOccursTooManyTimes,
            5010 => ResultCode::NoCommonApplication,
            5011 => ResultCode::UnsupportedVersion,
            5015 => ResultCode::InvalidMessageLength,
            5017 => ResultCode::NoCommonSecurity,
            _ => ResultCode::UnableToComply,
        }
    }
}
