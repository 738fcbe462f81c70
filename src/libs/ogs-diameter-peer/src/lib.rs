//! NextGCore Diameter Peer Library
//!
//! A minimal Diameter (RFC 6733) client peer:
//! - Message and AVP codec with an explicit, shareable [`Dictionary`]
//! - CER/CEA capabilities exchange with retransmission
//! - DWR/DWA watchdog and DPR/DPA disconnect handling
//! - Session-Id based request/answer correlation ([`Connection::send_and_wait`])
//! - Per-command handler registry for inbound messages
//! - Bounded, non-blocking error report channel for background faults
//!
//! Transport is TCP or TLS (rustls); any `AsyncRead + AsyncWrite` stream
//! can be used through [`DiameterClient::connect_stream`].

pub mod common;
pub mod avp;
pub mod message;
pub mod dict;
pub mod error;
pub mod config;
pub mod tls;
pub mod transport;
pub mod report;
pub mod handler;
pub mod session;
pub mod connection;
pub mod correlator;
pub mod peer;

#[cfg(test)]
pub(crate) mod testing;

pub use common::*;
pub use avp::*;
pub use message::*;
pub use dict::{Dictionary, HELLO_DICTIONARY};
pub use error::*;
pub use config::*;
pub use tls::TlsSettings;
pub use transport::{DiameterStream, Frame, MessageReader, MessageWriter, MAX_MESSAGE_SIZE};
pub use report::{error_channel, ErrorCause, ErrorReport, ErrorReporter, ErrorReports};
pub use handler::{Handler, HandlerRegistry};
pub use session::SessionIdGenerator;
pub use connection::{Connection, ConnectionState, RemotePeerMetadata};
pub use peer::DiameterClient;

/// Diameter protocol version
pub const DIAMETER_VERSION: u8 = 1;

/// Default Diameter port
pub const DIAMETER_PORT: u16 = 3868;

/// Default Diameter TLS port
pub const DIAMETER_TLS_PORT: u16 = 5658;
