//! Diameter message header and base message types
//!
//! Message format (RFC 6733):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Version    |                 Message Length                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | command flags |                  Command-Code                 |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                         Application-ID                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      Hop-by-Hop Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                      End-to-End Identifier                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  AVPs ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::avp::{find_all_avps, Avp};
use crate::common::avp_code;
use crate::error::{DiameterError, DiameterResult};
use crate::DIAMETER_VERSION;

/// Diameter message header size
pub const DIAMETER_HEADER_SIZE: usize = 20;

/// Command flags
pub mod cmd_flags {
    /// Request bit
    pub const REQUEST: u8 = 0x80;
    /// Proxiable bit
    pub const PROXIABLE: u8 = 0x40;
    /// Error bit
    pub const ERROR: u8 = 0x20;
    /// Potentially re-transmitted bit
    pub const RETRANSMIT: u8 = 0x10;
}

/// Base Diameter command codes (RFC 6733)
pub mod base_cmd {
    /// Capabilities-Exchange-Request/Answer
    pub const CAPABILITIES_EXCHANGE: u32 = 257;
    /// Device-Watchdog-Request/Answer
    pub const DEVICE_WATCHDOG: u32 = 280;
    /// Disconnect-Peer-Request/Answer
    pub const DISCONNECT_PEER: u32 = 282;
}

/// Base Diameter application ID
pub const BASE_APPLICATION_ID: u32 = 0;

/// Identifies a command direction within an application.
///
/// Requests and answers of the same command code are distinct keys, so a
/// handler registered for an answer never sees the request and vice versa.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId {
    pub application_id: u32,
    pub command_code: u32,
    pub request: bool,
}

impl CommandId {
    pub const fn request(application_id: u32, command_code: u32) -> Self {
        Self {
            application_id,
            command_code,
            request: true,
        }
    }

    pub const fn answer(application_id: u32, command_code: u32) -> Self {
        Self {
            application_id,
            command_code,
            request: false,
        }
    }

    /// The answer expected for this request
    pub fn to_answer(self) -> Self {
        Self::answer(self.application_id, self.command_code)
    }

    pub fn is_base(&self) -> bool {
        self.application_id == BASE_APPLICATION_ID
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} (app {})",
            self.command_code,
            if self.request { "R" } else { "A" },
            self.application_id
        )
    }
}

/// Diameter message header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiameterHeader {
    /// Protocol version (always 1)
    pub version: u8,
    /// Message length (including header)
    pub length: u32,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
}

impl DiameterHeader {
    /// Create a new proxiable request header
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: DIAMETER_HEADER_SIZE as u32,
            flags: cmd_flags::REQUEST | cmd_flags::PROXIABLE,
            command_code,
            application_id,
            hop_by_hop_id: 0,
            end_to_end_id: 0,
        }
    }

    /// Create a new answer header from a request.
    ///
    /// The answer keeps the request's identifiers and P bit; R, E and T
    /// are cleared.
    pub fn new_answer(request: &DiameterHeader) -> Self {
        Self {
            version: DIAMETER_VERSION,
            length: DIAMETER_HEADER_SIZE as u32,
            flags: request.flags & cmd_flags::PROXIABLE,
            command_code: request.command_code,
            application_id: request.application_id,
            hop_by_hop_id: request.hop_by_hop_id,
            end_to_end_id: request.end_to_end_id,
        }
    }

    pub fn is_request(&self) -> bool {
        self.flags & cmd_flags::REQUEST != 0
    }

    pub fn is_answer(&self) -> bool {
        !self.is_request()
    }

    pub fn is_proxiable(&self) -> bool {
        self.flags & cmd_flags::PROXIABLE != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & cmd_flags::ERROR != 0
    }

    pub fn is_retransmit(&self) -> bool {
        self.flags & cmd_flags::RETRANSMIT != 0
    }

    pub fn set_error(&mut self) {
        self.flags |= cmd_flags::ERROR;
    }

    /// Mark a request as a potential retransmission (T bit)
    pub fn set_retransmit(&mut self) {
        self.flags |= cmd_flags::RETRANSMIT;
    }

    pub fn command_id(&self) -> CommandId {
        CommandId {
            application_id: self.application_id,
            command_code: self.command_code,
            request: self.is_request(),
        }
    }

    /// Encode header to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        // Length is 3 bytes
        buf.put_u8(((self.length >> 16) & 0xFF) as u8);
        buf.put_u16((self.length & 0xFFFF) as u16);
        buf.put_u8(self.flags);
        // Command code is 3 bytes
        buf.put_u8(((self.command_code >> 16) & 0xFF) as u8);
        buf.put_u16((self.command_code & 0xFFFF) as u16);
        buf.put_u32(self.application_id);
        buf.put_u32(self.hop_by_hop_id);
        buf.put_u32(self.end_to_end_id);
    }

    /// Decode header from bytes
    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::BufferTooSmall {
                needed: DIAMETER_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let version = buf.get_u8();
        if version != DIAMETER_VERSION {
            return Err(DiameterError::Protocol(format!(
                "Unsupported Diameter version: {version}"
            )));
        }

        let len_high = buf.get_u8() as u32;
        let len_low = buf.get_u16() as u32;
        let length = (len_high << 16) | len_low;
        if (length as usize) < DIAMETER_HEADER_SIZE {
            return Err(DiameterError::InvalidMessage(format!(
                "message length {length} is less than header size"
            )));
        }

        let flags = buf.get_u8();
        let cmd_high = buf.get_u8() as u32;
        let cmd_low = buf.get_u16() as u32;
        let command_code = (cmd_high << 16) | cmd_low;

        let application_id = buf.get_u32();
        let hop_by_hop_id = buf.get_u32();
        let end_to_end_id = buf.get_u32();

        Ok(Self {
            version,
            length,
            flags,
            command_code,
            application_id,
            hop_by_hop_id,
            end_to_end_id,
        })
    }
}

/// Diameter message (header + AVPs)
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterMessage {
    pub header: DiameterHeader,
    pub avps: Vec<Avp>,
}

impl DiameterMessage {
    pub fn new(header: DiameterHeader, avps: Vec<Avp>) -> Self {
        Self { header, avps }
    }

    /// Create a new (proxiable) request message
    pub fn new_request(command_code: u32, application_id: u32) -> Self {
        Self {
            header: DiameterHeader::new_request(command_code, application_id),
            avps: Vec::new(),
        }
    }

    /// Create a base protocol request (CER, DWR, DPR are never proxiable)
    pub fn new_base_request(command_code: u32) -> Self {
        let mut msg = Self::new_request(command_code, BASE_APPLICATION_ID);
        msg.header.flags = cmd_flags::REQUEST;
        msg
    }

    /// Create a new answer message from a request
    pub fn new_answer(request: &DiameterMessage) -> Self {
        Self {
            header: DiameterHeader::new_answer(&request.header),
            avps: Vec::new(),
        }
    }

    pub fn command_id(&self) -> CommandId {
        self.header.command_id()
    }

    pub fn add_avp(&mut self, avp: Avp) {
        self.avps.push(avp);
    }

    pub fn has_avp(&self, code: u32) -> bool {
        self.avps.iter().any(|a| a.code == code)
    }

    /// Add an AVP unless one with the same code is already present
    pub fn add_avp_if_absent(&mut self, avp: Avp) {
        if !self.has_avp(avp.code) {
            self.avps.push(avp);
        }
    }

    pub fn find_avp(&self, code: u32) -> Option<&Avp> {
        crate::avp::find_avp(&self.avps, code)
    }

    pub fn find_all_avps(&self, code: u32) -> impl Iterator<Item = &Avp> {
        find_all_avps(&self.avps, code)
    }

    /// Calculate the total message length
    pub fn calculate_length(&self) -> u32 {
        let avp_len: usize = self.avps.iter().map(|a| a.encoded_len()).sum();
        (DIAMETER_HEADER_SIZE + avp_len) as u32
    }

    /// Encode message to bytes
    pub fn encode(&self) -> BytesMut {
        let length = self.calculate_length();
        let mut buf = BytesMut::with_capacity(length as usize);

        let mut header = self.header.clone();
        header.length = length;
        header.encode(&mut buf);

        for avp in &self.avps {
            avp.encode(&mut buf);
        }

        buf
    }

    /// Decode message from bytes
    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        let header = DiameterHeader::decode(buf)?;

        let avp_len = header.length as usize - DIAMETER_HEADER_SIZE;
        if buf.remaining() < avp_len {
            return Err(DiameterError::BufferTooSmall {
                needed: avp_len,
                available: buf.remaining(),
            });
        }

        let mut avp_buf = buf.copy_to_bytes(avp_len);
        let mut avps = Vec::new();

        while avp_buf.has_remaining() {
            avps.push(Avp::decode(&mut avp_buf)?);
        }

        Ok(Self { header, avps })
    }

    fn utf8_avp(&self, code: u32) -> Option<&str> {
        self.find_avp(code)?.as_utf8_string()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.utf8_avp(avp_code::SESSION_ID)
    }

    pub fn origin_host(&self) -> Option<&str> {
        self.utf8_avp(avp_code::ORIGIN_HOST)
    }

    pub fn origin_realm(&self) -> Option<&str> {
        self.utf8_avp(avp_code::ORIGIN_REALM)
    }

    pub fn destination_host(&self) -> Option<&str> {
        self.utf8_avp(avp_code::DESTINATION_HOST)
    }

    pub fn destination_realm(&self) -> Option<&str> {
        self.utf8_avp(avp_code::DESTINATION_REALM)
    }

    pub fn user_name(&self) -> Option<&str> {
        self.utf8_avp(avp_code::USER_NAME)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.utf8_avp(avp_code::ERROR_MESSAGE)
    }

    pub fn result_code(&self) -> Option<u32> {
        self.find_avp(avp_code::RESULT_CODE)?.as_u32()
    }
}
