//! Diameter AVP (Attribute-Value Pair) encoding and decoding
//!
//! AVP format (RFC 6733):
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           AVP Code                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V M P r r r r r|                  AVP Length                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Vendor-ID (opt)                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    Data ...
//! +-+-+-+-+-+-+-+-+
//! ```
//!
//! Decoding never interprets the payload: every decoded AVP carries
//! [`AvpData::Raw`] and the typed accessors read it on demand.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{DiameterError, DiameterResult};

/// AVP flags
pub mod avp_flags {
    /// Vendor-Specific bit
    pub const VENDOR: u8 = 0x80;
    /// Mandatory bit
    pub const MANDATORY: u8 = 0x40;
    /// Protected bit (encryption)
    pub const PROTECTED: u8 = 0x20;
}

/// AVP header size without vendor ID
pub const AVP_HEADER_SIZE: usize = 8;
/// AVP header size with vendor ID
pub const AVP_HEADER_SIZE_VENDOR: usize = 12;

/// Diameter AVP
#[derive(Debug, Clone, PartialEq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    /// Present only when the V bit is set
    pub vendor_id: Option<u32>,
    pub data: AvpData,
}

/// AVP data types
#[derive(Debug, Clone, PartialEq)]
pub enum AvpData {
    OctetString(Bytes),
    Integer32(i32),
    Unsigned32(u32),
    Unsigned64(u64),
    /// Address (IPv4 or IPv6), AddressType prefixed
    Address(IpAddr),
    Utf8String(String),
    /// DiameterIdentity (FQDN)
    DiameterIdentity(String),
    Enumerated(i32),
    Grouped(Vec<Avp>),
    /// Undecoded payload as received from the wire
    Raw(Bytes),
}

impl Avp {
    pub fn new(code: u32, flags: u8, vendor_id: Option<u32>, data: AvpData) -> Self {
        Self {
            code,
            flags,
            vendor_id,
            data,
        }
    }

    /// Create a mandatory AVP
    pub fn mandatory(code: u32, data: AvpData) -> Self {
        Self::new(code, avp_flags::MANDATORY, None, data)
    }

    /// Create an AVP with no flag bits set (e.g. Product-Name)
    pub fn optional(code: u32, data: AvpData) -> Self {
        Self::new(code, 0, None, data)
    }

    /// Create a vendor-specific mandatory AVP
    pub fn vendor_mandatory(code: u32, vendor_id: u32, data: AvpData) -> Self {
        Self::new(
            code,
            avp_flags::VENDOR | avp_flags::MANDATORY,
            Some(vendor_id),
            data,
        )
    }

    /// Mandatory DiameterIdentity AVP
    pub fn identity(code: u32, value: impl Into<String>) -> Self {
        Self::mandatory(code, AvpData::DiameterIdentity(value.into()))
    }

    /// Mandatory UTF8String AVP
    pub fn utf8(code: u32, value: impl Into<String>) -> Self {
        Self::mandatory(code, AvpData::Utf8String(value.into()))
    }

    /// Mandatory Unsigned32 AVP
    pub fn unsigned32(code: u32, value: u32) -> Self {
        Self::mandatory(code, AvpData::Unsigned32(value))
    }

    /// Check if AVP is vendor-specific
    pub fn is_vendor_specific(&self) -> bool {
        self.flags & avp_flags::VENDOR != 0
    }

    /// Check if AVP is mandatory
    pub fn is_mandatory(&self) -> bool {
        self.flags & avp_flags::MANDATORY != 0
    }

    fn header_len(&self) -> usize {
        if self.is_vendor_specific() {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        }
    }

    /// Get the encoded length of this AVP (including padding)
    pub fn encoded_len(&self) -> usize {
        let total = self.header_len() + self.data.encoded_len();
        (total + 3) & !3
    }

    /// Encode AVP to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        let data_len = self.data.encoded_len();
        let avp_len = self.header_len() + data_len;

        buf.put_u32(self.code);
        buf.put_u8(self.flags);
        buf.put_u8(((avp_len >> 16) & 0xFF) as u8);
        buf.put_u16((avp_len & 0xFFFF) as u16);

        if self.is_vendor_specific() {
            buf.put_u32(self.vendor_id.unwrap_or_default());
        }

        self.data.encode(buf);

        let padding = (4 - (data_len % 4)) % 4;
        buf.put_bytes(0, padding);
    }

    /// Decode AVP from bytes
    pub fn decode(buf: &mut Bytes) -> DiameterResult<Self> {
        if buf.remaining() < AVP_HEADER_SIZE {
            return Err(DiameterError::BufferTooSmall {
                needed: AVP_HEADER_SIZE,
                available: buf.remaining(),
            });
        }

        let code = buf.get_u32();
        let flags = buf.get_u8();
        let len_high = buf.get_u8() as usize;
        let len_low = buf.get_u16() as usize;
        let avp_len = (len_high << 16) | len_low;

        let is_vendor = flags & avp_flags::VENDOR != 0;
        let header_len = if is_vendor {
            AVP_HEADER_SIZE_VENDOR
        } else {
            AVP_HEADER_SIZE
        };

        if avp_len < header_len {
            return Err(DiameterError::InvalidAvp(format!(
                "AVP {code} length {avp_len} is less than header size {header_len}"
            )));
        }

        let vendor_id = if is_vendor {
            if buf.remaining() < 4 {
                return Err(DiameterError::BufferTooSmall {
                    needed: 4,
                    available: buf.remaining(),
                });
            }
            Some(buf.get_u32())
        } else {
            None
        };

        let data_len = avp_len - header_len;
        if buf.remaining() < data_len {
            return Err(DiameterError::BufferTooSmall {
                needed: data_len,
                available: buf.remaining(),
            });
        }

        let data_bytes = buf.copy_to_bytes(data_len);

        // The last AVP of a message may omit its padding
        let padding = (4 - (data_len % 4)) % 4;
        buf.advance(padding.min(buf.remaining()));

        Ok(Self {
            code,
            flags,
            vendor_id,
            data: AvpData::Raw(data_bytes),
        })
    }

    /// Get data as OctetString
    pub fn as_octet_string(&self) -> Option<&Bytes> {
        match &self.data {
            AvpData::OctetString(b) | AvpData::Raw(b) => Some(b),
            _ => None,
        }
    }

    /// Get data as Unsigned32
    pub fn as_u32(&self) -> Option<u32> {
        match &self.data {
            AvpData::Unsigned32(v) => Some(*v),
            AvpData::Enumerated(v) | AvpData::Integer32(v) => Some(*v as u32),
            AvpData::Raw(b) if b.len() == 4 => Some(b.clone().get_u32()),
            _ => None,
        }
    }

    /// Get data as Unsigned64
    pub fn as_u64(&self) -> Option<u64> {
        match &self.data {
            AvpData::Unsigned64(v) => Some(*v),
            AvpData::Raw(b) if b.len() == 8 => Some(b.clone().get_u64()),
            _ => None,
        }
    }

    /// Get data as Integer32 / Enumerated
    pub fn as_i32(&self) -> Option<i32> {
        match &self.data {
            AvpData::Integer32(v) | AvpData::Enumerated(v) => Some(*v),
            AvpData::Raw(b) if b.len() == 4 => Some(b.clone().get_i32()),
            _ => None,
        }
    }

    /// Get data as UTF8String / DiameterIdentity
    pub fn as_utf8_string(&self) -> Option<&str> {
        match &self.data {
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) => Some(s),
            AvpData::Raw(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get data as Address
    pub fn as_address(&self) -> Option<IpAddr> {
        match &self.data {
            AvpData::Address(addr) => Some(*addr),
            AvpData::Raw(b) if b.len() >= 6 => {
                let mut buf = b.clone();
                match buf.get_u16() {
                    1 if buf.remaining() == 4 => {
                        let mut octets = [0u8; 4];
                        buf.copy_to_slice(&mut octets);
                        Some(IpAddr::V4(Ipv4Addr::from(octets)))
                    }
                    2 if buf.remaining() == 16 => {
                        let mut octets = [0u8; 16];
                        buf.copy_to_slice(&mut octets);
                        Some(IpAddr::V6(Ipv6Addr::from(octets)))
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Get the children of a Grouped AVP, decoding raw payload when needed
    pub fn grouped(&self) -> DiameterResult<Vec<Avp>> {
        match &self.data {
            AvpData::Grouped(avps) => Ok(avps.clone()),
            AvpData::Raw(b) => {
                let mut buf = b.clone();
                let mut avps = Vec::new();
                while buf.has_remaining() {
                    avps.push(Avp::decode(&mut buf)?);
                }
                Ok(avps)
            }
            _ => Err(DiameterError::InvalidAvp(format!(
                "AVP {} is not grouped",
                self.code
            ))),
        }
    }
}

impl AvpData {
    /// Get the encoded length of this data (without padding)
    pub fn encoded_len(&self) -> usize {
        match self {
            AvpData::OctetString(b) | AvpData::Raw(b) => b.len(),
            AvpData::Integer32(_) | AvpData::Unsigned32(_) | AvpData::Enumerated(_) => 4,
            AvpData::Unsigned64(_) => 8,
            AvpData::Address(IpAddr::V4(_)) => 6,
            AvpData::Address(IpAddr::V6(_)) => 18,
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) => s.len(),
            AvpData::Grouped(avps) => avps.iter().map(Avp::encoded_len).sum(),
        }
    }

    /// Encode data to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            AvpData::OctetString(b) | AvpData::Raw(b) => buf.put_slice(b),
            AvpData::Integer32(v) | AvpData::Enumerated(v) => buf.put_i32(*v),
            AvpData::Unsigned32(v) => buf.put_u32(*v),
            AvpData::Unsigned64(v) => buf.put_u64(*v),
            AvpData::Address(IpAddr::V4(v4)) => {
                buf.put_u16(1);
                buf.put_slice(&v4.octets());
            }
            AvpData::Address(IpAddr::V6(v6)) => {
                buf.put_u16(2);
                buf.put_slice(&v6.octets());
            }
            AvpData::Utf8String(s) | AvpData::DiameterIdentity(s) => buf.put_slice(s.as_bytes()),
            AvpData::Grouped(avps) => {
                for avp in avps {
                    avp.encode(buf);
                }
            }
        }
    }
}

/// Helper to find an AVP by code in a list
pub fn find_avp(avps: &[Avp], code: u32) -> Option<&Avp> {
    avps.iter().find(|a| a.code == code)
}

/// Helper to find all AVPs with a given code
pub fn find_all_avps(avps: &[Avp], code: u32) -> impl Iterator<Item = &Avp> {
    avps.iter().filter(move |a| a.code == code)
}
