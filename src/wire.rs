//! Fixed binary headers for unicast and multicast messages.
//!
//! Every unicast message is a 6-byte header followed by `length` payload bytes.
//! Multicast broadcasts carry a 10-byte header that adds the id of the key the
//! payload was sealed with. All multi-byte fields are big endian.

use thiserror::Error;

/// Protocol version every header must carry.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Logical sub-protocol a message belongs to.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Default = 0,
    Authentication = 1,
    PixelData = 2,
    MulticastControl = 3,
    MulticastData = 4,
}

impl Endpoint {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Endpoint::Default),
            1 => Some(Endpoint::Authentication),
            2 => Some(Endpoint::PixelData),
            3 => Some(Endpoint::MulticastControl),
            4 => Some(Endpoint::MulticastData),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Default => "default",
            Endpoint::Authentication => "authentication",
            Endpoint::PixelData => "pixel_data",
            Endpoint::MulticastControl => "multicast_control",
            Endpoint::MulticastData => "multicast_data",
        }
    }
}

/// Errors raised while encoding or decoding headers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("message truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unsupported protocol version {0:#04x}")]
    VersionMismatch(u8),
    #[error("payload of {0} bytes exceeds the 16-bit length field")]
    PayloadTooLarge(usize),
}

impl WireError {
    /// Version mismatches end the connection; everything else is per-message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, WireError::VersionMismatch(_))
    }
}

/// Unicast message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub endpoint: u8,
    pub message_type: u8,
    pub tag: u8,
    pub length: u16,
}

impl Header {
    pub const SIZE: usize = 6;

    pub fn new(endpoint: Endpoint, message_type: u8, tag: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            endpoint: endpoint as u8,
            message_type,
            tag,
            length: 0,
        }
    }

    /// Header for a response: same endpoint and tag, new message type.
    pub fn reply(&self, message_type: u8) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            endpoint: self.endpoint,
            message_type,
            tag: self.tag,
            length: 0,
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        Endpoint::from_u8(self.endpoint)
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let len = self.length.to_be_bytes();
        [
            self.version,
            self.endpoint,
            self.message_type,
            self.tag,
            len[0],
            len[1],
        ]
    }

    /// Parses a header, rejecting short buffers and foreign protocol versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < Self::SIZE {
            return Err(WireError::Truncated {
                needed: Self::SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch(bytes[0]));
        }
        Ok(Self {
            version: bytes[0],
            endpoint: bytes[1],
            message_type: bytes[2],
            tag: bytes[3],
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }
}

/// Multicast message header; the key id names the key the payload is sealed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastHeader {
    pub version: u8,
    pub endpoint: u8,
    pub message_type: u8,
    pub tag: u8,
    pub length: u16,
    pub key_id: u32,
}

impl MulticastHeader {
    pub const SIZE: usize = 10;

    pub fn new(message_type: u8, tag: u8, key_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            endpoint: Endpoint::MulticastData as u8,
            message_type,
            tag,
            length: 0,
            key_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.version;
        out[1] = self.endpoint;
        out[2] = self.message_type;
        out[3] = self.tag;
        out[4..6].copy_from_slice(&self.length.to_be_bytes());
        out[6..10].copy_from_slice(&self.key_id.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < Self::SIZE {
            return Err(WireError::Truncated {
                needed: Self::SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PROTOCOL_VERSION {
            return Err(WireError::VersionMismatch(bytes[0]));
        }
        Ok(Self {
            version: bytes[0],
            endpoint: bytes[1],
            message_type: bytes[2],
            tag: bytes[3],
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            key_id: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        })
    }
}

fn checked_length(payload: &[u8]) -> Result<u16, WireError> {
    u16::try_from(payload.len()).map_err(|_| WireError::PayloadTooLarge(payload.len()))
}

/// Serializes a unicast message, filling in the header's length field.
pub fn encode_message(mut header: Header, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    header.length = checked_length(payload)?;
    let mut out = Vec::with_capacity(Header::SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Splits one datagram into its header and exactly `length` payload bytes.
pub fn decode_message(datagram: &[u8]) -> Result<(Header, &[u8]), WireError> {
    let header = Header::decode(datagram)?;
    let end = Header::SIZE + header.length as usize;
    if datagram.len() < end {
        return Err(WireError::Truncated {
            needed: end,
            actual: datagram.len(),
        });
    }
    Ok((header, &datagram[Header::SIZE..end]))
}

/// Serializes a multicast message, filling in the header's length field.
pub fn encode_multicast(mut header: MulticastHeader, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    header.length = checked_length(payload)?;
    let mut out = Vec::with_capacity(MulticastHeader::SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn decode_multicast(datagram: &[u8]) -> Result<(MulticastHeader, &[u8]), WireError> {
    let header = MulticastHeader::decode(datagram)?;
    let end = MulticastHeader::SIZE + header.length as usize;
    if datagram.len() < end {
        return Err(WireError::Truncated {
            needed: end,
            actual: datagram.len(),
        });
    }
    Ok((header, &datagram[MulticastHeader::SIZE..end]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unicast_header_layout_is_network_order() {
        let header = Header::new(Endpoint::PixelData, 0x05, 0x42);
        let bytes = encode_message(header, &[0xAA; 0x0102]).unwrap();
        assert_eq!(&bytes[..6], &[0x01, 0x02, 0x05, 0x42, 0x01, 0x02]);
        assert_eq!(bytes.len(), 6 + 0x0102);
    }

    #[test]
    fn multicast_header_carries_key_id_after_length() {
        let header = MulticastHeader::new(0x01, 7, 0xDEAD_BEEF);
        let bytes = encode_multicast(header, b"abc").unwrap();
        assert_eq!(
            &bytes[..10],
            &[0x01, 0x04, 0x01, 7, 0x00, 0x03, 0xDE, 0xAD, 0xBE, 0xEF]
        );
        let (decoded, payload) = decode_multicast(&bytes).unwrap();
        assert_eq!(decoded.key_id, 0xDEAD_BEEF);
        assert_eq!(payload, b"abc");
    }

    #[test]
    fn version_mismatch_is_fatal() {
        let err = Header::decode(&[0x02, 0, 0, 0, 0, 0]).unwrap_err();
        assert_eq!(err, WireError::VersionMismatch(0x02));
        assert!(err.is_fatal());
    }

    #[test]
    fn oversized_payload_fails_fast() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        let err = encode_message(Header::new(Endpoint::Default, 1, 0), &payload).unwrap_err();
        assert_eq!(err, WireError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1));
    }

    #[test]
    fn max_payload_is_accepted() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN];
        let bytes = encode_message(Header::new(Endpoint::Default, 1, 0), &payload).unwrap();
        assert_eq!(&bytes[4..6], &[0xFF, 0xFF]);
    }

    #[test]
    fn declared_length_beyond_datagram_is_truncated() {
        let mut bytes = encode_message(Header::new(Endpoint::Default, 1, 0), b"hello").unwrap();
        bytes.truncate(8);
        let err = decode_message(&bytes).unwrap_err();
        assert!(matches!(err, WireError::Truncated { needed: 11, actual: 8 }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let mut bytes = encode_message(Header::new(Endpoint::Default, 1, 0), b"hi").unwrap();
        bytes.extend_from_slice(b"junk");
        let (_, payload) = decode_message(&bytes).unwrap();
        assert_eq!(payload, b"hi");
    }

    #[test]
    fn reply_echoes_endpoint_and_tag() {
        let request = Header::new(Endpoint::MulticastControl, 3, 99);
        let reply = request.reply(4);
        assert_eq!(reply.endpoint(), Some(Endpoint::MulticastControl));
        assert_eq!(reply.tag, 99);
        assert_eq!(reply.message_type, 4);
    }

    #[test]
    fn unknown_endpoint_decodes_but_has_no_variant() {
        let header = Header::decode(&[0x01, 0x09, 0, 0, 0, 0]).unwrap();
        assert_eq!(header.endpoint(), None);
    }
}
