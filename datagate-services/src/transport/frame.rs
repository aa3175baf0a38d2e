//! Wire framing.
//!
//! Every frame is length-prefixed and carries a fixed header followed by an opaque payload:
//!
//! ```text
//! u32  frame length (bytes following this field)
//! u8   wire version
//! u64  correlation key
//! u8   flags: bit0 exception, bit1 handshake, bit2 cancel
//! u16  service name length, service name (UTF-8)
//! u16  method name length, method name (UTF-8)
//! u16  argument count
//! ...  payload
//! ```
//!
//! All integers are big-endian. A handshake frame uses the same layout with empty names and a
//! [`Handshake`] payload.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use datagate_core::crypto::PUBLIC_KEY_LEN;

pub const WIRE_VERSION: u8 = 1;
pub const PROTOCOL_VERSION: &str = "1";

const LEN_PREFIX: usize = 4;
// version + key + flags + 2 name lengths + argc
const MIN_HEADER: usize = 1 + 8 + 1 + 2 + 2 + 2;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the limit of {1}")]
    TooLarge(usize, usize),
    #[error("frame truncated")]
    Truncated,
    #[error("unsupported wire version {0}")]
    Version(u8),
    #[error("unknown flag bits {0:#04x}")]
    Flags(u8),
    #[error("name is not valid utf-8")]
    Utf8,
    #[error("name longer than {} bytes", u16::MAX)]
    NameTooLong,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const EXCEPTION: Flags = Flags(0b001);
    pub const HANDSHAKE: Flags = Flags(0b010);
    pub const CANCEL: Flags = Flags(0b100);
    const ALL: u8 = 0b111;

    pub const fn empty() -> Self {
        Flags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Result<Self, FrameError> {
        if bits & !Self::ALL != 0 {
            return Err(FrameError::Flags(bits));
        }
        Ok(Flags(bits))
    }

    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn with(self, other: Flags) -> Self {
        Flags(self.0 | other.0)
    }
}

/// One request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub correlation_key: u64,
    pub flags: Flags,
    pub service: String,
    pub method: String,
    pub arg_count: u16,
    pub payload: Bytes,
}

impl Envelope {
    pub fn request(
        correlation_key: u64,
        service: &str,
        method: &str,
        arg_count: u16,
        payload: Bytes,
    ) -> Self {
        Self {
            correlation_key,
            flags: Flags::empty(),
            service: service.to_string(),
            method: method.to_string(),
            arg_count,
            payload,
        }
    }

    pub fn response(correlation_key: u64, exception: bool, payload: Bytes) -> Self {
        let flags = if exception {
            Flags::EXCEPTION
        } else {
            Flags::empty()
        };
        Self {
            correlation_key,
            flags,
            service: String::new(),
            method: String::new(),
            arg_count: 0,
            payload,
        }
    }

    pub fn cancel(correlation_key: u64) -> Self {
        Self {
            flags: Flags::CANCEL,
            ..Self::response(correlation_key, false, Bytes::new())
        }
    }

    pub fn is_exception(&self) -> bool {
        self.flags.contains(Flags::EXCEPTION)
    }

    pub fn is_handshake(&self) -> bool {
        self.flags.contains(Flags::HANDSHAKE)
    }

    pub fn is_cancel(&self) -> bool {
        self.flags.contains(Flags::CANCEL)
    }

    /// The encoded header, which the (possibly encrypted) payload is bound to.
    pub fn aad(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.header_len());
        self.put_header(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encode including the length prefix.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let body_len = self.header_len() + self.payload.len();
        let mut buf = BytesMut::with_capacity(LEN_PREFIX + body_len);
        buf.put_u32(body_len as u32);
        self.put_header(&mut buf)?;
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    fn header_len(&self) -> usize {
        MIN_HEADER + self.service.len() + self.method.len()
    }

    fn put_header(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let service = self.service.as_bytes();
        let method = self.method.as_bytes();
        if service.len() > u16::MAX as usize || method.len() > u16::MAX as usize {
            return Err(FrameError::NameTooLong);
        }
        buf.put_u8(WIRE_VERSION);
        buf.put_u64(self.correlation_key);
        buf.put_u8(self.flags.bits());
        buf.put_u16(service.len() as u16);
        buf.put_slice(service);
        buf.put_u16(method.len() as u16);
        buf.put_slice(method);
        buf.put_u16(self.arg_count);
        Ok(())
    }

    /// Decode a frame body, i.e. everything after the length prefix.
    pub fn decode(mut body: Bytes) -> Result<Self, FrameError> {
        if body.len() < MIN_HEADER {
            return Err(FrameError::Truncated);
        }
        let version = body.get_u8();
        if version != WIRE_VERSION {
            return Err(FrameError::Version(version));
        }
        let correlation_key = body.get_u64();
        let flags = Flags::from_bits(body.get_u8())?;
        let service = take_name(&mut body)?;
        let method = take_name(&mut body)?;
        if body.remaining() < 2 {
            return Err(FrameError::Truncated);
        }
        let arg_count = body.get_u16();
        Ok(Self {
            correlation_key,
            flags,
            service,
            method,
            arg_count,
            payload: body,
        })
    }
}

fn take_name(body: &mut Bytes) -> Result<String, FrameError> {
    if body.remaining() < 2 {
        return Err(FrameError::Truncated);
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(FrameError::Truncated);
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::Utf8)
}

/// Exchanged once in each direction when a connection starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: String,
    pub public_key: Option<[u8; PUBLIC_KEY_LEN]>,
}

impl Handshake {
    pub fn new(public_key: Option<[u8; PUBLIC_KEY_LEN]>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            public_key,
        }
    }

    pub fn into_envelope(self) -> Envelope {
        let mut payload = BytesMut::with_capacity(2 + self.version.len() + 1 + PUBLIC_KEY_LEN);
        payload.put_u16(self.version.len() as u16);
        payload.put_slice(self.version.as_bytes());
        match self.public_key {
            Some(key) => {
                payload.put_u8(1);
                payload.put_slice(&key);
            }
            None => payload.put_u8(0),
        }
        Envelope {
            flags: Flags::HANDSHAKE,
            ..Envelope::response(0, false, payload.freeze())
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, FrameError> {
        let mut payload = envelope.payload.clone();
        let version = take_name(&mut payload)?;
        if payload.remaining() < 1 {
            return Err(FrameError::Truncated);
        }
        let public_key = match payload.get_u8() {
            0 => None,
            _ => {
                if payload.remaining() < PUBLIC_KEY_LEN {
                    return Err(FrameError::Truncated);
                }
                let mut key = [0u8; PUBLIC_KEY_LEN];
                payload.copy_to_slice(&mut key);
                Some(key)
            }
        };
        Ok(Self {
            version,
            public_key,
        })
    }
}
