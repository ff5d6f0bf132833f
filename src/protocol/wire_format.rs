//! Wire format encoding and decoding.
//!
//! Implements the 16-byte header format:
//! ```text
//! ┌──────────┬───────┬────────┬────────────┬─────────────┐
//! │ Magic    │ Flags │ Status │ Sequence   │ Body length │
//! │ 2 bytes  │ 1 byte│ 1 byte │ 8 bytes    │ 4 bytes     │
//! │ 0xda 0xbb│       │        │ uint64 BE  │ uint32 BE   │
//! └──────────┴───────┴────────┴────────────┴─────────────┘
//! ```
//!
//! All multi-byte integers are Big Endian. The body length counts payload
//! bytes only; the header itself is excluded.

use crate::error::{DubboError, Result};

/// Header size in bytes (fixed, exactly 16).
pub const HEADER_SIZE: usize = 16;

/// Protocol magic, first two header bytes.
pub const MAGIC: [u8; 2] = [0xda, 0xbb];

/// Flag constants and serialization ids for the flags byte (offset 2).
pub mod flags {
    /// Message is a request (1) rather than a response (0).
    pub const REQUEST: u8 = 0b1000_0000;
    /// Request expects a response.
    pub const TWOWAY: u8 = 0b0100_0000;
    /// Heartbeat event.
    pub const EVENT: u8 = 0b0010_0000;

    /// Low five bits identify the payload serialization scheme.
    pub const SERIALIZATION_MASK: u8 = 0b0001_1111;
    /// Serialization id carried on every request we emit.
    pub const SERIALIZATION_ID: u8 = 0x02;

    /// Flags byte of an ordinary two-way request.
    pub const REQUEST_FLAGS: u8 = REQUEST | TWOWAY | SERIALIZATION_ID;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Response status codes for the status byte (offset 3, 0 on requests).
pub mod status {
    pub const OK: u8 = 20;
    pub const CLIENT_TIMEOUT: u8 = 30;
    pub const SERVER_TIMEOUT: u8 = 31;
    pub const BAD_REQUEST: u8 = 40;
    pub const BAD_RESPONSE: u8 = 50;
    pub const SERVICE_NOT_FOUND: u8 = 60;
    pub const SERVICE_ERROR: u8 = 70;
    pub const SERVER_ERROR: u8 = 80;
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Flags byte (see `flags` module).
    pub flags: u8,
    /// Status byte (0 on requests, see `status` module).
    pub status: u8,
    /// Sequence number correlating a request with its response.
    pub sequence: u64,
    /// Body length in bytes, header excluded.
    pub body_length: u32,
}

impl Header {
    /// Create a request header for the given sequence and body length.
    pub fn request(sequence: u64, body_length: u32) -> Self {
        Self {
            flags: flags::REQUEST_FLAGS,
            status: 0,
            sequence,
            body_length,
        }
    }

    /// Create a response header with the given status.
    pub fn response(status: u8, sequence: u64, body_length: u32) -> Self {
        Self {
            flags: flags::TWOWAY | flags::SERIALIZATION_ID,
            status,
            sequence,
            body_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (16 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.flags;
        buf[3] = self.status;
        buf[4..12].copy_from_slice(&self.sequence.to_be_bytes());
        buf[12..16].copy_from_slice(&self.body_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `None` if buffer is too short. Magic is not checked here;
    /// use [`Header::validate`].
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            flags: buf[2],
            status: buf[3],
            sequence: u64::from_be_bytes(buf[4..12].try_into().expect("8 bytes")),
            body_length: u32::from_be_bytes(buf[12..16].try_into().expect("4 bytes")),
        })
    }

    /// Validate a decoded header against the raw bytes it came from.
    ///
    /// Checks the magic and caps the declared body length.
    pub fn validate(&self, raw: &[u8], max_body_size: u32) -> Result<()> {
        if raw.len() < 2 || raw[0..2] != MAGIC {
            return Err(DubboError::Protocol(format!(
                "bad magic: {:02x?}",
                &raw[..raw.len().min(2)]
            )));
        }
        if self.body_length > max_body_size {
            return Err(DubboError::Protocol(format!(
                "body length {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }
        Ok(())
    }

    /// Check if this is a request frame.
    #[inline]
    pub fn is_request(&self) -> bool {
        flags::has_flag(self.flags, flags::REQUEST)
    }

    /// Check if the response carries a success status.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    /// Check if this is a heartbeat event frame.
    #[inline]
    pub fn is_event(&self) -> bool {
        flags::has_flag(self.flags, flags::EVENT)
    }
}
