//! Frame header: `{version, flags, stream, opcode, length}`, 9 bytes big-endian.

use std::fmt;

use super::buffer::Buffer;
use crate::error::{DriverError, DriverResult};

/// Native protocol version spoken by this driver
pub const PROTOCOL_VERSION: u8 = 0x04;

/// Direction bit set in the version byte of every response
pub const RESPONSE_DIRECTION: u8 = 0x80;

pub const HEADER_SIZE: usize = 9;

/// Upper bound accepted for a frame body (256 MB, the server default)
pub const MAX_FRAME_SIZE: usize = 256 * 1024 * 1024;

/// Header flag bits
pub mod flags {
    pub const COMPRESSION: u8 = 0x01;
    pub const TRACING: u8 = 0x02;
    pub const CUSTOM_PAYLOAD: u8 = 0x04;
    pub const WARNING: u8 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for Opcode {
    type Error = DriverError;

    fn try_from(byte: u8) -> Result<Self, DriverError> {
        Ok(match byte {
            0x00 => Opcode::Error,
            0x01 => Opcode::Startup,
            0x02 => Opcode::Ready,
            0x03 => Opcode::Authenticate,
            0x05 => Opcode::Options,
            0x06 => Opcode::Supported,
            0x07 => Opcode::Query,
            0x08 => Opcode::Result,
            0x09 => Opcode::Prepare,
            0x0A => Opcode::Execute,
            0x0B => Opcode::Register,
            0x0C => Opcode::Event,
            0x0D => Opcode::Batch,
            0x0E => Opcode::AuthChallenge,
            0x0F => Opcode::AuthResponse,
            0x10 => Opcode::AuthSuccess,
            other => {
                return Err(DriverError::Protocol(format!(
                    "unknown opcode 0x{:02x}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Error => "ERROR",
            Opcode::Startup => "STARTUP",
            Opcode::Ready => "READY",
            Opcode::Authenticate => "AUTHENTICATE",
            Opcode::Options => "OPTIONS",
            Opcode::Supported => "SUPPORTED",
            Opcode::Query => "QUERY",
            Opcode::Result => "RESULT",
            Opcode::Prepare => "PREPARE",
            Opcode::Execute => "EXECUTE",
            Opcode::Register => "REGISTER",
            Opcode::Event => "EVENT",
            Opcode::Batch => "BATCH",
            Opcode::AuthChallenge => "AUTH_CHALLENGE",
            Opcode::AuthResponse => "AUTH_RESPONSE",
            Opcode::AuthSuccess => "AUTH_SUCCESS",
        };
        f.write_str(name)
    }
}

/// Frame header as it appears on the wire.
///
/// `opcode` is kept raw so a frame with an unknown opcode can still be
/// skipped by length and reported to its stream's waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub stream_id: i16,
    pub opcode: u8,
    pub length: u32,
}

impl Header {
    pub fn request(stream_id: i16, opcode: Opcode, flags: u8, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags,
            stream_id,
            opcode: opcode as u8,
            length,
        }
    }

    pub fn response(stream_id: i16, opcode: Opcode, flags: u8, length: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION | RESPONSE_DIRECTION,
            flags,
            stream_id,
            opcode: opcode as u8,
            length,
        }
    }

    pub fn write(&self, buf: &mut Buffer) {
        buf.write_byte(self.version);
        buf.write_byte(self.flags);
        buf.write_short(self.stream_id as u16);
        buf.write_byte(self.opcode);
        buf.write_int(self.length as i32);
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0] = self.version;
        out[1] = self.flags;
        out[2..4].copy_from_slice(&self.stream_id.to_be_bytes());
        out[4] = self.opcode;
        out[5..9].copy_from_slice(&self.length.to_be_bytes());
        out
    }

    /// Read the nine header bytes without validating their content
    pub fn read(buf: &mut Buffer) -> DriverResult<Self> {
        let header = Self {
            version: buf.read_byte(),
            flags: buf.read_byte(),
            stream_id: buf.read_short() as i16,
            opcode: buf.read_byte(),
            length: buf.read_int() as u32,
        };
        buf.check()?;
        Ok(header)
    }

    /// Read and validate: the version must be v4 and the length sane
    pub fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let header = Self::read(buf)?;
        header.validate()?;
        Ok(header)
    }

    pub fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            version: bytes[0],
            flags: bytes[1],
            stream_id: i16::from_be_bytes([bytes[2], bytes[3]]),
            opcode: bytes[4],
            length: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
        }
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.version & !RESPONSE_DIRECTION != PROTOCOL_VERSION {
            return Err(DriverError::Protocol(format!(
                "unsupported protocol version 0x{:02x}, expected v{}",
                self.version, PROTOCOL_VERSION
            )));
        }
        if self.length as usize > MAX_FRAME_SIZE {
            return Err(DriverError::Protocol(format!(
                "frame body of {} bytes exceeds limit",
                self.length
            )));
        }
        Ok(())
    }

    pub fn opcode(&self) -> DriverResult<Opcode> {
        Opcode::try_from(self.opcode)
    }

    pub fn is_response(&self) -> bool {
        self.version & RESPONSE_DIRECTION != 0
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}
