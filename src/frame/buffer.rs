//! Cursor-based byte buffer with big-endian protocol primitives.
//!
//! Every read and write goes through a sticky error slot: the first failure is
//! recorded and every later call becomes a no-op returning a zero value. A
//! message parser can chain reads freely and check [`Buffer::error`] (or
//! [`Buffer::check`]) once, after the last read it intends to trust.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use uuid::Uuid;

/// Errors recorded by a [`Buffer`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("short read: needed {needed} bytes, {remaining} remaining")]
    ShortRead { needed: usize, remaining: usize },

    #[error("invalid length {0}")]
    InvalidLength(i64),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid inet address length {0}")]
    InvalidInetLength(u8),

    #[error("{kind} too long: {len} bytes")]
    TooLong { kind: &'static str, len: usize },
}

/// A value slot in a request body: `[bytes]` with the v4 null/unset markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Unset,
    Set(Vec<u8>),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Set(bytes) => Some(bytes),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
    error: Option<BufferError>,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pos: 0,
            error: None,
        }
    }

    /// Wrap received bytes for reading
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            error: None,
        }
    }

    /// Everything written so far, regardless of the read cursor or error state
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Unread tail
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    pub fn remaining_len(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn error(&self) -> Option<&BufferError> {
        self.error.as_ref()
    }

    pub fn check(&self) -> Result<(), BufferError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Record an error unless one is already set
    pub fn fail(&mut self, err: BufferError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn take(&mut self, n: usize) -> Option<&[u8]> {
        if self.error.is_some() {
            return None;
        }
        let remaining = self.remaining_len();
        if remaining < n {
            self.fail(BufferError::ShortRead {
                needed: n,
                remaining,
            });
            return None;
        }
        let start = self.pos;
        self.pos += n;
        Some(&self.data[start..start + n])
    }

    fn take_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Some(out)
    }

    // ==================== Writes ====================

    pub fn write_raw(&mut self, bytes: &[u8]) {
        if self.error.is_none() {
            self.data.extend_from_slice(bytes);
        }
    }

    pub fn write_byte(&mut self, v: u8) {
        self.write_raw(&[v]);
    }

    pub fn write_short(&mut self, v: u16) {
        self.write_raw(&v.to_be_bytes());
    }

    pub fn write_int(&mut self, v: i32) {
        self.write_raw(&v.to_be_bytes());
    }

    pub fn write_long(&mut self, v: i64) {
        self.write_raw(&v.to_be_bytes());
    }

    /// `[string]`: u16 length then UTF-8 bytes
    pub fn write_string(&mut self, s: &str) {
        if s.len() > u16::MAX as usize {
            self.fail(BufferError::TooLong {
                kind: "string",
                len: s.len(),
            });
            return;
        }
        self.write_short(s.len() as u16);
        self.write_raw(s.as_bytes());
    }

    /// `[long string]`: i32 length then UTF-8 bytes
    pub fn write_long_string(&mut self, s: &str) {
        if s.len() > i32::MAX as usize {
            self.fail(BufferError::TooLong {
                kind: "long string",
                len: s.len(),
            });
            return;
        }
        self.write_int(s.len() as i32);
        self.write_raw(s.as_bytes());
    }

    /// `[bytes]`: i32 length then payload, `None` encoded as length -1
    pub fn write_bytes(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            None => self.write_int(-1),
            Some(b) if b.len() > i32::MAX as usize => self.fail(BufferError::TooLong {
                kind: "bytes",
                len: b.len(),
            }),
            Some(b) => {
                self.write_int(b.len() as i32);
                self.write_raw(b);
            }
        }
    }

    /// `[value]`: like `[bytes]` with -2 marking an unset value
    pub fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.write_int(-1),
            Value::Unset => self.write_int(-2),
            Value::Set(bytes) => self.write_bytes(Some(bytes)),
        }
    }

    /// `[short bytes]`: u16 length then payload
    pub fn write_short_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() > u16::MAX as usize {
            self.fail(BufferError::TooLong {
                kind: "short bytes",
                len: bytes.len(),
            });
            return;
        }
        self.write_short(bytes.len() as u16);
        self.write_raw(bytes);
    }

    pub fn write_string_list<S: AsRef<str>>(&mut self, list: &[S]) {
        if list.len() > u16::MAX as usize {
            self.fail(BufferError::TooLong {
                kind: "string list",
                len: list.len(),
            });
            return;
        }
        self.write_short(list.len() as u16);
        for s in list {
            self.write_string(s.as_ref());
        }
    }

    pub fn write_string_map<I, K, V>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        I::IntoIter: ExactSizeIterator,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let entries = entries.into_iter();
        self.write_short(entries.len() as u16);
        for (k, v) in entries {
            self.write_string(k.as_ref());
            self.write_string(v.as_ref());
        }
    }

    pub fn write_string_multimap<I, K, L, S>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (K, L)>,
        I::IntoIter: ExactSizeIterator,
        K: AsRef<str>,
        L: IntoIterator<Item = S>,
        L::IntoIter: ExactSizeIterator,
        S: AsRef<str>,
    {
        let entries = entries.into_iter();
        self.write_short(entries.len() as u16);
        for (k, values) in entries {
            self.write_string(k.as_ref());
            let values = values.into_iter();
            self.write_short(values.len() as u16);
            for v in values {
                self.write_string(v.as_ref());
            }
        }
    }

    /// `[bytes map]`: u16 count of `[string]` keys with `[bytes]` values
    pub fn write_bytes_map(&mut self, entries: &HashMap<String, Vec<u8>>) {
        self.write_short(entries.len() as u16);
        for (k, v) in entries {
            self.write_string(k);
            self.write_bytes(Some(v));
        }
    }

    /// `[inetaddr]`: one length byte then 4 or 16 address bytes
    pub fn write_inet_addr(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(v4) => {
                self.write_byte(4);
                self.write_raw(&v4.octets());
            }
            IpAddr::V6(v6) => {
                self.write_byte(16);
                self.write_raw(&v6.octets());
            }
        }
    }

    /// `[inet]`: `[inetaddr]` followed by an i32 port
    pub fn write_inet(&mut self, addr: SocketAddr) {
        self.write_inet_addr(addr.ip());
        self.write_int(addr.port() as i32);
    }

    pub fn write_uuid(&mut self, uuid: &Uuid) {
        self.write_raw(uuid.as_bytes());
    }

    /// Zig-zag encoded unsigned vint
    pub fn write_varint(&mut self, v: i64) {
        if self.error.is_none() {
            write_unsigned_vint(&mut self.data, zigzag_encode(v));
        }
    }

    // ==================== Reads ====================

    pub fn read_raw(&mut self, n: usize) -> Vec<u8> {
        self.take(n).map(<[u8]>::to_vec).unwrap_or_default()
    }

    pub fn read_byte(&mut self) -> u8 {
        self.take(1).map(|b| b[0]).unwrap_or(0)
    }

    pub fn read_short(&mut self) -> u16 {
        self.take_array().map(u16::from_be_bytes).unwrap_or(0)
    }

    pub fn read_int(&mut self) -> i32 {
        self.take_array().map(i32::from_be_bytes).unwrap_or(0)
    }

    pub fn read_long(&mut self) -> i64 {
        self.take_array().map(i64::from_be_bytes).unwrap_or(0)
    }

    fn read_utf8(&mut self, len: usize) -> String {
        let bytes = match self.take(len) {
            Some(b) => b.to_vec(),
            None => return String::new(),
        };
        match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => {
                self.fail(BufferError::InvalidUtf8);
                String::new()
            }
        }
    }

    pub fn read_string(&mut self) -> String {
        let len = self.read_short() as usize;
        self.read_utf8(len)
    }

    pub fn read_long_string(&mut self) -> String {
        let len = self.read_int();
        if len < 0 {
            self.fail(BufferError::InvalidLength(len as i64));
            return String::new();
        }
        self.read_utf8(len as usize)
    }

    /// `[bytes]`; any negative length decodes to `None`
    pub fn read_bytes(&mut self) -> Option<Vec<u8>> {
        let len = self.read_int();
        if len < 0 || self.error.is_some() {
            return None;
        }
        self.take(len as usize).map(<[u8]>::to_vec)
    }

    pub fn read_value(&mut self) -> Value {
        let len = self.read_int();
        if self.error.is_some() {
            return Value::Null;
        }
        match len {
            -1 => Value::Null,
            -2 => Value::Unset,
            n if n < 0 => {
                self.fail(BufferError::InvalidLength(n as i64));
                Value::Null
            }
            n => Value::Set(self.read_raw(n as usize)),
        }
    }

    pub fn read_short_bytes(&mut self) -> Vec<u8> {
        let len = self.read_short() as usize;
        self.read_raw(len)
    }

    pub fn read_string_list(&mut self) -> Vec<String> {
        let n = self.read_short();
        let mut out = Vec::with_capacity(n as usize);
        for _ in 0..n {
            if self.error.is_some() {
                break;
            }
            out.push(self.read_string());
        }
        out
    }

    pub fn read_string_map(&mut self) -> HashMap<String, String> {
        let n = self.read_short();
        let mut out = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            if self.error.is_some() {
                break;
            }
            let k = self.read_string();
            let v = self.read_string();
            out.insert(k, v);
        }
        out
    }

    pub fn read_string_multimap(&mut self) -> HashMap<String, Vec<String>> {
        let n = self.read_short();
        let mut out = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            if self.error.is_some() {
                break;
            }
            let k = self.read_string();
            let v = self.read_string_list();
            out.insert(k, v);
        }
        out
    }

    pub fn read_bytes_map(&mut self) -> HashMap<String, Vec<u8>> {
        let n = self.read_short();
        let mut out = HashMap::with_capacity(n as usize);
        for _ in 0..n {
            if self.error.is_some() {
                break;
            }
            let k = self.read_string();
            let v = self.read_bytes().unwrap_or_default();
            out.insert(k, v);
        }
        out
    }

    pub fn read_inet_addr(&mut self) -> IpAddr {
        let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        match self.read_byte() {
            4 => self
                .take_array::<4>()
                .map(|b| IpAddr::V4(Ipv4Addr::from(b)))
                .unwrap_or(unspecified),
            16 => self
                .take_array::<16>()
                .map(|b| IpAddr::V6(Ipv6Addr::from(b)))
                .unwrap_or(unspecified),
            n => {
                self.fail(BufferError::InvalidInetLength(n));
                unspecified
            }
        }
    }

    pub fn read_inet(&mut self) -> SocketAddr {
        let ip = self.read_inet_addr();
        let port = self.read_int();
        SocketAddr::new(ip, port as u16)
    }

    pub fn read_uuid(&mut self) -> Uuid {
        self.take_array::<16>()
            .map(Uuid::from_bytes)
            .unwrap_or_else(Uuid::nil)
    }

    pub fn read_varint(&mut self) -> i64 {
        if self.error.is_some() {
            return 0;
        }
        match decode_unsigned_vint(self.remaining()) {
            Ok((v, consumed)) => {
                self.pos += consumed;
                zigzag_decode(v)
            }
            Err(err) => {
                self.fail(err);
                0
            }
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from_bytes(data.to_vec())
    }
}

// ==================== Var-int ====================

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

fn unsigned_vint_size(value: u64) -> usize {
    let magnitude = (value | 1).leading_zeros() as usize;
    (639 - magnitude * 9) >> 6
}

fn write_unsigned_vint(out: &mut Vec<u8>, value: u64) {
    let size = unsigned_vint_size(value);
    match size {
        1 => out.push(value as u8),
        9 => {
            out.push(0xff);
            out.extend_from_slice(&value.to_be_bytes());
        }
        _ => {
            let start = out.len();
            out.extend_from_slice(&value.to_be_bytes()[8 - size..]);
            out[start] |= !(0xffu8 >> (size - 1));
        }
    }
}

fn decode_unsigned_vint(data: &[u8]) -> Result<(u64, usize), BufferError> {
    let first = *data.first().ok_or(BufferError::ShortRead {
        needed: 1,
        remaining: 0,
    })?;
    let extra = first.leading_ones() as usize;
    if extra == 0 {
        return Ok((first as u64, 1));
    }
    if data.len() < 1 + extra {
        return Err(BufferError::ShortRead {
            needed: 1 + extra,
            remaining: data.len(),
        });
    }
    let mut value = (first as u64) & (0xffu64 >> extra);
    for b in &data[1..=extra] {
        value = (value << 8) | *b as u64;
    }
    Ok((value, 1 + extra))
}

/// Encode a signed value as a zig-zag vint
pub fn encode_varint(v: i64) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    write_unsigned_vint(&mut out, zigzag_encode(v));
    out
}

/// Decode a zig-zag vint, returning the value and the number of bytes consumed
pub fn decode_varint(data: &[u8]) -> Result<(i64, usize), BufferError> {
    decode_unsigned_vint(data).map(|(v, n)| (zigzag_decode(v), n))
}
