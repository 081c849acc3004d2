//! Runtime representation of any CQL value and its `[bytes]` serialization.

use std::net::IpAddr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::buffer::{decode_varint, encode_varint, Buffer, Value};
use super::types::ColumnType;

/// Returned by the `as_*` accessors when the value holds another type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("type mismatch: expected {expected}, found {found}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("invalid length for {ty}: expected {expected} bytes, got {got}")]
    InvalidLength {
        ty: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{0} value is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("ascii value contains non-ascii bytes")]
    InvalidAscii,

    #[error("null item inside a collection")]
    NullCollectionItem,

    #[error("invalid collection size {0}")]
    InvalidSize(i32),

    #[error("duration fields must not mix positive and negative values")]
    InvalidDuration,

    #[error("truncated {0} value")]
    Truncated(&'static str),

    #[error("{count} trailing bytes after {ty} value")]
    TrailingBytes { ty: &'static str, count: usize },
}

/// Arbitrary precision integer as big-endian two's complement bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Varint(Vec<u8>);

impl Varint {
    pub fn from_be_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_be_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `None` when the value does not fit in 64 bits
    pub fn to_i64(&self) -> Option<i64> {
        if self.0.len() > 8 {
            return None;
        }
        let fill = match self.0.first() {
            Some(b) if b & 0x80 != 0 => 0xff,
            _ => 0x00,
        };
        let mut out = [fill; 8];
        out[8 - self.0.len()..].copy_from_slice(&self.0);
        Some(i64::from_be_bytes(out))
    }
}

impl From<i64> for Varint {
    fn from(v: i64) -> Self {
        let bytes = v.to_be_bytes();
        let mut start = 0;
        while start < 7 {
            let (b, next) = (bytes[start], bytes[start + 1]);
            let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        Self(bytes[start..].to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Decimal {
    pub unscaled: Varint,
    pub scale: i32,
}

impl Decimal {
    pub fn new(unscaled: impl Into<Varint>, scale: i32) -> Self {
        Self {
            unscaled: unscaled.into(),
            scale,
        }
    }
}

/// CQL duration. Fields must not mix signs; zero is compatible with both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Duration {
    months: i32,
    days: i32,
    nanoseconds: i64,
}

impl Duration {
    pub fn new(months: i32, days: i32, nanoseconds: i64) -> Result<Self, ValueError> {
        let any_positive = months > 0 || days > 0 || nanoseconds > 0;
        let any_negative = months < 0 || days < 0 || nanoseconds < 0;
        if any_positive && any_negative {
            return Err(ValueError::InvalidDuration);
        }
        Ok(Self {
            months,
            days,
            nanoseconds,
        })
    }

    pub fn months(&self) -> i32 {
        self.months
    }

    pub fn days(&self) -> i32 {
        self.days
    }

    pub fn nanoseconds(&self) -> i64 {
        self.nanoseconds
    }
}

/// Any CQL value. `Empty` is a zero-length value of a type that has no
/// natural empty form (an int sent as zero bytes), distinct from null.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlValue {
    Ascii(String),
    BigInt(i64),
    Blob(Vec<u8>),
    Boolean(bool),
    Counter(i64),
    Decimal(Decimal),
    Double(f64),
    Float(f32),
    Int(i32),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
    Uuid(Uuid),
    Text(String),
    Varint(Varint),
    Timeuuid(Uuid),
    Inet(IpAddr),
    /// Days since the Unix epoch, centered at 2^31
    Date(u32),
    /// Nanoseconds since midnight
    Time(i64),
    SmallInt(i16),
    TinyInt(i8),
    Duration(Duration),
    List(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Set(Vec<CqlValue>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, Option<CqlValue>)>,
    },
    Tuple(Vec<Option<CqlValue>>),
    Custom(Vec<u8>),
    Empty,
}

macro_rules! copy_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<$ty, TypeMismatch> {
            match self {
                CqlValue::$variant(v) => Ok(*v),
                other => Err(other.mismatch(stringify!($variant))),
            }
        }
    };
}

macro_rules! ref_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self) -> Result<&$ty, TypeMismatch> {
            match self {
                CqlValue::$variant(v) => Ok(v),
                other => Err(other.mismatch(stringify!($variant))),
            }
        }
    };
}

impl CqlValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CqlValue::Ascii(_) => "Ascii",
            CqlValue::BigInt(_) => "BigInt",
            CqlValue::Blob(_) => "Blob",
            CqlValue::Boolean(_) => "Boolean",
            CqlValue::Counter(_) => "Counter",
            CqlValue::Decimal(_) => "Decimal",
            CqlValue::Double(_) => "Double",
            CqlValue::Float(_) => "Float",
            CqlValue::Int(_) => "Int",
            CqlValue::Timestamp(_) => "Timestamp",
            CqlValue::Uuid(_) => "Uuid",
            CqlValue::Text(_) => "Text",
            CqlValue::Varint(_) => "Varint",
            CqlValue::Timeuuid(_) => "Timeuuid",
            CqlValue::Inet(_) => "Inet",
            CqlValue::Date(_) => "Date",
            CqlValue::Time(_) => "Time",
            CqlValue::SmallInt(_) => "SmallInt",
            CqlValue::TinyInt(_) => "TinyInt",
            CqlValue::Duration(_) => "Duration",
            CqlValue::List(_) => "List",
            CqlValue::Map(_) => "Map",
            CqlValue::Set(_) => "Set",
            CqlValue::Udt { .. } => "Udt",
            CqlValue::Tuple(_) => "Tuple",
            CqlValue::Custom(_) => "Custom",
            CqlValue::Empty => "Empty",
        }
    }

    fn mismatch(&self, expected: &'static str) -> TypeMismatch {
        TypeMismatch {
            expected,
            found: self.type_name(),
        }
    }

    copy_accessor!(as_bigint, BigInt, i64);
    copy_accessor!(as_boolean, Boolean, bool);
    copy_accessor!(as_counter, Counter, i64);
    copy_accessor!(as_double, Double, f64);
    copy_accessor!(as_float, Float, f32);
    copy_accessor!(as_int, Int, i32);
    copy_accessor!(as_timestamp, Timestamp, i64);
    copy_accessor!(as_uuid, Uuid, Uuid);
    copy_accessor!(as_timeuuid, Timeuuid, Uuid);
    copy_accessor!(as_inet, Inet, IpAddr);
    copy_accessor!(as_date, Date, u32);
    copy_accessor!(as_time, Time, i64);
    copy_accessor!(as_smallint, SmallInt, i16);
    copy_accessor!(as_tinyint, TinyInt, i8);
    copy_accessor!(as_duration, Duration, Duration);
    ref_accessor!(as_blob, Blob, [u8]);
    ref_accessor!(as_decimal, Decimal, Decimal);
    ref_accessor!(as_varint, Varint, Varint);
    ref_accessor!(as_list, List, [CqlValue]);
    ref_accessor!(as_set, Set, [CqlValue]);
    ref_accessor!(as_map, Map, [(CqlValue, CqlValue)]);
    ref_accessor!(as_tuple, Tuple, [Option<CqlValue>]);

    pub fn as_ascii(&self) -> Result<&str, TypeMismatch> {
        match self {
            CqlValue::Ascii(s) => Ok(s),
            other => Err(other.mismatch("Ascii")),
        }
    }

    pub fn as_text(&self) -> Result<&str, TypeMismatch> {
        match self {
            CqlValue::Text(s) => Ok(s),
            other => Err(other.mismatch("Text")),
        }
    }

    pub fn as_udt(&self) -> Result<&[(String, Option<CqlValue>)], TypeMismatch> {
        match self {
            CqlValue::Udt { fields, .. } => Ok(fields),
            other => Err(other.mismatch("Udt")),
        }
    }

    pub fn list(items: impl IntoIterator<Item = impl Into<CqlValue>>) -> Self {
        CqlValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn set(items: impl IntoIterator<Item = impl Into<CqlValue>>) -> Self {
        CqlValue::Set(items.into_iter().map(Into::into).collect())
    }

    // ==================== Encoding ====================

    /// Serialize the value body, without the `[bytes]` length prefix
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        match self {
            CqlValue::Ascii(s) | CqlValue::Text(s) => out.extend_from_slice(s.as_bytes()),
            CqlValue::BigInt(v)
            | CqlValue::Counter(v)
            | CqlValue::Timestamp(v)
            | CqlValue::Time(v) => out.extend_from_slice(&v.to_be_bytes()),
            CqlValue::Blob(b) | CqlValue::Custom(b) => out.extend_from_slice(b),
            CqlValue::Boolean(b) => out.push(*b as u8),
            CqlValue::Decimal(d) => {
                out.extend_from_slice(&d.scale.to_be_bytes());
                out.extend_from_slice(d.unscaled.as_be_bytes());
            }
            CqlValue::Double(v) => out.extend_from_slice(&v.to_be_bytes()),
            CqlValue::Float(v) => out.extend_from_slice(&v.to_be_bytes()),
            CqlValue::Int(v) => out.extend_from_slice(&v.to_be_bytes()),
            CqlValue::Uuid(u) | CqlValue::Timeuuid(u) => out.extend_from_slice(u.as_bytes()),
            CqlValue::Varint(v) => out.extend_from_slice(v.as_be_bytes()),
            CqlValue::Inet(IpAddr::V4(v4)) => out.extend_from_slice(&v4.octets()),
            CqlValue::Inet(IpAddr::V6(v6)) => out.extend_from_slice(&v6.octets()),
            CqlValue::Date(d) => out.extend_from_slice(&d.to_be_bytes()),
            CqlValue::SmallInt(v) => out.extend_from_slice(&v.to_be_bytes()),
            CqlValue::TinyInt(v) => out.extend_from_slice(&v.to_be_bytes()),
            CqlValue::Duration(d) => {
                out.extend_from_slice(&encode_varint(d.months as i64));
                out.extend_from_slice(&encode_varint(d.days as i64));
                out.extend_from_slice(&encode_varint(d.nanoseconds));
            }
            CqlValue::List(items) | CqlValue::Set(items) => {
                out.extend_from_slice(&(items.len() as i32).to_be_bytes());
                for item in items {
                    write_item(out, Some(item));
                }
            }
            CqlValue::Map(entries) => {
                out.extend_from_slice(&(entries.len() as i32).to_be_bytes());
                for (k, v) in entries {
                    write_item(out, Some(k));
                    write_item(out, Some(v));
                }
            }
            CqlValue::Udt { fields, .. } => {
                for (_, field) in fields {
                    write_item(out, field.as_ref());
                }
            }
            CqlValue::Tuple(elems) => {
                for elem in elems {
                    write_item(out, elem.as_ref());
                }
            }
            CqlValue::Empty => {}
        }
    }

    // ==================== Decoding ====================

    /// Decode a `[bytes]` payload of the given type. `None` input is a
    /// null value and decodes to `None`.
    pub fn decode(ty: &ColumnType, bytes: Option<&[u8]>) -> Result<Option<CqlValue>, ValueError> {
        match bytes {
            None => Ok(None),
            Some(b) => Self::decode_non_null(ty, b).map(Some),
        }
    }

    pub fn decode_non_null(ty: &ColumnType, b: &[u8]) -> Result<CqlValue, ValueError> {
        let has_empty_form = matches!(
            ty,
            ColumnType::Ascii | ColumnType::Text | ColumnType::Blob | ColumnType::Custom(_)
        );
        if b.is_empty() && !has_empty_form {
            return Ok(CqlValue::Empty);
        }

        Ok(match ty {
            ColumnType::Custom(_) => CqlValue::Custom(b.to_vec()),
            ColumnType::Ascii => {
                if !b.is_ascii() {
                    return Err(ValueError::InvalidAscii);
                }
                CqlValue::Ascii(utf8(b, "ascii")?)
            }
            ColumnType::Text => CqlValue::Text(utf8(b, "text")?),
            ColumnType::Blob => CqlValue::Blob(b.to_vec()),
            ColumnType::BigInt => CqlValue::BigInt(i64::from_be_bytes(fixed(b, "bigint")?)),
            ColumnType::Counter => CqlValue::Counter(i64::from_be_bytes(fixed(b, "counter")?)),
            ColumnType::Timestamp => {
                CqlValue::Timestamp(i64::from_be_bytes(fixed(b, "timestamp")?))
            }
            ColumnType::Time => CqlValue::Time(i64::from_be_bytes(fixed(b, "time")?)),
            ColumnType::Boolean => CqlValue::Boolean(fixed::<1>(b, "boolean")?[0] != 0),
            ColumnType::Decimal => {
                if b.len() < 4 {
                    return Err(ValueError::Truncated("decimal"));
                }
                let scale = i32::from_be_bytes(fixed(&b[..4], "decimal")?);
                CqlValue::Decimal(Decimal {
                    unscaled: Varint(b[4..].to_vec()),
                    scale,
                })
            }
            ColumnType::Double => CqlValue::Double(f64::from_be_bytes(fixed(b, "double")?)),
            ColumnType::Float => CqlValue::Float(f32::from_be_bytes(fixed(b, "float")?)),
            ColumnType::Int => CqlValue::Int(i32::from_be_bytes(fixed(b, "int")?)),
            ColumnType::Uuid => CqlValue::Uuid(Uuid::from_bytes(fixed(b, "uuid")?)),
            ColumnType::Timeuuid => CqlValue::Timeuuid(Uuid::from_bytes(fixed(b, "timeuuid")?)),
            ColumnType::Varint => CqlValue::Varint(Varint(b.to_vec())),
            ColumnType::Inet => match b.len() {
                4 => CqlValue::Inet(IpAddr::from(fixed::<4>(b, "inet")?)),
                16 => CqlValue::Inet(IpAddr::from(fixed::<16>(b, "inet")?)),
                got => {
                    return Err(ValueError::InvalidLength {
                        ty: "inet",
                        expected: 4,
                        got,
                    })
                }
            },
            ColumnType::Date => CqlValue::Date(u32::from_be_bytes(fixed(b, "date")?)),
            ColumnType::SmallInt => CqlValue::SmallInt(i16::from_be_bytes(fixed(b, "smallint")?)),
            ColumnType::TinyInt => CqlValue::TinyInt(i8::from_be_bytes(fixed(b, "tinyint")?)),
            ColumnType::Duration => CqlValue::Duration(decode_duration(b)?),
            ColumnType::List(elem) => CqlValue::List(decode_items(elem, b, "list")?),
            ColumnType::Set(elem) => CqlValue::Set(decode_items(elem, b, "set")?),
            ColumnType::Map(key_ty, value_ty) => {
                let mut buf = Buffer::from(b);
                let count = read_count(&mut buf, "map")?;
                let mut entries = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let k = read_item(&mut buf, key_ty, "map")?;
                    let v = read_item(&mut buf, value_ty, "map")?;
                    entries.push((k, v));
                }
                finish(&buf, "map")?;
                CqlValue::Map(entries)
            }
            ColumnType::Udt {
                keyspace,
                name,
                fields,
            } => {
                let mut buf = Buffer::from(b);
                let mut values = Vec::with_capacity(fields.len());
                for (field, field_ty) in fields {
                    // Fields added to the type after the value was written are absent
                    let value = if buf.remaining_len() == 0 {
                        None
                    } else {
                        read_optional(&mut buf, field_ty, "udt")?
                    };
                    values.push((field.clone(), value));
                }
                finish(&buf, "udt")?;
                CqlValue::Udt {
                    keyspace: keyspace.clone(),
                    name: name.clone(),
                    fields: values,
                }
            }
            ColumnType::Tuple(elems) => {
                let mut buf = Buffer::from(b);
                let mut values = Vec::with_capacity(elems.len());
                for elem_ty in elems {
                    values.push(read_optional(&mut buf, elem_ty, "tuple")?);
                }
                finish(&buf, "tuple")?;
                CqlValue::Tuple(values)
            }
        })
    }
}

fn write_item(out: &mut Vec<u8>, item: Option<&CqlValue>) {
    match item {
        None => out.extend_from_slice(&(-1i32).to_be_bytes()),
        Some(value) => {
            let start = out.len();
            out.extend_from_slice(&[0; 4]);
            value.serialize(out);
            let len = (out.len() - start - 4) as i32;
            out[start..start + 4].copy_from_slice(&len.to_be_bytes());
        }
    }
}

fn fixed<const N: usize>(b: &[u8], ty: &'static str) -> Result<[u8; N], ValueError> {
    <[u8; N]>::try_from(b).map_err(|_| ValueError::InvalidLength {
        ty,
        expected: N,
        got: b.len(),
    })
}

fn utf8(b: &[u8], ty: &'static str) -> Result<String, ValueError> {
    String::from_utf8(b.to_vec()).map_err(|_| ValueError::InvalidUtf8(ty))
}

fn decode_duration(b: &[u8]) -> Result<Duration, ValueError> {
    let truncated = |_| ValueError::Truncated("duration");
    let (months, n1) = decode_varint(b).map_err(truncated)?;
    let (days, n2) = decode_varint(&b[n1..]).map_err(truncated)?;
    let (nanoseconds, n3) = decode_varint(&b[n1 + n2..]).map_err(truncated)?;
    let consumed = n1 + n2 + n3;
    if consumed != b.len() {
        return Err(ValueError::TrailingBytes {
            ty: "duration",
            count: b.len() - consumed,
        });
    }
    let months = i32::try_from(months).map_err(|_| ValueError::InvalidDuration)?;
    let days = i32::try_from(days).map_err(|_| ValueError::InvalidDuration)?;
    Duration::new(months, days, nanoseconds)
}

fn read_count(buf: &mut Buffer, ty: &'static str) -> Result<usize, ValueError> {
    let n = buf.read_int();
    if buf.error().is_some() {
        return Err(ValueError::Truncated(ty));
    }
    if n < 0 {
        return Err(ValueError::InvalidSize(n));
    }
    Ok(n as usize)
}

fn read_optional(
    buf: &mut Buffer,
    ty: &ColumnType,
    container: &'static str,
) -> Result<Option<CqlValue>, ValueError> {
    let bytes = buf.read_bytes();
    if buf.error().is_some() {
        return Err(ValueError::Truncated(container));
    }
    CqlValue::decode(ty, bytes.as_deref())
}

fn read_item(
    buf: &mut Buffer,
    ty: &ColumnType,
    container: &'static str,
) -> Result<CqlValue, ValueError> {
    read_optional(buf, ty, container)?.ok_or(ValueError::NullCollectionItem)
}

fn decode_items(
    elem: &ColumnType,
    b: &[u8],
    container: &'static str,
) -> Result<Vec<CqlValue>, ValueError> {
    let mut buf = Buffer::from(b);
    let count = read_count(&mut buf, container)?;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(read_item(&mut buf, elem, container)?);
    }
    finish(&buf, container)?;
    Ok(items)
}

fn finish(buf: &Buffer, ty: &'static str) -> Result<(), ValueError> {
    match buf.remaining_len() {
        0 => Ok(()),
        count => Err(ValueError::TrailingBytes { ty, count }),
    }
}

// ==================== Conversions ====================

impl From<bool> for CqlValue {
    fn from(v: bool) -> Self {
        CqlValue::Boolean(v)
    }
}

impl From<i8> for CqlValue {
    fn from(v: i8) -> Self {
        CqlValue::TinyInt(v)
    }
}

impl From<i16> for CqlValue {
    fn from(v: i16) -> Self {
        CqlValue::SmallInt(v)
    }
}

impl From<i32> for CqlValue {
    fn from(v: i32) -> Self {
        CqlValue::Int(v)
    }
}

impl From<i64> for CqlValue {
    fn from(v: i64) -> Self {
        CqlValue::BigInt(v)
    }
}

impl From<f32> for CqlValue {
    fn from(v: f32) -> Self {
        CqlValue::Float(v)
    }
}

impl From<f64> for CqlValue {
    fn from(v: f64) -> Self {
        CqlValue::Double(v)
    }
}

impl From<&str> for CqlValue {
    fn from(v: &str) -> Self {
        CqlValue::Text(v.to_string())
    }
}

impl From<String> for CqlValue {
    fn from(v: String) -> Self {
        CqlValue::Text(v)
    }
}

impl From<Vec<u8>> for CqlValue {
    fn from(v: Vec<u8>) -> Self {
        CqlValue::Blob(v)
    }
}

impl From<Uuid> for CqlValue {
    fn from(v: Uuid) -> Self {
        CqlValue::Uuid(v)
    }
}

impl From<IpAddr> for CqlValue {
    fn from(v: IpAddr) -> Self {
        CqlValue::Inet(v)
    }
}

impl From<Duration> for CqlValue {
    fn from(v: Duration) -> Self {
        CqlValue::Duration(v)
    }
}

impl From<Decimal> for CqlValue {
    fn from(v: Decimal) -> Self {
        CqlValue::Decimal(v)
    }
}

impl From<Varint> for CqlValue {
    fn from(v: Varint) -> Self {
        CqlValue::Varint(v)
    }
}

impl From<DateTime<Utc>> for CqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        CqlValue::Timestamp(v.timestamp_millis())
    }
}

/// Days from 0001-01-01 (CE) to 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

impl From<NaiveDate> for CqlValue {
    fn from(v: NaiveDate) -> Self {
        let days = v.num_days_from_ce() as i64 - UNIX_EPOCH_DAYS_FROM_CE;
        CqlValue::Date((days + (1i64 << 31)) as u32)
    }
}

impl From<CqlValue> for Value {
    fn from(v: CqlValue) -> Self {
        Value::Set(v.encode())
    }
}

impl From<Option<CqlValue>> for Value {
    fn from(v: Option<CqlValue>) -> Self {
        match v {
            Some(v) => Value::Set(v.encode()),
            None => Value::Null,
        }
    }
}
