//! Column type descriptors (`[option]` on the wire).

use std::fmt;

use super::buffer::Buffer;
use crate::error::{DriverError, DriverResult};

/// Type identifiers carried by `[option]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OptionId {
    Custom = 0x0000,
    Ascii = 0x0001,
    BigInt = 0x0002,
    Blob = 0x0003,
    Boolean = 0x0004,
    Counter = 0x0005,
    Decimal = 0x0006,
    Double = 0x0007,
    Float = 0x0008,
    Int = 0x0009,
    Timestamp = 0x000B,
    Uuid = 0x000C,
    Varchar = 0x000D,
    Varint = 0x000E,
    Timeuuid = 0x000F,
    Inet = 0x0010,
    Date = 0x0011,
    Time = 0x0012,
    SmallInt = 0x0013,
    TinyInt = 0x0014,
    Duration = 0x0015,
    List = 0x0020,
    Map = 0x0021,
    Set = 0x0022,
    Udt = 0x0030,
    Tuple = 0x0031,
}

impl OptionId {
    pub fn from_u16(id: u16) -> DriverResult<Self> {
        Ok(match id {
            0x0000 => OptionId::Custom,
            0x0001 => OptionId::Ascii,
            0x0002 => OptionId::BigInt,
            0x0003 => OptionId::Blob,
            0x0004 => OptionId::Boolean,
            0x0005 => OptionId::Counter,
            0x0006 => OptionId::Decimal,
            0x0007 => OptionId::Double,
            0x0008 => OptionId::Float,
            0x0009 => OptionId::Int,
            0x000B => OptionId::Timestamp,
            0x000C => OptionId::Uuid,
            0x000D => OptionId::Varchar,
            0x000E => OptionId::Varint,
            0x000F => OptionId::Timeuuid,
            0x0010 => OptionId::Inet,
            0x0011 => OptionId::Date,
            0x0012 => OptionId::Time,
            0x0013 => OptionId::SmallInt,
            0x0014 => OptionId::TinyInt,
            0x0015 => OptionId::Duration,
            0x0020 => OptionId::List,
            0x0021 => OptionId::Map,
            0x0022 => OptionId::Set,
            0x0030 => OptionId::Udt,
            0x0031 => OptionId::Tuple,
            other => {
                return Err(DriverError::Protocol(format!(
                    "unknown type option 0x{:04x}",
                    other
                )))
            }
        })
    }
}

/// Fully resolved column type, recursive for collections and composites
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Decimal,
    Double,
    Float,
    Int,
    Timestamp,
    Uuid,
    Text,
    Varint,
    Timeuuid,
    Inet,
    Date,
    Time,
    SmallInt,
    TinyInt,
    Duration,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    Udt {
        keyspace: String,
        name: String,
        fields: Vec<(String, ColumnType)>,
    },
    Tuple(Vec<ColumnType>),
}

impl ColumnType {
    pub fn id(&self) -> OptionId {
        match self {
            ColumnType::Custom(_) => OptionId::Custom,
            ColumnType::Ascii => OptionId::Ascii,
            ColumnType::BigInt => OptionId::BigInt,
            ColumnType::Blob => OptionId::Blob,
            ColumnType::Boolean => OptionId::Boolean,
            ColumnType::Counter => OptionId::Counter,
            ColumnType::Decimal => OptionId::Decimal,
            ColumnType::Double => OptionId::Double,
            ColumnType::Float => OptionId::Float,
            ColumnType::Int => OptionId::Int,
            ColumnType::Timestamp => OptionId::Timestamp,
            ColumnType::Uuid => OptionId::Uuid,
            ColumnType::Text => OptionId::Varchar,
            ColumnType::Varint => OptionId::Varint,
            ColumnType::Timeuuid => OptionId::Timeuuid,
            ColumnType::Inet => OptionId::Inet,
            ColumnType::Date => OptionId::Date,
            ColumnType::Time => OptionId::Time,
            ColumnType::SmallInt => OptionId::SmallInt,
            ColumnType::TinyInt => OptionId::TinyInt,
            ColumnType::Duration => OptionId::Duration,
            ColumnType::List(_) => OptionId::List,
            ColumnType::Map(_, _) => OptionId::Map,
            ColumnType::Set(_) => OptionId::Set,
            ColumnType::Udt { .. } => OptionId::Udt,
            ColumnType::Tuple(_) => OptionId::Tuple,
        }
    }

    pub fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let raw = buf.read_short();
        buf.check()?;
        let ty = match OptionId::from_u16(raw)? {
            OptionId::Custom => ColumnType::Custom(buf.read_string()),
            OptionId::Ascii => ColumnType::Ascii,
            OptionId::BigInt => ColumnType::BigInt,
            OptionId::Blob => ColumnType::Blob,
            OptionId::Boolean => ColumnType::Boolean,
            OptionId::Counter => ColumnType::Counter,
            OptionId::Decimal => ColumnType::Decimal,
            OptionId::Double => ColumnType::Double,
            OptionId::Float => ColumnType::Float,
            OptionId::Int => ColumnType::Int,
            OptionId::Timestamp => ColumnType::Timestamp,
            OptionId::Uuid => ColumnType::Uuid,
            OptionId::Varchar => ColumnType::Text,
            OptionId::Varint => ColumnType::Varint,
            OptionId::Timeuuid => ColumnType::Timeuuid,
            OptionId::Inet => ColumnType::Inet,
            OptionId::Date => ColumnType::Date,
            OptionId::Time => ColumnType::Time,
            OptionId::SmallInt => ColumnType::SmallInt,
            OptionId::TinyInt => ColumnType::TinyInt,
            OptionId::Duration => ColumnType::Duration,
            OptionId::List => ColumnType::List(Box::new(Self::parse(buf)?)),
            OptionId::Map => {
                let key = Self::parse(buf)?;
                let value = Self::parse(buf)?;
                ColumnType::Map(Box::new(key), Box::new(value))
            }
            OptionId::Set => ColumnType::Set(Box::new(Self::parse(buf)?)),
            OptionId::Udt => {
                let keyspace = buf.read_string();
                let name = buf.read_string();
                let n = buf.read_short();
                buf.check()?;
                let mut fields = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let field = buf.read_string();
                    fields.push((field, Self::parse(buf)?));
                }
                ColumnType::Udt {
                    keyspace,
                    name,
                    fields,
                }
            }
            OptionId::Tuple => {
                let n = buf.read_short();
                buf.check()?;
                let mut elems = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    elems.push(Self::parse(buf)?);
                }
                ColumnType::Tuple(elems)
            }
        };
        buf.check()?;
        Ok(ty)
    }

    pub fn write(&self, buf: &mut Buffer) {
        buf.write_short(self.id() as u16);
        match self {
            ColumnType::Custom(class) => buf.write_string(class),
            ColumnType::List(elem) | ColumnType::Set(elem) => elem.write(buf),
            ColumnType::Map(key, value) => {
                key.write(buf);
                value.write(buf);
            }
            ColumnType::Udt {
                keyspace,
                name,
                fields,
            } => {
                buf.write_string(keyspace);
                buf.write_string(name);
                buf.write_short(fields.len() as u16);
                for (field, ty) in fields {
                    buf.write_string(field);
                    ty.write(buf);
                }
            }
            ColumnType::Tuple(elems) => {
                buf.write_short(elems.len() as u16);
                for ty in elems {
                    ty.write(buf);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Custom(class) => write!(f, "'{}'", class),
            ColumnType::Ascii => f.write_str("ascii"),
            ColumnType::BigInt => f.write_str("bigint"),
            ColumnType::Blob => f.write_str("blob"),
            ColumnType::Boolean => f.write_str("boolean"),
            ColumnType::Counter => f.write_str("counter"),
            ColumnType::Decimal => f.write_str("decimal"),
            ColumnType::Double => f.write_str("double"),
            ColumnType::Float => f.write_str("float"),
            ColumnType::Int => f.write_str("int"),
            ColumnType::Timestamp => f.write_str("timestamp"),
            ColumnType::Uuid => f.write_str("uuid"),
            ColumnType::Text => f.write_str("text"),
            ColumnType::Varint => f.write_str("varint"),
            ColumnType::Timeuuid => f.write_str("timeuuid"),
            ColumnType::Inet => f.write_str("inet"),
            ColumnType::Date => f.write_str("date"),
            ColumnType::Time => f.write_str("time"),
            ColumnType::SmallInt => f.write_str("smallint"),
            ColumnType::TinyInt => f.write_str("tinyint"),
            ColumnType::Duration => f.write_str("duration"),
            ColumnType::List(elem) => write!(f, "list<{}>", elem),
            ColumnType::Map(key, value) => write!(f, "map<{}, {}>", key, value),
            ColumnType::Set(elem) => write!(f, "set<{}>", elem),
            ColumnType::Udt { keyspace, name, .. } => write!(f, "{}.{}", keyspace, name),
            ColumnType::Tuple(elems) => {
                f.write_str("tuple<")?;
                for (i, ty) in elems.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", ty)?;
                }
                f.write_str(">")
            }
        }
    }
}
