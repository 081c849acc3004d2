//! CQL v4 frame codec
//!
//! A frame is a 9-byte [`Header`] followed by `length` body bytes. The body
//! optionally starts with a tracing id, warnings and a custom payload (as
//! announced by the header flags) and may be compressed as a whole.

pub mod buffer;
pub mod compression;
pub mod consistency;
pub mod error;
pub mod header;
pub mod request;
pub mod response;
pub mod types;
pub mod value;

use std::collections::HashMap;

use uuid::Uuid;

pub use buffer::{Buffer, BufferError, Value};
pub use compression::{compressor_by_name, Compressor, Lz4Compressor, SnappyCompressor};
pub use consistency::Consistency;
pub use error::{CqlError, ErrorCode, ErrorDetails, WriteType};
pub use header::{flags, Header, Opcode, HEADER_SIZE, PROTOCOL_VERSION};
pub use request::{
    Batch, BatchQuery, BatchStatement, BatchType, EventType, Execute, QueryParams, Request,
    Startup, Statement,
};
pub use response::{
    ColumnSpec, Event, Prepared, PreparedMetadata, QueryResult, Response, ResultMetadata, Row,
    Rows, SchemaChange, SchemaChangeTarget, StatusChange, TopologyChange,
};
pub use types::{ColumnType, OptionId};
pub use value::{CqlValue, Decimal, Duration, TypeMismatch, ValueError, Varint};

use crate::error::{DriverError, DriverResult};

/// Per-request frame options
#[derive(Debug, Clone, Default)]
pub struct FrameOptions {
    pub tracing: bool,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
}

/// A decoded response frame with its optional body prefixes
#[derive(Debug, Clone)]
pub struct ResponseFrame {
    pub stream_id: i16,
    pub tracing_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub custom_payload: HashMap<String, Vec<u8>>,
    pub response: Response,
}

fn finish_frame(
    header: Header,
    body: Vec<u8>,
    compressor: Option<&dyn Compressor>,
) -> DriverResult<Vec<u8>> {
    let mut header = header;
    let body = match compressor {
        Some(c) => {
            header.flags |= flags::COMPRESSION;
            c.compress(&body)?
        }
        None => body,
    };
    header.length = body.len() as u32;
    let mut out = Vec::with_capacity(HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Serialize a request into a complete frame
pub fn encode_request(
    stream_id: i16,
    request: &Request,
    options: &FrameOptions,
    compressor: Option<&dyn Compressor>,
) -> DriverResult<Vec<u8>> {
    let mut frame_flags = 0;
    let mut body = Buffer::new();
    if options.tracing {
        frame_flags |= flags::TRACING;
    }
    if let Some(payload) = &options.custom_payload {
        frame_flags |= flags::CUSTOM_PAYLOAD;
        body.write_bytes_map(payload);
    }
    request.write(&mut body);
    body.check()?;
    let header = Header::request(stream_id, request.opcode(), frame_flags, 0);
    finish_frame(header, body.into_bytes(), compressor)
}

fn decompress_body(
    header: &Header,
    body: Vec<u8>,
    compressor: Option<&dyn Compressor>,
) -> DriverResult<Buffer> {
    if !header.has_flag(flags::COMPRESSION) {
        return Ok(Buffer::from_bytes(body));
    }
    match compressor {
        Some(c) => Ok(Buffer::from_bytes(c.decompress(&body)?)),
        None => Err(DriverError::Protocol(
            "compressed frame received but no compression was negotiated".to_string(),
        )),
    }
}

/// Decode the body of a response frame whose header was already read
pub fn decode_response(
    header: &Header,
    body: Vec<u8>,
    compressor: Option<&dyn Compressor>,
) -> DriverResult<ResponseFrame> {
    header.validate()?;
    let opcode = header.opcode()?;
    let mut buf = decompress_body(header, body, compressor)?;
    let tracing_id = header
        .has_flag(flags::TRACING)
        .then(|| buf.read_uuid());
    let warnings = if header.has_flag(flags::WARNING) {
        buf.read_string_list()
    } else {
        Vec::new()
    };
    let custom_payload = if header.has_flag(flags::CUSTOM_PAYLOAD) {
        buf.read_bytes_map()
    } else {
        HashMap::new()
    };
    buf.check()?;
    let response = Response::parse(opcode, &mut buf)?;
    Ok(ResponseFrame {
        stream_id: header.stream_id,
        tracing_id,
        warnings,
        custom_payload,
        response,
    })
}

/// Serialize a response into a complete frame; the server side of the codec
pub fn encode_response(
    stream_id: i16,
    response: &Response,
    warnings: &[String],
    compressor: Option<&dyn Compressor>,
) -> DriverResult<Vec<u8>> {
    let mut frame_flags = 0;
    let mut body = Buffer::new();
    if !warnings.is_empty() {
        frame_flags |= flags::WARNING;
        body.write_string_list(warnings);
    }
    response.write(&mut body);
    body.check()?;
    let header = Header::response(stream_id, response.opcode(), frame_flags, 0);
    finish_frame(header, body.into_bytes(), compressor)
}

/// Decode a request frame body; the server side of the codec
pub fn decode_request(
    header: &Header,
    body: Vec<u8>,
    compressor: Option<&dyn Compressor>,
) -> DriverResult<(Request, FrameOptions)> {
    header.validate()?;
    let opcode = header.opcode()?;
    let mut buf = decompress_body(header, body, compressor)?;
    let custom_payload = header
        .has_flag(flags::CUSTOM_PAYLOAD)
        .then(|| buf.read_bytes_map());
    buf.check()?;
    let request = Request::parse(opcode, &mut buf)?;
    let options = FrameOptions {
        tracing: header.has_flag(flags::TRACING),
        custom_payload,
    };
    Ok((request, options))
}
