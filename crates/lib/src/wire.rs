//! MessagePack-RPC framing.
//!
//! Requests are `[0, msgid, method, params]`; responses are
//! `[1, msgid, error, result]` with exactly one of `error`/`result`
//! non-nil. A fifth request element carries mesh metadata and is only
//! ever honored on the TLS transport, and only when configured.

use crate::error::ErrorKind;
use rmpv::Value;
use std::io::{self, Cursor};
use thiserror::Error;

pub const REQUEST_TAG: u64 = 0;
pub const RESPONSE_TAG: u64 = 1;

/// A decoded request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub msgid: u64,
    pub method: String,
    pub params: Vec<Value>,
    /// The fifth frame element, when present. Transport policy decides
    /// whether it is honored, answered with an error, or fatal.
    pub metadata: Option<Value>,
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is not a msgpack array")]
    NotArray,
    #[error("frame has {0} elements, expected 4")]
    BadArity(usize),
    #[error("frame tag is not a request")]
    BadTag,
    #[error("frame msgid is not an unsigned integer")]
    BadMsgId,
    #[error("frame method is not a string")]
    BadMethod,
    #[error("frame params is not an array")]
    BadParams,
    #[error("undecodable msgpack: {0}")]
    Malformed(String),
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            // Structure errors are answerable; byte-level garbage is not.
            FrameError::Malformed(_) => ErrorKind::ProtocolError,
            _ => ErrorKind::InvalidRequest,
        }
    }
}

/// Try to decode one request frame from the front of `bytes`.
///
/// Returns `Ok(None)` when the buffer holds only a prefix of a frame,
/// `Ok(Some((request, consumed)))` on success, and `Err` when the bytes
/// can never form a valid frame.
pub fn decode_request(bytes: &[u8]) -> Result<Option<(Request, usize)>, FrameError> {
    let mut cursor = Cursor::new(bytes);
    let value = match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => value,
        Err(e) if is_incomplete(&e) => return Ok(None),
        Err(e) => return Err(FrameError::Malformed(e.to_string())),
    };
    let consumed = cursor.position() as usize;
    parse_request(value).map(|req| Some((req, consumed)))
}

fn is_incomplete(e: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error::*;
    match e {
        InvalidMarkerRead(io) | InvalidDataRead(io) => io.kind() == io::ErrorKind::UnexpectedEof,
        _ => false,
    }
}

fn parse_request(value: Value) -> Result<Request, FrameError> {
    let Value::Array(mut elems) = value else {
        return Err(FrameError::NotArray);
    };
    if elems.len() != 4 && elems.len() != 5 {
        return Err(FrameError::BadArity(elems.len()));
    }

    let metadata = if elems.len() == 5 { elems.pop() } else { None };
    let params = elems.pop().expect("arity checked");
    let method = elems.pop().expect("arity checked");
    let msgid = elems.pop().expect("arity checked");
    let tag = elems.pop().expect("arity checked");

    match tag.as_u64() {
        Some(REQUEST_TAG) => {}
        _ => return Err(FrameError::BadTag),
    }
    let msgid = msgid.as_u64().ok_or(FrameError::BadMsgId)?;
    let method = match method {
        Value::String(s) => s.into_str().ok_or(FrameError::BadMethod)?,
        _ => return Err(FrameError::BadMethod),
    };
    let Value::Array(params) = params else {
        return Err(FrameError::BadParams);
    };

    Ok(Request {
        msgid,
        method,
        params,
        metadata,
    })
}

/// Encode a success response.
pub fn encode_result(msgid: u64, result: Value) -> Vec<u8> {
    encode_response_frame(msgid, Value::Nil, result)
}

/// Encode an error response carrying a wire error name.
pub fn encode_error(msgid: u64, kind: ErrorKind) -> Vec<u8> {
    encode_response_frame(msgid, Value::from(kind.as_str()), Value::Nil)
}

fn encode_response_frame(msgid: u64, error: Value, result: Value) -> Vec<u8> {
    let frame = Value::Array(vec![Value::from(RESPONSE_TAG), Value::from(msgid), error, result]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &frame).expect("writes to Vec are infallible");
    buf
}

/// Encode a request frame. The daemon itself only decodes requests; this
/// is the client half, used by mesh peers and tests.
pub fn encode_request(req: &Request) -> Vec<u8> {
    let mut elems = vec![
        Value::from(REQUEST_TAG),
        Value::from(req.msgid),
        Value::from(req.method.as_str()),
        Value::Array(req.params.clone()),
    ];
    if let Some(meta) = &req.metadata {
        elems.push(meta.clone());
    }
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &Value::Array(elems)).expect("writes to Vec are infallible");
    buf
}

/// Decode a response frame, returning `(msgid, Err(error_name) | Ok(result))`.
/// Client-side counterpart of [`encode_result`]/[`encode_error`].
pub fn decode_response(bytes: &[u8]) -> Result<Option<(u64, Result<Value, String>, usize)>, FrameError> {
    let mut cursor = Cursor::new(bytes);
    let value = match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => value,
        Err(e) if is_incomplete(&e) => return Ok(None),
        Err(e) => return Err(FrameError::Malformed(e.to_string())),
    };
    let consumed = cursor.position() as usize;

    let Value::Array(mut elems) = value else {
        return Err(FrameError::NotArray);
    };
    if elems.len() != 4 {
        return Err(FrameError::BadArity(elems.len()));
    }
    let result = elems.pop().expect("arity checked");
    let error = elems.pop().expect("arity checked");
    let msgid = elems.pop().expect("arity checked").as_u64().ok_or(FrameError::BadMsgId)?;
    match elems.pop().expect("arity checked").as_u64() {
        Some(RESPONSE_TAG) => {}
        _ => return Err(FrameError::BadTag),
    }

    let outcome = match error {
        Value::Nil => Ok(result),
        Value::String(s) => Err(s.into_str().ok_or(FrameError::BadMethod)?),
        _ => return Err(FrameError::BadTag),
    };
    Ok(Some((msgid, outcome, consumed)))
}
