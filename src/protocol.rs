//! Wire codec for the sensor protocol.
//!
//! Messages are single text lines in a URL-query-like format:
//! - Request: `?type=METHOD&param1=value1&param2=value2`
//! - Response: `?status=1/0&param1=value1&error=message`
//!
//! The format carries no schema, so field order is significant for
//! readability when inspecting traffic; both directions use insertion-order
//! maps. Values are percent-decoded on receipt. Output is not re-encoded:
//! the emulator never produces values containing `&`, `=`, or `%`.

use indexmap::IndexMap;
use std::fmt;

/// Line emitted for a response with no fields.
const EMPTY_RESPONSE: &str = "?status=0&error=No parameters";

/// A decoded request: field name to raw text value, in encounter order.
pub type Request = IndexMap<String, String>;

/// A response under construction: field name to typed value, in insertion order.
pub type Response = IndexMap<String, Value>;

/// A response field value.
///
/// The wire format is untyped text; this keeps numeric fields numeric until
/// encode time so the stringify rule (floats at two decimals) is applied in
/// exactly one place.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Wire form of the value: integers and text verbatim, floats with
    /// exactly two decimals.
    pub fn render(&self) -> String {
        match self {
            Value::Int(n) => n.to_string(),
            Value::Float(x) => format!("{x:.2}"),
            Value::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CodecError {
    /// The line held content but no parseable `key=value` field.
    Malformed(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Malformed(line) => write!(f, "No parseable fields in message: {line}"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Decode one request line into its fields.
///
/// Strips an optional leading `?`, splits on `&`, and splits each segment at
/// the first `=`. Segments without `=` are dropped. Values are
/// percent-decoded. An empty line decodes to an empty request; a non-empty
/// line yielding no fields is malformed.
pub fn decode(line: &str) -> Result<Request, CodecError> {
    let trimmed = line.trim();
    let body = trimmed.strip_prefix('?').unwrap_or(trimmed);

    let mut fields = Request::new();
    if body.is_empty() {
        return Ok(fields);
    }

    for segment in body.split('&') {
        if let Some((key, value)) = segment.split_once('=') {
            fields.insert(key.trim().to_string(), percent_decode(value.trim()));
        }
    }

    if fields.is_empty() {
        return Err(CodecError::Malformed(trimmed.to_string()));
    }
    Ok(fields)
}

/// Encode a response map into one wire line.
///
/// Fields are joined in iteration order. An empty response renders as the
/// fixed no-parameters failure line.
pub fn encode(response: &Response) -> String {
    if response.is_empty() {
        return EMPTY_RESPONSE.to_string();
    }

    let mut line = String::with_capacity(response.len() * 16);
    line.push('?');
    for (i, (key, value)) in response.iter().enumerate() {
        if i > 0 {
            line.push('&');
        }
        line.push_str(key);
        line.push('=');
        line.push_str(&value.render());
    }
    line
}

/// Decode `%XX` escapes. Invalid escapes pass through literally.
fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = hex_pair(bytes[i + 1], bytes[i + 2]) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let hi = (hi as char).to_digit(16)?;
    let lo = (lo as char).to_digit(16)?;
    Some((hi as u8) << 4 | lo as u8)
}
