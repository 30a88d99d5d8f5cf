//! Bridging between wire values (MessagePack) and stored record values.
//!
//! Records are JSON-shaped: string keys, finite numbers, no binary blobs.
//! Ingest normalizes what the wire allows into that shape; egress is the
//! lossless inverse.

use rmpv::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    #[error("binary values are not representable in records")]
    Binary,
    #[error("extension values are not representable in records")]
    Extension,
    #[error("non-finite float is not representable in records")]
    NonFiniteFloat,
    #[error("map key is not a string or integer")]
    BadMapKey,
    #[error("string is not valid UTF-8")]
    BadUtf8,
}

/// Normalize a wire value into a stored record value.
///
/// Integer map keys are stringified; anything a JSON document cannot hold
/// (binary, extensions, NaN) is refused rather than silently mangled.
pub fn to_json(v: &Value) -> Result<serde_json::Value, ValueError> {
    use serde_json::Value as Json;
    Ok(match v {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => i
            .as_i64()
            .map(Json::from)
            .or_else(|| i.as_u64().map(Json::from))
            .expect("msgpack integers fit i64 or u64"),
        Value::F32(f) => {
            serde_json::Number::from_f64(*f as f64)
                .map(Json::Number)
                .ok_or(ValueError::NonFiniteFloat)?
        }
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .ok_or(ValueError::NonFiniteFloat)?,
        Value::String(s) => Json::String(s.as_str().ok_or(ValueError::BadUtf8)?.to_owned()),
        Value::Binary(_) => return Err(ValueError::Binary),
        Value::Array(items) => Json::Array(items.iter().map(to_json).collect::<Result<_, _>>()?),
        Value::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (k, val) in entries {
                let key = map_key(k)?;
                map.insert(key, to_json(val)?);
            }
            Json::Object(map)
        }
        Value::Ext(..) => return Err(ValueError::Extension),
    })
}

/// Encode a stored record value back onto the wire. Total: every value the
/// store holds has a MessagePack form.
pub fn from_json(v: &serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match v {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::from(s.as_str()),
        Json::Array(items) => Value::Array(items.iter().map(from_json).collect()),
        Json::Object(map) => Value::Map(
            map.iter()
                .map(|(k, val)| (Value::from(k.as_str()), from_json(val)))
                .collect(),
        ),
    }
}

/// Coerce a wire value into a record key. Strings pass through; integers
/// become their decimal form. Everything else has no key interpretation.
pub fn key_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => s.as_str().map(str::to_owned),
        Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Some(n.to_string())
            } else {
                i.as_u64().map(|n| n.to_string())
            }
        }
        _ => None,
    }
}

/// Coerce a stored JSON value into a record key, mirroring [`key_string`].
pub fn json_key_string(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_u64().map(|u| u.to_string())
            }
        }
        _ => None,
    }
}

fn map_key(v: &Value) -> Result<String, ValueError> {
    match v {
        Value::String(s) => s.as_str().map(str::to_owned).ok_or(ValueError::BadUtf8),
        Value::Integer(_) => key_string(v).ok_or(ValueError::BadMapKey),
        _ => Err(ValueError::BadMapKey),
    }
}
