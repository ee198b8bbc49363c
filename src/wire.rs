//! The wire-safe value grammar: structured values minus procedure
//! references and cycles, plus the two tagged escape forms
//! (`Handle`, `BackRef`) described in spec §3.
//!
//! [`WireValue`] is a Rust-native enum — escape forms are first-class
//! variants here, not overloaded maps. The `{"$": ...}` convention only
//! exists at the boundary with the actual bytes on the wire, realized by
//! [`encode`]/[`decode`] against `rmpv::Value` (MessagePack).

use indexmap::IndexMap;

/// One step of a path from the message root to a previously visited node:
/// a mapping key, or a sequence index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathComponent {
    Key(String),
    Index(usize),
}

pub type Path = Vec<PathComponent>;

#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<WireValue>),
    Map(IndexMap<String, WireValue>),
    /// `{"$": <key>}` — a procedure handle registered by the sender.
    Handle(u32),
    /// `{"$": [<path>...]}` — a back-reference to a node already visited
    /// earlier in this same message.
    BackRef(Path),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    #[error("malformed escape form: {0}")]
    Malformed(String),
    #[error("non-string map key on the wire")]
    NonStringKey,
    #[error("msgpack decode error: {0}")]
    Decode(String),
}

const ESCAPE_KEY: &str = "$";

/// Convert a [`WireValue`] tree into an `rmpv::Value`, applying the `"$"`
/// escape forms and the leading-`"$"` key doubling from spec §3.
pub fn to_rmpv(value: &WireValue) -> rmpv::Value {
    match value {
        WireValue::Null => rmpv::Value::Nil,
        WireValue::Bool(b) => rmpv::Value::Boolean(*b),
        WireValue::Int(i) => rmpv::Value::Integer((*i).into()),
        WireValue::Float(x) => rmpv::Value::F64(*x),
        WireValue::Str(s) => rmpv::Value::String(s.clone().into()),
        WireValue::Bytes(b) => rmpv::Value::Binary(b.clone()),
        WireValue::Array(items) => rmpv::Value::Array(items.iter().map(to_rmpv).collect()),
        WireValue::Map(entries) => rmpv::Value::Map(
            entries
                .iter()
                .map(|(k, v)| (rmpv::Value::String(escape_key(k).into()), to_rmpv(v)))
                .collect(),
        ),
        WireValue::Handle(key) => single_key_map(ESCAPE_KEY, rmpv::Value::Integer((*key).into())),
        WireValue::BackRef(path) => single_key_map(
            ESCAPE_KEY,
            rmpv::Value::Array(path.iter().map(path_component_to_rmpv).collect()),
        ),
    }
}

fn path_component_to_rmpv(c: &PathComponent) -> rmpv::Value {
    match c {
        PathComponent::Key(k) => rmpv::Value::String(k.clone().into()),
        PathComponent::Index(i) => rmpv::Value::Integer((*i as u64).into()),
    }
}

fn single_key_map(key: &str, value: rmpv::Value) -> rmpv::Value {
    rmpv::Value::Map(vec![(rmpv::Value::String(key.into()), value)])
}

fn escape_key(key: &str) -> String {
    if key.starts_with('$') {
        format!("${key}")
    } else {
        key.to_string()
    }
}

fn unescape_key(key: &str) -> String {
    key.strip_prefix('$').map(str::to_string).unwrap_or_else(|| key.to_string())
}

/// Convert an `rmpv::Value` back into a [`WireValue`], recognizing the
/// escape forms and un-doubling escaped keys.
pub fn from_rmpv(value: &rmpv::Value) -> Result<WireValue, WireError> {
    match value {
        rmpv::Value::Nil => Ok(WireValue::Null),
        rmpv::Value::Boolean(b) => Ok(WireValue::Bool(*b)),
        rmpv::Value::Integer(i) => i
            .as_i64()
            .map(WireValue::Int)
            .ok_or_else(|| WireError::Malformed("integer out of i64 range".into())),
        rmpv::Value::F32(x) => Ok(WireValue::Float(*x as f64)),
        rmpv::Value::F64(x) => Ok(WireValue::Float(*x)),
        rmpv::Value::String(s) => Ok(WireValue::Str(
            s.as_str()
                .ok_or_else(|| WireError::Malformed("invalid utf-8 string".into()))?
                .to_string(),
        )),
        rmpv::Value::Binary(b) => Ok(WireValue::Bytes(b.clone())),
        rmpv::Value::Array(items) => {
            Ok(WireValue::Array(items.iter().map(from_rmpv).collect::<Result<_, _>>()?))
        }
        rmpv::Value::Map(entries) => from_rmpv_map(entries),
        other => Err(WireError::Malformed(format!("unsupported msgpack type: {other:?}"))),
    }
}

fn from_rmpv_map(entries: &[(rmpv::Value, rmpv::Value)]) -> Result<WireValue, WireError> {
    if let [(rmpv::Value::String(k), v)] = entries {
        if k.as_str() == Some(ESCAPE_KEY) {
            return decode_escape(v);
        }
    }

    let mut map = IndexMap::with_capacity(entries.len());
    for (k, v) in entries {
        let key = k.as_str().ok_or(WireError::NonStringKey)?;
        map.insert(unescape_key(key), from_rmpv(v)?);
    }
    Ok(WireValue::Map(map))
}

fn decode_escape(value: &rmpv::Value) -> Result<WireValue, WireError> {
    match value {
        rmpv::Value::Integer(i) => i
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .map(WireValue::Handle)
            .ok_or_else(|| WireError::Malformed("handle key out of u32 range".into())),
        rmpv::Value::Array(items) => {
            let path = items
                .iter()
                .map(path_component_from_rmpv)
                .collect::<Result<_, _>>()?;
            Ok(WireValue::BackRef(path))
        }
        other => Err(WireError::Malformed(format!("invalid escape value: {other:?}"))),
    }
}

fn path_component_from_rmpv(v: &rmpv::Value) -> Result<PathComponent, WireError> {
    match v {
        rmpv::Value::String(s) => Ok(PathComponent::Key(
            s.as_str()
                .ok_or_else(|| WireError::Malformed("invalid utf-8 path key".into()))?
                .to_string(),
        )),
        rmpv::Value::Integer(i) => i
            .as_u64()
            .map(|v| PathComponent::Index(v as usize))
            .ok_or_else(|| WireError::Malformed("path index out of range".into())),
        other => Err(WireError::Malformed(format!("invalid path component: {other:?}"))),
    }
}

/// Serialize a [`WireValue`] to bytes using the MessagePack structured-value
/// serializer.
pub fn encode(value: &WireValue) -> Result<Vec<u8>, WireError> {
    let rmpv_value = to_rmpv(value);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &rmpv_value)
        .map_err(|e| WireError::Decode(e.to_string()))?;
    Ok(buf)
}

/// Deserialize a [`WireValue`] from bytes.
pub fn decode(bytes: &[u8]) -> Result<WireValue, WireError> {
    let mut cursor = std::io::Cursor::new(bytes);
    let rmpv_value =
        rmpv::decode::read_value(&mut cursor).map_err(|e| WireError::Decode(e.to_string()))?;
    from_rmpv(&rmpv_value)
}
