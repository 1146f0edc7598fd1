//! The message data model and its canonical encodings.
//!
//! A message maps canonicalized keys to values. Values are sub-messages, raw
//! scalars, ordered lists, device references, or paths. Messages are
//! immutable in spirit: every "mutation" in the resolver produces a new
//! message.
//!
//! Two encodings live here:
//!
//! - the **commit encoding**, a deterministic length-prefixed byte form fed
//!   to BLAKE3 to produce content ids (keys iterate sorted because the
//!   backing map is a `BTreeMap`);
//! - the **blob codec**, JSON via `serde_json`, used for messages persisted
//!   in the content store (reference-call targets, device manifests).
//!
//! The hashpath witness rides out-of-band: it never participates in the
//! commit encoding, so stripping it is structural rather than a map edit.

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use thiserror::Error;

use crate::device::Device;
use crate::hashpath::{ContentId, Hashpath, DIGEST_SIZE};
use crate::key::{to_key, Key};
use crate::path::Path;

/// Reserved key: selects the handler module.
pub const DEVICE_KEY: &str = "device";
/// Reserved key: the residual hierarchical selector.
pub const PATH_KEY: &str = "path";
/// Reserved key: commitment metadata carrying signer identities.
pub const COMMITMENTS_KEY: &str = "commitments";
/// Recognized by the cache plane for write negotiation.
pub const CACHE_CONTROL_KEY: &str = "cache-control";

const TAG_MAP: u8 = 0x01;
const TAG_BYTES: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_BOOL: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_DEVICE: u8 = 0x07;
const TAG_PATH: u8 = 0x08;

/// Errors from the blob codec.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// Inline devices hold closures and have no blob rendering.
    #[error("inline devices cannot be serialized")]
    InlineDevice,
    /// The JSON shape does not decode to a message.
    #[error("bad blob shape: {0}")]
    BadShape(String),
    /// Underlying JSON failure.
    #[error("json: {0}")]
    Json(String),
}

/// A message value.
#[derive(Clone)]
pub enum Value {
    /// A nested message.
    Map(Message),
    /// A byte string (also the carrier for text).
    Bytes(Vec<u8>),
    /// A signed integer.
    Int(i64),
    /// A float.
    Float(f64),
    /// A boolean.
    Bool(bool),
    /// An ordered sequence.
    List(Vec<Value>),
    /// A device reference.
    Device(Device),
    /// A path term.
    Path(Path),
}

impl Value {
    /// A byte-string value from text.
    #[must_use]
    pub fn text(text: &str) -> Self {
        Self::Bytes(text.as_bytes().to_vec())
    }

    /// The UTF-8 view of a byte-string value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// The nested message, when this is a map.
    #[must_use]
    pub const fn as_map(&self) -> Option<&Message> {
        match self {
            Self::Map(msg) => Some(msg),
            _ => None,
        }
    }

    /// Consumes the value into a message, when it is a map.
    #[must_use]
    pub fn into_map(self) -> Option<Message> {
        match self {
            Self::Map(msg) => Some(msg),
            _ => None,
        }
    }

    /// The integer, when this is an int.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// True for every shape except a nested message.
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        !matches!(self, Self::Map(_))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Map(msg) => {
                out.push(TAG_MAP);
                encode_u32(msg.entries.len() as u32, out);
                for (key, value) in &msg.entries {
                    encode_bytes(&crate::key::key_to_binary(key), out);
                    value.encode_into(out);
                }
            }
            Self::Bytes(bytes) => {
                out.push(TAG_BYTES);
                encode_bytes(bytes, out);
            }
            Self::Int(n) => {
                out.push(TAG_INT);
                out.extend_from_slice(&n.to_be_bytes());
            }
            Self::Float(x) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&x.to_bits().to_be_bytes());
            }
            Self::Bool(b) => {
                out.push(TAG_BOOL);
                out.push(u8::from(*b));
            }
            Self::List(items) => {
                out.push(TAG_LIST);
                encode_u32(items.len() as u32, out);
                for item in items {
                    item.encode_into(out);
                }
            }
            Self::Device(device) => {
                out.push(TAG_DEVICE);
                encode_bytes(device.commitment_label().as_bytes(), out);
            }
            Self::Path(path) => {
                out.push(TAG_PATH);
                encode_u32(path.len() as u32, out);
                for key in path.keys() {
                    encode_bytes(&crate::key::key_to_binary(key), out);
                }
            }
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, CodecError> {
        use serde_json::json;
        Ok(match self {
            Self::Map(msg) => msg.to_json()?,
            Self::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) if !text.starts_with('%') => serde_json::Value::String(text.to_string()),
                _ => json!({ "%b64": URL_SAFE_NO_PAD.encode(bytes) }),
            },
            Self::Int(n) => json!(n),
            Self::Float(x) => json!(x),
            Self::Bool(b) => json!(b),
            Self::List(items) => {
                let encoded: Result<Vec<_>, _> = items.iter().map(Value::to_json).collect();
                serde_json::Value::Array(encoded?)
            }
            Self::Device(device) => match device {
                Device::Inline(_) => return Err(CodecError::InlineDevice),
                Device::Preloaded(name) => json!({ "%device": name.render() }),
                Device::Remote(id) => json!({ "%device": id.to_string() }),
            },
            Self::Path(path) => json!({
                "%path": path.keys().iter().map(Key::render).collect::<Vec<_>>()
            }),
        })
    }

    fn from_json(value: &serde_json::Value) -> Result<Self, CodecError> {
        match value {
            serde_json::Value::String(text) => Ok(Self::text(text)),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map_or_else(
                || {
                    n.as_f64()
                        .map(Self::Float)
                        .ok_or_else(|| CodecError::BadShape("unrepresentable number".to_string()))
                },
                |i| Ok(Self::Int(i)),
            ),
            serde_json::Value::Array(items) => {
                let decoded: Result<Vec<_>, _> = items.iter().map(Self::from_json).collect();
                Ok(Self::List(decoded?))
            }
            serde_json::Value::Object(fields) => {
                if let Some(encoded) = fields.get("%b64").and_then(serde_json::Value::as_str) {
                    let bytes = URL_SAFE_NO_PAD
                        .decode(encoded)
                        .map_err(|_| CodecError::BadShape("bad %b64 payload".to_string()))?;
                    return Ok(Self::Bytes(bytes));
                }
                if let Some(reference) = fields.get("%device").and_then(serde_json::Value::as_str) {
                    let device = ContentId::parse(reference).map_or_else(
                        |_| Device::Preloaded(to_key(reference)),
                        Device::Remote,
                    );
                    return Ok(Self::Device(device));
                }
                if let Some(segments) = fields.get("%path").and_then(serde_json::Value::as_array) {
                    let mut keys = Vec::with_capacity(segments.len());
                    for segment in segments {
                        let text = segment.as_str().ok_or_else(|| {
                            CodecError::BadShape("non-string path segment".to_string())
                        })?;
                        keys.push(to_key(text));
                    }
                    return Ok(Self::Path(Path::from_keys(keys)));
                }
                Ok(Self::Map(Message::from_json_object(fields)?))
            }
            serde_json::Value::Null => {
                Err(CodecError::BadShape("null has no value rendering".to_string()))
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Device(a), Self::Device(b)) => a.commitment_label() == b.commitment_label(),
            (Self::Path(a), Self::Path(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Map(msg) => write!(f, "{msg:?}"),
            Self::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => write!(f, "{text:?}"),
                Err(_) => write!(f, "0x{}", hex::encode(bytes)),
            },
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::List(items) => f.debug_list().entries(items).finish(),
            Self::Device(device) => write!(f, "device:{}", device.commitment_label()),
            Self::Path(path) => write!(f, "path:{}", path.render()),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<Message> for Value {
    fn from(msg: Message) -> Self {
        Self::Map(msg)
    }
}

impl From<Device> for Value {
    fn from(device: Device) -> Self {
        Self::Device(device)
    }
}

impl From<Path> for Value {
    fn from(path: Path) -> Self {
        Self::Path(path)
    }
}

/// A mapping from canonicalized keys to values, plus an optional hashpath
/// witness carried out-of-band.
#[derive(Clone, Default)]
pub struct Message {
    entries: BTreeMap<Key, Value>,
    hashpath: Option<Hashpath>,
}

impl Message {
    /// An empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consuming builder: adds an entry.
    #[must_use]
    pub fn with(mut self, key: impl Into<Key>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Inserts an entry.
    pub fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Looks up a textual key (canonicalized first).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&to_key(key))
    }

    /// Looks up a canonical key.
    #[must_use]
    pub fn get_key(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Removes an entry, returning it.
    pub fn remove_key(&mut self, key: &Key) -> Option<Value> {
        self.entries.remove(key)
    }

    /// True when the key is present.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the message has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in canonical key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }

    /// The keys, in canonical order.
    #[must_use]
    pub fn keys(&self) -> Vec<Key> {
        self.entries.keys().cloned().collect()
    }

    /// The declared device reference, when present.
    #[must_use]
    pub fn device(&self) -> Option<Device> {
        match self.get(DEVICE_KEY) {
            Some(Value::Device(device)) => Some(device.clone()),
            Some(Value::Bytes(bytes)) => std::str::from_utf8(bytes)
                .ok()
                .map(|text| match ContentId::parse(text) {
                    Ok(id) => Device::Remote(id),
                    Err(_) => Device::Preloaded(to_key(text)),
                }),
            _ => None,
        }
    }

    /// A copy with the device binding replaced.
    #[must_use]
    pub fn with_device(&self, device: Device) -> Self {
        self.clone().with(DEVICE_KEY, Value::Device(device))
    }

    /// A copy with the device binding removed.
    #[must_use]
    pub fn without_device(&self) -> Self {
        let mut copy = self.clone();
        copy.remove_key(&to_key(DEVICE_KEY));
        copy
    }

    /// The message path, coerced to a [`Path`] when the raw value allows it.
    #[must_use]
    pub fn path(&self) -> Option<Path> {
        self.get(PATH_KEY)
            .and_then(|value| crate::path::term_to_path(value).ok())
    }

    /// A copy with the path replaced.
    #[must_use]
    pub fn with_path(&self, path: Path) -> Self {
        self.clone().with(PATH_KEY, Value::Path(path))
    }

    /// A copy with the path removed.
    #[must_use]
    pub fn without_path(&self) -> Self {
        let mut copy = self.clone();
        copy.remove_key(&to_key(PATH_KEY));
        copy
    }

    /// The hashpath witness.
    #[must_use]
    pub const fn hashpath(&self) -> Option<&Hashpath> {
        self.hashpath.as_ref()
    }

    /// Attaches a hashpath witness.
    pub fn set_hashpath(&mut self, hashpath: Hashpath) {
        self.hashpath = Some(hashpath);
    }

    /// Drops the hashpath witness.
    pub fn clear_hashpath(&mut self) {
        self.hashpath = None;
    }

    /// The canonical commit encoding (witness excluded).
    #[must_use]
    pub fn encode_canonical(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        Value::Map(self.clone()).encode_into(&mut out);
        out
    }

    /// The content id of this message.
    #[must_use]
    pub fn commit(&self) -> ContentId {
        ContentId::commit(&self.encode_canonical())
    }

    /// Signer identities attached via the commitments entry.
    #[must_use]
    pub fn signers(&self) -> Vec<String> {
        let Some(Value::Map(commitments)) = self.get(COMMITMENTS_KEY) else {
            return Vec::new();
        };
        let mut signers = Vec::new();
        for (_, commitment) in commitments.iter() {
            if let Value::Map(body) = commitment {
                if let Some(committer) = body.get("committer").and_then(Value::as_text) {
                    signers.push(committer.to_string());
                }
            }
        }
        signers
    }

    /// Renders the message as a JSON value for the blob codec.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InlineDevice`] when an inline device is reachable
    /// from the message (closures have no blob rendering).
    pub fn to_json(&self) -> Result<serde_json::Value, CodecError> {
        let mut object = serde_json::Map::new();
        for (key, value) in &self.entries {
            object.insert(key.render(), value.to_json()?);
        }
        if let Some(witness) = &self.hashpath {
            object.insert(
                "%hashpath".to_string(),
                serde_json::json!({
                    "digest": URL_SAFE_NO_PAD.encode(witness.digest()),
                    "links": witness.links(),
                }),
            );
        }
        Ok(serde_json::Value::Object(object))
    }

    /// Decodes a message from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BadShape`] when the JSON is not an object or a
    /// field fails to decode.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, CodecError> {
        match value {
            serde_json::Value::Object(fields) => Self::from_json_object(fields),
            _ => Err(CodecError::BadShape("message blob must be an object".to_string())),
        }
    }

    fn from_json_object(
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, CodecError> {
        let mut msg = Self::new();
        for (name, value) in fields {
            if name == "%hashpath" {
                let digest_text = value
                    .get("digest")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| CodecError::BadShape("bad %hashpath digest".to_string()))?;
                let links = value
                    .get("links")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| CodecError::BadShape("bad %hashpath links".to_string()))?;
                let decoded = URL_SAFE_NO_PAD
                    .decode(digest_text)
                    .map_err(|_| CodecError::BadShape("bad %hashpath digest".to_string()))?;
                let digest: [u8; DIGEST_SIZE] = decoded
                    .try_into()
                    .map_err(|_| CodecError::BadShape("bad %hashpath digest".to_string()))?;
                msg.set_hashpath(Hashpath::from_parts(digest, links));
                continue;
            }
            msg.insert(to_key(name), Value::from_json(value)?);
        }
        Ok(msg)
    }

    /// Serializes the message for the content store.
    ///
    /// # Errors
    ///
    /// Propagates codec failures; see [`Message::to_json`].
    pub fn to_blob(&self) -> Result<Vec<u8>, CodecError> {
        let json = self.to_json()?;
        serde_json::to_vec(&json).map_err(|e| CodecError::Json(e.to_string()))
    }

    /// Deserializes a message from store bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when the bytes are not a JSON message blob.
    pub fn from_blob(bytes: &[u8]) -> Result<Self, CodecError> {
        let json: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CodecError::Json(e.to_string()))?;
        Self::from_json(&json)
    }
}

/// Equality compares entries only. The witness is provenance, not content:
/// two messages with the same entries are the same value regardless of how
/// they were produced.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.entries {
            map.entry(&key.render(), value);
        }
        map.finish()
    }
}

fn encode_u32(n: u32, out: &mut Vec<u8>) {
    out.extend_from_slice(&n.to_be_bytes());
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    encode_u32(bytes.len() as u32, out);
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_is_key_order_independent() {
        let a = Message::new().with("x", 1i64).with("y", 2i64);
        let b = Message::new().with("y", 2i64).with("x", 1i64);
        assert_eq!(a.commit(), b.commit());
    }

    #[test]
    fn commit_is_case_insensitive_over_keys() {
        let a = Message::new().with("Balance", 10i64);
        let b = Message::new().with("balance", 10i64);
        assert_eq!(a.commit(), b.commit());
    }

    #[test]
    fn commit_excludes_the_witness() {
        let plain = Message::new().with("a", 1i64);
        let mut witnessed = plain.clone();
        witnessed.set_hashpath(Hashpath::seed(plain.commit()));
        assert_eq!(plain.commit(), witnessed.commit());
    }

    #[test]
    fn distinct_content_distinct_commit() {
        let a = Message::new().with("a", 1i64);
        let b = Message::new().with("a", 2i64);
        assert_ne!(a.commit(), b.commit());
    }

    #[test]
    fn list_and_nested_map_commit_deterministically() {
        let build = || {
            Message::new()
                .with("items", Value::List(vec![Value::Int(1), Value::text("two")]))
                .with("inner", Message::new().with("k", true))
        };
        assert_eq!(build().commit(), build().commit());
    }

    #[test]
    fn blob_round_trip_preserves_entries_and_witness() {
        let mut msg = Message::new()
            .with("name", "converge")
            .with("count", 7i64)
            .with("flags", Value::List(vec![Value::Bool(true), Value::Bool(false)]))
            .with("nested", Message::new().with("deep", "value"))
            .with("path", Value::Path(Path::parse("a/b")));
        msg.set_hashpath(Hashpath::seed(msg.commit()));

        let blob = msg.to_blob().expect("encode");
        let decoded = Message::from_blob(&blob).expect("decode");
        assert_eq!(decoded, msg);
        assert_eq!(decoded.hashpath(), msg.hashpath());
    }

    #[test]
    fn blob_round_trip_preserves_non_utf8_bytes() {
        let msg = Message::new().with("raw", Value::Bytes(vec![0, 159, 146, 150]));
        let decoded = Message::from_blob(&msg.to_blob().expect("encode")).expect("decode");
        assert_eq!(decoded.get("raw"), msg.get("raw"));
    }

    #[test]
    fn blob_refuses_inline_devices() {
        let device = Device::Inline(std::sync::Arc::new(crate::device::InlineDevice::new()));
        let msg = Message::new().with(DEVICE_KEY, Value::Device(device));
        assert_eq!(msg.to_blob(), Err(CodecError::InlineDevice));
    }

    #[test]
    fn device_accessor_reads_textual_references() {
        let msg = Message::new().with(DEVICE_KEY, "ledger");
        assert!(matches!(msg.device(), Some(Device::Preloaded(_))));
    }

    #[test]
    fn signers_come_from_commitments() {
        let commitment = Message::new().with("committer", "signer-a");
        let commitments = Message::new().with("c1", commitment);
        let msg = Message::new().with(COMMITMENTS_KEY, commitments);
        assert_eq!(msg.signers(), vec!["signer-a".to_string()]);
    }

    #[test]
    fn equality_ignores_witness() {
        let plain = Message::new().with("a", 1i64);
        let mut witnessed = plain.clone();
        witnessed.set_hashpath(Hashpath::seed(plain.commit()));
        assert_eq!(plain, witnessed);
    }
}
