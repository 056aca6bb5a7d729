//! htmx WebSocket envelope codec.
//!
//! Inbound wire format (one JSON object per text frame):
//!
//! ```text
//! {
//!   "HEADERS": { "HX-Request": "true", "HX-Trigger": "<element id>", ... },
//!   "<form field>": <value>,
//!   ...
//! }
//! ```
//!
//! The `HEADERS` object is transport metadata; every sibling key is payload.
//! Outbound frames carry no envelope: handlers write raw text (usually an
//! HTML fragment for an out-of-band swap).

use crate::error::{HxError, HxResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Display;

/// Top-level key holding the htmx request headers.
pub const METADATA_KEY: &str = "HEADERS";

/// The htmx request headers carried inside [`METADATA_KEY`].
///
/// Missing fields (and explicit `null`s, which htmx emits for elements
/// without a name or target) decode as empty strings. Unknown fields are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(rename = "HX-Request", default, deserialize_with = "null_as_empty")]
    pub request: String,
    #[serde(rename = "HX-Trigger", default, deserialize_with = "null_as_empty")]
    pub trigger: String,
    #[serde(rename = "HX-Trigger-Name", default)]
    pub trigger_name: Option<String>,
    #[serde(rename = "HX-Target", default, deserialize_with = "null_as_empty")]
    pub target: String,
    #[serde(rename = "HX-Current-URL", default, deserialize_with = "null_as_empty")]
    pub current_url: String,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// One decoded inbound message: metadata plus the free-form payload bag.
///
/// Built fresh for every frame and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    headers: Headers,
    payload: Map<String, Value>,
    raw: Vec<u8>,
}

impl Envelope {
    /// Assemble an envelope directly (e.g. in handler tests). The raw frame is
    /// the equivalent wire encoding.
    pub fn new(headers: Headers, payload: Map<String, Value>) -> Self {
        let mut wire = payload.clone();
        if let Ok(h) = serde_json::to_value(&headers) {
            wire.insert(METADATA_KEY.to_string(), h);
        }
        let raw = serde_json::to_vec(&Value::Object(wire)).unwrap_or_default();
        Self {
            headers,
            payload,
            raw,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// `HX-Request`.
    pub fn request_flag(&self) -> &str {
        &self.headers.request
    }

    /// `HX-Trigger`: the id of the element that fired, used for routing.
    pub fn trigger(&self) -> &str {
        &self.headers.trigger
    }

    /// `HX-Trigger-Name`.
    pub fn trigger_name(&self) -> Option<&str> {
        self.headers.trigger_name.as_deref()
    }

    /// `HX-Target`.
    pub fn target(&self) -> &str {
        &self.headers.target
    }

    /// `HX-Current-URL`.
    pub fn current_url(&self) -> &str {
        &self.headers.current_url
    }

    /// Every top-level key of the frame except [`METADATA_KEY`], values kept typed.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Look up a single payload value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// The payload with every value coerced to its printable form.
    pub fn payload_strings(&self) -> BTreeMap<String, String> {
        self.payload
            .iter()
            .map(|(k, v)| (k.clone(), value_to_string(v)))
            .collect()
    }

    /// Deserialize the payload bag into an application type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> HxResult<T> {
        serde_json::from_value(Value::Object(self.payload.clone()))
            .map_err(|e| HxError::Malformed(format!("payload does not match target type: {e}")))
    }

    /// The undecoded frame this envelope was parsed from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Decode one inbound frame into an [`Envelope`].
///
/// Fails with [`HxError::Malformed`] if the frame is not a JSON object, if
/// [`METADATA_KEY`] holds anything other than an object (or `null`), or if a
/// header field has the wrong type.
pub fn decode(raw: &[u8]) -> HxResult<Envelope> {
    let mut bag: Map<String, Value> = serde_json::from_slice(raw)
        .map_err(|e| HxError::Malformed(format!("frame is not a JSON object: {e}")))?;

    let headers = match bag.remove(METADATA_KEY) {
        None | Some(Value::Null) => Headers::default(),
        Some(meta @ Value::Object(_)) => serde_json::from_value(meta)
            .map_err(|e| HxError::Malformed(format!("invalid {METADATA_KEY}: {e}")))?,
        Some(other) => {
            return Err(HxError::Malformed(format!(
                "{METADATA_KEY} must be an object, got {}",
                json_kind(&other)
            )));
        }
    };

    Ok(Envelope {
        headers,
        payload: bag,
        raw: raw.to_vec(),
    })
}

/// Decode a text frame.
pub fn decode_text(text: &str) -> HxResult<Envelope> {
    decode(text.as_bytes())
}

/// Format a handler reply for a text frame. No escaping is applied.
pub fn encode_text<T: Display + ?Sized>(value: &T) -> String {
    value.to_string()
}

/// Serialize a handler reply as compact JSON for a text frame.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> HxResult<String> {
    Ok(serde_json::to_string(value)?)
}

/// Printable form of a payload value.
///
/// Strings pass through, integers print in base 10, floats in their shortest
/// round-trip decimal form (`1.0` prints as `1`), booleans and `null` as their
/// JSON literals, arrays and objects as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else if let Some(f) = n.as_f64() {
                format!("{f}")
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
