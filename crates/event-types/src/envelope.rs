//! CloudEvents v1.0 envelope and JSON structured-mode codec.
//!
//! The envelope carries the CloudEvents context attributes (`id`, `source`,
//! `specversion`, `type`, `datacontenttype`, `time`), any extension
//! attributes, and a JSON `data` payload. Envelopes are immutable once built;
//! producers assemble them through [`EventBuilder`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{DecodeError, EncodeError};

/// The only CloudEvents spec version this pipeline produces and accepts.
pub const SPEC_VERSION: &str = "1.0";

/// Media type for a structured-mode CloudEvents JSON record, carried as a
/// transport header next to the payload.
pub const CONTENT_TYPE_CLOUDEVENTS_JSON: &str = "application/cloudevents+json";

/// A CloudEvents v1.0 event in JSON structured mode.
///
/// Field names follow the CloudEvents JSON format, so the struct serializes
/// directly to the wire representation. Extension attributes are flattened
/// into the top-level object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event identifier.
    pub id: String,
    /// URI reference identifying the event origin.
    pub source: String,
    /// CloudEvents spec version, always [`SPEC_VERSION`] for produced events.
    pub specversion: String,
    /// Reverse-domain event type, e.g. `io.cloudstream.producer`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Media type of `data`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datacontenttype: Option<String>,
    /// Event production timestamp (RFC 3339).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Extension attributes, flattened into the JSON object.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
    /// Event payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    /// Start building an envelope.
    pub fn builder() -> EventBuilder {
        EventBuilder::default()
    }

    /// Serialize to structured-mode CloudEvents JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope from structured-mode CloudEvents JSON bytes.
    ///
    /// Fails with [`DecodeError::MalformedJson`] when the bytes are not a
    /// JSON object, [`DecodeError::MissingAttribute`] when a required context
    /// attribute is absent or empty, [`DecodeError::UnsupportedSpecVersion`]
    /// for anything other than `1.0`, and
    /// [`DecodeError::UnsupportedContentType`] for non-JSON payload types.
    pub fn from_bytes(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| DecodeError::MalformedJson(e.to_string()))?;
        let attrs = value
            .as_object()
            .ok_or_else(|| DecodeError::MalformedJson("event is not a JSON object".to_string()))?;

        for required in ["id", "source", "type"] {
            match attrs.get(required) {
                Some(Value::String(s)) if !s.is_empty() => {}
                _ => return Err(DecodeError::MissingAttribute(required)),
            }
        }

        match attrs.get("specversion") {
            None | Some(Value::Null) => return Err(DecodeError::MissingAttribute("specversion")),
            Some(Value::String(v)) if v == SPEC_VERSION => {}
            Some(v) => {
                return Err(DecodeError::UnsupportedSpecVersion(
                    v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()),
                ))
            }
        }

        if let Some(Value::String(ct)) = attrs.get("datacontenttype") {
            if !is_json_content_type(ct) {
                return Err(DecodeError::UnsupportedContentType(ct.clone()));
            }
        }

        serde_json::from_value(value).map_err(|e| DecodeError::MalformedJson(e.to_string()))
    }

    /// Look up an extension attribute by name.
    pub fn extension(&self, name: &str) -> Option<&Value> {
        self.extensions.get(name)
    }

    /// Look up a string-valued extension attribute by name.
    pub fn extension_str(&self, name: &str) -> Option<&str> {
        self.extensions.get(name).and_then(Value::as_str)
    }

    /// Whether the envelope carries a payload.
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Deserialize the payload into a domain type.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| DecodeError::Payload("envelope has no data".to_string()))?;
        serde_json::from_value(data.clone()).map_err(|e| DecodeError::Payload(e.to_string()))
    }
}

/// Whether a `datacontenttype` value describes a JSON payload.
fn is_json_content_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    media_type == "application/json" || media_type == "text/json" || media_type.ends_with("+json")
}

/// Error returned by [`EventBuilder::build`] when a required context
/// attribute was never set.
#[derive(Error, Debug)]
#[error("cannot build envelope without required attribute: {0}")]
pub struct BuilderError(pub &'static str);

/// Builder for [`Envelope`].
///
/// `id`, `source` and `event_type` are required; everything else is optional.
#[derive(Debug, Default)]
pub struct EventBuilder {
    id: Option<String>,
    source: Option<String>,
    event_type: Option<String>,
    datacontenttype: Option<String>,
    time: Option<DateTime<Utc>>,
    extensions: BTreeMap<String, Value>,
    data: Option<Value>,
}

impl EventBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn time(mut self, time: DateTime<Utc>) -> Self {
        self.time = Some(time);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.datacontenttype = Some(content_type.into());
        self
    }

    /// Add a string-valued extension attribute.
    pub fn extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions
            .insert(name.into(), Value::String(value.into()));
        self
    }

    /// Set the payload to the JSON serialization of a domain record.
    ///
    /// Defaults `datacontenttype` to `application/json` if not already set.
    pub fn json_data<T: Serialize>(mut self, record: &T) -> Result<Self, EncodeError> {
        self.data = Some(serde_json::to_value(record)?);
        if self.datacontenttype.is_none() {
            self.datacontenttype = Some("application/json".to_string());
        }
        Ok(self)
    }

    pub fn build(self) -> Result<Envelope, BuilderError> {
        Ok(Envelope {
            id: self.id.ok_or(BuilderError("id"))?,
            source: self.source.ok_or(BuilderError("source"))?,
            specversion: SPEC_VERSION.to_string(),
            event_type: self.event_type.ok_or(BuilderError("type"))?,
            datacontenttype: self.datacontenttype,
            time: self.time,
            extensions: self.extensions,
            data: self.data,
        })
    }
}
