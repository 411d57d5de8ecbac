//! Shared packet model and codecs for the resync socket protocol.
//!
//! This crate owns the wire representation used by both the server and
//! `client`. Every packet is a positional tuple whose first element is a
//! numeric [`Kind`] tag. Text frames carry the tuple as a JSON array; binary
//! frames carry the same tuple as a protobuf `WirePacket` whose fields are
//! `google.protobuf.Value`s.
//!
//! DESIGN
//! ======
//! Payloads stay flexible (`serde_json::Value`) because actions, API results
//! and synced values are application data. Only the envelope is typed:
//! decoding is exhaustive, so an unknown tag or a missing/mistyped field is a
//! [`CodecError`] rather than a silently-misread tuple.

use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// =============================================================================
// CONSTANTS
// =============================================================================

/// Cookie carrying the session token on the upgrade request.
pub const SESSION_COOKIE: &str = "session";

/// Session event announcing the catch-up sync after an attach.
pub const EVENT_SYNCED: &str = "synced";
/// Session event carrying one dispatched action and its serial.
pub const EVENT_ACTION: &str = "action";
/// Session event carrying changed synced values.
pub const EVENT_SYNC: &str = "SYNC";
/// Tracker event reporting a subscribe or snapshot failure.
pub const EVENT_ERROR: &str = "error";

/// Action type wrapping a tracker's initial snapshot.
pub const ACTION_INIT: &str = "INIT";
/// Action type wrapping several actions delivered together.
pub const ACTION_BATCH: &str = "BATCH";

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Closed without a status code (reported when the network went away).
pub const CLOSE_NO_STATUS: u16 = 1005;
/// Connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// A newer connection took over the session.
pub const CLOSE_REPLACED: u16 = 4000;
/// The initial sync for the session failed.
pub const CLOSE_SYNC_FAILED: u16 = 4001;
/// The presented session token is malformed.
pub const CLOSE_INVALID_SESSION: u16 = 4002;
/// The session was closed on the server.
pub const CLOSE_SESSION_CLOSED: u16 = 4003;

/// Whether a close code is a server-side rejection that must not be retried.
#[must_use]
pub fn is_rejection(code: u16) -> bool {
    (4000..5000).contains(&code)
}

/// Wrap a snapshot as the action that initializes a tracker's state.
#[must_use]
pub fn init_tracker(data: Value) -> Value {
    json!({ "type": ACTION_INIT, "payload": data })
}

/// Coalesce several actions into a single action.
#[must_use]
pub fn batch_actions(actions: Vec<Value>) -> Value {
    json!({ "type": ACTION_BATCH, "payload": actions })
}

// =============================================================================
// TYPES
// =============================================================================

/// Error returned when decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The text frame is not valid JSON.
    #[error("failed to parse json packet: {0}")]
    Json(#[from] serde_json::Error),
    /// The raw bytes could not be decoded as a protobuf `WirePacket`.
    #[error("failed to decode protobuf packet: {0}")]
    Decode(#[from] prost::DecodeError),
    /// The packet is not a non-empty array.
    #[error("packet is not a tuple")]
    NotATuple,
    /// The leading tag does not map to a known [`Kind`].
    #[error("invalid packet kind: {0}")]
    InvalidKind(Value),
    /// A required field is absent.
    #[error("{kind:?} packet is missing field `{field}`")]
    MissingField { kind: Kind, field: &'static str },
    /// A field is present but has the wrong type.
    #[error("{kind:?} packet has invalid field `{field}`: {value}")]
    InvalidField {
        kind: Kind,
        field: &'static str,
        value: Value,
    },
    /// The tuple carries more fields than its kind defines.
    #[error("{kind:?} packet has {extra} unexpected trailing field(s)")]
    TrailingFields { kind: Kind, extra: usize },
}

/// Numeric tag leading every packet tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Api,
    ApiResponse,
    Event,
    Sync,
    TrackerAction,
    TrackerEvent,
    TrackerOpen,
    TrackerClose,
    TrackerTimestamp,
}

impl Kind {
    /// Convert kind into its wire tag.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Api => 1,
            Self::ApiResponse => 2,
            Self::Event => 3,
            Self::Sync => 4,
            Self::TrackerAction => 10,
            Self::TrackerEvent => 11,
            Self::TrackerOpen => 12,
            Self::TrackerClose => 13,
            Self::TrackerTimestamp => 14,
        }
    }

    /// Parse a kind from its wire tag.
    fn from_i64(value: i64) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::Api),
            2 => Ok(Self::ApiResponse),
            3 => Ok(Self::Event),
            4 => Ok(Self::Sync),
            10 => Ok(Self::TrackerAction),
            11 => Ok(Self::TrackerEvent),
            12 => Ok(Self::TrackerOpen),
            13 => Ok(Self::TrackerClose),
            14 => Ok(Self::TrackerTimestamp),
            _ => Err(CodecError::InvalidKind(Value::from(value))),
        }
    }
}

/// A single message on the socket, in either direction.
#[derive(Clone, Debug, PartialEq)]
pub enum Packet {
    /// Remote procedure call from the peer.
    Api {
        id: u64,
        name: String,
        payload: Value,
    },
    /// Result of an [`Packet::Api`] call; `error` is set on failure.
    ApiResponse {
        id: u64,
        error: Option<String>,
        result: Option<Value>,
    },
    /// Named session-level event.
    Event { name: String, data: Value },
    /// Peer acknowledgment of every action up to `serial`.
    Sync { serial: u64 },
    /// Channel action forwarded by a tracker.
    TrackerAction {
        tracker: String,
        action: Value,
        serial: u64,
    },
    /// Channel event forwarded by a tracker.
    TrackerEvent {
        tracker: String,
        event: String,
        data: Value,
    },
    /// The tracker finished its catch-up and is live.
    TrackerOpen { tracker: String },
    /// The tracker was closed.
    TrackerClose {
        tracker: String,
        code: u16,
        message: String,
    },
    /// Server clock reading for client-side timestamp correction.
    TrackerTimestamp { tracker: String, server_time_ms: i64 },
}

impl Packet {
    /// Build a named session event.
    #[must_use]
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            name: name.into(),
            data,
        }
    }

    /// Build a successful API response.
    #[must_use]
    pub fn api_ok(id: u64, result: Value) -> Self {
        Self::ApiResponse {
            id,
            error: None,
            result: Some(result),
        }
    }

    /// Build a failed API response.
    #[must_use]
    pub fn api_err(id: u64, message: impl Into<String>) -> Self {
        Self::ApiResponse {
            id,
            error: Some(message.into()),
            result: None,
        }
    }

    /// Wire tag of this packet.
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Api { .. } => Kind::Api,
            Self::ApiResponse { .. } => Kind::ApiResponse,
            Self::Event { .. } => Kind::Event,
            Self::Sync { .. } => Kind::Sync,
            Self::TrackerAction { .. } => Kind::TrackerAction,
            Self::TrackerEvent { .. } => Kind::TrackerEvent,
            Self::TrackerOpen { .. } => Kind::TrackerOpen,
            Self::TrackerClose { .. } => Kind::TrackerClose,
            Self::TrackerTimestamp { .. } => Kind::TrackerTimestamp,
        }
    }

    /// Convert into the positional field list that follows the tag.
    fn into_fields(self) -> Vec<Value> {
        match self {
            Self::Api { id, name, payload } => vec![id.into(), name.into(), payload],
            Self::ApiResponse {
                id,
                error: Some(message),
                ..
            } => vec![id.into(), message.into()],
            Self::ApiResponse {
                id,
                error: None,
                result,
            } => vec![id.into(), Value::Null, result.unwrap_or(Value::Null)],
            Self::Event { name, data } => vec![name.into(), data],
            Self::Sync { serial } => vec![serial.into()],
            Self::TrackerAction {
                tracker,
                action,
                serial,
            } => vec![tracker.into(), action, serial.into()],
            Self::TrackerEvent {
                tracker,
                event,
                data,
            } => vec![tracker.into(), event.into(), data],
            Self::TrackerOpen { tracker } => vec![tracker.into()],
            Self::TrackerClose {
                tracker,
                code,
                message,
            } => vec![tracker.into(), code.into(), message.into()],
            Self::TrackerTimestamp {
                tracker,
                server_time_ms,
            } => vec![tracker.into(), server_time_ms.into()],
        }
    }

    /// Rebuild a packet from its tag and positional fields.
    fn from_fields(kind: Kind, fields: Vec<Value>) -> Result<Self, CodecError> {
        let mut f = Fields::new(kind, fields);
        let packet = match kind {
            Kind::Api => Self::Api {
                id: f.u64("id")?,
                name: f.string("name")?,
                payload: f.value("payload")?,
            },
            Kind::ApiResponse => {
                let id = f.u64("id")?;
                let error = f.optional_string("error")?;
                let result = f.optional();
                Self::ApiResponse { id, error, result }
            }
            Kind::Event => Self::Event {
                name: f.string("name")?,
                data: f.value("data")?,
            },
            Kind::Sync => Self::Sync {
                serial: f.u64("serial")?,
            },
            Kind::TrackerAction => Self::TrackerAction {
                tracker: f.string("tracker")?,
                action: f.value("action")?,
                serial: f.u64("serial")?,
            },
            Kind::TrackerEvent => Self::TrackerEvent {
                tracker: f.string("tracker")?,
                event: f.string("event")?,
                data: f.value("data")?,
            },
            Kind::TrackerOpen => Self::TrackerOpen {
                tracker: f.string("tracker")?,
            },
            Kind::TrackerClose => Self::TrackerClose {
                tracker: f.string("tracker")?,
                code: f.u16("code")?,
                message: f.string("message")?,
            },
            Kind::TrackerTimestamp => Self::TrackerTimestamp {
                tracker: f.string("tracker")?,
                server_time_ms: f.i64("server_time_ms")?,
            },
        };
        f.finish()?;
        Ok(packet)
    }
}

/// Frame encoding negotiated per connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// JSON arrays on text frames.
    #[default]
    Json,
    /// Protobuf `WirePacket` on binary frames.
    Binary,
}

impl Encoding {
    /// Query-string value naming this encoding.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Binary => "binary",
        }
    }
}

// =============================================================================
// CODECS
// =============================================================================

/// Convert a packet into its JSON tuple form.
#[must_use]
pub fn to_value(packet: Packet) -> Value {
    let mut tuple = vec![Value::from(packet.kind().as_i64())];
    tuple.extend(packet.into_fields());
    Value::Array(tuple)
}

/// Parse a packet from its JSON tuple form.
///
/// # Errors
///
/// Returns [`CodecError::NotATuple`] for anything but a non-empty array,
/// [`CodecError::InvalidKind`] for an unknown tag, and a field error when the
/// remaining elements do not match the kind's shape.
pub fn from_value(value: Value) -> Result<Packet, CodecError> {
    let Value::Array(mut tuple) = value else {
        return Err(CodecError::NotATuple);
    };
    if tuple.is_empty() {
        return Err(CodecError::NotATuple);
    }
    let tag = tuple.remove(0);
    let kind = tag
        .as_i64()
        .ok_or_else(|| CodecError::InvalidKind(tag.clone()))
        .and_then(Kind::from_i64)?;
    Packet::from_fields(kind, tuple)
}

/// Encode a packet as a JSON text frame.
#[must_use]
pub fn encode_text(packet: &Packet) -> String {
    to_value(packet.clone()).to_string()
}

/// Decode a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Json`] for invalid JSON, otherwise see [`from_value`].
pub fn decode_text(text: &str) -> Result<Packet, CodecError> {
    from_value(serde_json::from_str(text)?)
}

/// Encode a packet into protobuf bytes.
#[must_use]
pub fn encode_packet(packet: &Packet) -> Vec<u8> {
    let packet = packet.clone();
    let wire = WirePacket {
        kind: packet.kind().as_i64(),
        fields: packet.into_fields().iter().map(json_to_proto_value).collect(),
    };

    let mut out = Vec::with_capacity(wire.encoded_len());
    // Encoding into a growable Vec cannot run out of buffer.
    wire.encode(&mut out).unwrap_or_default();
    out
}

/// Decode protobuf bytes into a packet.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes, otherwise the same
/// shape errors as [`from_value`].
pub fn decode_packet(bytes: &[u8]) -> Result<Packet, CodecError> {
    let wire = WirePacket::decode(bytes)?;
    let kind = Kind::from_i64(wire.kind)?;
    let fields = wire.fields.iter().map(proto_to_json_value).collect();
    Packet::from_fields(kind, fields)
}

// =============================================================================
// HELPERS
// =============================================================================

/// Cursor over a tuple's positional fields.
struct Fields {
    kind: Kind,
    iter: std::vec::IntoIter<Value>,
}

impl Fields {
    fn new(kind: Kind, fields: Vec<Value>) -> Self {
        Self {
            kind,
            iter: fields.into_iter(),
        }
    }

    fn value(&mut self, field: &'static str) -> Result<Value, CodecError> {
        self.iter.next().ok_or(CodecError::MissingField {
            kind: self.kind,
            field,
        })
    }

    fn optional(&mut self) -> Option<Value> {
        self.iter.next()
    }

    fn invalid(&self, field: &'static str, value: Value) -> CodecError {
        CodecError::InvalidField {
            kind: self.kind,
            field,
            value,
        }
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, CodecError> {
        let value = self.value(field)?;
        value.as_u64().ok_or_else(|| self.invalid(field, value))
    }

    fn i64(&mut self, field: &'static str) -> Result<i64, CodecError> {
        let value = self.value(field)?;
        value.as_i64().ok_or_else(|| self.invalid(field, value))
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, CodecError> {
        let value = self.value(field)?;
        value
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| self.invalid(field, value))
    }

    fn string(&mut self, field: &'static str) -> Result<String, CodecError> {
        match self.value(field)? {
            Value::String(s) => Ok(s),
            other => Err(self.invalid(field, other)),
        }
    }

    fn optional_string(&mut self, field: &'static str) -> Result<Option<String>, CodecError> {
        match self.value(field)? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(self.invalid(field, other)),
        }
    }

    fn finish(self) -> Result<(), CodecError> {
        let extra = self.iter.len();
        if extra == 0 {
            Ok(())
        } else {
            Err(CodecError::TrailingFields {
                kind: self.kind,
                extra,
            })
        }
    }
}

fn json_to_proto_value(value: &Value) -> prost_types::Value {
    let kind = match value {
        Value::Null => {
            prost_types::value::Kind::NullValue(prost_types::NullValue::NullValue as i32)
        }
        Value::Bool(v) => prost_types::value::Kind::BoolValue(*v),
        Value::Number(v) => prost_types::value::Kind::NumberValue(v.as_f64().unwrap_or(0.0)),
        Value::String(v) => prost_types::value::Kind::StringValue(v.clone()),
        Value::Array(v) => prost_types::value::Kind::ListValue(prost_types::ListValue {
            values: v.iter().map(json_to_proto_value).collect(),
        }),
        Value::Object(v) => prost_types::value::Kind::StructValue(prost_types::Struct {
            fields: v
                .iter()
                .map(|(k, v)| (k.clone(), json_to_proto_value(v)))
                .collect(),
        }),
    };

    prost_types::Value { kind: Some(kind) }
}

/// Largest integer a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

fn proto_to_json_value(value: &prost_types::Value) -> Value {
    let Some(kind) = &value.kind else {
        return Value::Null;
    };

    match kind {
        prost_types::value::Kind::NullValue(_) => Value::Null,
        prost_types::value::Kind::NumberValue(v) => number_to_json(*v),
        prost_types::value::Kind::StringValue(v) => Value::String(v.clone()),
        prost_types::value::Kind::BoolValue(v) => Value::Bool(*v),
        prost_types::value::Kind::StructValue(v) => Value::Object(
            v.fields
                .iter()
                .map(|(k, v)| (k.clone(), proto_to_json_value(v)))
                .collect::<Map<_, _>>(),
        ),
        prost_types::value::Kind::ListValue(v) => {
            Value::Array(v.values.iter().map(proto_to_json_value).collect())
        }
    }
}

/// Integral doubles come back as integers so ids and serials keep their type.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn number_to_json(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER {
        if v >= 0.0 {
            return Value::from(v as u64);
        }
        return Value::from(v as i64);
    }
    serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
}

#[derive(Clone, PartialEq, Message)]
struct WirePacket {
    #[prost(int64, tag = "1")]
    kind: i64,
    #[prost(message, repeated, tag = "2")]
    fields: Vec<prost_types::Value>,
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
