use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Placeholder written locally for a server-timestamp transform until the
/// backend reports the committed time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTimestampValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Box<FirestoreValue>>,
    pub local_write_time: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp(ServerTimestampValue),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Vector(Vec<f64>),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_vector(values: Vec<f64>) -> Self {
        Self {
            kind: ValueKind::Vector(values),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    /// Local stand-in for a server timestamp that has not been committed yet.
    ///
    /// Chained server timestamps keep the value that preceded the first one.
    pub fn server_timestamp(previous: Option<&FirestoreValue>, local_write_time: Timestamp) -> Self {
        let previous_value = previous.and_then(|value| match value.kind() {
            ValueKind::ServerTimestamp(inner) => inner.previous_value.clone(),
            _ => Some(Box::new(value.clone())),
        });
        Self {
            kind: ValueKind::ServerTimestamp(ServerTimestampValue {
                previous_value,
                local_write_time,
            }),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_server_timestamp(&self) -> bool {
        matches!(self.kind, ValueKind::ServerTimestamp(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[FirestoreValue]> {
        match &self.kind {
            ValueKind::Array(array) => Some(array.values()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Stable textual form used to build target canonical ids.
    pub fn canonical_id(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::ServerTimestamp(value) => format!(
                "server_timestamp({},{})",
                value.local_write_time.seconds, value.local_write_time.nanos
            ),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => {
                format!("geo({},{})", value.latitude(), value.longitude())
            }
            ValueKind::Array(array) => {
                let inner: Vec<String> = array.values().iter().map(|v| v.canonical_id()).collect();
                format!("[{}]", inner.join(","))
            }
            ValueKind::Vector(values) => {
                let inner: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
                format!("vector[{}]", inner.join(","))
            }
            ValueKind::Map(map) => {
                let inner: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_id()))
                    .collect();
                format!("{{{}}}", inner.join(","))
            }
        }
    }

    /// Rough in-memory footprint, used to decide when the cache needs collecting.
    pub fn estimated_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null | ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) => 16,
            ValueKind::ServerTimestamp(value) => {
                16 + value
                    .previous_value
                    .as_ref()
                    .map(|previous| previous.estimated_byte_size())
                    .unwrap_or(0)
            }
            ValueKind::String(value) | ValueKind::Reference(value) => value.len(),
            ValueKind::Bytes(value) => value.as_slice().len(),
            ValueKind::GeoPoint(_) => 16,
            ValueKind::Array(array) => array
                .values()
                .iter()
                .map(FirestoreValue::estimated_byte_size)
                .sum(),
            ValueKind::Vector(values) => values.len() * 8,
            ValueKind::Map(map) => map.estimated_byte_size(),
        }
    }
}

impl From<ValueKind> for FirestoreValue {
    fn from(kind: ValueKind) -> Self {
        Self { kind }
    }
}
