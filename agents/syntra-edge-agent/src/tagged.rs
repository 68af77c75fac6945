//! Type-Tag Codec
//!
//! Polymorphic entities (modules, runtime info) carry a `type` discriminant
//! next to their properties. Each polymorphic field is a Rust enum with one
//! variant per registered tag plus an `Unknown` member; tags that are not
//! registered decode into [`UnknownEntity`] instead of failing, and encoding
//! an unknown entity re-emits its original tag and properties untouched.

use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key holding the discriminant in every tagged entity
pub const TYPE_KEY: &str = "type";

/// Tag for docker-backed modules and runtimes
pub const DOCKER_TYPE: &str = "docker";

/// Tag written for entities that never carried one
pub const UNKNOWN_TYPE: &str = "unknown";

/// An entity whose type tag is not registered on this node
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UnknownEntity {
    /// Tag exactly as received
    pub type_tag: String,
    /// Every other property, kept verbatim
    pub properties: Map<String, Value>,
}

/// An enum whose variants are selected by a `type` string
pub trait TypeTagged: Sized {
    /// The tag written when encoding this value
    fn type_tag(&self) -> &str;

    /// Properties of this value, without the tag
    fn to_properties(&self) -> serde_json::Result<Map<String, Value>>;

    /// Build a value from a tag and the remaining properties.
    ///
    /// Registered tags decode into their concrete shape; anything else must
    /// produce the unknown variant.
    fn from_tagged(tag: &str, properties: Map<String, Value>) -> serde_json::Result<Self>;
}

/// Decode the properties of a registered shape
pub fn decode_shape<T: for<'de> Deserialize<'de>>(
    properties: Map<String, Value>,
) -> serde_json::Result<T> {
    serde_json::from_value(Value::Object(properties))
}

/// Encode a registered shape into a property map
pub fn encode_shape<T: Serialize>(shape: &T) -> serde_json::Result<Map<String, Value>> {
    match serde_json::to_value(shape)? {
        Value::Object(map) => Ok(map),
        other => Err(ser::Error::custom(format!(
            "tagged entity must encode to an object, got {}",
            kind_of(&other)
        ))),
    }
}

/// Serialize a tagged value as `{ "type": tag, ...properties }`
pub fn serialize_tagged<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: TypeTagged,
    S: Serializer,
{
    let mut map = value.to_properties().map_err(ser::Error::custom)?;
    map.insert(
        TYPE_KEY.to_string(),
        Value::String(value.type_tag().to_string()),
    );
    map.serialize(serializer)
}

/// Deserialize a tagged value, consulting the `type` discriminant
pub fn deserialize_tagged<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: TypeTagged,
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let mut map = match value {
        Value::Object(map) => map,
        other => {
            return Err(de::Error::custom(format!(
                "expected a tagged object, got {}",
                kind_of(&other)
            )))
        }
    };

    let tag = match map.remove(TYPE_KEY) {
        Some(Value::String(tag)) => tag,
        Some(other) => {
            return Err(de::Error::custom(format!(
                "'{}' must be a string, got {}",
                TYPE_KEY,
                kind_of(&other)
            )))
        }
        None => UNKNOWN_TYPE.to_string(),
    };

    T::from_tagged(&tag, map).map_err(de::Error::custom)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
