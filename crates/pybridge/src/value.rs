use std::{any::Any, fmt, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    error::{Error, Result},
    reference::Handle,
};

/// Semantic type tag for a parameter or return slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValType {
    Integer,
    Float,
    Boolean,
    String,
    /// Any nested structure the codec can represent.
    Structured,
    /// Opaque host object passed by handle.
    HostRef,
    Unit,
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Structured => "structured value",
            Self::HostRef => "host reference",
            Self::Unit => "unit",
        })
    }
}

/// Host-owned object that crosses the boundary as an integer handle.
///
/// A reference received from the guest remembers its handle, so returning it
/// again yields the same handle instead of a new table entry.
#[derive(Clone)]
pub struct HostRef {
    handle: Option<Handle>,
    object: Arc<dyn Any + Send + Sync>,
}

impl HostRef {
    #[must_use]
    pub fn new<T: Any + Send + Sync>(object: T) -> Self {
        Self::from_arc(Arc::new(object))
    }

    #[must_use]
    pub fn from_arc(object: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            handle: None,
            object,
        }
    }

    pub(crate) fn with_handle(handle: Handle, object: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            handle: Some(handle),
            object,
        }
    }

    /// Handle this reference was resolved from, if it came out of a table.
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        self.handle
    }

    #[must_use]
    pub fn object(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.object
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.object.downcast_ref()
    }

    /// Identity comparison: both refer to the same host allocation.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.object, &other.object)
    }
}

impl fmt::Debug for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRef")
            .field("handle", &self.handle)
            .field("object", &"<opaque>")
            .finish()
    }
}

/// A decoded argument or a host function result.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Unit result, or an argument the guest left out or passed as null.
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Structured(serde_json::Value),
    HostRef(HostRef),
}

impl Value {
    /// Serialize a serde value into a structured runtime value.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn from_serde<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Structured)
    }

    /// Deserialize this value into a serde type.
    ///
    /// # Errors
    /// Returns an error if deserialization fails or this is a host
    /// reference.
    pub fn to_serde<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        let json = self.to_json().ok_or_else(|| {
            <serde_json::Error as serde::de::Error>::custom(
                "host references cannot be deserialized",
            )
        })?;
        serde_json::from_value(json)
    }

    /// Plain structured form of this value; `None` for host references.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(i) => (*i).into(),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Self::Boolean(b) => (*b).into(),
            Self::String(s) => s.clone().into(),
            Self::Structured(v) => v.clone(),
            Self::HostRef(_) => return None,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Boolean(_) => "boolean",
            Self::String(_) => "string",
            Self::Structured(_) => "structured value",
            Self::HostRef(_) => "host reference",
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub const fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Structured(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_host_ref(&self) -> Option<&HostRef> {
        match self {
            Self::HostRef(r) => Some(r),
            _ => None,
        }
    }

    /// Decode one wire element into the declared type. Host references are
    /// resolved by the caller, which owns the reference table.
    pub(crate) fn decode(ty: ValType, json: serde_json::Value, site: &str) -> Result<Self> {
        let mismatch = |json: &serde_json::Value| Error::TypeMismatch {
            site: site.to_string(),
            expected: ty,
            found: json_kind(json).to_string(),
        };
        if json.is_null() {
            return Ok(Self::Null);
        }
        match ty {
            ValType::Integer => json.as_i64().map(Self::Integer).ok_or_else(|| mismatch(&json)),
            ValType::Float => json.as_f64().map(Self::Float).ok_or_else(|| mismatch(&json)),
            ValType::Boolean => json.as_bool().map(Self::Boolean).ok_or_else(|| mismatch(&json)),
            ValType::String => match json {
                serde_json::Value::String(s) => Ok(Self::String(s)),
                other => Err(mismatch(&other)),
            },
            ValType::Structured => Ok(Self::Structured(json)),
            ValType::HostRef | ValType::Unit => Err(mismatch(&json)),
        }
    }

    /// Encode this value for a declared non-reference slot.
    pub(crate) fn encode(&self, ty: ValType, site: &str) -> Result<serde_json::Value> {
        let mismatch = || Error::TypeMismatch {
            site: site.to_string(),
            expected: ty,
            found: self.kind().to_string(),
        };
        match (ty, self) {
            (ValType::Unit, _) | (_, Self::Null) => Ok(serde_json::Value::Null),
            (ValType::Integer, Self::Integer(i)) => Ok((*i).into()),
            (ValType::Float, Self::Float(_) | Self::Integer(_)) => self
                .as_f64()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .ok_or_else(|| Error::TypeMismatch {
                    site: site.to_string(),
                    expected: ty,
                    found: "non-finite float".to_string(),
                }),
            (ValType::Boolean, Self::Boolean(b)) => Ok((*b).into()),
            (ValType::String, Self::String(s)) => Ok(s.clone().into()),
            (ValType::Structured, Self::Float(f)) if !f.is_finite() => Err(mismatch()),
            (ValType::Structured, value) => value.to_json().ok_or_else(mismatch),
            _ => Err(mismatch()),
        }
    }
}

pub(crate) fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(n) if n.is_f64() => "float",
        serde_json::Value::Number(_) => "integer",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Structured(value)
    }
}

impl From<HostRef> for Value {
    fn from(value: HostRef) -> Self {
        Self::HostRef(value)
    }
}

impl From<()> for Value {
    fn from((): ()) -> Self {
        Self::Null
    }
}
