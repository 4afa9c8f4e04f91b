use std::any::Any;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::error::{ChannelError, Result};
use crate::proxy::RemoteHandle;
use crate::registry::Instance;

/// A call argument or result as seen by user code.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Byte(u8),
    Char(char),
    String(String),
    Int32(i32),
    /// A reference that may point into either process.
    Handle(RemoteHandle),
    /// An object hosted by this process, passed by reference.
    Instance(Instance),
    /// Anything else, carried through the generic serializer.
    Other(serde_json::Value),
}

impl Value {
    /// Wrap a new object so it can be passed by reference.
    pub fn instance<T: Any + Send + Sync>(value: T) -> Self {
        Self::Instance(Arc::new(value))
    }

    /// Serialize any value through the generic serializer path.
    pub fn other<T: serde::Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Other(serde_json::to_value(value)?))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Int32(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_handle(&self) -> Option<&RemoteHandle> {
        match self {
            Self::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_handle(self) -> Option<RemoteHandle> {
        match self {
            Self::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    /// The local object behind this value, whether passed directly or
    /// through a handle to an object hosted here.
    pub fn local_instance<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Instance(instance) => Arc::clone(instance).downcast::<T>().ok(),
            Self::Handle(handle) => handle.local_instance::<T>(),
            _ => None,
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            Self::Other(json) => Ok(serde_json::from_value(json.clone())?),
            other => Err(ChannelError::InvalidArgument(format!(
                "expected a serialized value, got {}",
                other.kind_name()
            ))),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Byte(_) => "byte",
            Self::Char(_) => "char",
            Self::String(_) => "string",
            Self::Int32(_) => "int32",
            Self::Handle(_) => "handle",
            Self::Instance(_) => "instance",
            Self::Other(_) => "other",
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<u8> for Value {
    fn from(value: u8) -> Self {
        Self::Byte(value)
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Self::Char(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int32(value)
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

impl From<RemoteHandle> for Value {
    fn from(value: RemoteHandle) -> Self {
        Self::Handle(value)
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Other(value)
    }
}

/// Positional call arguments with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Value> {
        self.0.get(index).ok_or_else(|| {
            ChannelError::InvalidArgument(format!("missing argument {index}"))
        })
    }

    pub fn bool(&self, index: usize) -> Result<bool> {
        let value = self.get(index)?;
        value.as_bool().ok_or_else(|| mismatch(index, "bool", value))
    }

    pub fn byte(&self, index: usize) -> Result<u8> {
        match self.get(index)? {
            Value::Byte(b) => Ok(*b),
            other => Err(mismatch(index, "byte", other)),
        }
    }

    pub fn char(&self, index: usize) -> Result<char> {
        match self.get(index)? {
            Value::Char(c) => Ok(*c),
            other => Err(mismatch(index, "char", other)),
        }
    }

    pub fn int32(&self, index: usize) -> Result<i32> {
        let value = self.get(index)?;
        value.as_i32().ok_or_else(|| mismatch(index, "int32", value))
    }

    pub fn string(&self, index: usize) -> Result<&str> {
        let value = self.get(index)?;
        value.as_str().ok_or_else(|| mismatch(index, "string", value))
    }

    pub fn handle(&self, index: usize) -> Result<&RemoteHandle> {
        let value = self.get(index)?;
        value.as_handle().ok_or_else(|| mismatch(index, "handle", value))
    }

    /// Local object of type `T` passed at `index`.
    pub fn instance<T: Any + Send + Sync>(&self, index: usize) -> Result<Arc<T>> {
        let value = self.get(index)?;
        value.local_instance::<T>().ok_or_else(|| {
            ChannelError::InvalidArgument(format!(
                "argument {index} is not a local {}",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn deserialize<T: DeserializeOwned>(&self, index: usize) -> Result<T> {
        self.get(index)?.deserialize()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Value> {
        self.0
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Args {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn mismatch(index: usize, expected: &str, found: &Value) -> ChannelError {
    ChannelError::InvalidArgument(format!(
        "argument {index}: expected {expected}, got {}",
        found.kind_name()
    ))
}
