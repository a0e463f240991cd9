//! Event payload values.
//!
//! A [`Payload`] is a JSON value tree whose leaves may also be raw binary
//! buffers. Before a packet is written, binary leaves are replaced by
//! placeholder objects and shipped as separate attachment frames; the
//! receiving side substitutes them back in order.
//!
//! # Placeholder Format
//!
//! ```json
//! { "_placeholder": true, "num": 0 }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::BTreeMap;

use serde_json::{Map, Number, Value};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Key marking a placeholder object.
const PLACEHOLDER_KEY: &str = "_placeholder";

/// Key holding the attachment index of a placeholder.
const PLACEHOLDER_NUM: &str = "num";

// ============================================================================
// Payload
// ============================================================================

/// A JSON-like value tree with binary leaves.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    /// JSON `null`.
    #[default]
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(Number),
    /// JSON string.
    String(String),
    /// Raw binary buffer, sent as an attachment.
    Binary(Vec<u8>),
    /// JSON array.
    Array(Vec<Payload>),
    /// JSON object.
    Object(BTreeMap<String, Payload>),
}

// ============================================================================
// Accessors
// ============================================================================

impl Payload {
    /// Returns `true` if this is `null`.
    #[inline]
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the string value, if this is a string.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as `i64`, if this is an integer number.
    #[inline]
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    /// Returns the value as `f64`, if this is a number.
    #[inline]
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    #[inline]
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the buffer, if this is a binary leaf.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the elements, if this is an array.
    #[inline]
    #[must_use]
    pub fn as_array(&self) -> Option<&[Payload]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries, if this is an object.
    #[inline]
    #[must_use]
    pub fn as_object(&self) -> Option<&BTreeMap<String, Payload>> {
        match self {
            Self::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a key, if this is an object.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Payload> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Returns `true` if any leaf of the tree is binary.
    #[must_use]
    pub fn has_binary(&self) -> bool {
        match self {
            Self::Binary(_) => true,
            Self::Array(items) => items.iter().any(Self::has_binary),
            Self::Object(map) => map.values().any(Self::has_binary),
            _ => false,
        }
    }

    /// Counts the binary leaves of the tree.
    #[must_use]
    pub fn binary_count(&self) -> usize {
        match self {
            Self::Binary(_) => 1,
            Self::Array(items) => items.iter().map(Self::binary_count).sum(),
            Self::Object(map) => map.values().map(Self::binary_count).sum(),
            _ => 0,
        }
    }

    /// Converts to a plain JSON value.
    ///
    /// Returns `None` if the tree contains binary leaves.
    #[must_use]
    pub fn to_json(&self) -> Option<Value> {
        if self.has_binary() {
            return None;
        }
        Some(self.deconstruct(&mut Vec::new()))
    }
}

// ============================================================================
// Binary Deconstruction
// ============================================================================

impl Payload {
    /// Converts the tree to JSON, moving binary leaves into `attachments`.
    ///
    /// Leaves are visited depth-first; each is replaced by a placeholder
    /// whose `num` is its index in `attachments`.
    pub fn deconstruct(&self, attachments: &mut Vec<Vec<u8>>) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Number(n) => Value::Number(n.clone()),
            Self::String(s) => Value::String(s.clone()),
            Self::Binary(bytes) => {
                let num = attachments.len();
                attachments.push(bytes.clone());
                let mut placeholder = Map::new();
                placeholder.insert(PLACEHOLDER_KEY.to_string(), Value::Bool(true));
                placeholder.insert(PLACEHOLDER_NUM.to_string(), Value::from(num));
                Value::Object(placeholder)
            }
            Self::Array(items) => {
                Value::Array(items.iter().map(|item| item.deconstruct(attachments)).collect())
            }
            Self::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, value)| (key.clone(), value.deconstruct(attachments)))
                    .collect(),
            ),
        }
    }

    /// Rebuilds a tree from JSON, substituting placeholders with attachments.
    ///
    /// # Errors
    ///
    /// - [`Error::Parse`] if a placeholder index is out of range
    pub fn reconstruct(value: Value, attachments: &[Vec<u8>]) -> Result<Self> {
        match value {
            Value::Object(map) if is_placeholder(&map) => {
                let num = map
                    .get(PLACEHOLDER_NUM)
                    .and_then(Value::as_u64)
                    .ok_or_else(|| Error::parse("illegal attachment placeholder"))?;
                let bytes = usize::try_from(num)
                    .ok()
                    .and_then(|index| attachments.get(index))
                    .ok_or_else(|| Error::parse(format!("illegal attachment index {num}")))?;
                Ok(Self::Binary(bytes.clone()))
            }
            Value::Object(map) => {
                let mut out = BTreeMap::new();
                for (key, value) in map {
                    out.insert(key, Self::reconstruct(value, attachments)?);
                }
                Ok(Self::Object(out))
            }
            Value::Array(items) => items
                .into_iter()
                .map(|item| Self::reconstruct(item, attachments))
                .collect::<Result<Vec<_>>>()
                .map(Self::Array),
            other => Ok(Self::from(other)),
        }
    }
}

/// Returns `true` if the object is an attachment placeholder.
fn is_placeholder(map: &Map<String, Value>) -> bool {
    map.get(PLACEHOLDER_KEY).and_then(Value::as_bool) == Some(true)
        && map.get(PLACEHOLDER_NUM).is_some_and(Value::is_number)
}

// ============================================================================
// Conversions
// ============================================================================

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => Self::Number(n),
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Self::from).collect()),
            Value::Object(map) => {
                Self::Object(map.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    #[inline]
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Payload {
    #[inline]
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Payload {
    #[inline]
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Payload {
    /// Non-finite values become `null`, as JSON cannot carry them.
    fn from(n: f64) -> Self {
        Number::from_f64(n).map_or(Self::Null, Self::Number)
    }
}

macro_rules! payload_from_int {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Payload {
                #[inline]
                fn from(n: $ty) -> Self {
                    Self::Number(Number::from(n))
                }
            }
        )*
    };
}

payload_from_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<Vec<u8>> for Payload {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(bytes)
    }
}

impl From<&[u8]> for Payload {
    #[inline]
    fn from(bytes: &[u8]) -> Self {
        Self::Binary(bytes.to_vec())
    }
}

impl From<Vec<Payload>> for Payload {
    #[inline]
    fn from(items: Vec<Payload>) -> Self {
        Self::Array(items)
    }
}

impl From<BTreeMap<String, Payload>> for Payload {
    #[inline]
    fn from(map: BTreeMap<String, Payload>) -> Self {
        Self::Object(map)
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    #[inline]
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ============================================================================
// Tests
// ============================================================================
