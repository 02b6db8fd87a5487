//! Message payload documents
//!
//! A `Document` is a tree of named fields. Each field holds a UTF-8 string, a
//! 32-bit integer, a double, a nested document, or an array of those. The
//! wire encoding is compact JSON text; decoding anything other than a JSON
//! object fails with `Error::Decode`.
//!
//! Nesting is by value: `set_document` stores a deep copy and `get_document`
//! returns an independent one, so a document never shares state with another.
//!
//! ```rust
//! use popbus::document::Document;
//!
//! let mut doc = Document::new();
//! doc.set_string("field2", "hello world");
//! doc.set_i32("field1", 7);
//!
//! let decoded = Document::decode(&doc.encode().unwrap()).unwrap();
//! assert_eq!(decoded.get_i32("field1"), Some(7));
//! assert_eq!(decoded.get_string("missing"), None);
//! ```

use std::fmt;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::utils::error::{Error, Result};

/// Field carrying the topic a document should be sent to, see
/// `Connection::send`.
pub const SEND_TOPIC_FIELD: &str = "_topic";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: Map<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Map::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Removes a field, returning whether it was present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.fields.remove(name).is_some()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn set_string(&mut self, name: &str, value: impl Into<String>) {
        self.fields
            .insert(name.to_string(), Value::String(value.into()));
    }

    pub fn set_i32(&mut self, name: &str, value: i32) {
        self.fields.insert(name.to_string(), Value::from(value));
    }

    /// Sets a double field. NaN and infinities have no text encoding and are
    /// stored as null.
    pub fn set_f64(&mut self, name: &str, value: f64) {
        let value = Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.fields.insert(name.to_string(), value);
    }

    /// Stores a deep copy of `value` under `name`.
    pub fn set_document(&mut self, name: &str, value: &Document) {
        self.fields
            .insert(name.to_string(), Value::Object(value.fields.clone()));
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.fields
            .get(name)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(Value::as_f64)
    }

    /// Returns an independent copy of the nested document `name`.
    pub fn get_document(&self, name: &str) -> Option<Document> {
        match self.fields.get(name) {
            Some(Value::Object(fields)) => Some(Document {
                fields: fields.clone(),
            }),
            _ => None,
        }
    }

    /// Appends a string to the array field `name`, creating the array if the
    /// field is absent.
    pub fn append_string(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.array_mut(name)?.push(Value::String(value.into()));
        Ok(())
    }

    /// Appends a deep copy of `value` to the array field `name`.
    pub fn append_document(&mut self, name: &str, value: &Document) -> Result<()> {
        self.array_mut(name)?
            .push(Value::Object(value.fields.clone()));
        Ok(())
    }

    /// Number of items in the array field `name`, `None` if it is absent or
    /// not an array.
    pub fn array_len(&self, name: &str) -> Option<usize> {
        self.fields
            .get(name)
            .and_then(Value::as_array)
            .map(Vec::len)
    }

    pub fn string_item(&self, name: &str, index: usize) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(Value::as_array)
            .and_then(|items| items.get(index))
            .and_then(Value::as_str)
    }

    pub fn document_item(&self, name: &str, index: usize) -> Option<Document> {
        match self
            .fields
            .get(name)
            .and_then(Value::as_array)
            .and_then(|items| items.get(index))
        {
            Some(Value::Object(fields)) => Some(Document {
                fields: fields.clone(),
            }),
            _ => None,
        }
    }

    pub fn set_send_topic(&mut self, topic: impl Into<String>) {
        self.set_string(SEND_TOPIC_FIELD, topic);
    }

    pub fn send_topic(&self) -> Option<&str> {
        self.get_string(SEND_TOPIC_FIELD)
    }

    /// Encodes the document as compact JSON text.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.fields)?))
    }

    /// Decodes a document, rejecting anything that is not a JSON object.
    pub fn decode(bytes: &[u8]) -> Result<Document> {
        match serde_json::from_slice::<Value>(bytes)? {
            Value::Object(fields) => Ok(Document { fields }),
            other => Err(Error::Decode(format!(
                "expected a document, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// Builds a document from any serializable value that maps to an object.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Document> {
        match serde_json::to_value(value)
            .map_err(|e| Error::InvalidArgument(e.to_string()))?
        {
            Value::Object(fields) => Ok(Document { fields }),
            other => Err(Error::InvalidArgument(format!(
                "expected a struct or map, found {}",
                json_kind(&other)
            ))),
        }
    }

    /// Deserializes the document into a typed value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    fn array_mut(&mut self, name: &str) -> Result<&mut Vec<Value>> {
        let entry = self
            .fields
            .entry(name.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => Ok(items),
            other => Err(Error::InvalidArgument(format!(
                "field '{name}' holds {}, not an array",
                json_kind(other)
            ))),
        }
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = serde_json::to_string(&self.fields).map_err(|_| fmt::Error)?;
        f.write_str(&text)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a document",
    }
}
