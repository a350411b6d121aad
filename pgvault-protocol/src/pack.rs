//! Pack encoding.
//!
//! The wire format for protocol frames and filter results. A pack is a typed
//! value serialized as a tag byte followed by a varint-encoded payload.
//! Objects use a sorted map so encoding is canonical: the same value always
//! produces the same bytes.

use std::collections::BTreeMap;

use pgvault_api_types::{Error, Result};

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_ARRAY: u8 = 6;
const TAG_OBJECT: u8 = 7;

/// A dynamically typed pack value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn obj<const N: usize>(fields: [(&str, Value); N]) -> Value {
        Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key.to_string(), value))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Object field lookup. Returns `Null` for missing keys so optional
    /// fields read cleanly.
    pub fn get(&self, key: &str) -> &Value {
        match self {
            Value::Object(map) => map.get(key).unwrap_or(&Value::Null),
            _ => &Value::Null,
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(value) => Ok(*value),
            _ => Err(Error::protocol(format!("expected bool, got {}", self.type_name()))),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(value) => Ok(*value),
            Value::UInt(value) if *value <= i64::MAX as u64 => Ok(*value as i64),
            _ => Err(Error::protocol(format!("expected int, got {}", self.type_name()))),
        }
    }

    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Value::UInt(value) => Ok(*value),
            Value::Int(value) if *value >= 0 => Ok(*value as u64),
            _ => Err(Error::protocol(format!("expected uint, got {}", self.type_name()))),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(value) => Ok(value),
            _ => Err(Error::protocol(format!("expected string, got {}", self.type_name()))),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(value) => Ok(value),
            _ => Err(Error::protocol(format!("expected bytes, got {}", self.type_name()))),
        }
    }

    pub fn as_array(&self) -> Result<&[Value]> {
        match self {
            Value::Array(value) => Ok(value),
            _ => Err(Error::protocol(format!("expected array, got {}", self.type_name()))),
        }
    }

    /// Optional string: `Null` maps to `None`.
    pub fn as_opt_str(&self) -> Result<Option<&str>> {
        match self {
            Value::Null => Ok(None),
            other => other.as_str().map(Some),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(TAG_NULL),
            Value::Bool(value) => {
                out.push(TAG_BOOL);
                out.push(*value as u8);
            }
            Value::Int(value) => {
                out.push(TAG_INT);
                write_varint(out, zigzag(*value));
            }
            Value::UInt(value) => {
                out.push(TAG_UINT);
                write_varint(out, *value);
            }
            Value::Str(value) => {
                out.push(TAG_STR);
                write_varint(out, value.len() as u64);
                out.extend_from_slice(value.as_bytes());
            }
            Value::Bytes(value) => {
                out.push(TAG_BYTES);
                write_varint(out, value.len() as u64);
                out.extend_from_slice(value);
            }
            Value::Array(items) => {
                out.push(TAG_ARRAY);
                write_varint(out, items.len() as u64);
                for item in items {
                    item.encode_into(out);
                }
            }
            Value::Object(map) => {
                out.push(TAG_OBJECT);
                write_varint(out, map.len() as u64);
                for (key, value) in map {
                    write_varint(out, key.len() as u64);
                    out.extend_from_slice(key.as_bytes());
                    value.encode_into(out);
                }
            }
        }
    }

    pub fn decode(data: &[u8]) -> Result<Value> {
        let mut cursor = Cursor { data, pos: 0 };
        let value = decode_value(&mut cursor)?;

        if cursor.pos != data.len() {
            return Err(Error::protocol("trailing bytes after pack value"));
        }

        Ok(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Value {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Value {
        Value::Int(value)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Value {
        Value::UInt(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Value {
        Value::UInt(value.into())
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Value {
        Value::UInt(value as u64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Value {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Value {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Value {
        Value::Array(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        match value {
            Some(value) => value.into(),
            None => Value::Null,
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Error::protocol("truncated pack value"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.data.len() - self.pos < len {
            return Err(Error::protocol("truncated pack value"));
        }

        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn varint(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;

        loop {
            let byte = self.byte()?;

            if shift == 63 && byte > 1 {
                return Err(Error::protocol("varint overflow"));
            }

            result |= u64::from(byte & 0x7f) << shift;

            if byte & 0x80 == 0 {
                return Ok(result);
            }

            shift += 7;
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.varint()? as usize;
        let bytes = self.slice(len)?;

        String::from_utf8(bytes.to_vec()).map_err(|_| Error::protocol("invalid utf-8 in pack string"))
    }
}

fn decode_value(cursor: &mut Cursor) -> Result<Value> {
    let value = match cursor.byte()? {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Bool(cursor.byte()? != 0),
        TAG_INT => Value::Int(unzigzag(cursor.varint()?)),
        TAG_UINT => Value::UInt(cursor.varint()?),
        TAG_STR => Value::Str(cursor.string()?),
        TAG_BYTES => {
            let len = cursor.varint()? as usize;
            Value::Bytes(cursor.slice(len)?.to_vec())
        }
        TAG_ARRAY => {
            let count = cursor.varint()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));

            for _ in 0..count {
                items.push(decode_value(cursor)?);
            }

            Value::Array(items)
        }
        TAG_OBJECT => {
            let count = cursor.varint()? as usize;
            let mut map = BTreeMap::new();

            for _ in 0..count {
                let key = cursor.string()?;
                let value = decode_value(cursor)?;
                map.insert(key, value);
            }

            Value::Object(map)
        }
        tag => return Err(Error::protocol(format!("unknown pack tag {tag}"))),
    };

    Ok(value)
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            out.push(byte);
            return;
        }

        out.push(byte | 0x80);
    }
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod test {
    use super::*;

    fn round_trip(value: Value) {
        let encoded = value.encode();
        assert_eq!(Value::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn scalar_round_trip() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Int(0));
        round_trip(Value::Int(-1));
        round_trip(Value::Int(i64::MIN));
        round_trip(Value::Int(i64::MAX));
        round_trip(Value::UInt(u64::MAX));
        round_trip(Value::Str("stanza".into()));
        round_trip(Value::Bytes(vec![0, 1, 2, 0xff]));
    }

    #[test]
    fn container_round_trip() {
        round_trip(Value::Array(vec![
            Value::Int(1),
            Value::Str("two".into()),
            Value::Array(vec![Value::Null]),
        ]));
        round_trip(Value::obj([
            ("name", Value::from("demo")),
            ("size", Value::from(16777216u64)),
            ("nested", Value::obj([("a", Value::Bool(false))])),
        ]));
    }

    #[test]
    fn canonical_object_encoding() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), Value::Int(2));
        a.insert("a".to_string(), Value::Int(1));

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), Value::Int(1));
        b.insert("b".to_string(), Value::Int(2));

        assert_eq!(Value::Object(a).encode(), Value::Object(b).encode());
    }

    #[test]
    fn truncated_input_is_an_error() {
        let encoded = Value::Str("hello".into()).encode();
        assert!(Value::decode(&encoded[..encoded.len() - 1]).is_err());
        assert!(Value::decode(&[]).is_err());
        assert!(Value::decode(&[9]).is_err());
    }

    #[test]
    fn missing_object_field_reads_null() {
        let value = Value::obj([("present", Value::Bool(true))]);
        assert!(value.get("absent").is_null());
        assert!(value.get("present").as_bool().unwrap());
    }
}
