//! Dynamic value tree produced by the DAG-CBOR decoder.
//!
//! CIDs decoded from tag-42 byte strings are first-class values so that
//! downstream code can reference them without binary leakage; in JSON dumps
//! they render as `{"__cid__":"b…"}`.

use crate::Cid;
use std::collections::BTreeMap;

pub type Map = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(Map),
    Cid(Cid),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_cid(&self) -> Option<&Cid> {
        match self {
            Value::Cid(c) => Some(c),
            _ => None,
        }
    }

    /// Map field lookup; `None` for non-maps and missing keys alike.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// The record type tag, when present.
    pub fn record_type(&self) -> Option<&str> {
        self.get("$type").and_then(Value::as_str)
    }

    /// Compact JSON-like rendering for logs. Bytes show length only.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out);
        out
    }

    fn dump_into(&self, out: &mut String) {
        use std::fmt::Write;
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Int(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Float(v) => {
                let _ = write!(out, "{v}");
            }
            Value::Text(s) => {
                let _ = write!(out, "{:?}", s);
            }
            Value::Bytes(b) => {
                let _ = write!(out, "\"<bytes:{}>\"", b.len());
            }
            Value::Cid(c) => {
                let _ = write!(out, "{{\"__cid__\":\"{c}\"}}");
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.dump_into(out);
                }
                out.push(']');
            }
            Value::Map(m) => {
                out.push('{');
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{:?}:", k);
                    v.dump_into(out);
                }
                out.push('}');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::{CODEC_DAG_CBOR, HASH_SHA2_256};

    #[test]
    fn dump_renders_cid_marker() {
        let cid = Cid {
            version: 1,
            codec: CODEC_DAG_CBOR,
            hash: HASH_SHA2_256,
            digest: vec![0u8; 32],
        };
        let text = cid.to_string();
        let v = Value::Cid(cid);
        assert_eq!(v.dump(), format!("{{\"__cid__\":\"{text}\"}}"));
    }

    #[test]
    fn get_traverses_maps_only() {
        let mut m = Map::new();
        m.insert("a".into(), Value::Int(1));
        let v = Value::Map(m);
        assert_eq!(v.get("a").and_then(Value::as_int), Some(1));
        assert!(v.get("b").is_none());
        assert!(Value::Int(3).get("a").is_none());
    }
}
