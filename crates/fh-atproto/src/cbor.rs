//! Event-driven DAG-CBOR decoder.
//!
//! The decoder walks one encoded item and emits `(depth, Event)` pairs to a
//! [`Sax`] handler; [`TreeBuilder`] is the stock handler that assembles the
//! dynamic [`Value`] tree. Only the DAG-CBOR profile is accepted: definite
//! lengths, text keys, tag 42 for CIDs, 64-bit floats.

use crate::value::{Map, Value};
use crate::{Cid, CodecError};

const DEPTH_LIMIT: usize = 128;
const TAG_CID: u64 = 42;

/// Decode events, in document order.
#[derive(Debug)]
pub enum Event {
    ObjectStart,
    ObjectEnd,
    ArrayStart,
    ArrayEnd,
    Key(String),
    Scalar(Value),
    /// A complete top-level item has been assembled.
    Result,
}

pub trait Sax {
    fn event(&mut self, depth: usize, event: Event) -> Result<(), CodecError>;
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Decoder { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Decode one top-level item, emitting events plus a final `Result`.
    pub fn decode_item(&mut self, sax: &mut dyn Sax) -> Result<(), CodecError> {
        self.item(sax, 0)?;
        sax.event(0, Event::Result)
    }

    fn byte(&mut self) -> Result<u8, CodecError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(CodecError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(CodecError::Truncated(self.buf.len()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Read a head byte and its argument. For major 7 the raw additional
    /// info is returned untouched in `info` so the caller can distinguish
    /// simple values from floats.
    fn head(&mut self) -> Result<(u8, u8, u64), CodecError> {
        let initial = self.byte()?;
        let major = initial >> 5;
        let info = initial & 0x1f;
        let arg = match info {
            0..=23 => u64::from(info),
            24 => u64::from(self.byte()?),
            25 => {
                let b = self.take(2)?;
                u64::from(u16::from_be_bytes([b[0], b[1]]))
            }
            26 => {
                let b = self.take(4)?;
                u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            27 => {
                let b = self.take(8)?;
                u64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
            }
            _ => return Err(CodecError::Unsupported { major, info }),
        };
        Ok((major, info, arg))
    }

    fn item(&mut self, sax: &mut dyn Sax, depth: usize) -> Result<(), CodecError> {
        if depth > DEPTH_LIMIT {
            return Err(CodecError::DepthLimit);
        }
        let (major, info, arg) = self.head()?;
        match major {
            0 => {
                let v = i64::try_from(arg)
                    .map_err(|_| CodecError::BadEncoding("integer out of range".into()))?;
                sax.event(depth, Event::Scalar(Value::Int(v)))
            }
            1 => {
                let v = i64::try_from(arg)
                    .map_err(|_| CodecError::BadEncoding("integer out of range".into()))?;
                sax.event(depth, Event::Scalar(Value::Int(-1 - v)))
            }
            2 => {
                let bytes = self.take(arg as usize)?.to_vec();
                sax.event(depth, Event::Scalar(Value::Bytes(bytes)))
            }
            3 => {
                let bytes = self.take(arg as usize)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|e| CodecError::BadEncoding(format!("text string: {e}")))?;
                sax.event(depth, Event::Scalar(Value::Text(text.to_owned())))
            }
            4 => {
                sax.event(depth, Event::ArrayStart)?;
                for _ in 0..arg {
                    self.item(sax, depth + 1)?;
                }
                sax.event(depth, Event::ArrayEnd)
            }
            5 => {
                sax.event(depth, Event::ObjectStart)?;
                for _ in 0..arg {
                    let (kmajor, _, klen) = self.head()?;
                    if kmajor != 3 {
                        return Err(CodecError::BadEncoding("non-text map key".into()));
                    }
                    let bytes = self.take(klen as usize)?;
                    let key = std::str::from_utf8(bytes)
                        .map_err(|e| CodecError::BadEncoding(format!("map key: {e}")))?;
                    sax.event(depth + 1, Event::Key(key.to_owned()))?;
                    self.item(sax, depth + 1)?;
                }
                sax.event(depth, Event::ObjectEnd)
            }
            6 => {
                if arg == TAG_CID {
                    let (imajor, _, ilen) = self.head()?;
                    if imajor != 2 {
                        return Err(CodecError::BadCid("tag 42 without byte string".into()));
                    }
                    let bytes = self.take(ilen as usize)?;
                    let cid = Cid::from_tagged_bytes(bytes)?;
                    sax.event(depth, Event::Scalar(Value::Cid(cid)))
                } else {
                    // Unknown tags are ignored; the inner item stands alone.
                    self.item(sax, depth)
                }
            }
            7 => match info {
                20 => sax.event(depth, Event::Scalar(Value::Bool(false))),
                21 => sax.event(depth, Event::Scalar(Value::Bool(true))),
                22 => sax.event(depth, Event::Scalar(Value::Null)),
                27 => sax.event(depth, Event::Scalar(Value::Float(f64::from_bits(arg)))),
                _ => Err(CodecError::Unsupported { major, info }),
            },
            _ => unreachable!("major type is three bits"),
        }
    }
}

// ---------------------------------------------------------------------------
// TreeBuilder
// ---------------------------------------------------------------------------

/// Assembles decoder events into [`Value`] trees, one root per `Result`.
#[derive(Default)]
pub struct TreeBuilder {
    stack: Vec<Frame>,
    roots: Vec<Value>,
}

enum Frame {
    Map { entries: Map, key: Option<String> },
    Array(Vec<Value>),
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed top-level values, in input order.
    pub fn into_roots(self) -> Vec<Value> {
        self.roots
    }

    pub fn take_root(&mut self) -> Option<Value> {
        if self.roots.is_empty() {
            None
        } else {
            Some(self.roots.remove(0))
        }
    }

    fn attach(&mut self, value: Value) -> Result<(), CodecError> {
        match self.stack.last_mut() {
            None => self.roots.push(value),
            Some(Frame::Array(items)) => items.push(value),
            Some(Frame::Map { entries, key }) => {
                let key = key
                    .take()
                    .ok_or_else(|| CodecError::BadEncoding("map value without key".into()))?;
                entries.insert(key, value);
            }
        }
        Ok(())
    }
}

impl Sax for TreeBuilder {
    fn event(&mut self, _depth: usize, event: Event) -> Result<(), CodecError> {
        match event {
            Event::ObjectStart => {
                self.stack.push(Frame::Map {
                    entries: Map::new(),
                    key: None,
                });
                Ok(())
            }
            Event::ArrayStart => {
                self.stack.push(Frame::Array(Vec::new()));
                Ok(())
            }
            Event::Key(key) => match self.stack.last_mut() {
                Some(Frame::Map { key: slot, .. }) => {
                    *slot = Some(key);
                    Ok(())
                }
                _ => Err(CodecError::BadEncoding("key outside map".into())),
            },
            Event::Scalar(value) => self.attach(value),
            Event::ObjectEnd => match self.stack.pop() {
                Some(Frame::Map { entries, .. }) => self.attach(Value::Map(entries)),
                _ => Err(CodecError::BadEncoding("unbalanced object end".into())),
            },
            Event::ArrayEnd => match self.stack.pop() {
                Some(Frame::Array(items)) => self.attach(Value::Array(items)),
                _ => Err(CodecError::BadEncoding("unbalanced array end".into())),
            },
            Event::Result => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Convenience entry points
// ---------------------------------------------------------------------------

/// Decode a single value; trailing bytes are an error.
pub fn decode(buf: &[u8]) -> Result<Value, CodecError> {
    let mut decoder = Decoder::new(buf);
    let mut builder = TreeBuilder::new();
    decoder.decode_item(&mut builder)?;
    if !decoder.at_end() {
        return Err(CodecError::TrailingBytes(buf.len() - decoder.position()));
    }
    builder
        .take_root()
        .ok_or_else(|| CodecError::BadEncoding("no value decoded".into()))
}

/// Decode a sequence of concatenated values until end of input.
pub fn decode_all(buf: &[u8]) -> Result<Vec<Value>, CodecError> {
    let mut decoder = Decoder::new(buf);
    let mut builder = TreeBuilder::new();
    while !decoder.at_end() {
        decoder.decode_item(&mut builder)?;
    }
    Ok(builder.into_roots())
}

// ---------------------------------------------------------------------------
// Minimal encoder, test support for frame construction
// ---------------------------------------------------------------------------

/// Encode a [`Value`] in DAG-CBOR form. Used by tests to build synthetic
/// frames; maps are emitted in `BTreeMap` (sorted) order.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(0xf6),
        Value::Bool(false) => out.push(0xf4),
        Value::Bool(true) => out.push(0xf5),
        Value::Int(v) => {
            if *v >= 0 {
                encode_head(0, *v as u64, out);
            } else {
                encode_head(1, (-1 - *v) as u64, out);
            }
        }
        Value::Float(v) => {
            out.push(0xfb);
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            encode_head(3, s.len() as u64, out);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            encode_head(2, b.len() as u64, out);
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            encode_head(4, items.len() as u64, out);
            for item in items {
                encode(item, out);
            }
        }
        Value::Map(m) => {
            encode_head(5, m.len() as u64, out);
            for (k, v) in m {
                encode_head(3, k.len() as u64, out);
                out.extend_from_slice(k.as_bytes());
                encode(v, out);
            }
        }
        Value::Cid(cid) => {
            encode_head(6, TAG_CID, out);
            let mut bytes = vec![0x00];
            bytes.extend(cid.to_bytes());
            encode_head(2, bytes.len() as u64, out);
            out.extend_from_slice(&bytes);
        }
    }
}

fn encode_head(major: u8, arg: u64, out: &mut Vec<u8>) {
    let major = major << 5;
    match arg {
        0..=23 => out.push(major | arg as u8),
        24..=0xff => {
            out.push(major | 24);
            out.push(arg as u8);
        }
        0x100..=0xffff => {
            out.push(major | 25);
            out.extend_from_slice(&(arg as u16).to_be_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(major | 26);
            out.extend_from_slice(&(arg as u32).to_be_bytes());
        }
        _ => {
            out.push(major | 27);
            out.extend_from_slice(&arg.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cid::{CODEC_DAG_CBOR, HASH_SHA2_256};

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(entries.into_iter().map(|(k, v)| (k.to_owned(), v)).collect())
    }

    fn round_trip(value: &Value) -> Value {
        let mut buf = Vec::new();
        encode(value, &mut buf);
        decode(&buf).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::Int(0),
            Value::Int(23),
            Value::Int(24),
            Value::Int(-100),
            Value::Int(70_000),
            Value::Float(2.5),
            Value::Text("Хохол".into()),
            Value::Bytes(vec![1, 2, 3]),
        ] {
            assert_eq!(round_trip(&v), v);
        }
    }

    #[test]
    fn nested_structures_round_trip() {
        let v = map(vec![
            ("$type", Value::Text("app.bsky.feed.post".into())),
            (
                "facets",
                Value::Array(vec![map(vec![("uri", Value::Text("https://x".into()))])]),
            ),
            ("langs", Value::Array(vec![Value::Text("en".into())])),
        ]);
        assert_eq!(round_trip(&v), v);
    }

    #[test]
    fn tag_42_surfaces_as_cid() {
        let cid = Cid {
            version: 1,
            codec: CODEC_DAG_CBOR,
            hash: HASH_SHA2_256,
            digest: vec![7u8; 32],
        };
        let v = map(vec![("ref", Value::Cid(cid.clone()))]);
        let decoded = round_trip(&v);
        assert_eq!(decoded.get("ref").and_then(Value::as_cid), Some(&cid));
    }

    #[test]
    fn trailing_bytes_rejected_for_single_decode() {
        let mut buf = Vec::new();
        encode(&Value::Int(1), &mut buf);
        buf.push(0x00);
        assert!(matches!(decode(&buf), Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn decode_all_handles_concatenated_items() {
        let mut buf = Vec::new();
        encode(&map(vec![("op", Value::Int(1))]), &mut buf);
        encode(&map(vec![("seq", Value::Int(42))]), &mut buf);
        let roots = decode_all(&buf).unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[1].get("seq").and_then(Value::as_int), Some(42));
    }

    #[test]
    fn invalid_utf8_text_is_bad_encoding() {
        // text string of length 2 with invalid UTF-8 payload
        let buf = [0x62, 0xff, 0xfe];
        assert!(matches!(decode(&buf), Err(CodecError::BadEncoding(_))));
    }

    #[test]
    fn indefinite_lengths_are_unsupported() {
        // 0x9f: array, indefinite length
        assert!(matches!(
            decode(&[0x9f]),
            Err(CodecError::Unsupported { .. })
        ));
    }

    #[test]
    fn truncated_input_reports_position() {
        let mut buf = Vec::new();
        encode(&Value::Text("hello".into()), &mut buf);
        assert!(matches!(
            decode(&buf[..3]),
            Err(CodecError::Truncated(_))
        ));
    }

    #[test]
    fn sax_events_observe_depth() {
        struct DepthProbe {
            max: usize,
        }
        impl Sax for DepthProbe {
            fn event(&mut self, depth: usize, _event: Event) -> Result<(), CodecError> {
                self.max = self.max.max(depth);
                Ok(())
            }
        }
        let v = map(vec![("a", Value::Array(vec![map(vec![("b", Value::Int(1))])]))]);
        let mut buf = Vec::new();
        encode(&v, &mut buf);
        let mut probe = DepthProbe { max: 0 };
        Decoder::new(&buf).decode_item(&mut probe).unwrap();
        assert!(probe.max >= 2);
    }
}
