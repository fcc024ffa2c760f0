//! CARv1 envelope reading.
//!
//! An envelope is a varint-length-prefixed DAG-CBOR header followed by zero
//! or more varint-length-prefixed (CID, DAG-CBOR payload) blocks, per
//! <https://ipld.io/specs/transport/car/carv1/>. Blocks come back in write
//! order. A duplicate CID or a digest mismatch fails only that block; the
//! rest of the envelope still decodes, since the enclosing commit message is
//! idempotent and partial progress is acceptable.

use crate::cbor::{Decoder, TreeBuilder};
use crate::collections;
use crate::value::Value;
use crate::{Cid, CodecError, varint};
use std::collections::HashSet;

/// A decoded envelope plus the per-block errors that were skipped over.
#[derive(Debug)]
pub struct CarEnvelope {
    pub header: Value,
    pub blocks: Vec<(Cid, Value)>,
    pub errors: Vec<CodecError>,
}

/// Read a complete envelope from `buf`.
///
/// Fails outright only when the header is unreadable or the framing is
/// truncated mid-block; per-block payload problems land in `errors`.
/// Trailing bytes that cannot form another block are a `trailing-bytes`
/// error in strict mode (always on here).
pub fn read_envelope(buf: &[u8]) -> Result<CarEnvelope, CodecError> {
    let mut pos = 0;
    let header_len = varint::read_u64(buf, &mut pos)? as usize;
    let header_end = pos
        .checked_add(header_len)
        .filter(|&e| e <= buf.len())
        .ok_or(CodecError::Truncated(buf.len()))?;
    let header = decode_block_payload(&buf[pos..header_end])?;
    pos = header_end;

    let mut blocks = Vec::new();
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    while pos < buf.len() {
        let frame_start = pos;
        let block_len = match varint::read_u64(buf, &mut pos) {
            Ok(len) => len as usize,
            Err(_) => return Err(CodecError::TrailingBytes(buf.len() - frame_start)),
        };
        let block_end = pos
            .checked_add(block_len)
            .filter(|&e| e <= buf.len())
            .ok_or(CodecError::TrailingBytes(buf.len() - frame_start))?;
        let block = &buf[pos..block_end];
        pos = block_end;

        let mut inner = 0;
        let cid = Cid::parse(block, &mut inner)?;
        let payload = &block[inner..];
        if !cid.matches_content(payload) {
            errors.push(CodecError::BadCid(format!(
                "digest mismatch for framed cid {cid}"
            )));
            continue;
        }
        if !seen.insert(cid.clone()) {
            errors.push(CodecError::DuplicateCid(cid.to_string()));
            continue;
        }
        match decode_block_payload(payload) {
            Ok(value) => blocks.push((cid, value)),
            Err(e) => errors.push(e),
        }
    }

    Ok(CarEnvelope {
        header,
        blocks,
        errors,
    })
}

fn decode_block_payload(payload: &[u8]) -> Result<Value, CodecError> {
    let mut decoder = Decoder::new(payload);
    let mut builder = TreeBuilder::new();
    decoder.decode_item(&mut builder)?;
    if !decoder.at_end() {
        return Err(CodecError::TrailingBytes(payload.len() - decoder.position()));
    }
    builder
        .take_root()
        .ok_or_else(|| CodecError::BadEncoding("empty block payload".into()))
}

// ---------------------------------------------------------------------------
// Block classification
// ---------------------------------------------------------------------------

/// Envelope blocks grouped by how the dispatcher consumes them.
///
/// `matchable` records carry text-matchable fields per the target-field
/// table; `content` records are tracked but not scanned; `other` covers
/// commit-tree nodes and anything without a `$type` tag.
#[derive(Debug, Default)]
pub struct ClassifiedBlocks {
    pub matchable: Vec<(String, Value)>,
    pub content: Vec<(String, Value)>,
    pub other: Vec<(String, Value)>,
}

pub fn classify(envelope: CarEnvelope) -> ClassifiedBlocks {
    let mut out = ClassifiedBlocks::default();
    for (cid, value) in envelope.blocks {
        let key = cid.to_string();
        match value.record_type() {
            Some(rtype) if collections::target_fields(rtype).is_some() => {
                out.matchable.push((key, value));
            }
            Some(_) => out.content.push((key, value)),
            None => out.other.push((key, value)),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Test support: envelope construction
// ---------------------------------------------------------------------------

/// Build an envelope from a header and payload values, computing each
/// block's CID over its encoded payload. Used by decoder tests and by the
/// dispatcher's frame tests.
pub fn build_envelope(header: &Value, payloads: &[Value]) -> Vec<u8> {
    let blocks: Vec<(Cid, Vec<u8>)> = payloads
        .iter()
        .map(|p| {
            let mut bytes = Vec::new();
            crate::cbor::encode(p, &mut bytes);
            (cid_for(&bytes), bytes)
        })
        .collect();
    build_envelope_raw(header, &blocks)
}

/// As [`build_envelope`] but with caller-supplied CIDs, so tests can frame
/// duplicate or mismatched identifiers.
pub fn build_envelope_raw(header: &Value, blocks: &[(Cid, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut header_bytes = Vec::new();
    crate::cbor::encode(header, &mut header_bytes);
    varint::write_u64(header_bytes.len() as u64, &mut out);
    out.extend_from_slice(&header_bytes);
    for (cid, payload) in blocks {
        let cid_bytes = cid.to_bytes();
        varint::write_u64((cid_bytes.len() + payload.len()) as u64, &mut out);
        out.extend_from_slice(&cid_bytes);
        out.extend_from_slice(payload);
    }
    out
}

/// The v1 DAG-CBOR CID for an encoded payload.
pub fn cid_for(payload: &[u8]) -> Cid {
    use sha2::{Digest, Sha256};
    Cid {
        version: 1,
        codec: crate::cid::CODEC_DAG_CBOR,
        hash: crate::cid::HASH_SHA2_256,
        digest: Sha256::digest(payload).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Map;

    fn map(entries: Vec<(&str, Value)>) -> Value {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_owned(), v))
                .collect::<Map>(),
        )
    }

    fn post(text: &str) -> Value {
        map(vec![
            ("$type", Value::Text("app.bsky.feed.post".into())),
            ("text", Value::Text(text.into())),
        ])
    }

    #[test]
    fn blocks_decode_in_write_order_with_matching_cids() {
        let header = map(vec![("version", Value::Int(1))]);
        let payloads = vec![post("first"), post("second"), post("third")];
        let buf = build_envelope(&header, &payloads);

        let envelope = read_envelope(&buf).unwrap();
        assert!(envelope.errors.is_empty());
        assert_eq!(envelope.blocks.len(), 3);
        for ((cid, value), original) in envelope.blocks.iter().zip(&payloads) {
            assert_eq!(value, original);
            let mut bytes = Vec::new();
            crate::cbor::encode(value, &mut bytes);
            assert!(cid.matches_content(&bytes));
        }
    }

    #[test]
    fn duplicate_cid_skips_block_and_continues() {
        let header = map(vec![("version", Value::Int(1))]);
        let mut first = Vec::new();
        crate::cbor::encode(&post("dup"), &mut first);
        let mut last = Vec::new();
        crate::cbor::encode(&post("tail"), &mut last);
        let cid = cid_for(&first);
        let buf = build_envelope_raw(
            &header,
            &[
                (cid.clone(), first.clone()),
                (cid.clone(), first),
                (cid_for(&last), last),
            ],
        );

        let envelope = read_envelope(&buf).unwrap();
        assert_eq!(envelope.blocks.len(), 2);
        assert_eq!(envelope.errors.len(), 1);
        assert!(matches!(envelope.errors[0], CodecError::DuplicateCid(_)));
        // The block after the duplicate still decoded.
        assert_eq!(
            envelope.blocks[1].1.get("text").and_then(Value::as_str),
            Some("tail")
        );
    }

    #[test]
    fn digest_mismatch_is_flagged_not_fatal() {
        let header = map(vec![("version", Value::Int(1))]);
        let mut payload = Vec::new();
        crate::cbor::encode(&post("real"), &mut payload);
        let mut wrong = cid_for(&payload);
        wrong.digest[0] ^= 0xff;
        let buf = build_envelope_raw(&header, &[(wrong, payload)]);

        let envelope = read_envelope(&buf).unwrap();
        assert!(envelope.blocks.is_empty());
        assert_eq!(envelope.errors.len(), 1);
        assert!(matches!(envelope.errors[0], CodecError::BadCid(_)));
    }

    #[test]
    fn trailing_garbage_is_an_error() {
        let header = map(vec![("version", Value::Int(1))]);
        let mut buf = build_envelope(&header, &[post("ok")]);
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            read_envelope(&buf),
            Err(CodecError::TrailingBytes(_))
        ));
    }

    #[test]
    fn classification_by_record_type() {
        let header = map(vec![("version", Value::Int(1))]);
        let payloads = vec![
            post("scan me"),
            map(vec![
                ("$type", Value::Text("app.bsky.feed.like".into())),
                ("subject", map(vec![("uri", Value::Text("at://x/y/z".into()))])),
            ]),
            map(vec![("e", Value::Text("tree node".into()))]),
        ];
        let buf = build_envelope(&header, &payloads);
        let grouped = classify(read_envelope(&buf).unwrap());
        assert_eq!(grouped.matchable.len(), 1);
        assert_eq!(grouped.content.len(), 1);
        assert_eq!(grouped.other.len(), 1);
    }
}
