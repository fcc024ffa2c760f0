// fh-atproto: wire formats and platform vocabulary for the firehose client.
//
// Covers the subset of the protocol stack the moderation pipeline needs:
// Unicode canonicalization for matching, CID parsing/printing, a DAG-CBOR
// event decoder with a dynamic value tree, CARv1 envelope reading, and typed
// views over the firehose frame shapes.

pub mod car;
pub mod cbor;
pub mod cid;
pub mod collections;
pub mod fold;
pub mod frames;
pub mod uri;
pub mod value;
pub mod varint;

use thiserror::Error;

/// Decode failures for the CID/CBOR/CAR layers.
///
/// Malformed input is never fatal to the pipeline: callers log the offending
/// unit, skip it, and keep the cursor advancing.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("input truncated at byte {0}")]
    Truncated(usize),
    #[error("bad encoding: {0}")]
    BadEncoding(String),
    #[error("bad cid: {0}")]
    BadCid(String),
    #[error("duplicate cid {0}")]
    DuplicateCid(String),
    #[error("{0} trailing bytes after final block")]
    TrailingBytes(usize),
    #[error("unsupported cbor item: major {major} info {info}")]
    Unsupported { major: u8, info: u8 },
    #[error("nesting depth limit exceeded")]
    DepthLimit,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("unexpected type for field {0}")]
    WrongType(&'static str),
}

pub use cid::Cid;
pub use uri::AtUri;
pub use value::Value;
