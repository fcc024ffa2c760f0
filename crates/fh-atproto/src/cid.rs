//! Content identifier parsing and printing.
//!
//! Handles exactly the forms the firehose carries: binary CIDs inside CAR
//! frames and CBOR tag-42 byte strings (multibase identity prefix), printed
//! as multibase base32-lower text. Round-trip identity holds for v1 CIDs:
//! `Cid::parse_str(&cid.to_string()) == cid`.

use crate::{CodecError, varint};
use sha2::{Digest, Sha256};

/// Multicodec for DAG-CBOR payloads.
pub const CODEC_DAG_CBOR: u64 = 0x71;
/// Multihash code for SHA2-256.
pub const HASH_SHA2_256: u64 = 0x12;

const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cid {
    pub version: u64,
    pub codec: u64,
    pub hash: u64,
    pub digest: Vec<u8>,
}

impl Cid {
    /// Parse a binary CID, advancing `*pos` past it.
    ///
    /// A leading (0x12, 0x20) pair is the legacy v0 form: a bare SHA2-256
    /// multihash with a fixed 32-byte digest. Anything else is v1:
    /// version, codec, multihash code, digest length, digest bytes.
    pub fn parse(buf: &[u8], pos: &mut usize) -> Result<Self, CodecError> {
        let first = varint::read_u64(buf, pos)?;
        let second = varint::read_u64(buf, pos)?;
        let (version, codec, hash, digest_len) = if (first, second) == (0x12, 0x20) {
            (0, CODEC_DAG_CBOR, HASH_SHA2_256, 0x20)
        } else {
            let hash = varint::read_u64(buf, pos)?;
            let digest_len = varint::read_u64(buf, pos)?;
            (first, second, hash, digest_len)
        };
        if digest_len > 64 {
            return Err(CodecError::BadCid(format!(
                "implausible digest length {digest_len}"
            )));
        }
        let end = *pos + digest_len as usize;
        if end > buf.len() {
            return Err(CodecError::Truncated(buf.len()));
        }
        let digest = buf[*pos..end].to_vec();
        *pos = end;
        Ok(Cid {
            version,
            codec,
            hash,
            digest,
        })
    }

    /// Parse the CBOR tag-42 byte-string form: a multibase identity prefix
    /// (0x00) followed by the binary CID.
    pub fn from_tagged_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let inner = match bytes.first() {
            Some(0x00) => &bytes[1..],
            Some(_) => bytes,
            None => return Err(CodecError::BadCid("empty tagged cid".into())),
        };
        let mut pos = 0;
        let cid = Self::parse(inner, &mut pos)?;
        if pos != inner.len() {
            return Err(CodecError::BadCid(format!(
                "{} trailing bytes after tagged cid",
                inner.len() - pos
            )));
        }
        Ok(cid)
    }

    /// Parse the multibase base32-lower text form produced by `to_string`.
    pub fn parse_str(text: &str) -> Result<Self, CodecError> {
        let rest = text
            .strip_prefix('b')
            .ok_or_else(|| CodecError::BadCid(format!("unsupported multibase in '{text}'")))?;
        let bytes = base32_decode(rest)?;
        let mut pos = 0;
        let cid = Self::parse(&bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(CodecError::BadCid("trailing bytes in cid text".into()));
        }
        Ok(cid)
    }

    /// The binary form: what sits between the framing varints in a CAR block.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.digest.len() + 8);
        if self.version == 0 {
            varint::write_u64(self.hash, &mut out);
            varint::write_u64(self.digest.len() as u64, &mut out);
        } else {
            varint::write_u64(self.version, &mut out);
            varint::write_u64(self.codec, &mut out);
            varint::write_u64(self.hash, &mut out);
            varint::write_u64(self.digest.len() as u64, &mut out);
        }
        out.extend_from_slice(&self.digest);
        out
    }

    /// True when this CID's digest matches `content` (SHA2-256 hashes only).
    pub fn matches_content(&self, content: &[u8]) -> bool {
        if self.hash != HASH_SHA2_256 {
            return true;
        }
        Sha256::digest(content).as_slice() == self.digest.as_slice()
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", base32_encode(&self.to_bytes()))
    }
}

// ---------------------------------------------------------------------------
// Base32 (RFC 4648 lowercase, no padding) for the multibase text form
// ---------------------------------------------------------------------------

fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut acc: u64 = 0;
    let mut bits: u32 = 0;
    for &byte in data {
        acc = (acc << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

fn base32_decode(text: &str) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut acc: u64 = 0;
    let mut bits: u32 = 0;
    for ch in text.chars() {
        let value = match ch {
            'a'..='z' => ch as u64 - 'a' as u64,
            '2'..='7' => ch as u64 - '2' as u64 + 26,
            _ => {
                return Err(CodecError::BadCid(format!(
                    "invalid base32 character '{ch}'"
                )));
            }
        };
        acc = (acc << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((acc >> bits) & 0xff) as u8);
        }
    }
    Ok(out)
}
