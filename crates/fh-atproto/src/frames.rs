//! Typed views over firehose frame bodies.
//!
//! Each binary WebSocket message carries two concatenated DAG-CBOR values:
//! a header `{op, t}` and a body whose shape depends on `t`. These types
//! pull the fields the dispatcher needs out of the dynamic tree, with
//! missing/mistyped fields reported as error kinds rather than panics.

use crate::value::Value;
use crate::{Cid, CodecError};

pub const OP_MESSAGE: i64 = 1;
pub const OP_ERROR: i64 = -1;

pub const TYPE_COMMIT: &str = "#commit";
pub const TYPE_IDENTITY: &str = "#identity";
pub const TYPE_HANDLE: &str = "#handle";
pub const TYPE_ACCOUNT: &str = "#account";
pub const TYPE_TOMBSTONE: &str = "#tombstone";
pub const TYPE_MIGRATE: &str = "#migrate";
pub const TYPE_INFO: &str = "#info";

#[derive(Debug, Clone)]
pub struct FrameHeader {
    pub op: i64,
    pub t: Option<String>,
}

impl FrameHeader {
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        let op = value
            .get("op")
            .and_then(Value::as_int)
            .ok_or(CodecError::MissingField("op"))?;
        let t = value.get("t").and_then(Value::as_str).map(str::to_owned);
        Ok(FrameHeader { op, t })
    }
}

#[derive(Debug, Clone)]
pub struct RepoOp {
    pub path: String,
    pub action: String,
    pub cid: Option<Cid>,
}

#[derive(Debug)]
pub struct CommitBody<'a> {
    pub repo: String,
    pub seq: i64,
    pub time: String,
    pub ops: Vec<RepoOp>,
    pub blocks: Option<&'a [u8]>,
}

impl<'a> CommitBody<'a> {
    pub fn from_value(value: &'a Value) -> Result<Self, CodecError> {
        let repo = required_str(value, "repo")?.to_owned();
        let seq = value
            .get("seq")
            .and_then(Value::as_int)
            .ok_or(CodecError::MissingField("seq"))?;
        let time = required_str(value, "time")?.to_owned();
        let blocks = value.get("blocks").and_then(Value::as_bytes);
        let mut ops = Vec::new();
        let raw_ops = value
            .get("ops")
            .and_then(Value::as_array)
            .ok_or(CodecError::MissingField("ops"))?;
        for op in raw_ops {
            let path = required_str(op, "path")?.to_owned();
            let action = required_str(op, "action")?.to_owned();
            let cid = match op.get("cid") {
                Some(Value::Cid(c)) => Some(c.clone()),
                Some(Value::Bytes(b)) => Some(Cid::from_tagged_bytes(b)?),
                Some(Value::Null) | None => None,
                Some(_) => return Err(CodecError::WrongType("ops.cid")),
            };
            ops.push(RepoOp { path, action, cid });
        }
        Ok(CommitBody {
            repo,
            seq,
            time,
            ops,
            blocks,
        })
    }
}

#[derive(Debug, Clone)]
pub struct IdentityBody {
    pub did: String,
    pub handle: Option<String>,
    pub time: String,
}

impl IdentityBody {
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        Ok(IdentityBody {
            did: required_str(value, "did")?.to_owned(),
            handle: value.get("handle").and_then(Value::as_str).map(str::to_owned),
            time: required_str(value, "time")?.to_owned(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccountBody {
    pub did: String,
    pub active: bool,
    pub status: Option<String>,
    pub time: String,
}

impl AccountBody {
    pub fn from_value(value: &Value) -> Result<Self, CodecError> {
        Ok(AccountBody {
            did: required_str(value, "did")?.to_owned(),
            active: value
                .get("active")
                .and_then(Value::as_bool)
                .ok_or(CodecError::MissingField("active"))?,
            status: value.get("status").and_then(Value::as_str).map(str::to_owned),
            time: required_str(value, "time")?.to_owned(),
        })
    }
}

fn required_str<'v>(value: &'v Value, field: &'static str) -> Result<&'v str, CodecError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingField(field))
}
