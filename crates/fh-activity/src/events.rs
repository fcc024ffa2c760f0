//! The activity event model: tagged sums carried from the dispatcher to the
//! recorder.

use chrono::{DateTime, Utc};
use fh_atproto::AtUri;

/// Why an account went inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    Deactivated,
    Deleted,
    Suspended,
    TakenDown,
    Tombstone,
    Unknown,
}

impl DownReason {
    pub fn from_status(status: &str) -> Self {
        match status {
            "deactivated" => DownReason::Deactivated,
            "deleted" => DownReason::Deleted,
            "suspended" => DownReason::Suspended,
            "takendown" => DownReason::TakenDown,
            "tombstone" => DownReason::Tombstone,
            _ => DownReason::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DownReason::Deactivated => "deactivated",
            DownReason::Deleted => "deleted",
            DownReason::Suspended => "suspended",
            DownReason::TakenDown => "takendown",
            DownReason::Tombstone => "tombstone",
            DownReason::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    Post { uri: AtUri },
    Reply { uri: AtUri, root: AtUri, parent: AtUri },
    Quote { uri: AtUri, post: AtUri },
    Repost { uri: AtUri, post: AtUri },
    Like { uri: AtUri, content: AtUri },
    Follow { followed: String },
    Block { blocked: String },
    Active,
    Inactive { reason: DownReason },
    HandleChange { handle: String },
    Profile { uri: AtUri },
    Deleted { path: String },
    Matches { count: usize },
    Facets { tags: usize, mentions: usize, links: usize },
}

#[derive(Debug, Clone)]
pub struct TimedEvent {
    pub did: String,
    pub created_at: DateTime<Utc>,
    pub event: Event,
}

impl TimedEvent {
    pub fn new(did: impl Into<String>, created_at: DateTime<Utc>, event: Event) -> Self {
        TimedEvent {
            did: did.into(),
            created_at,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn down_reason_mapping() {
        assert_eq!(DownReason::from_status("suspended"), DownReason::Suspended);
        assert_eq!(DownReason::from_status("takendown"), DownReason::TakenDown);
        assert_eq!(DownReason::from_status("???"), DownReason::Unknown);
        assert_eq!(DownReason::Tombstone.as_str(), "tombstone");
    }
}
