//! AT-URI handling: `at://<authority>/<collection>/<rkey>`.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AtUri {
    pub authority: String,
    pub collection: String,
    pub rkey: String,
}

impl AtUri {
    /// Parse a full `at://` URI. Returns `None` when any component is
    /// missing or empty.
    pub fn parse(uri: &str) -> Option<Self> {
        let rest = uri.strip_prefix("at://")?;
        let mut parts = rest.splitn(3, '/');
        let authority = parts.next().filter(|s| !s.is_empty())?;
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let rkey = parts.next().filter(|s| !s.is_empty())?;
        Some(AtUri {
            authority: authority.to_owned(),
            collection: collection.to_owned(),
            rkey: rkey.to_owned(),
        })
    }

    /// Build from a repo did and a `<collection>/<rkey>` record path.
    pub fn from_record_path(did: &str, path: &str) -> Option<Self> {
        let mut parts = path.splitn(2, '/');
        let collection = parts.next().filter(|s| !s.is_empty())?;
        let rkey = parts.next().filter(|s| !s.is_empty())?;
        Some(AtUri {
            authority: did.to_owned(),
            collection: collection.to_owned(),
            rkey: rkey.to_owned(),
        })
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at://{}/{}/{}",
            self.authority, self.collection, self.rkey
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let text = "at://did:plc:abc123/app.bsky.feed.post/3kxyz";
        let uri = AtUri::parse(text).unwrap();
        assert_eq!(uri.authority, "did:plc:abc123");
        assert_eq!(uri.collection, "app.bsky.feed.post");
        assert_eq!(uri.rkey, "3kxyz");
        assert_eq!(uri.to_string(), text);
    }

    #[test]
    fn from_record_path() {
        let uri = AtUri::from_record_path("did:plc:abc", "app.bsky.feed.post/3k").unwrap();
        assert_eq!(uri.to_string(), "at://did:plc:abc/app.bsky.feed.post/3k");
    }

    #[test]
    fn malformed_inputs_rejected() {
        assert!(AtUri::parse("https://example.com").is_none());
        assert!(AtUri::parse("at://only-authority").is_none());
        assert!(AtUri::parse("at:///coll/rkey").is_none());
        assert!(AtUri::from_record_path("did:plc:abc", "no-slash").is_none());
        assert!(AtUri::from_record_path("did:plc:abc", "coll/").is_none());
    }
}
