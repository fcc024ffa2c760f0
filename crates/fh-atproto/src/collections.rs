//! Platform collection names, facet/embed type tags, and the
//! record-type-indexed table of text-matchable fields.

use crate::value::Value;

pub const APP_BSKY_FEED_POST: &str = "app.bsky.feed.post";
pub const APP_BSKY_FEED_LIKE: &str = "app.bsky.feed.like";
pub const APP_BSKY_FEED_REPOST: &str = "app.bsky.feed.repost";
pub const APP_BSKY_GRAPH_FOLLOW: &str = "app.bsky.graph.follow";
pub const APP_BSKY_GRAPH_BLOCK: &str = "app.bsky.graph.block";
pub const APP_BSKY_GRAPH_LIST: &str = "app.bsky.graph.list";
pub const APP_BSKY_GRAPH_LISTITEM: &str = "app.bsky.graph.listitem";
pub const APP_BSKY_ACTOR_PROFILE: &str = "app.bsky.actor.profile";

pub const FACET_MENTION: &str = "app.bsky.richtext.facet#mention";
pub const FACET_TAG: &str = "app.bsky.richtext.facet#tag";
pub const FACET_LINK: &str = "app.bsky.richtext.facet#link";

pub const EMBED_EXTERNAL: &str = "app.bsky.embed.external";
pub const EMBED_IMAGES: &str = "app.bsky.embed.images";
pub const EMBED_VIDEO: &str = "app.bsky.embed.video";
pub const EMBED_RECORD: &str = "app.bsky.embed.record";
pub const EMBED_RECORD_WITH_MEDIA: &str = "app.bsky.embed.recordWithMedia";

/// One extracted unit of matchable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub record_type: String,
    pub field: String,
    pub value: String,
}

impl Candidate {
    pub fn new(
        record_type: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Candidate {
            record_type: record_type.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Top-level matchable fields per record type; `None` means the type is not
/// scanned at all.
pub fn target_fields(record_type: &str) -> Option<&'static [&'static str]> {
    match record_type {
        APP_BSKY_FEED_POST => Some(&["text"]),
        APP_BSKY_ACTOR_PROFILE => Some(&["description", "displayName"]),
        _ => None,
    }
}

/// Extract all candidates from a decoded record: the top-level fields from
/// the target table plus, for posts, the embed's visible text and link
/// surfaces (alt text, external title/description/uri).
pub fn extract_candidates(record_type: &str, record: &Value) -> Vec<Candidate> {
    let mut results = Vec::new();
    let Some(fields) = target_fields(record_type) else {
        return results;
    };
    for field in fields {
        if let Some(text) = record.get(field).and_then(Value::as_str) {
            results.push(Candidate::new(record_type, *field, text));
        }
    }
    if record_type == APP_BSKY_FEED_POST {
        if let Some(embed) = record.get("embed") {
            extract_embed_candidates(record_type, embed, &mut results);
        }
    }
    results
}

fn extract_embed_candidates(record_type: &str, embed: &Value, results: &mut Vec<Candidate>) {
    match embed.record_type() {
        Some(EMBED_EXTERNAL) => {
            if let Some(external) = embed.get("external") {
                for field in ["uri", "title", "description"] {
                    if let Some(text) = external.get(field).and_then(Value::as_str) {
                        if !text.is_empty() {
                            results.push(Candidate::new(
                                record_type,
                                format!("embed/external/{field}"),
                                text,
                            ));
                        }
                    }
                }
            }
        }
        Some(EMBED_IMAGES) => {
            if let Some(images) = embed.get("images").and_then(Value::as_array) {
                for image in images {
                    if let Some(alt) = image.get("alt").and_then(Value::as_str) {
                        if !alt.is_empty() {
                            results.push(Candidate::new(record_type, "embed/images/alt", alt));
                        }
                    }
                }
            }
        }
        Some(EMBED_VIDEO) => {
            if let Some(alt) = embed.get("alt").and_then(Value::as_str) {
                if !alt.is_empty() {
                    results.push(Candidate::new(record_type, "embed/video/alt", alt));
                }
            }
        }
        Some(EMBED_RECORD_WITH_MEDIA) => {
            if let Some(media) = embed.get("media") {
                extract_embed_candidates(record_type, media, results);
            }
        }
        _ => {}
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

    #[test]
    fn post_text_is_a_candidate() {
        let record = map(vec![
            ("$type", Value::Text(APP_BSKY_FEED_POST.into())),
            ("text", Value::Text("hello".into())),
        ]);
        let candidates = extract_candidates(APP_BSKY_FEED_POST, &record);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].field, "text");
    }

    #[test]
    fn profile_exposes_description_and_display_name() {
        let record = map(vec![
            ("description", Value::Text("about me".into())),
            ("displayName", Value::Text("someone".into())),
        ]);
        let candidates = extract_candidates(APP_BSKY_ACTOR_PROFILE, &record);
        let fields: Vec<&str> = candidates.iter().map(|c| c.field.as_str()).collect();
        assert_eq!(fields, vec!["description", "displayName"]);
    }

    #[test]
    fn external_embed_surfaces_are_extracted() {
        let record = map(vec![
            ("text", Value::Text("look".into())),
            (
                "embed",
                map(vec![
                    ("$type", Value::Text(EMBED_EXTERNAL.into())),
                    (
                        "external",
                        map(vec![
                            ("uri", Value::Text("https://example.com/x".into())),
                            ("title", Value::Text("A page".into())),
                            ("description", Value::Text("about a page".into())),
                        ]),
                    ),
                ]),
            ),
        ]);
        let candidates = extract_candidates(APP_BSKY_FEED_POST, &record);
        let fields: Vec<&str> = candidates.iter().map(|c| c.field.as_str()).collect();
        assert!(fields.contains(&"embed/external/uri"));
        assert!(fields.contains(&"embed/external/title"));
        assert!(fields.contains(&"embed/external/description"));
    }

    #[test]
    fn image_alt_text_is_extracted() {
        let record = map(vec![
            ("text", Value::Text("pic".into())),
            (
                "embed",
                map(vec![
                    ("$type", Value::Text(EMBED_IMAGES.into())),
                    (
                        "images",
                        Value::Array(vec![map(vec![("alt", Value::Text("alt text".into()))])]),
                    ),
                ]),
            ),
        ]);
        let candidates = extract_candidates(APP_BSKY_FEED_POST, &record);
        assert!(candidates.iter().any(|c| c.field == "embed/images/alt"));
    }

    #[test]
    fn untracked_types_yield_nothing() {
        let record = map(vec![("subject", Value::Text("did:plc:abc".into()))]);
        assert!(extract_candidates(APP_BSKY_GRAPH_FOLLOW, &record).is_empty());
    }
}
