//! Firehose payload dispatch.
//!
//! Each binary frame carries a header and body as two concatenated DAG-CBOR
//! values. Commits decode their CAR block bag, map op CIDs to record paths,
//! and fan out: typed activity events to the recorder, embeds to the embed
//! checker, and matchable candidates through the rule set to the action
//! router. Malformed units are logged and skipped; the cursor advances
//! regardless.

use crate::cursor::Cursor;
use crate::metrics::Metrics;
use crate::moderation::action_router::AccountMatches;
use crate::moderation::embed_checker::{Embed, EmbedBatch};
use chrono::{DateTime, Utc};
use fh_activity::{DownReason, Event, EventRecorder, TimedEvent};
use fh_atproto::collections::{self, Candidate};
use fh_atproto::frames::{
    AccountBody, CommitBody, FrameHeader, IdentityBody, OP_ERROR, OP_MESSAGE, TYPE_ACCOUNT,
    TYPE_COMMIT, TYPE_HANDLE, TYPE_IDENTITY, TYPE_INFO, TYPE_MIGRATE, TYPE_TOMBSTONE,
};
use fh_atproto::value::Value;
use fh_atproto::{AtUri, CodecError, car, cbor};
use fh_matcher::MatcherStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

pub struct PayloadDispatcher {
    matcher: Arc<MatcherStore>,
    recorder: EventRecorder,
    actions: mpsc::Sender<AccountMatches>,
    embeds: mpsc::Sender<EmbedBatch>,
    cursor: Arc<Cursor>,
    metrics: Arc<Metrics>,
}

/// Everything one message contributes beyond activity events.
#[derive(Default)]
struct MessageEffects {
    repo: String,
    path_candidates: Vec<(String, Vec<Candidate>)>,
    embed_batches: Vec<EmbedBatch>,
}

impl PayloadDispatcher {
    pub fn new(
        matcher: Arc<MatcherStore>,
        recorder: EventRecorder,
        actions: mpsc::Sender<AccountMatches>,
        embeds: mpsc::Sender<EmbedBatch>,
        cursor: Arc<Cursor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        PayloadDispatcher {
            matcher,
            recorder,
            actions,
            embeds,
            cursor,
            metrics,
        }
    }

    /// Decode and dispatch one frame. Decode failures surface so the
    /// datasource can log and drop the message; the stream keeps running.
    pub async fn handle_message(&self, data: &[u8]) -> Result<(), CodecError> {
        let values = cbor::decode_all(data)?;
        if values.len() != 2 {
            self.metrics
                .firehose_errors
                .with_label_values(&["malformed_frame"])
                .inc();
            return Err(CodecError::BadEncoding(format!(
                "expected header and body, found {} values",
                values.len()
            )));
        }
        let header = FrameHeader::from_value(&values[0])?;
        let body = &values[1];

        if header.op == OP_ERROR {
            self.metrics
                .firehose_messages
                .with_label_values(&["error", ""])
                .inc();
            error!(body = %body.dump(), "error frame from upstream");
            return Ok(());
        }
        if header.op != OP_MESSAGE {
            warn!(op = header.op, "unknown frame op");
            return Ok(());
        }
        let message_type = header.t.as_deref().unwrap_or("");
        self.metrics
            .firehose_messages
            .with_label_values(&["message", message_type])
            .inc();

        let mut effects = MessageEffects::default();
        match message_type {
            TYPE_COMMIT => self.handle_commit(body, &mut effects).await?,
            TYPE_IDENTITY | TYPE_HANDLE => {
                self.handle_identity(message_type, body, &mut effects).await?;
            }
            TYPE_ACCOUNT => self.handle_account(body).await?,
            TYPE_TOMBSTONE => self.handle_tombstone(body).await?,
            TYPE_MIGRATE | TYPE_INFO => {
                trace!(message_type, "informational frame");
            }
            other => {
                trace!(message_type = other, "unhandled frame type");
            }
        }

        for batch in effects.embed_batches.drain(..) {
            self.metrics
                .activity
                .backlog
                .with_label_values(&["embed_checker"])
                .inc();
            let _ = self.embeds.send(batch).await;
        }
        self.match_candidates(&effects.repo, &effects.path_candidates)
            .await;
        Ok(())
    }

    fn count_decode_error(&self, error: &CodecError) {
        let kind = match error {
            CodecError::DuplicateCid(_) => "duplicate_cid",
            CodecError::TrailingBytes(_) => "trailing_bytes",
            CodecError::BadCid(_) => "bad_cid",
            CodecError::BadEncoding(_) => "bad_encoding",
            CodecError::Truncated(_) => "truncated",
            _ => "decode",
        };
        self.metrics.firehose_errors.with_label_values(&[kind]).inc();
    }

    // -----------------------------------------------------------------------
    // Commits
    // -----------------------------------------------------------------------

    async fn handle_commit(
        &self,
        body: &Value,
        effects: &mut MessageEffects,
    ) -> Result<(), CodecError> {
        let commit = CommitBody::from_value(body)?;
        self.cursor.advance(commit.seq, &commit.time);
        effects.repo = commit.repo.clone();
        let message_time = parse_time(&commit.time).unwrap_or_else(Utc::now);

        let classified = match commit.blocks {
            Some(blocks) => match car::read_envelope(blocks) {
                Ok(envelope) => {
                    for error in &envelope.errors {
                        self.count_decode_error(error);
                        error!(repo = %commit.repo, seq = commit.seq, %error,
                            "block skipped in commit");
                    }
                    car::classify(envelope)
                }
                Err(error) => {
                    self.count_decode_error(&error);
                    error!(repo = %commit.repo, seq = commit.seq, %error,
                        "unreadable block bag, ops only");
                    car::ClassifiedBlocks::default()
                }
            },
            None => car::ClassifiedBlocks::default(),
        };

        // Map block CIDs to record paths; deletions have no block.
        let mut path_by_cid: HashMap<String, String> = HashMap::new();
        for op in &commit.ops {
            let collection = op.path.split('/').next().unwrap_or("");
            if collection.is_empty() {
                warn!(path = %op.path, "blank collection in op path");
                continue;
            }
            self.metrics
                .firehose_collections
                .with_label_values(&[collection, op.action.as_str()])
                .inc();
            if op.action == "delete" {
                self.recorder
                    .record(TimedEvent::new(
                        &commit.repo,
                        message_time,
                        Event::Deleted {
                            path: op.path.clone(),
                        },
                    ))
                    .await;
                continue;
            }
            if let Some(cid) = &op.cid {
                let key = cid.to_string();
                if let Some(existing) = path_by_cid.get(&key) {
                    // Rarely seen for block operations; keep the first path.
                    self.metrics
                        .firehose_errors
                        .with_label_values(&["duplicate_cid"])
                        .inc();
                    error!(cid = %key, path = %op.path, existing = %existing,
                        "duplicate cid in commit ops");
                    continue;
                }
                path_by_cid.insert(key, op.path.clone());
            }
        }

        for (cid, record) in &classified.content {
            self.handle_record(&commit.repo, cid, record, &path_by_cid, message_time, effects)
                .await;
        }
        for (cid, record) in &classified.matchable {
            self.handle_record(&commit.repo, cid, record, &path_by_cid, message_time, effects)
                .await;
            let Some(path) = path_by_cid.get(cid) else {
                continue;
            };
            let Some(record_type) = record.record_type() else {
                continue;
            };
            let candidates = collections::extract_candidates(record_type, record);
            if !candidates.is_empty() {
                effects.path_candidates.push((path.clone(), candidates));
            }
        }
        Ok(())
    }

    async fn handle_record(
        &self,
        repo: &str,
        cid: &str,
        record: &Value,
        path_by_cid: &HashMap<String, String>,
        message_time: DateTime<Utc>,
        effects: &mut MessageEffects,
    ) {
        let Some(path) = path_by_cid.get(cid) else {
            self.metrics
                .firehose_errors
                .with_label_values(&["unreferenced_block"])
                .inc();
            error!(cid = %cid, repo, "no op path for block");
            return;
        };
        let Some(uri) = AtUri::from_record_path(repo, path) else {
            warn!(repo, path = %path, "malformed record path");
            return;
        };
        let created_at = record
            .get("createdAt")
            .and_then(Value::as_str)
            .and_then(parse_time)
            .unwrap_or(message_time);

        match record.record_type() {
            Some(collections::APP_BSKY_FEED_POST) => {
                self.handle_post(repo, path, uri, record, created_at, effects)
                    .await;
            }
            Some(collections::APP_BSKY_FEED_LIKE) => {
                let Some(subject) = record
                    .get("subject")
                    .and_then(|s| s.get("uri"))
                    .and_then(Value::as_str)
                    .and_then(AtUri::parse)
                else {
                    warn!(repo, path = %path, "like without subject uri");
                    return;
                };
                self.record_event(repo, created_at, Event::Like {
                    uri,
                    content: subject,
                })
                .await;
            }
            Some(collections::APP_BSKY_FEED_REPOST) => {
                let Some(subject) = record
                    .get("subject")
                    .and_then(|s| s.get("uri"))
                    .and_then(Value::as_str)
                    .and_then(AtUri::parse)
                else {
                    warn!(repo, path = %path, "repost without subject uri");
                    return;
                };
                self.record_event(repo, created_at, Event::Repost {
                    uri,
                    post: subject,
                })
                .await;
            }
            Some(collections::APP_BSKY_GRAPH_FOLLOW) => {
                let Some(subject) = record.get("subject").and_then(Value::as_str) else {
                    warn!(repo, path = %path, "follow without subject");
                    return;
                };
                self.record_event(repo, created_at, Event::Follow {
                    followed: subject.to_owned(),
                })
                .await;
            }
            Some(collections::APP_BSKY_GRAPH_BLOCK) => {
                let Some(subject) = record.get("subject").and_then(Value::as_str) else {
                    warn!(repo, path = %path, "block without subject");
                    return;
                };
                self.record_event(repo, created_at, Event::Block {
                    blocked: subject.to_owned(),
                })
                .await;
            }
            Some(collections::APP_BSKY_ACTOR_PROFILE) => {
                self.record_event(repo, created_at, Event::Profile { uri })
                    .await;
            }
            _ => {}
        }
    }

    async fn handle_post(
        &self,
        repo: &str,
        path: &str,
        uri: AtUri,
        record: &Value,
        created_at: DateTime<Utc>,
        effects: &mut MessageEffects,
    ) {
        let mut recorded = false;
        let mut embeds: Vec<Embed> = Vec::new();

        if let Some(reply) = record.get("reply") {
            let root = reply
                .get("root")
                .and_then(|r| r.get("uri"))
                .and_then(Value::as_str)
                .and_then(AtUri::parse);
            let parent = reply
                .get("parent")
                .and_then(|r| r.get("uri"))
                .and_then(Value::as_str)
                .and_then(AtUri::parse);
            if let (Some(root), Some(parent)) = (root, parent) {
                self.record_event(repo, created_at, Event::Reply {
                    uri: uri.clone(),
                    root,
                    parent,
                })
                .await;
                recorded = true;
            } else {
                warn!(repo, path, "reply with malformed thread refs");
            }
        }

        if let Some(embed) = record.get("embed") {
            recorded |= self
                .process_embed(repo, path, embed, created_at, &uri, &mut embeds)
                .await;
        }

        // Facet accounting runs for every post, embed or not.
        let mut tags = record
            .get("tags")
            .and_then(Value::as_array)
            .map(<[Value]>::len)
            .unwrap_or(0);
        let mut mentions = 0usize;
        let mut links = 0usize;
        if let Some(facets) = record.get("facets").and_then(Value::as_array) {
            for facet in facets {
                let Some(features) = facet.get("features").and_then(Value::as_array) else {
                    continue;
                };
                for feature in features {
                    match feature.record_type() {
                        Some(collections::FACET_MENTION) => mentions += 1,
                        Some(collections::FACET_TAG) => tags += 1,
                        Some(collections::FACET_LINK) => {
                            links += 1;
                            if let Some(link) = feature.get("uri").and_then(Value::as_str) {
                                effects.path_candidates.push((
                                    path.to_owned(),
                                    vec![Candidate::new(
                                        collections::APP_BSKY_FEED_POST,
                                        collections::FACET_LINK,
                                        link,
                                    )],
                                ));
                                embeds.push(Embed::External(link.to_owned()));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        for (facet, count) in [("tag", tags), ("mention", mentions), ("link", links)] {
            if count > 0 {
                self.metrics
                    .firehose_facets
                    .with_label_values(&[facet])
                    .observe(count as f64);
            }
        }
        if tags + mentions + links > 0 {
            self.metrics
                .firehose_facets
                .with_label_values(&["total"])
                .observe((tags + mentions + links) as f64);
            self.record_event(repo, created_at, Event::Facets {
                tags,
                mentions,
                links,
            })
            .await;
        }

        if !recorded {
            self.record_event(repo, created_at, Event::Post { uri }).await;
        }
        if !embeds.is_empty() {
            effects.embed_batches.push(EmbedBatch {
                did: repo.to_owned(),
                path: path.to_owned(),
                embeds,
            });
        }
    }

    /// Returns true when the embed classified the post (as a quote).
    async fn process_embed(
        &self,
        repo: &str,
        path: &str,
        embed: &Value,
        created_at: DateTime<Utc>,
        post_uri: &AtUri,
        embeds: &mut Vec<Embed>,
    ) -> bool {
        match embed.record_type() {
            Some(collections::EMBED_RECORD) => {
                let Some(quoted) = embed
                    .get("record")
                    .and_then(|r| r.get("uri"))
                    .and_then(Value::as_str)
                    .and_then(AtUri::parse)
                else {
                    warn!(repo, path, "record embed without uri");
                    return false;
                };
                self.record_event(repo, created_at, Event::Quote {
                    uri: post_uri.clone(),
                    post: quoted,
                })
                .await;
                true
            }
            Some(collections::EMBED_RECORD_WITH_MEDIA) => {
                let quoted = embed
                    .get("record")
                    .and_then(|r| r.get("record"))
                    .and_then(|r| r.get("uri"))
                    .and_then(Value::as_str)
                    .and_then(AtUri::parse);
                let mut classified = false;
                if let Some(quoted) = quoted {
                    embeds.push(Embed::Record(quoted.to_string()));
                    self.record_event(repo, created_at, Event::Quote {
                        uri: post_uri.clone(),
                        post: quoted,
                    })
                    .await;
                    classified = true;
                }
                if let Some(media) = embed.get("media") {
                    // The nested media embed cannot re-classify the post.
                    Box::pin(self.process_embed(repo, path, media, created_at, post_uri, embeds))
                        .await;
                }
                classified
            }
            Some(collections::EMBED_EXTERNAL) => {
                if let Some(external) = embed.get("external") {
                    if let Some(link) = external.get("uri").and_then(Value::as_str) {
                        embeds.push(Embed::External(link.to_owned()));
                    }
                    if let Some(thumb) = external
                        .get("thumb")
                        .and_then(|t| t.get("ref"))
                        .and_then(Value::as_cid)
                    {
                        embeds.push(Embed::Image(thumb.to_string()));
                    }
                }
                false
            }
            Some(collections::EMBED_IMAGES) => {
                if let Some(images) = embed.get("images").and_then(Value::as_array) {
                    for image in images {
                        if let Some(cid) = image
                            .get("image")
                            .and_then(|i| i.get("ref"))
                            .and_then(Value::as_cid)
                        {
                            embeds.push(Embed::Image(cid.to_string()));
                        }
                    }
                }
                false
            }
            Some(collections::EMBED_VIDEO) => {
                if let Some(cid) = embed
                    .get("video")
                    .and_then(|v| v.get("ref"))
                    .and_then(Value::as_cid)
                {
                    embeds.push(Embed::Video(cid.to_string()));
                }
                false
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Non-commit frames
    // -----------------------------------------------------------------------

    async fn handle_identity(
        &self,
        message_type: &str,
        body: &Value,
        effects: &mut MessageEffects,
    ) -> Result<(), CodecError> {
        let identity = IdentityBody::from_value(body)?;
        effects.repo = identity.did.clone();
        if let Some(handle) = &identity.handle {
            effects.path_candidates.push((
                "handle".to_owned(),
                vec![Candidate::new(message_type, "handle", handle.clone())],
            ));
            let time = parse_time(&identity.time).unwrap_or_else(Utc::now);
            self.record_event(&identity.did, time, Event::HandleChange {
                handle: handle.clone(),
            })
            .await;
        }
        info!(message_type, did = %identity.did, handle = ?identity.handle, "identity update");
        Ok(())
    }

    async fn handle_account(&self, body: &Value) -> Result<(), CodecError> {
        let account = AccountBody::from_value(body)?;
        let time = parse_time(&account.time).unwrap_or_else(Utc::now);
        let status = if account.active { "active" } else { "inactive" };
        self.metrics
            .firehose_messages
            .with_label_values(&["message", status])
            .inc();
        if account.active {
            self.record_event(&account.did, time, Event::Active).await;
        } else {
            let reason = account
                .status
                .as_deref()
                .map(DownReason::from_status)
                .unwrap_or(DownReason::Unknown);
            self.record_event(&account.did, time, Event::Inactive { reason })
                .await;
        }
        info!(did = %account.did, status, reason = ?account.status, "account update");
        Ok(())
    }

    async fn handle_tombstone(&self, body: &Value) -> Result<(), CodecError> {
        let identity = IdentityBody::from_value(body)?;
        let time = parse_time(&identity.time).unwrap_or_else(Utc::now);
        self.record_event(&identity.did, time, Event::Inactive {
            reason: DownReason::Tombstone,
        })
        .await;
        info!(did = %identity.did, "tombstone");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Matching tail
    // -----------------------------------------------------------------------

    async fn match_candidates(&self, repo: &str, path_candidates: &[(String, Vec<Candidate>)]) {
        if repo.is_empty() || path_candidates.is_empty() {
            return;
        }
        let state = self.matcher.current();
        let matches = state.all_matches_for_path_candidates(path_candidates);
        if matches.is_empty() {
            return;
        }
        let mut count = 0usize;
        for (path, results) in &matches {
            for result in results {
                count += result.keywords.len();
                info!(repo, path = %path, record_type = %result.candidate.record_type,
                    field = %result.candidate.field, keywords = ?result.keywords,
                    value = %result.candidate.value, "candidate matched");
                for keyword in &result.keywords {
                    self.metrics
                        .message_string_matches
                        .with_label_values(&[
                            &result.candidate.record_type,
                            &result.candidate.field,
                            keyword,
                        ])
                        .inc();
                }
            }
        }
        self.record_event(repo, Utc::now(), Event::Matches { count })
            .await;
        self.metrics
            .activity
            .backlog
            .with_label_values(&["action_router"])
            .inc();
        let _ = self
            .actions
            .send(AccountMatches {
                did: repo.to_owned(),
                matches,
            })
            .await;
    }

    async fn record_event(&self, did: &str, created_at: DateTime<Utc>, event: Event) {
        debug!(did, event = ?event, "activity");
        self.recorder
            .record(TimedEvent::new(did, created_at, event))
            .await;
    }
}

fn parse_time(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_parse_or_fall_back() {
        assert!(parse_time("2024-05-01T12:00:00Z").is_some());
        assert!(parse_time("2024-05-01T12:00:00.123Z").is_some());
        assert!(parse_time("yesterday").is_none());
    }
}
