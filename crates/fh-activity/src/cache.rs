//! The per-account event cache.
//!
//! Owned exclusively by the recorder task, so all mutation is serialized
//! without a lock. Events that reference another account (replies, likes,
//! follows, blocks, …) also touch the target account's counters and the
//! target content item's hit counts.

use crate::account::{
    Account, CONTENT_LIKE_FACTOR, CONTENT_QUOTE_FACTOR, CONTENT_REPLY_FACTOR,
    CONTENT_REPOST_FACTOR, alert_needed,
};
use crate::events::{Event, TimedEvent};
use crate::lfu::LfuCache;
use crate::metrics::ActivityMetrics;
use fh_atproto::AtUri;
use std::sync::Arc;
use tracing::info;

/// Accounts tracked before LFU eviction kicks in.
pub const MAX_ACCOUNTS: usize = 250_000;

/// Side effects the cache cannot perform itself; the recorder forwards them
/// to the moderation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The account blocked the moderation service itself.
    BlocksModeration { did: String },
}

pub struct EventCache {
    accounts: LfuCache<String, Account>,
    metrics: Arc<ActivityMetrics>,
    /// The moderation service's own did; blocks against it are escalated.
    service_did: Option<String>,
}

impl EventCache {
    pub fn new(metrics: Arc<ActivityMetrics>, service_did: Option<String>) -> Self {
        Self::with_capacity(MAX_ACCOUNTS, metrics, service_did)
    }

    pub fn with_capacity(
        capacity: usize,
        metrics: Arc<ActivityMetrics>,
        service_did: Option<String>,
    ) -> Self {
        EventCache {
            accounts: LfuCache::new(capacity),
            metrics,
            service_did,
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Look up an account without creating it (tests and summaries).
    pub fn peek(&self, did: &str) -> Option<&Account> {
        self.accounts.iter().find(|(k, _)| *k == did).map(|(_, v)| v)
    }

    /// Return the existing account or create an empty one, handling any
    /// eviction summary.
    pub fn get_account(&mut self, did: &str) -> &mut Account {
        let metrics = self.metrics.clone();
        let existed = self.accounts.contains(&did.to_owned());
        let (evicted, account) = self
            .accounts
            .get_or_insert_with(did.to_owned(), || Account::new(did));
        if !existed {
            metrics.cached_items.with_label_values(&["account"]).inc();
        }
        if let Some((old_did, old)) = evicted {
            metrics.cached_items.with_label_values(&["account"]).dec();
            if old.alert_count() > 0 {
                info!(did = %old_did, alerts = old.alert_count(), events = old.event_count(),
                    "account evicted with alerts");
                metrics
                    .evictions
                    .with_label_values(&["account", "flagged"])
                    .inc();
            } else {
                metrics
                    .evictions
                    .with_label_values(&["account", "clean"])
                    .inc();
            }
        }
        account
    }

    /// Record one event, returning any escalations for the moderation
    /// layer.
    pub fn record(&mut self, event: TimedEvent) -> Vec<Outcome> {
        let metrics = self.metrics.clone();
        let mut outcomes = Vec::new();
        let did = event.did.clone();
        match &event.event {
            Event::Post { .. } => self.get_account(&did).post(&metrics),
            Event::Reply { root, parent, .. } => {
                self.reply_to(parent, &metrics);
                if root != parent {
                    self.reply_to(root, &metrics);
                }
                self.get_account(&did).reply(&metrics);
            }
            Event::Quote { post, .. } => {
                let alerted = {
                    let author = self.get_account(&post.authority);
                    author.quoted(&metrics);
                    let content = author.content_item(post, &metrics);
                    content.quotes += 1;
                    if alert_needed(content.quotes, CONTENT_QUOTE_FACTOR) {
                        content.alert();
                        info!(did = %post.authority, uri = %post, quotes = content.quotes,
                            "content flagged quotes");
                        metrics.alert("content_quotes");
                        true
                    } else {
                        false
                    }
                };
                let source = self.get_account(&did);
                if alerted {
                    source.alert(&metrics);
                }
                source.quote(&metrics);
            }
            Event::Repost { post, .. } => {
                let alerted = {
                    let author = self.get_account(&post.authority);
                    author.reposted(&metrics);
                    let content = author.content_item(post, &metrics);
                    content.reposts += 1;
                    if alert_needed(content.reposts, CONTENT_REPOST_FACTOR) {
                        content.alert();
                        info!(did = %post.authority, uri = %post, reposts = content.reposts,
                            "content flagged reposts");
                        metrics.alert("content_reposts");
                        true
                    } else {
                        false
                    }
                };
                let source = self.get_account(&did);
                if alerted {
                    source.alert(&metrics);
                }
                source.repost(&metrics);
            }
            Event::Like { content: uri, .. } => {
                let alerted = {
                    let author = self.get_account(&uri.authority);
                    author.liked(&metrics);
                    let content = author.content_item(uri, &metrics);
                    content.likes += 1;
                    if alert_needed(content.likes, CONTENT_LIKE_FACTOR) {
                        content.alert();
                        info!(did = %uri.authority, uri = %uri, likes = content.likes,
                            "content flagged likes");
                        metrics.alert("content_likes");
                        true
                    } else {
                        false
                    }
                };
                let source = self.get_account(&did);
                if alerted {
                    source.alert(&metrics);
                }
                source.like(&metrics);
            }
            Event::Follow { followed } => {
                self.get_account(&did).follows(&metrics);
                self.get_account(followed).followed_by(&metrics);
            }
            Event::Block { blocked } => {
                self.get_account(&did).blocks(&metrics);
                self.get_account(blocked).blocked_by(&metrics);
                if self.service_did.as_deref() == Some(blocked.as_str()) {
                    outcomes.push(Outcome::BlocksModeration { did: did.clone() });
                }
            }
            Event::Active => self.get_account(&did).activation(true, &metrics),
            Event::Inactive { reason } => {
                info!(did = %did, reason = reason.as_str(), "account inactive");
                self.get_account(&did).activation(false, &metrics);
            }
            Event::HandleChange { handle } => {
                info!(did = %did, handle = %handle, "handle change");
                self.get_account(&did).handle_change(&metrics);
            }
            Event::Profile { .. } => self.get_account(&did).profile(&metrics),
            Event::Deleted { path } => self.get_account(&did).deleted(path, &metrics),
            Event::Matches { count } => self.get_account(&did).add_matches(*count, &metrics),
            Event::Facets {
                tags,
                mentions,
                links,
            } => self
                .get_account(&did)
                .facets(*tags, *mentions, *links, &metrics),
        }
        self.get_account(&did).note_event(&metrics);
        outcomes
    }

    fn reply_to(&mut self, uri: &AtUri, metrics: &ActivityMetrics) {
        let author = self.get_account(&uri.authority);
        author.replied_to(metrics);
        let content = author.content_item(uri, metrics);
        content.replies += 1;
        if alert_needed(content.replies, CONTENT_REPLY_FACTOR) {
            content.alert();
            info!(did = %uri.authority, uri = %uri, replies = content.replies,
                "content flagged replies");
            metrics.alert("content_replies");
            author.alert(metrics);
        }
    }
}
