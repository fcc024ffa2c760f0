//! Per-account statistics and the alert policy.
//!
//! Every counter has a factor; [`alert_needed`] fires on exponentially
//! spaced milestones (count divisible by the factor, quotient a power of
//! two), so noisy accounts surface early and then progressively less often.

use crate::lfu::LfuCache;
use crate::metrics::ActivityMetrics;
use fh_atproto::AtUri;
use fh_atproto::collections;
use tracing::info;

// Facet abuse thresholds per post, from observed 99.9th-percentile metrics.
pub const TAG_FACET_THRESHOLD: usize = 23;
pub const LINK_FACET_THRESHOLD: usize = 7;
pub const MENTION_FACET_THRESHOLD: usize = 10;
pub const TOTAL_FACET_THRESHOLD: usize = 20;

pub const EVENT_FACTOR: u64 = 500;
pub const ALERT_FACTOR: u64 = 10;
pub const POST_FACTOR: u64 = 25;

pub const REPLIED_TO_FACTOR: u64 = 50;
pub const QUOTED_FACTOR: u64 = 50;
pub const REPOSTED_FACTOR: u64 = 100;
pub const LIKED_FACTOR: u64 = 500;

pub const REPLY_FACTOR: u64 = 15;
pub const QUOTE_FACTOR: u64 = 15;
pub const REPOST_FACTOR: u64 = 25;
pub const LIKE_FACTOR: u64 = 100;

pub const CONTENT_REPLY_FACTOR: u64 = 10;
pub const CONTENT_QUOTE_FACTOR: u64 = 10;
pub const CONTENT_REPOST_FACTOR: u64 = 20;
pub const CONTENT_LIKE_FACTOR: u64 = 80;

pub const FOLLOWS_FACTOR: u64 = 500;
pub const FOLLOWED_BY_FACTOR: u64 = 125;
pub const BLOCKS_FACTOR: u64 = 50;
pub const BLOCKED_BY_FACTOR: u64 = 25;
pub const UPDATE_FACTOR: u64 = 10;
pub const DELETE_FACTOR: u64 = 25;
pub const MATCH_FACTOR: u64 = 5;

/// Content items tracked per account before LFU eviction kicks in.
pub const MAX_CONTENT_ITEMS: usize = 30;

/// True exactly when `count` is a positive multiple of `factor` and
/// `count / factor` is a power of two.
pub fn alert_needed(count: u64, factor: u64) -> bool {
    factor != 0 && count % factor == 0 && (count / factor).is_power_of_two()
}

// ---------------------------------------------------------------------------
// ContentHitCount
// ---------------------------------------------------------------------------

/// Interaction tallies for one content item, nested inside its Account.
#[derive(Debug, Default, Clone)]
pub struct ContentHitCount {
    pub likes: u64,
    pub reposts: u64,
    pub quotes: u64,
    pub replies: u64,
    alerts: u64,
    hits: u64,
}

impl ContentHitCount {
    pub fn alert(&mut self) {
        self.alerts += 1;
    }

    pub fn alerts(&self) -> u64 {
        self.alerts
    }

    pub fn hit(&mut self) {
        self.hits += 1;
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountState {
    Unknown,
    Active,
    Inactive,
}

impl AccountState {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountState::Unknown => "unknown",
            AccountState::Active => "active",
            AccountState::Inactive => "inactive",
        }
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

pub struct Account {
    did: String,
    event_count: u64,
    alert_count: u64,

    // facet abuse buckets
    tags: u64,
    links: u64,
    mentions: u64,
    facets: u64,

    posts: u64,
    replied_to: u64,
    replies: u64,
    quoted: u64,
    quotes: u64,
    reposted: u64,
    reposts: u64,
    liked: u64,
    likes: u64,

    follows: u64,
    followed_by: u64,
    blocks: u64,
    blocked_by: u64,

    state: AccountState,
    updates: u64,
    activations: u64,
    profiles: u64,
    handles: u64,
    matches: u64,

    unposts: u64,
    unlikes: u64,
    unreposts: u64,
    unfollows: u64,
    unblocks: u64,

    content: LfuCache<AtUri, ContentHitCount>,
}

impl Account {
    pub fn new(did: impl Into<String>) -> Self {
        Account {
            did: did.into(),
            event_count: 0,
            alert_count: 0,
            tags: 0,
            links: 0,
            mentions: 0,
            facets: 0,
            posts: 0,
            replied_to: 0,
            replies: 0,
            quoted: 0,
            quotes: 0,
            reposted: 0,
            reposts: 0,
            liked: 0,
            likes: 0,
            follows: 0,
            followed_by: 0,
            blocks: 0,
            blocked_by: 0,
            state: AccountState::Unknown,
            updates: 0,
            activations: 0,
            profiles: 0,
            handles: 0,
            matches: 0,
            unposts: 0,
            unlikes: 0,
            unreposts: 0,
            unfollows: 0,
            unblocks: 0,
            content: LfuCache::new(MAX_CONTENT_ITEMS),
        }
    }

    pub fn did(&self) -> &str {
        &self.did
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    pub fn alert_count(&self) -> u64 {
        self.alert_count
    }

    pub fn posts(&self) -> u64 {
        self.posts
    }

    pub fn matches(&self) -> u64 {
        self.matches
    }

    pub fn state(&self) -> AccountState {
        self.state
    }

    pub fn note_event(&mut self, metrics: &ActivityMetrics) {
        self.event_count += 1;
        if alert_needed(self.event_count, EVENT_FACTOR) {
            info!(did = %self.did, events = self.event_count, "account flagged event volume");
            metrics.alert("event_volume");
            self.alert(metrics);
        }
    }

    pub fn alert(&mut self, metrics: &ActivityMetrics) {
        self.alert_count += 1;
        if alert_needed(self.alert_count, ALERT_FACTOR) {
            info!(did = %self.did, alerts = self.alert_count, events = self.event_count,
                "account flagged alerts");
            metrics.alert("alerts");
        }
    }

    fn bump(
        &mut self,
        field: impl FnOnce(&mut Self) -> &mut u64,
        factor: u64,
        category: &'static str,
        metrics: &ActivityMetrics,
    ) {
        let counter = field(self);
        *counter += 1;
        let count = *counter;
        if alert_needed(count, factor) {
            info!(did = %self.did, category, count, "account flagged activity");
            metrics.alert(category);
            self.alert(metrics);
        }
    }

    pub fn post(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.posts, POST_FACTOR, "posts", metrics);
    }

    pub fn replied_to(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.replied_to, REPLIED_TO_FACTOR, "replied_to", metrics);
    }

    pub fn reply(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.replies, REPLY_FACTOR, "replies", metrics);
    }

    pub fn quoted(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.quoted, QUOTED_FACTOR, "quoted", metrics);
    }

    pub fn quote(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.quotes, QUOTE_FACTOR, "quotes", metrics);
    }

    pub fn reposted(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.reposted, REPOSTED_FACTOR, "reposted", metrics);
    }

    pub fn repost(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.reposts, REPOST_FACTOR, "reposts", metrics);
    }

    pub fn liked(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.liked, LIKED_FACTOR, "liked", metrics);
    }

    pub fn like(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.likes, LIKE_FACTOR, "likes", metrics);
    }

    pub fn follows(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.follows, FOLLOWS_FACTOR, "follows", metrics);
    }

    pub fn followed_by(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.followed_by, FOLLOWED_BY_FACTOR, "followed_by", metrics);
    }

    pub fn blocks(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.blocks, BLOCKS_FACTOR, "blocks", metrics);
    }

    pub fn blocked_by(&mut self, metrics: &ActivityMetrics) {
        self.bump(|a| &mut a.blocked_by, BLOCKED_BY_FACTOR, "blocked_by", metrics);
    }

    // Account-level updates share one throttle bucket across the individual
    // kinds, so churny accounts surface regardless of which field churns.
    fn updated(&mut self, metrics: &ActivityMetrics) {
        self.updates += 1;
        if alert_needed(self.updates, UPDATE_FACTOR) {
            info!(did = %self.did, updates = self.updates, profiles = self.profiles,
                handles = self.handles, activations = self.activations,
                state = self.state.as_str(), "account flagged updates");
            metrics.alert("updates");
            self.alert(metrics);
        }
    }

    pub fn activation(&mut self, active: bool, metrics: &ActivityMetrics) {
        self.state = if active {
            AccountState::Active
        } else {
            AccountState::Inactive
        };
        self.activations += 1;
        if alert_needed(self.activations, UPDATE_FACTOR) {
            info!(did = %self.did, activations = self.activations, "account flagged activations");
            metrics.alert("activations");
            self.alert(metrics);
        }
        self.updated(metrics);
    }

    pub fn handle_change(&mut self, metrics: &ActivityMetrics) {
        self.handles += 1;
        if alert_needed(self.handles, UPDATE_FACTOR) {
            info!(did = %self.did, handles = self.handles, "account flagged handle changes");
            metrics.alert("handles");
            self.alert(metrics);
        }
        self.updated(metrics);
    }

    pub fn profile(&mut self, metrics: &ActivityMetrics) {
        self.profiles += 1;
        if alert_needed(self.profiles, UPDATE_FACTOR) {
            info!(did = %self.did, profiles = self.profiles, "account flagged profile edits");
            metrics.alert("profiles");
            self.alert(metrics);
        }
        self.updated(metrics);
    }

    /// Deletions bucketed by collection; the alert throttle runs on the
    /// combined total.
    pub fn deleted(&mut self, path: &str, metrics: &ActivityMetrics) {
        if path.starts_with(collections::APP_BSKY_FEED_LIKE) {
            self.unlikes += 1;
        } else if path.starts_with(collections::APP_BSKY_FEED_POST) {
            self.unposts += 1;
        } else if path.starts_with(collections::APP_BSKY_FEED_REPOST) {
            self.unreposts += 1;
        } else if path.starts_with(collections::APP_BSKY_GRAPH_BLOCK) {
            self.unblocks += 1;
        } else if path.starts_with(collections::APP_BSKY_GRAPH_FOLLOW) {
            self.unfollows += 1;
        } else {
            // other collections not tracked
            return;
        }
        let deletes = self.unlikes + self.unposts + self.unreposts + self.unblocks + self.unfollows;
        if alert_needed(deletes, DELETE_FACTOR) {
            info!(did = %self.did, unlikes = self.unlikes, unposts = self.unposts,
                unreposts = self.unreposts, unblocks = self.unblocks,
                unfollows = self.unfollows, "account flagged deletes");
            metrics.alert("deletes");
            self.alert(metrics);
        }
    }

    pub fn add_matches(&mut self, count: usize, metrics: &ActivityMetrics) {
        let old = self.matches;
        self.matches += count as u64;
        if old == 0 || old / MATCH_FACTOR != self.matches / MATCH_FACTOR {
            info!(did = %self.did, matches = self.matches, "account flagged filter matches");
            metrics.alert("match_alert");
            self.alert(metrics);
        }
    }

    /// Facet abuse: each per-post count past its category threshold raises
    /// one category alert on the account.
    pub fn facets(&mut self, tags: usize, mentions: usize, links: usize, metrics: &ActivityMetrics) {
        if tags > TAG_FACET_THRESHOLD {
            self.tags += 1;
            info!(did = %self.did, flagged = self.tags, count = tags, "account flagged tag facets");
            metrics.alert("tag_facets");
            self.alert(metrics);
        }
        if mentions > MENTION_FACET_THRESHOLD {
            self.mentions += 1;
            info!(did = %self.did, flagged = self.mentions, count = mentions,
                "account flagged mention facets");
            metrics.alert("mention_facets");
            self.alert(metrics);
        }
        if links > LINK_FACET_THRESHOLD {
            self.links += 1;
            info!(did = %self.did, flagged = self.links, count = links,
                "account flagged link facets");
            metrics.alert("link_facets");
            self.alert(metrics);
        }
        let total = tags + mentions + links;
        if total > TOTAL_FACET_THRESHOLD {
            self.facets += 1;
            info!(did = %self.did, flagged = self.facets, count = total,
                "account flagged total facets");
            metrics.alert("all_facets");
            self.alert(metrics);
        }
    }

    /// Get-or-insert the nested content counter, bumping its hit count.
    /// An eviction with alerts is summarized before the entry drops.
    pub fn content_item(
        &mut self,
        uri: &AtUri,
        metrics: &ActivityMetrics,
    ) -> &mut ContentHitCount {
        let did = self.did.clone();
        let (evicted, entry) = self
            .content
            .get_or_insert_with(uri.clone(), ContentHitCount::default);
        if let Some((old_uri, old)) = evicted {
            metrics.cached_items.with_label_values(&["content"]).dec();
            if old.alerts() > 0 {
                info!(did = %did, uri = %old_uri, alerts = old.alerts(), hits = old.hits(),
                    "content item evicted with alerts");
                metrics
                    .evictions
                    .with_label_values(&["content", "flagged"])
                    .inc();
            } else {
                metrics
                    .evictions
                    .with_label_values(&["content", "clean"])
                    .inc();
            }
        }
        if entry.hits() == 0 {
            metrics.cached_items.with_label_values(&["content"]).inc();
        }
        entry.hit();
        entry
    }
}
