//! Embed and link analysis.
//!
//! A worker pool drains batches of embeds extracted from posts. Image,
//! video, and record embeds get repetition counting only; external URLs
//! additionally get redirect-chain resolution (when enabled) with a hard
//! hop cap, per-hop rule matching, and a host allowlist refreshed from the
//! auxiliary store.

use crate::client::http_client_builder;
use crate::controller::Controller;
use crate::metrics::Metrics;
use crate::moderation::action_router::AccountMatches;
use crate::moderation::report_agent::{AccountReport, ReportContent};
use fh_activity::{LfuCache, alert_needed};
use fh_matcher::{Candidate, MatcherStore};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Queued items are small; a deep backlog lets bursty commits drain slowly
/// while create-rate limits are respected downstream.
pub const QUEUE_LIMIT: usize = 50_000;
pub const URL_REDIRECT_LIMIT: usize = 10;
pub const DEFAULT_WORKERS: usize = 5;
const MAX_HOSTS: usize = 10_000;
const HOSTS_OF_INTEREST: usize = 250;
const HOST_DUMP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

const IMAGE_FACTOR: u64 = 5;
const LINK_FACTOR: u64 = 5;
const RECORD_FACTOR: u64 = 5;
const VIDEO_FACTOR: u64 = 5;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36";

/// Trailing ellipsis the web app appends to truncated link text.
const URL_SUFFIX: &str = "\u{2026}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Embed {
    External(String),
    Image(String),
    Record(String),
    Video(String),
}

#[derive(Debug, Clone)]
pub struct EmbedBatch {
    pub did: String,
    pub path: String,
    pub embeds: Vec<Embed>,
}

struct CheckerState {
    checked_uris: HashMap<String, u64>,
    checked_images: HashMap<String, u64>,
    checked_records: HashMap<String, u64>,
    checked_videos: HashMap<String, u64>,
    popular_hosts: HashSet<String>,
    observed_hosts: LfuCache<String, u64>,
    last_host_dump: Instant,
    ready: bool,
}

pub struct EmbedChecker {
    follow_links: bool,
    matcher: Arc<MatcherStore>,
    metrics: Arc<Metrics>,
    report_tx: mpsc::Sender<AccountReport>,
    action_tx: mpsc::Sender<AccountMatches>,
    // Shared with redirect-policy closures, which run inside reqwest.
    state: Arc<Mutex<CheckerState>>,
}

impl EmbedChecker {
    pub fn new(
        follow_links: bool,
        matcher: Arc<MatcherStore>,
        metrics: Arc<Metrics>,
        report_tx: mpsc::Sender<AccountReport>,
        action_tx: mpsc::Sender<AccountMatches>,
    ) -> Self {
        EmbedChecker {
            follow_links,
            matcher,
            metrics,
            report_tx,
            action_tx,
            state: Arc::new(Mutex::new(CheckerState {
                checked_uris: HashMap::new(),
                checked_images: HashMap::new(),
                checked_records: HashMap::new(),
                checked_videos: HashMap::new(),
                popular_hosts: HashSet::new(),
                observed_hosts: LfuCache::new(MAX_HOSTS),
                last_host_dump: Instant::now(),
                ready: false,
            })),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().expect("checker lock poisoned").ready
    }

    /// Spawn the worker pool over one shared receiver.
    pub fn start(
        self: Arc<Self>,
        rx: mpsc::Receiver<EmbedBatch>,
        workers: usize,
        controller: Controller,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        (0..workers.max(1))
            .map(|worker| {
                let checker = self.clone();
                let rx = rx.clone();
                let controller = controller.clone();
                tokio::spawn(async move {
                    while controller.is_active() {
                        let item = {
                            let mut guard = rx.lock().await;
                            tokio::time::timeout(DEQUEUE_TIMEOUT, guard.recv()).await
                        };
                        match item {
                            Ok(Some(batch)) => {
                                checker
                                    .metrics
                                    .activity
                                    .backlog
                                    .with_label_values(&["embed_checker"])
                                    .dec();
                                checker.handle_batch(batch).await;
                            }
                            Ok(None) => break,
                            Err(_) => {}
                        }
                    }
                    info!(worker, "embed worker stopping");
                })
            })
            .collect()
    }

    async fn handle_batch(&self, batch: EmbedBatch) {
        for embed in &batch.embeds {
            match embed {
                Embed::Image(cid) => self.image_seen(&batch.did, &batch.path, cid),
                Embed::Record(uri) => self.record_seen(&batch.did, &batch.path, uri),
                Embed::Video(cid) => self.video_seen(&batch.did, &batch.path, cid),
                Embed::External(uri) => {
                    self.handle_external(&batch.did, &batch.path, uri).await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Repetition counting
    // -----------------------------------------------------------------------

    pub fn image_seen(&self, did: &str, path: &str, cid: &str) {
        repetition(
            &self.state,
            &self.metrics,
            |s| &mut s.checked_images,
            cid,
            "images",
            IMAGE_FACTOR,
            did,
            path,
        );
    }

    pub fn record_seen(&self, did: &str, path: &str, uri: &str) {
        repetition(
            &self.state,
            &self.metrics,
            |s| &mut s.checked_records,
            uri,
            "records",
            RECORD_FACTOR,
            did,
            path,
        );
    }

    pub fn video_seen(&self, did: &str, path: &str, cid: &str) {
        repetition(
            &self.state,
            &self.metrics,
            |s| &mut s.checked_videos,
            cid,
            "videos",
            VIDEO_FACTOR,
            did,
            path,
        );
    }

    pub fn uri_seen(&self, did: &str, path: &str, uri: &str) -> bool {
        repetition(
            &self.state,
            &self.metrics,
            |s| &mut s.checked_uris,
            uri,
            "links",
            LINK_FACTOR,
            did,
            path,
        )
    }

    // -----------------------------------------------------------------------
    // Host allowlist
    // -----------------------------------------------------------------------

    /// Replace the allowlist from the auxiliary store, logging the delta.
    pub fn refresh_hosts(&self, new_hosts: HashSet<String>) {
        let mut state = self.state.lock().expect("checker lock poisoned");
        for removed in state.popular_hosts.difference(&new_hosts) {
            info!(host = %removed, "hot-site refresh: removed");
        }
        for added in new_hosts.difference(&state.popular_hosts) {
            info!(host = %added, "hot-site refresh: added");
        }
        state.popular_hosts = new_hosts;
        state.ready = true;
    }

    /// Track observation counts per host and dump the busiest hosts hourly;
    /// returns allowlist membership.
    pub fn is_popular_host(&self, host: &str) -> bool {
        is_popular_host(&self.state, host)
    }

    /// Well-formedness and allowlist gate for external URLs. Returns the
    /// cleaned URL to fetch, or `None` when the link should be skipped.
    pub fn should_process_uri(&self, uri: &str) -> Option<String> {
        let target = uri.strip_suffix(URL_SUFFIX).unwrap_or(uri);
        let parsed = match reqwest::Url::parse(target) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(uri, error = %e, "skipping malformed link");
                self.metrics
                    .embedded_content
                    .with_label_values(&["links", "malformed"])
                    .inc();
                return None;
            }
        };
        let Some(host) = parsed.host_str() else {
            self.metrics
                .embedded_content
                .with_label_values(&["links", "malformed"])
                .inc();
            return None;
        };
        if self.is_popular_host(host) {
            self.metrics
                .embedded_content
                .with_label_values(&["links", "whitelist_skipped"])
                .inc();
            return None;
        }
        Some(target.to_owned())
    }

    // -----------------------------------------------------------------------
    // External URL resolution
    // -----------------------------------------------------------------------

    async fn handle_external(&self, did: &str, path: &str, uri: &str) {
        if self.uri_seen(did, path, uri) {
            return;
        }
        let Some(target) = self.should_process_uri(uri) else {
            return;
        };
        if !self.follow_links {
            // Chain resolution needs fast DNS; leave it off unless enabled.
            return;
        }
        self.check_redirects(did, path, target).await;
    }

    async fn check_redirects(&self, did: &str, path: &str, root_url: String) {
        info!(url = %root_url, "redirect check starting");
        let chain = Arc::new(Mutex::new(vec![root_url.clone()]));
        let hop_hits: Arc<Mutex<Vec<(String, Vec<fh_matcher::MatchResult>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let matcher_state = self.matcher.current();
        let policy_state = self.state.clone();
        let policy_metrics = self.metrics.clone();
        let policy_chain = chain.clone();
        let policy_hits = hop_hits.clone();
        let policy_did = did.to_owned();
        let policy_path = path.to_owned();
        let policy_root = root_url.clone();

        let policy = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() > URL_REDIRECT_LIMIT {
                return attempt.error("redirect limit exceeded");
            }
            let hop = attempt.url().to_string();
            policy_chain
                .lock()
                .expect("chain lock poisoned")
                .push(hop.clone());
            policy_metrics
                .embedded_content
                .with_label_values(&["links", "redirections"])
                .inc();
            // Redirect targets are themselves match candidates.
            let candidates = [Candidate::new(
                policy_root.clone(),
                "redirected_url",
                hop.clone(),
            )];
            let results = matcher_state.all_matches_for_candidates(&candidates);
            if !results.is_empty() {
                policy_hits
                    .lock()
                    .expect("hits lock poisoned")
                    .push((hop.clone(), results));
            }
            // A hop that is already counted or allowlisted ends the chase.
            let host_allowlisted = attempt
                .url()
                .host_str()
                .is_some_and(|host| is_popular_host(&policy_state, host));
            let seen = repetition(
                &policy_state,
                &policy_metrics,
                |s| &mut s.checked_uris,
                &hop,
                "links",
                LINK_FACTOR,
                &policy_did,
                &policy_path,
            );
            if seen || host_allowlisted {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let outcome = match http_client_builder()
            .redirect(policy)
            // Connections are promiscuous here; keep the pool short-lived.
            .pool_idle_timeout(Duration::from_secs(5))
            .user_agent(BROWSER_USER_AGENT)
            .build()
        {
            Ok(client) => {
                client
                    .get(&root_url)
                    .header(
                        "Accept",
                        "text/html,application/xhtml+xml,application/xml;q=0.9,\
                         image/avif,image/webp,image/apng,*/*;q=0.8",
                    )
                    .header("Accept-Language", "en-US,en;q=0.9")
                    .send()
                    .await
            }
            Err(e) => {
                warn!(url = %root_url, error = %e, "redirect client build failed");
                return;
            }
        };

        let final_chain = chain.lock().expect("chain lock poisoned").clone();
        match outcome {
            Ok(_) => {
                self.metrics
                    .embedded_content
                    .with_label_values(&["links", "redirect_ok"])
                    .inc();
            }
            Err(e) if e.is_redirect() => {
                warn!(url = %root_url, hops = final_chain.len(), "redirect limit exceeded");
                self.metrics
                    .embedded_content
                    .with_label_values(&["links", "redirect_limit_exceeded"])
                    .inc();
                let _ = self
                    .report_tx
                    .send(AccountReport {
                        did: did.to_owned(),
                        content: ReportContent::LinkRedirection {
                            path: path.to_owned(),
                            uris: final_chain.clone(),
                        },
                    })
                    .await;
            }
            Err(e) => {
                warn!(url = %root_url, error = %e, "redirect check failed");
                self.metrics
                    .embedded_content
                    .with_label_values(&["links", "redirect_error"])
                    .inc();
            }
        }
        self.metrics
            .web_links_hops
            .with_label_values(&["hops"])
            .observe(final_chain.len() as f64);
        info!(url = %root_url, hops = final_chain.len(), "redirect check complete");

        let hits = std::mem::take(&mut *hop_hits.lock().expect("hits lock poisoned"));
        for (hop, results) in hits {
            info!(url = %hop, "redirect hop matched rules");
            self.metrics
                .embedded_content
                .with_label_values(&["links", "redirect_matched_rule"])
                .inc();
            let _ = self
                .action_tx
                .send(AccountMatches {
                    did: did.to_owned(),
                    matches: vec![(path.to_owned(), results)],
                })
                .await;
        }
    }
}

// ---------------------------------------------------------------------------
// Shared-state helpers (also reachable from redirect-policy closures)
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn repetition(
    state: &Mutex<CheckerState>,
    metrics: &Metrics,
    bucket: impl FnOnce(&mut CheckerState) -> &mut HashMap<String, u64>,
    key: &str,
    kind: &'static str,
    factor: u64,
    did: &str,
    path: &str,
) -> bool {
    metrics
        .embedded_content
        .with_label_values(&[kind, "checks"])
        .inc();
    let mut state = state.lock().expect("checker lock poisoned");
    let count = bucket(&mut state).entry(key.to_owned()).or_insert(0);
    *count += 1;
    let count = *count;
    drop(state);
    if count > 1 && alert_needed(count, factor) {
        info!(count, key, did, path, kind, "embed repetition");
        metrics
            .embedded_content
            .with_label_values(&[kind, "repetition"])
            .inc();
    }
    count > 1
}

fn is_popular_host(state: &Mutex<CheckerState>, host: &str) -> bool {
    let mut state = state.lock().expect("checker lock poisoned");
    let (_, count) = state
        .observed_hosts
        .get_or_insert_with(host.to_owned(), || 0);
    *count += 1;
    if state.last_host_dump.elapsed() > HOST_DUMP_INTERVAL {
        state.last_host_dump = Instant::now();
        let mut hot: Vec<(u64, String)> = state
            .observed_hosts
            .iter()
            .map(|(host, count)| (*count, host.clone()))
            .collect();
        hot.sort_by(|a, b| b.cmp(a));
        for (count, host) in hot.into_iter().take(HOSTS_OF_INTEREST) {
            info!(count, host = %host, "embed host observations");
        }
    }
    state.popular_hosts.contains(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(
        follow_links: bool,
    ) -> (
        Arc<EmbedChecker>,
        mpsc::Receiver<AccountReport>,
        mpsc::Receiver<AccountMatches>,
    ) {
        let (report_tx, report_rx) = mpsc::channel(8);
        let (action_tx, action_rx) = mpsc::channel(8);
        let checker = Arc::new(EmbedChecker::new(
            follow_links,
            Arc::new(MatcherStore::new(true)),
            Arc::new(Metrics::register().unwrap()),
            report_tx,
            action_tx,
        ));
        (checker, report_rx, action_rx)
    }

    #[test]
    fn uri_repetition_is_detected() {
        let (checker, _r, _a) = checker(false);
        assert!(!checker.uri_seen("did:plc:a", "p", "https://x.example/1"));
        assert!(checker.uri_seen("did:plc:a", "p", "https://x.example/1"));
        assert!(!checker.uri_seen("did:plc:a", "p", "https://x.example/2"));
    }

    #[test]
    fn malformed_uris_are_skipped() {
        let (checker, _r, _a) = checker(false);
        assert!(checker.should_process_uri("not a url").is_none());
        assert!(checker.should_process_uri("https://ok.example/path").is_some());
    }

    #[test]
    fn trailing_ellipsis_is_stripped() {
        let (checker, _r, _a) = checker(false);
        let cleaned = checker
            .should_process_uri("https://ok.example/path\u{2026}")
            .unwrap();
        assert_eq!(cleaned, "https://ok.example/path");
    }

    #[test]
    fn allowlisted_hosts_are_skipped() {
        let (checker, _r, _a) = checker(false);
        checker.refresh_hosts(["popular.example".to_owned()].into_iter().collect());
        assert!(checker.is_ready());
        assert!(
            checker
                .should_process_uri("https://popular.example/anything")
                .is_none()
        );
        assert!(
            checker
                .should_process_uri("https://obscure.example/anything")
                .is_some()
        );
    }

    #[test]
    fn host_refresh_replaces_the_set() {
        let (checker, _r, _a) = checker(false);
        checker.refresh_hosts(["a.example".to_owned()].into_iter().collect());
        checker.refresh_hosts(["b.example".to_owned()].into_iter().collect());
        assert!(!checker.is_popular_host("a.example"));
        assert!(checker.is_popular_host("b.example"));
    }

    #[tokio::test]
    async fn image_and_record_embeds_only_count() {
        let (checker, mut report_rx, mut action_rx) = checker(true);
        checker
            .handle_batch(EmbedBatch {
                did: "did:plc:a".to_owned(),
                path: "app.bsky.feed.post/3k".to_owned(),
                embeds: vec![
                    Embed::Image("bafyimage".to_owned()),
                    Embed::Record("at://did:plc:b/app.bsky.feed.post/3x".to_owned()),
                    Embed::Video("bafyvideo".to_owned()),
                ],
            })
            .await;
        assert!(report_rx.try_recv().is_err());
        assert!(action_rx.try_recv().is_err());
    }
}
