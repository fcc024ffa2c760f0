//! Routes matched accounts to the report agent and list manager.
//!
//! Dedupe happens here: accounts the moderation service already handled
//! (ozone view) or that this instance already reported in memory are
//! skipped. Surviving matches are grouped by record path, filtered by each
//! rule's content scope, and forwarded with the filter strings, paths, and
//! any auto-label values.

use crate::controller::Controller;
use crate::metrics::Metrics;
use crate::moderation::list_manager::BlockListAddition;
use crate::moderation::ozone::OzoneAdapter;
use crate::moderation::report_agent::{AccountReport, ReportContent};
use fh_atproto::collections::APP_BSKY_ACTOR_PROFILE;
use fh_matcher::{ContentScope, MatcherStore, PathMatches};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Small queue: each item fans out to HTTP work downstream.
pub const QUEUE_LIMIT: usize = 1000;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

/// One account with its per-path match results.
#[derive(Debug, Clone)]
pub struct AccountMatches {
    pub did: String,
    pub matches: PathMatches,
}

pub struct ActionRouter {
    matcher: Arc<MatcherStore>,
    ozone: Arc<OzoneAdapter>,
    metrics: Arc<Metrics>,
    report_tx: mpsc::Sender<AccountReport>,
    list_tx: mpsc::Sender<BlockListAddition>,
    reported: HashSet<String>,
}

impl ActionRouter {
    pub fn new(
        matcher: Arc<MatcherStore>,
        ozone: Arc<OzoneAdapter>,
        metrics: Arc<Metrics>,
        report_tx: mpsc::Sender<AccountReport>,
        list_tx: mpsc::Sender<BlockListAddition>,
    ) -> Self {
        ActionRouter {
            matcher,
            ozone,
            metrics,
            report_tx,
            list_tx,
            reported: HashSet::new(),
        }
    }

    pub fn start(
        mut self,
        mut rx: mpsc::Receiver<AccountMatches>,
        controller: Controller,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while controller.is_active() {
                // Timed dequeue so the loop observes shutdown.
                match tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()).await {
                    Ok(Some(item)) => {
                        self.metrics
                            .activity
                            .backlog
                            .with_label_values(&["action_router"])
                            .dec();
                        self.route(item).await;
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }
            }
            info!("action router stopping");
        })
    }

    pub async fn route(&mut self, item: AccountMatches) {
        if self.ozone.already_processed(&item.did) || self.reported.contains(&item.did) {
            info!(did = %item.did, "report skipped, already known");
            self.metrics
                .auto_reports
                .with_label_values(&["skipped"])
                .inc();
            return;
        }

        let state = self.matcher.current();
        let mut paths = Vec::new();
        let mut all_filters = Vec::new();
        let mut labels = Vec::new();
        for (path, results) in &item.matches {
            let mut filters = Vec::new();
            for result in results {
                for keyword in &result.keywords {
                    let Some(rule) = state.find_rule(keyword) else {
                        // The rule set refreshed between match and routing.
                        debug!(keyword = %keyword, "rule no longer installed");
                        continue;
                    };
                    if let Some(group) = &rule.block_group {
                        let _ = self
                            .list_tx
                            .send(BlockListAddition {
                                did: item.did.clone(),
                                group: group.clone(),
                            })
                            .await;
                    }
                    if !rule.report && !rule.label {
                        continue;
                    }
                    let in_scope = match rule.scope {
                        ContentScope::Any => true,
                        ContentScope::Profile => {
                            result.candidate.record_type == APP_BSKY_ACTOR_PROFILE
                        }
                    };
                    if !in_scope {
                        continue;
                    }
                    filters.push(rule.target.clone());
                    if rule.label {
                        labels.extend(rule.labels.iter().cloned());
                    }
                }
            }
            if !filters.is_empty() {
                paths.push(path.clone());
                all_filters.append(&mut filters);
            }
        }

        if all_filters.is_empty() {
            return;
        }
        labels.sort();
        labels.dedup();
        self.reported.insert(item.did.clone());
        self.metrics
            .auto_reports
            .with_label_values(&["submitted"])
            .inc();
        let _ = self
            .report_tx
            .send(AccountReport {
                did: item.did,
                content: ReportContent::FilterMatches {
                    filters: all_filters,
                    paths,
                    labels,
                },
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fh_matcher::{Candidate, MatchResult, MatcherBuilder};

    fn matcher_with(rules: &[&str]) -> Arc<MatcherStore> {
        let store = MatcherStore::new(true);
        let mut builder = MatcherBuilder::new();
        for rule in rules {
            builder.add_rule_text(rule).unwrap();
        }
        store.install(builder.build().unwrap());
        Arc::new(store)
    }

    fn match_item(did: &str, record_type: &str, keyword: &str) -> AccountMatches {
        AccountMatches {
            did: did.to_owned(),
            matches: vec![(
                format!("{record_type}/3k"),
                vec![MatchResult {
                    candidate: Candidate::new(record_type, "text", "matched text"),
                    keywords: vec![keyword.to_owned()],
                }],
            )],
        }
    }

    fn router(
        matcher: Arc<MatcherStore>,
        ozone: OzoneAdapter,
    ) -> (
        ActionRouter,
        mpsc::Receiver<AccountReport>,
        mpsc::Receiver<BlockListAddition>,
    ) {
        let (report_tx, report_rx) = mpsc::channel(8);
        let (list_tx, list_rx) = mpsc::channel(8);
        let router = ActionRouter::new(
            matcher,
            Arc::new(ozone),
            Arc::new(Metrics::register().unwrap()),
            report_tx,
            list_tx,
        );
        (router, report_rx, list_rx)
    }

    #[tokio::test]
    async fn reportable_match_reaches_the_agent() {
        let matcher =
            matcher_with(&["Хохол|slur|track=true,report=true,match=substring|"]);
        let keyword = fh_atproto::fold::canonicalize("Хохол");
        let (mut router, mut report_rx, _list_rx) =
            router(matcher, OzoneAdapter::for_tests(&[], &[]));

        router
            .route(match_item("did:plc:offender", "app.bsky.feed.post", &keyword))
            .await;
        let report = report_rx.try_recv().unwrap();
        assert_eq!(report.did, "did:plc:offender");
        match report.content {
            ReportContent::FilterMatches { filters, paths, .. } => {
                assert_eq!(filters, vec!["Хохол"]);
                assert_eq!(paths, vec!["app.bsky.feed.post/3k"]);
            }
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[tokio::test]
    async fn already_labeled_accounts_are_skipped() {
        let matcher = matcher_with(&["slur|bad|track=true,report=true,match=substring|"]);
        let (mut router, mut report_rx, _list_rx) = router(
            matcher,
            OzoneAdapter::for_tests(&["did:plc:offender"], &[]),
        );
        router
            .route(match_item("did:plc:offender", "app.bsky.feed.post", "slur"))
            .await;
        assert!(report_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn in_memory_dedupe_reports_once() {
        let matcher = matcher_with(&["slur|bad|track=true,report=true,match=substring|"]);
        let (mut router, mut report_rx, _list_rx) =
            router(matcher, OzoneAdapter::for_tests(&[], &[]));
        router
            .route(match_item("did:plc:offender", "app.bsky.feed.post", "slur"))
            .await;
        router
            .route(match_item("did:plc:offender", "app.bsky.feed.post", "slur"))
            .await;
        assert!(report_rx.try_recv().is_ok());
        assert!(report_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn profile_scoped_rules_ignore_post_matches() {
        let matcher =
            matcher_with(&["symbol|hate|track=true,report=true,scope=profile,match=substring|"]);
        let (mut router, mut report_rx, _list_rx) =
            router(matcher, OzoneAdapter::for_tests(&[], &[]));
        router
            .route(match_item("did:plc:poster", "app.bsky.feed.post", "symbol"))
            .await;
        assert!(report_rx.try_recv().is_err());
        router
            .route(match_item(
                "did:plc:poster",
                "app.bsky.actor.profile",
                "symbol",
            ))
            .await;
        assert!(report_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn block_group_rules_feed_the_list_manager() {
        let matcher =
            matcher_with(&["symbol|hate|track=true,report=true,block=hate,match=substring|"]);
        let (mut router, _report_rx, mut list_rx) =
            router(matcher, OzoneAdapter::for_tests(&[], &[]));
        router
            .route(match_item("did:plc:poster", "app.bsky.feed.post", "symbol"))
            .await;
        let addition = list_rx.try_recv().unwrap();
        assert_eq!(addition.did, "did:plc:poster");
        assert_eq!(addition.group, "hate");
    }

    #[tokio::test]
    async fn label_rules_attach_sorted_deduped_labels() {
        let matcher = matcher_with(&[
            "alpha|l2,l1|track=true,label=true,match=substring|",
            "beta|l1|track=true,label=true,match=substring|",
        ]);
        let (mut router, mut report_rx, _list_rx) =
            router(matcher, OzoneAdapter::for_tests(&[], &[]));
        let item = AccountMatches {
            did: "did:plc:poster".to_owned(),
            matches: vec![(
                "app.bsky.feed.post/3k".to_owned(),
                vec![MatchResult {
                    candidate: Candidate::new("app.bsky.feed.post", "text", "alpha beta"),
                    keywords: vec!["alpha".to_owned(), "beta".to_owned()],
                }],
            )],
        };
        router.route(item).await;
        match report_rx.try_recv().unwrap().content {
            ReportContent::FilterMatches { labels, .. } => {
                assert_eq!(labels, vec!["l1", "l2"]);
            }
            other => panic!("unexpected content {other:?}"),
        }
    }
}
