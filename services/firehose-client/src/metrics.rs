//! Process-wide Prometheus instruments.
//!
//! One registry owns everything, including the activity-layer instruments.
//! Exposition is a collaborator's concern; `metrics.port` is accepted in
//! config and the registry is available for whatever scrapes it.

use fh_activity::ActivityMetrics;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

pub struct Metrics {
    pub registry: Registry,
    pub activity: ActivityMetrics,

    /// Inbound WebSocket traffic.
    pub websocket_messages: IntCounter,
    pub websocket_bytes: IntCounter,

    /// Frames by op and message type.
    pub firehose_messages: IntCounterVec,
    /// Commit operations by collection and kind.
    pub firehose_collections: IntCounterVec,
    /// Decode problems by error kind.
    pub firehose_errors: IntCounterVec,
    /// Facet counts per post, by facet type.
    pub firehose_facets: HistogramVec,

    /// Rule hits by candidate type, field, and filter.
    pub message_string_matches: IntCounterVec,
    /// Report dispositions (submitted, skipped, dry_run, failed).
    pub auto_reports: IntCounterVec,
    /// Embed checks by embed kind and outcome.
    pub embedded_content: IntCounterVec,
    /// Redirect chain lengths.
    pub web_links_hops: HistogramVec,
    /// Block-list operations by group.
    pub automation: IntCounterVec,
}

impl Metrics {
    pub fn register() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let activity = ActivityMetrics::register(&registry)?;

        let websocket_messages = IntCounter::new(
            "websocket_inbound_messages",
            "Number of inbound messages",
        )?;
        let websocket_bytes =
            IntCounter::new("websocket_inbound_bytes", "Number of inbound message bytes")?;
        let firehose_messages = IntCounterVec::new(
            Opts::new("firehose_messages", "Frames by op and type"),
            &["op", "type"],
        )?;
        let firehose_collections = IntCounterVec::new(
            Opts::new("firehose_collections", "Commit ops by collection and kind"),
            &["collection", "kind"],
        )?;
        let firehose_errors = IntCounterVec::new(
            Opts::new("firehose_errors", "Decode failures by kind"),
            &["kind"],
        )?;
        let firehose_facets = HistogramVec::new(
            HistogramOpts::new("firehose_facets", "Facet counts per post")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 30.0, 50.0]),
            &["facet"],
        )?;
        let message_string_matches = IntCounterVec::new(
            Opts::new("message_string_matches", "Rule hits on candidate fields"),
            &["type", "field", "filter"],
        )?;
        let auto_reports = IntCounterVec::new(
            Opts::new("auto_reports", "Automatic report dispositions"),
            &["outcome"],
        )?;
        let embedded_content = IntCounterVec::new(
            Opts::new("embedded_content", "Embed checks by kind and outcome"),
            &["kind", "outcome"],
        )?;
        let web_links_hops = HistogramVec::new(
            HistogramOpts::new("web_links", "Link redirection statistics").buckets(vec![
                0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0,
            ]),
            &["redirection"],
        )?;
        let automation = IntCounterVec::new(
            Opts::new("automation", "Block-list operations"),
            &["operation", "group"],
        )?;

        registry.register(Box::new(websocket_messages.clone()))?;
        registry.register(Box::new(websocket_bytes.clone()))?;
        registry.register(Box::new(firehose_messages.clone()))?;
        registry.register(Box::new(firehose_collections.clone()))?;
        registry.register(Box::new(firehose_errors.clone()))?;
        registry.register(Box::new(firehose_facets.clone()))?;
        registry.register(Box::new(message_string_matches.clone()))?;
        registry.register(Box::new(auto_reports.clone()))?;
        registry.register(Box::new(embedded_content.clone()))?;
        registry.register(Box::new(web_links_hops.clone()))?;
        registry.register(Box::new(automation.clone()))?;

        Ok(Metrics {
            registry,
            activity,
            websocket_messages,
            websocket_bytes,
            firehose_messages,
            firehose_collections,
            firehose_errors,
            firehose_facets,
            message_string_matches,
            auto_reports,
            embedded_content,
            web_links_hops,
            automation,
        })
    }
}
