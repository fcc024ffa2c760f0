//! Auxiliary store worker: cursor persistence plus periodic refresh of the
//! rule set and the popular-host allowlist.
//!
//! One pool, one loop, 15 s ticks. Every tick flushes the in-memory cursor;
//! the checkpoint table gets an hourly row once a timestamp has been
//! observed; rules refresh every 5 minutes (fail-closed on any bad row) and
//! hosts every 15. Database errors are logged and retried next tick; the
//! worker loop never gives up.

use crate::controller::Controller;
use crate::cursor::Cursor;
use crate::metrics::Metrics;
use crate::moderation::embed_checker::EmbedChecker;
use fh_matcher::{MatcherBuilder, MatcherStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info, trace, warn};

const FLUSH_INTERVAL: Duration = Duration::from_secs(15);
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MATCH_FILTERS_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const POPULAR_HOSTS_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

pub struct AuxiliaryData {
    pool: PgPool,
    cursor: Arc<Cursor>,
    matcher: Arc<MatcherStore>,
    embed_checker: Arc<EmbedChecker>,
    metrics: Arc<Metrics>,
}

impl AuxiliaryData {
    pub async fn connect(
        connection_string: &str,
        cursor: Arc<Cursor>,
        matcher: Arc<MatcherStore>,
        embed_checker: Arc<EmbedChecker>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(connection_string)
            .await?;
        Ok(AuxiliaryData {
            pool,
            cursor,
            matcher,
            embed_checker,
            metrics,
        })
    }

    /// The persisted resume point, for rewinding after a restart.
    pub async fn read_rewind_point(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT last_processed FROM firehose_state")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>(0)).unwrap_or(0))
    }

    pub fn start(self, controller: Controller) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_checkpoint: Option<Instant> = None;
            let mut last_rules: Option<Instant> = None;
            let mut last_hosts: Option<Instant> = None;
            let mut shutdown = controller.subscribe();
            while controller.is_active() {
                if let Err(e) = self.flush_cursor().await {
                    error!(error = %e, "cursor flush failed");
                }
                if due(&last_checkpoint, CHECKPOINT_INTERVAL) {
                    match self.write_checkpoint().await {
                        Ok(true) => last_checkpoint = Some(Instant::now()),
                        Ok(false) => {} // nothing observed yet
                        Err(e) => error!(error = %e, "checkpoint failed"),
                    }
                }
                if self.matcher.use_db_for_rules() && due(&last_rules, MATCH_FILTERS_REFRESH_INTERVAL)
                {
                    match self.refresh_match_filters().await {
                        // A discarded refresh retries on the next tick.
                        Ok(true) => last_rules = Some(Instant::now()),
                        Ok(false) => {}
                        Err(e) => error!(error = %e, "rule refresh failed"),
                    }
                }
                if due(&last_hosts, POPULAR_HOSTS_REFRESH_INTERVAL) {
                    match self.refresh_popular_hosts().await {
                        Ok(()) => last_hosts = Some(Instant::now()),
                        Err(e) => error!(error = %e, "host refresh failed"),
                    }
                }
                // Sleep a tick, waking early on shutdown.
                let _ = tokio::time::timeout(FLUSH_INTERVAL, shutdown.changed()).await;
            }
            info!("auxiliary data worker stopping");
        })
    }

    async fn flush_cursor(&self) -> Result<(), sqlx::Error> {
        let seq = self.cursor.sequence();
        sqlx::query("UPDATE firehose_state SET last_processed = $1")
            .bind(seq)
            .execute(&self.pool)
            .await?;
        trace!(seq, "cursor flushed");
        Ok(())
    }

    /// Append an (emitted_at, seq) checkpoint row; returns false until the
    /// stream has produced a timestamp.
    async fn write_checkpoint(&self) -> Result<bool, sqlx::Error> {
        let Some(emitted_at) = self.cursor.emitted_at() else {
            info!("checkpoint pending stream timestamp");
            return Ok(false);
        };
        let seq = self.cursor.sequence();
        sqlx::query("INSERT INTO firehose_checkpoint (emitted_at, seq) VALUES ($1::timestamptz, $2)")
            .bind(&emitted_at)
            .bind(seq)
            .execute(&self.pool)
            .await?;
        info!(%emitted_at, seq, "checkpoint written");
        Ok(true)
    }

    /// Rescan `match_filters` and install the replacement, unless any row
    /// fails to parse. Returns whether a new state went live.
    async fn refresh_match_filters(&self) -> Result<bool, sqlx::Error> {
        let rows: Vec<FilterRow> =
            sqlx::query("SELECT filter, labels, actions, contingent FROM match_filters")
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| FilterRow {
                    filter: row.get(0),
                    labels: row.get(1),
                    actions: row.get(2),
                    contingent: row.get(3),
                })
                .collect();
        match build_replacement(&rows) {
            Some(state) => {
                info!(rules = state.rule_count(), "rule refresh installed");
                self.matcher.install(state);
                Ok(true)
            }
            None => {
                warn!("rule refresh discarded, previous rules remain active");
                self.metrics
                    .firehose_errors
                    .with_label_values(&["rule_refresh_discarded"])
                    .inc();
                Ok(false)
            }
        }
    }

    async fn refresh_popular_hosts(&self) -> Result<(), sqlx::Error> {
        let rows = sqlx::query("SELECT hostname FROM popular_hosts")
            .fetch_all(&self.pool)
            .await?;
        let hosts: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();
        info!(hosts = hosts.len(), "popular host refresh");
        self.embed_checker.refresh_hosts(hosts);
        Ok(())
    }
}

fn due(last: &Option<Instant>, interval: Duration) -> bool {
    last.is_none_or(|t| t.elapsed() >= interval)
}

/// One `match_filters` row, as stored.
struct FilterRow {
    filter: String,
    labels: String,
    actions: String,
    contingent: Option<String>,
}

/// Compile a candidate rule set. Any unparseable row discards the whole
/// replacement: a half-loaded rule set must never go live.
fn build_replacement(rows: &[FilterRow]) -> Option<fh_matcher::MatcherState> {
    let mut builder = MatcherBuilder::new();
    let mut load_failed = false;
    for row in rows {
        match fh_matcher::Rule::from_fields(
            &row.filter,
            &row.labels,
            &row.actions,
            row.contingent.as_deref().unwrap_or(""),
        ) {
            Ok(rule) => {
                if let Err(e) = builder.add_rule(rule) {
                    warn!(filter = %row.filter, error = %e, "bad rule row");
                    load_failed = true;
                }
            }
            Err(e) => {
                warn!(filter = %row.filter, error = %e, "bad rule row");
                load_failed = true;
            }
        }
    }
    if load_failed {
        return None;
    }
    builder.build().ok()
}
