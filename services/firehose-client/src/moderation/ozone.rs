//! Cached view of the moderation service's already-handled accounts.
//!
//! Polls the moderation database every 15 minutes for accounts with label
//! or acknowledge events and exposes membership tests so the router and
//! list manager skip work the service has already done.

use crate::controller::Controller;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info};

const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);
const TICK: Duration = Duration::from_secs(15);

const LABEL_ACTION: &str = "tools.ozone.moderation.defs#modEventLabel";
const ACKNOWLEDGE_ACTION: &str = "tools.ozone.moderation.defs#modEventAcknowledge";

pub struct OzoneAdapter {
    pool: PgPool,
    labeled: RwLock<HashSet<String>>,
    processed: RwLock<HashSet<String>>,
}

impl OzoneAdapter {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;
        Ok(OzoneAdapter {
            pool,
            labeled: RwLock::new(HashSet::new()),
            processed: RwLock::new(HashSet::new()),
        })
    }

    pub fn is_labeled(&self, did: &str) -> bool {
        self.labeled.read().expect("ozone lock poisoned").contains(did)
    }

    /// Labeled or acknowledged: no further automated action wanted.
    pub fn already_processed(&self, did: &str) -> bool {
        self.is_labeled(did)
            || self
                .processed
                .read()
                .expect("ozone lock poisoned")
                .contains(did)
    }

    async fn refresh(&self) -> Result<(), sqlx::Error> {
        let labeled: HashSet<String> =
            sqlx::query("SELECT DISTINCT \"subjectDid\" FROM moderation_event WHERE action = $1")
                .bind(LABEL_ACTION)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get(0))
                .collect();
        let acknowledged: HashSet<String> =
            sqlx::query("SELECT DISTINCT \"subjectDid\" FROM moderation_event WHERE action = $1")
                .bind(ACKNOWLEDGE_ACTION)
                .fetch_all(&self.pool)
                .await?
                .iter()
                .map(|row| row.get::<String, _>(0))
                .filter(|did| !labeled.contains(did))
                .collect();
        info!(
            labeled = labeled.len(),
            acknowledged = acknowledged.len(),
            "processed-account view refreshed"
        );
        *self.labeled.write().expect("ozone lock poisoned") = labeled;
        *self.processed.write().expect("ozone lock poisoned") = acknowledged;
        Ok(())
    }

    /// Poll loop; database errors are logged and retried on the next tick.
    pub fn start(self: Arc<Self>, controller: Controller) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_refresh: Option<Instant> = None;
            while controller.is_active() {
                let due = last_refresh.is_none_or(|t| t.elapsed() >= REFRESH_INTERVAL);
                if due {
                    match self.refresh().await {
                        Ok(()) => last_refresh = Some(Instant::now()),
                        Err(e) => error!(error = %e, "moderation DB refresh failed"),
                    }
                }
                tokio::time::sleep(TICK).await;
            }
            info!("ozone adapter stopping");
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(labeled: &[&str], processed: &[&str]) -> Self {
        OzoneAdapter {
            pool: PgPoolOptions::new().connect_lazy("postgres://localhost/unused").unwrap(),
            labeled: RwLock::new(labeled.iter().map(|s| (*s).to_owned()).collect()),
            processed: RwLock::new(processed.iter().map(|s| (*s).to_owned()).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership_checks() {
        let adapter = OzoneAdapter::for_tests(&["did:plc:labeled"], &["did:plc:acked"]);
        assert!(adapter.is_labeled("did:plc:labeled"));
        assert!(!adapter.is_labeled("did:plc:acked"));
        assert!(adapter.already_processed("did:plc:labeled"));
        assert!(adapter.already_processed("did:plc:acked"));
        assert!(!adapter.already_processed("did:plc:new"));
    }
}
