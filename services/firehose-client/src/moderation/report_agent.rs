//! Report and label emission against the moderation service.
//!
//! Owns its HTTP session; both createReport and emitEvent are idempotent
//! upstream on (subject, reason), so a duplicate send is harmless. The
//! client retries transient connection loss; any other failure is logged
//! and the item abandoned.

use crate::client::{BskyClient, ClientError};
use crate::config::AutoReporterConfig;
use crate::controller::Controller;
use crate::metrics::Metrics;
use crate::moderation::PROJECT_NAME;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const QUEUE_LIMIT: usize = 10_000;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(10);

const REASON_OTHER: &str = "com.atproto.moderation.defs#reasonOther";
const REPO_REF: &str = "com.atproto.admin.defs#repoRef";
const MOD_EVENT_LABEL: &str = "tools.ozone.moderation.defs#modEventLabel";
const PROXY_LABELER_SUFFIX: &str = "#atproto_labeler";

/// What a report is about; serialized into the reason JSON string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportContent {
    FilterMatches {
        filters: Vec<String>,
        paths: Vec<String>,
        labels: Vec<String>,
    },
    LinkRedirection {
        path: String,
        uris: Vec<String>,
    },
    BlocksModeration,
}

#[derive(Debug, Clone)]
pub struct AccountReport {
    pub did: String,
    pub content: ReportContent,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ReportSubject<'a> {
    #[serde(rename = "$type")]
    kind: &'static str,
    did: &'a str,
}

impl<'a> ReportSubject<'a> {
    fn repo(did: &'a str) -> Self {
        ReportSubject {
            kind: REPO_REF,
            did,
        }
    }
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    #[serde(rename = "reasonType")]
    reason_type: &'static str,
    /// JSON-in-a-string per the service convention.
    reason: String,
    subject: ReportSubject<'a>,
}

#[derive(Deserialize)]
struct ReportResponse {
    #[serde(rename = "createdAt")]
    created_at: String,
    id: i64,
    #[serde(rename = "reportedBy")]
    reported_by: String,
}

#[derive(Serialize)]
struct FilterMatchInfo<'a> {
    descriptor: &'static str,
    filters: &'a [String],
    paths: &'a [String],
}

#[derive(Serialize)]
struct LinkRedirectionInfo<'a> {
    descriptor: &'static str,
    path: &'a str,
    uris: &'a [String],
}

#[derive(Serialize)]
struct BlocksModerationInfo {
    descriptor: &'static str,
}

#[derive(Serialize)]
struct ModEventLabel<'a> {
    #[serde(rename = "$type")]
    kind: &'static str,
    #[serde(rename = "createLabelVals")]
    create_label_vals: &'a [String],
    #[serde(rename = "negateLabelVals")]
    negate_label_vals: &'a [String],
}

#[derive(Serialize)]
struct EmitEventRequest<'a> {
    event: ModEventLabel<'a>,
    subject: ReportSubject<'a>,
    #[serde(rename = "createdBy")]
    created_by: &'a str,
}

#[derive(Deserialize)]
struct EmitEventResponse {
    #[serde(rename = "createdAt")]
    created_at: String,
    id: i64,
    #[serde(rename = "createdBy")]
    #[allow(dead_code)]
    created_by: String,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct ReportAgent {
    config: AutoReporterConfig,
    client: BskyClient,
    metrics: Arc<Metrics>,
}

impl ReportAgent {
    pub fn new(config: AutoReporterConfig, metrics: Arc<Metrics>) -> Result<Self, ClientError> {
        let client = BskyClient::new(
            &config.host,
            config.port,
            config.handle.clone(),
            config.password.clone(),
        )?;
        Ok(ReportAgent {
            config,
            client,
            metrics,
        })
    }

    pub fn service_did(&self) -> &str {
        &self.config.service_did
    }

    fn labeler_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Atproto-Accept-Labelers", self.config.service_did.clone()),
            (
                "Atproto-Proxy",
                format!("{}{PROXY_LABELER_SUFFIX}", self.config.service_did),
            ),
        ]
    }

    pub fn start(
        mut self,
        mut rx: mpsc::Receiver<AccountReport>,
        controller: Controller,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.dry_run {
                if let Err(e) = self.client.login().await {
                    error!(error = %e, "report agent cannot establish a session");
                    controller.force_stop("report agent login failed");
                    return;
                }
            }
            while controller.is_active() {
                match tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()).await {
                    Ok(Some(report)) => {
                        self.metrics
                            .activity
                            .backlog
                            .with_label_values(&["report_agent"])
                            .dec();
                        self.process(report).await;
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }
                if !self.config.dry_run {
                    if let Err(e) = self.client.check_refresh().await {
                        error!(error = %e, "report agent session is unrecoverable");
                        controller.force_stop("report agent session lost");
                        return;
                    }
                }
            }
            info!("report agent stopping");
        })
    }

    pub async fn process(&mut self, report: AccountReport) {
        match &report.content {
            ReportContent::FilterMatches {
                filters,
                paths,
                labels,
            } => {
                let reason = serde_json::to_string(&FilterMatchInfo {
                    descriptor: PROJECT_NAME,
                    filters,
                    paths,
                })
                .unwrap_or_default();
                self.send_report(&report.did, reason).await;
                if !labels.is_empty() {
                    self.label_account(&report.did, labels).await;
                }
            }
            ReportContent::LinkRedirection { path, uris } => {
                let reason = serde_json::to_string(&LinkRedirectionInfo {
                    descriptor: PROJECT_NAME,
                    path,
                    uris,
                })
                .unwrap_or_default();
                self.send_report(&report.did, reason).await;
            }
            ReportContent::BlocksModeration => {
                let reason = serde_json::to_string(&BlocksModerationInfo {
                    descriptor: PROJECT_NAME,
                })
                .unwrap_or_default();
                self.send_report(&report.did, reason).await;
                self.label_account(&report.did, &["blocks".to_owned()]).await;
            }
        }
    }

    async fn send_report(&self, did: &str, reason: String) {
        if self.config.dry_run {
            info!(did, %reason, "dry-run report");
            self.metrics
                .auto_reports
                .with_label_values(&["dry_run"])
                .inc();
            return;
        }
        let request = ReportRequest {
            reason_type: REASON_OTHER,
            reason,
            subject: ReportSubject::repo(did),
        };
        match self
            .client
            .xrpc_post::<_, ReportResponse>(
                "com.atproto.moderation.createReport",
                &request,
                &self.labeler_headers(),
            )
            .await
        {
            Ok(response) => {
                info!(did, id = response.id, reporter = %response.reported_by,
                    at = %response.created_at, "report recorded");
            }
            Err(e) => {
                warn!(did, error = %e, "report abandoned");
                self.metrics
                    .auto_reports
                    .with_label_values(&["failed"])
                    .inc();
            }
        }
    }

    async fn label_account(&self, did: &str, labels: &[String]) {
        if self.config.dry_run {
            info!(did, ?labels, "dry-run label");
            return;
        }
        let request = EmitEventRequest {
            event: ModEventLabel {
                kind: MOD_EVENT_LABEL,
                create_label_vals: labels,
                negate_label_vals: &[],
            },
            subject: ReportSubject::repo(did),
            created_by: &self.config.did,
        };
        match self
            .client
            .xrpc_post::<_, EmitEventResponse>(
                "tools.ozone.moderation.emitEvent",
                &request,
                &self.labeler_headers(),
            )
            .await
        {
            Ok(response) => {
                info!(did, id = response.id, at = %response.created_at, "labels applied");
            }
            Err(e) => {
                warn!(did, error = %e, "label event abandoned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_json_carries_filters_and_paths() {
        let filters = vec!["Хохол".to_owned()];
        let paths = vec!["app.bsky.feed.post/3k".to_owned()];
        let reason = serde_json::to_string(&FilterMatchInfo {
            descriptor: PROJECT_NAME,
            filters: &filters,
            paths: &paths,
        })
        .unwrap();
        assert!(reason.contains("\"filters\":[\"Хохол\"]"));
        assert!(reason.contains("\"paths\":[\"app.bsky.feed.post/3k\"]"));
        assert!(reason.contains(PROJECT_NAME));
    }

    #[test]
    fn report_request_serializes_reserved_type_field() {
        let request = ReportRequest {
            reason_type: REASON_OTHER,
            reason: "{}".to_owned(),
            subject: ReportSubject::repo("did:plc:abc"),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"$type\":\"com.atproto.admin.defs#repoRef\""));
        assert!(json.contains("\"reasonType\""));
        assert!(json.contains("\"did\":\"did:plc:abc\""));
    }

    #[test]
    fn label_event_serializes_create_vals() {
        let labels = vec!["slur".to_owned()];
        let request = EmitEventRequest {
            event: ModEventLabel {
                kind: MOD_EVENT_LABEL,
                create_label_vals: &labels,
                negate_label_vals: &[],
            },
            subject: ReportSubject::repo("did:plc:abc"),
            created_by: "did:plc:reporter",
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"createLabelVals\":[\"slur\"]"));
        assert!(json.contains("\"negateLabelVals\":[]"));
        assert!(json.contains("modEventLabel"));
    }

    #[test]
    fn link_redirection_reason_includes_chain() {
        let uris: Vec<String> = (0..11).map(|i| format!("https://hop{i}.example")).collect();
        let reason = serde_json::to_string(&LinkRedirectionInfo {
            descriptor: PROJECT_NAME,
            path: "app.bsky.feed.post/3k",
            uris: &uris,
        })
        .unwrap();
        for uri in &uris {
            assert!(reason.contains(uri.as_str()));
        }
    }
}
