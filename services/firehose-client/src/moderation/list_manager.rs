//! Platform-side block-list ("modlist") maintenance.
//!
//! Lazily loads the operator's lists and their membership at startup, then
//! drains queued additions: ensure the group's active list exists, archive
//! it with a timestamped rename once it grows past the size threshold, and
//! create a listitem record for the account. Create operations are paced to
//! respect the platform's record-creation rate limits.

use crate::client::{BskyClient, ClientError};
use crate::config::ListManagerConfig;
use crate::controller::Controller;
use crate::metrics::Metrics;
use crate::moderation::ozone::OzoneAdapter;
use chrono::Utc;
use fh_matcher::MatcherStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Deep queue: additions trickle out under the create-record pacing.
pub const QUEUE_LIMIT: usize = 50_000;
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(10);
/// 86400 seconds per day over 16667 creates per day comes to 7.4 s; round
/// down and stay under the limit with headroom from skipped items.
const CREATE_SPACING: Duration = Duration::from_secs(7);
const RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);
/// Archive the active list for a group once it reaches this many members.
const MAX_ITEMS_IN_LIST: usize = 5_000;
const LIST_DESCRIPTION_LIMIT: usize = 300;
const PAGE_SIZE: u32 = 50;

const MODLIST_PURPOSE: &str = "app.bsky.graph.defs#modlist";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockListAddition {
    pub did: String,
    pub group: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRecord {
    #[serde(rename = "$type")]
    pub kind: String,
    pub purpose: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

#[derive(Serialize)]
struct ListItemRecord<'a> {
    #[serde(rename = "$type")]
    kind: &'static str,
    subject: &'a str,
    list: &'a str,
    #[serde(rename = "createdAt")]
    created_at: String,
}

#[derive(Deserialize)]
struct ListView {
    uri: String,
    name: String,
}

#[derive(Deserialize)]
struct GetListsResponse {
    #[serde(default)]
    cursor: Option<String>,
    lists: Vec<ListView>,
}

#[derive(Deserialize)]
struct ItemSubject {
    did: String,
}

#[derive(Deserialize)]
struct ListItemView {
    subject: ItemSubject,
}

#[derive(Deserialize)]
struct GetListResponse {
    #[serde(default)]
    cursor: Option<String>,
    items: Vec<ListItemView>,
}

#[derive(Deserialize)]
struct CreateRecordResponse {
    uri: String,
    #[allow(dead_code)]
    cid: String,
}

#[derive(Deserialize)]
struct GetListRecordResponse {
    #[allow(dead_code)]
    uri: String,
    #[allow(dead_code)]
    cid: String,
    value: ListRecord,
}

#[derive(Deserialize)]
struct PutRecordResponse {
    #[allow(dead_code)]
    uri: String,
    #[allow(dead_code)]
    cid: String,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct ListManager {
    config: ListManagerConfig,
    client: BskyClient,
    matcher: Arc<MatcherStore>,
    ozone: Arc<OzoneAdapter>,
    metrics: Arc<Metrics>,
    /// Active list URI per group.
    list_uris: HashMap<String, String>,
    /// Known members per group, across active and archived lists.
    group_members: HashMap<String, HashSet<String>>,
}

impl ListManager {
    pub fn new(
        config: ListManagerConfig,
        matcher: Arc<MatcherStore>,
        ozone: Arc<OzoneAdapter>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClientError> {
        let client = BskyClient::new(
            &config.host,
            config.port,
            config.handle.clone(),
            config.password.clone(),
        )?;
        Ok(ListManager {
            config,
            client,
            matcher,
            ozone,
            metrics,
            list_uris: HashMap::new(),
            group_members: HashMap::new(),
        })
    }

    pub fn start(
        mut self,
        mut rx: mpsc::Receiver<BlockListAddition>,
        controller: Controller,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.config.dry_run {
                if let Err(e) = self.client.login().await {
                    error!(error = %e, "list manager cannot establish a session");
                    controller.force_stop("list manager login failed");
                    return;
                }
                if let Err(e) = self.lazy_load_managed_lists().await {
                    // Start empty; lists are recreated on demand.
                    warn!(error = %e, "list load incomplete");
                }
            }
            while controller.is_active() {
                match tokio::time::timeout(DEQUEUE_TIMEOUT, rx.recv()).await {
                    Ok(Some(addition)) => {
                        self.metrics
                            .activity
                            .backlog
                            .with_label_values(&["list_manager"])
                            .dec();
                        if self.process(addition).await {
                            tokio::time::sleep(CREATE_SPACING).await;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {}
                }
                if !self.config.dry_run {
                    if let Err(e) = self.client.check_refresh().await {
                        error!(error = %e, "list manager session is unrecoverable");
                        controller.force_stop("list manager session lost");
                        return;
                    }
                }
            }
            info!("list manager stopping");
        })
    }

    pub fn is_member(&self, did: &str, group: &str) -> bool {
        self.group_members
            .get(group)
            .is_some_and(|members| members.contains(did))
    }

    fn record_member(&mut self, did: &str, group: &str) {
        self.group_members
            .entry(group.to_owned())
            .or_default()
            .insert(did.to_owned());
    }

    /// One queued addition; returns true when a create op actually ran and
    /// pacing applies.
    async fn process(&mut self, addition: BlockListAddition) -> bool {
        if self.ozone.already_processed(&addition.did) {
            info!(did = %addition.did, group = %addition.group,
                "skipping list addition, already processed upstream");
            return false;
        }
        if self.is_member(&addition.did, &addition.group) {
            info!(did = %addition.did, group = %addition.group,
                "skipping list addition, already a member");
            return false;
        }
        self.add_account(&addition.did, &addition.group).await
    }

    async fn add_account(&mut self, did: &str, group: &str) -> bool {
        self.record_member(did, group);
        if self.config.dry_run {
            info!(did, group, "dry-run list addition");
            return false;
        }
        let list_uri = match self.ensure_group_available(group).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(group, error = %e, "cannot resolve active list, abandoning addition");
                self.metrics
                    .automation
                    .with_label_values(&["add_failed", group])
                    .inc();
                return false;
            }
        };
        let list_uri = match self.archive_if_needed(group, list_uri).await {
            Ok(uri) => uri,
            Err(e) => {
                warn!(group, error = %e, "archival failed, abandoning addition");
                return false;
            }
        };
        let record = ListItemRecord {
            kind: fh_atproto::collections::APP_BSKY_GRAPH_LISTITEM,
            subject: did,
            list: &list_uri,
            created_at: now_rfc3339(),
        };
        match self
            .create_with_rate_retry(fh_atproto::collections::APP_BSKY_GRAPH_LISTITEM, &record)
            .await
        {
            Ok(_) => {
                info!(did, group, list = %list_uri, "account added to block list");
                self.metrics
                    .automation
                    .with_label_values(&["added", group])
                    .inc();
                true
            }
            Err(e) if e.is_conflict() => {
                info!(did, group, "already a list member upstream");
                true
            }
            Err(e) => {
                warn!(did, group, error = %e, "listitem create failed");
                self.metrics
                    .automation
                    .with_label_values(&["add_failed", group])
                    .inc();
                true
            }
        }
    }

    /// Create with one long backoff retry when the platform rate-limits us.
    async fn create_with_rate_retry<R: Serialize>(
        &self,
        collection: &str,
        record: &R,
    ) -> Result<CreateRecordResponse, ClientError> {
        match self
            .client
            .create_record(&self.config.client_did, collection, record)
            .await
        {
            Err(e) if e.is_rate_limited() => {
                warn!(collection, "rate limited, backing off");
                tokio::time::sleep(RATE_LIMIT_BACKOFF).await;
                self.client
                    .create_record(&self.config.client_did, collection, record)
                    .await
            }
            other => other,
        }
    }

    // -----------------------------------------------------------------------
    // List discovery and creation
    // -----------------------------------------------------------------------

    /// Enumerate the operator's lists and page in their membership.
    async fn lazy_load_managed_lists(&mut self) -> Result<(), ClientError> {
        info!("list load starting");
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("actor", self.config.client_did.clone()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }
            let response: GetListsResponse = self
                .client
                .xrpc_get("app.bsky.graph.getLists", &query)
                .await?;
            for list in &response.lists {
                info!(name = %list.name, uri = %list.uri, "list load processing");
                let group = group_for_list(&list.name);
                self.list_uris
                    .entry(group.clone())
                    .or_insert_with(|| list.uri.clone());
                self.load_list_members(&group, &list.uri).await?;
            }
            match response.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        info!(groups = self.list_uris.len(), "list load complete");
        Ok(())
    }

    async fn load_list_members(&mut self, group: &str, uri: &str) -> Result<(), ClientError> {
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("list", uri.to_owned()),
                ("limit", PAGE_SIZE.to_string()),
            ];
            if let Some(cursor) = &cursor {
                query.push(("cursor", cursor.clone()));
            }
            let response: GetListResponse =
                self.client.xrpc_get("app.bsky.graph.getList", &query).await?;
            for item in &response.items {
                self.record_member(&item.subject.did, group);
            }
            match response.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        self.metrics
            .automation
            .with_label_values(&["loaded", group])
            .inc();
        Ok(())
    }

    /// Resolve the group's active list URI, creating the list if the group
    /// is unknown.
    async fn ensure_group_available(&mut self, group: &str) -> Result<String, ClientError> {
        if let Some(uri) = self.list_uris.get(group) {
            return Ok(uri.clone());
        }
        let record = ListRecord {
            kind: fh_atproto::collections::APP_BSKY_GRAPH_LIST.to_owned(),
            purpose: MODLIST_PURPOSE.to_owned(),
            name: group.to_owned(),
            description: self.block_reasons(group),
            created_at: now_rfc3339(),
        };
        info!(group, "creating block list");
        let response: CreateRecordResponse = self
            .create_with_rate_retry(fh_atproto::collections::APP_BSKY_GRAPH_LIST, &record)
            .await?;
        self.list_uris.insert(group.to_owned(), response.uri.clone());
        Ok(response.uri)
    }

    /// Rule targets feeding this group, truncated to the platform's
    /// description limit.
    fn block_reasons(&self, group: &str) -> String {
        let state = self.matcher.current();
        let mut reasons = state
            .block_groups()
            .get(group)
            .cloned()
            .unwrap_or_default();
        reasons.sort();
        let mut description = reasons.join(", ");
        if description.len() > LIST_DESCRIPTION_LIMIT {
            let mut cut = LIST_DESCRIPTION_LIMIT;
            while !description.is_char_boundary(cut) {
                cut -= 1;
            }
            description.truncate(cut);
        }
        description
    }

    /// When the group's active list is at capacity, rename it with a
    /// timestamp suffix, note the archival in its description, and start a
    /// fresh list.
    async fn archive_if_needed(
        &mut self,
        group: &str,
        list_uri: String,
    ) -> Result<String, ClientError> {
        let members = self
            .group_members
            .get(group)
            .map(HashSet::len)
            .unwrap_or_default();
        if members < MAX_ITEMS_IN_LIST {
            return Ok(list_uri);
        }
        let Some(parsed) = fh_atproto::AtUri::parse(&list_uri) else {
            warn!(group, uri = %list_uri, "unparseable list uri, keeping as active");
            return Ok(list_uri);
        };
        let current: GetListRecordResponse = self
            .client
            .get_record(&parsed.authority, &parsed.collection, &parsed.rkey)
            .await?;
        let mut record = current.value;
        record.name = format!("{}-{}", record.name, now_rfc3339());
        record.description = format!(
            "{}\nArchived with {} members",
            record.description, members
        );
        let _: PutRecordResponse = self
            .client
            .put_record(&parsed.authority, &parsed.collection, &parsed.rkey, &record)
            .await?;
        info!(group, archived = %record.name, "block list archived");
        self.metrics
            .automation
            .with_label_values(&["archived", group])
            .inc();
        // Membership restarts for the fresh list; archived members remain
        // recorded upstream.
        self.group_members.remove(group);
        self.list_uris.remove(group);
        self.ensure_group_available(group).await
    }
}

/// Archived lists carry a `-<timestamp>` suffix; both map to their group.
fn group_for_list(name: &str) -> String {
    match name.split_once('-') {
        Some((group, _)) => group.to_owned(),
        None => name.to_owned(),
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archived_list_names_resolve_to_their_group() {
        assert_eq!(group_for_list("hate"), "hate");
        assert_eq!(group_for_list("hate-2024-05-01T00:00:00Z"), "hate");
    }

    #[test]
    fn listitem_record_serializes_wire_names() {
        let record = ListItemRecord {
            kind: fh_atproto::collections::APP_BSKY_GRAPH_LISTITEM,
            subject: "did:plc:banned",
            list: "at://did:plc:op/app.bsky.graph.list/3k",
            created_at: "2024-05-01T00:00:00Z".to_owned(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"$type\":\"app.bsky.graph.listitem\""));
        assert!(json.contains("\"createdAt\""));
        assert!(json.contains("did:plc:banned"));
    }

    #[test]
    fn list_record_round_trips() {
        let record = ListRecord {
            kind: fh_atproto::collections::APP_BSKY_GRAPH_LIST.to_owned(),
            purpose: MODLIST_PURPOSE.to_owned(),
            name: "hate".to_owned(),
            description: "symbolA, symbolB".to_owned(),
            created_at: "2024-05-01T00:00:00Z".to_owned(),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: ListRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.name, "hate");
        assert_eq!(back.kind, "app.bsky.graph.list");
    }

    fn manager() -> ListManager {
        let store = MatcherStore::new(true);
        let mut builder = fh_matcher::MatcherBuilder::new();
        builder
            .add_rule_text("symbolB|hate|track=true,block=hate,match=substring|")
            .unwrap();
        builder
            .add_rule_text("symbolA|hate|track=true,block=hate,match=substring|")
            .unwrap();
        store.install(builder.build().unwrap());
        ListManager::new(
            ListManagerConfig {
                handle: "lists.example.com".to_owned(),
                password: "pw".to_owned(),
                host: "pds.example.com".to_owned(),
                port: 443,
                client_did: "did:plc:operator".to_owned(),
                dry_run: true,
            },
            Arc::new(store),
            Arc::new(OzoneAdapter::for_tests(&[], &[])),
            Arc::new(Metrics::register().unwrap()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn block_reasons_come_from_the_rule_set() {
        let manager = manager();
        assert_eq!(manager.block_reasons("hate"), "symbolA, symbolB");
        assert_eq!(manager.block_reasons("unknown"), "");
    }

    #[tokio::test]
    async fn dry_run_records_membership_without_creates() {
        let mut manager = manager();
        let ran_create = manager
            .process(BlockListAddition {
                did: "did:plc:banned".to_owned(),
                group: "hate".to_owned(),
            })
            .await;
        assert!(!ran_create);
        assert!(manager.is_member("did:plc:banned", "hate"));
        // second addition is a dedupe skip
        let ran_create = manager
            .process(BlockListAddition {
                did: "did:plc:banned".to_owned(),
                group: "hate".to_owned(),
            })
            .await;
        assert!(!ran_create);
    }

    #[tokio::test]
    async fn upstream_processed_accounts_are_skipped() {
        let store = MatcherStore::new(true);
        store.install(fh_matcher::MatcherBuilder::new().build().unwrap());
        let mut manager = ListManager::new(
            ListManagerConfig {
                handle: "lists.example.com".to_owned(),
                password: "pw".to_owned(),
                host: "pds.example.com".to_owned(),
                port: 443,
                client_did: "did:plc:operator".to_owned(),
                dry_run: true,
            },
            Arc::new(store),
            Arc::new(OzoneAdapter::for_tests(&["did:plc:handled"], &[])),
            Arc::new(Metrics::register().unwrap()),
        )
        .unwrap();
        manager
            .process(BlockListAddition {
                did: "did:plc:handled".to_owned(),
                group: "hate".to_owned(),
            })
            .await;
        assert!(!manager.is_member("did:plc:handled", "hate"));
    }
}
