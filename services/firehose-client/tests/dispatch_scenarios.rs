//! End-to-end dispatcher scenarios over synthetic firehose frames.
//!
//! Frames are built with the codec's own encoder: two concatenated DAG-CBOR
//! values (header, body), commit bodies carrying a CAR block bag whose CIDs
//! are computed over the encoded payloads, exactly as the relay frames them.

use fh_activity::{ActivityMetrics, EventCache, EventRecorder};
use fh_atproto::value::{Map, Value};
use fh_atproto::{car, cbor};
use fh_matcher::{MatcherBuilder, MatcherStore};
use firehose_client::cursor::Cursor;
use firehose_client::metrics::Metrics;
use firehose_client::moderation::action_router::AccountMatches;
use firehose_client::moderation::embed_checker::{Embed, EmbedBatch};
use firehose_client::payload::PayloadDispatcher;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect::<Map>(),
    )
}

fn text(s: &str) -> Value {
    Value::Text(s.to_owned())
}

struct Harness {
    dispatcher: PayloadDispatcher,
    cursor: Arc<Cursor>,
    action_rx: mpsc::Receiver<AccountMatches>,
    embed_rx: mpsc::Receiver<EmbedBatch>,
    _shutdown: watch::Sender<bool>,
}

fn harness(rules: &[&str]) -> Harness {
    let store = MatcherStore::new(true);
    let mut builder = MatcherBuilder::new();
    for rule in rules {
        builder.add_rule_text(rule).unwrap();
    }
    store.install(builder.build().unwrap());
    let matcher = Arc::new(store);

    let activity_metrics = Arc::new(ActivityMetrics::detached());
    let cache = EventCache::with_capacity(256, activity_metrics.clone(), None);
    let (shutdown_tx, shutdown_rx) = watch::channel(true);
    let (recorder, _task) = EventRecorder::start(cache, activity_metrics, None, shutdown_rx);

    let (action_tx, action_rx) = mpsc::channel(16);
    let (embed_tx, embed_rx) = mpsc::channel(16);
    let cursor = Arc::new(Cursor::new());
    let dispatcher = PayloadDispatcher::new(
        matcher,
        recorder,
        action_tx,
        embed_tx,
        cursor.clone(),
        Arc::new(Metrics::register().unwrap()),
    );
    Harness {
        dispatcher,
        cursor,
        action_rx,
        embed_rx,
        _shutdown: shutdown_tx,
    }
}

/// Encode a (header, body) frame as the wire carries it.
fn frame(header: &Value, body: &Value) -> Vec<u8> {
    let mut bytes = Vec::new();
    cbor::encode(header, &mut bytes);
    cbor::encode(body, &mut bytes);
    bytes
}

fn commit_frame(repo: &str, seq: i64, records: &[(&str, Value)]) -> Vec<u8> {
    let mut ops = Vec::new();
    let mut blocks = Vec::new();
    for (path, record) in records {
        let mut payload = Vec::new();
        cbor::encode(record, &mut payload);
        let cid = car::cid_for(&payload);
        ops.push(map(vec![
            ("path", text(path)),
            ("action", text("create")),
            ("cid", Value::Cid(cid.clone())),
        ]));
        blocks.push((cid, payload));
    }
    let envelope = car::build_envelope_raw(&map(vec![("version", Value::Int(1))]), &blocks);
    let body = map(vec![
        ("repo", text(repo)),
        ("seq", Value::Int(seq)),
        ("time", text("2024-05-01T12:00:00Z")),
        ("ops", Value::Array(ops)),
        ("blocks", Value::Bytes(envelope)),
    ]);
    frame(&map(vec![("op", Value::Int(1)), ("t", text("#commit"))]), &body)
}

#[tokio::test]
async fn single_post_match_enqueues_an_action() {
    let mut h = harness(&["Хохол|slur|track=true,report=true,match=substring|"]);
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("...Хохол...")),
        ("createdAt", text("2024-05-01T11:59:00Z")),
    ]);
    let data = commit_frame("did:plc:offender", 42, &[("app.bsky.feed.post/3k1", record)]);

    h.dispatcher.handle_message(&data).await.unwrap();

    assert_eq!(h.cursor.sequence(), 42);
    let action = h.action_rx.recv().await.unwrap();
    assert_eq!(action.did, "did:plc:offender");
    assert_eq!(action.matches.len(), 1);
    let (path, results) = &action.matches[0];
    assert_eq!(path, "app.bsky.feed.post/3k1");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].candidate.field, "text");
    assert_eq!(
        results[0].keywords,
        vec![fh_atproto::fold::canonicalize("Хохол")]
    );
}

#[tokio::test]
async fn contingent_rejection_suppresses_the_report() {
    let mut h = harness(&["bank|fraud|track=true,report=true,match=substring|scam,!educational"]);
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("educational bank scam")),
        ("createdAt", text("2024-05-01T11:59:00Z")),
    ]);
    let data = commit_frame("did:plc:poster", 7, &[("app.bsky.feed.post/3k1", record)]);

    h.dispatcher.handle_message(&data).await.unwrap();
    assert!(h.action_rx.try_recv().is_err());

    // The same rule fires once the required context is present alone.
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("obvious bank scam")),
        ("createdAt", text("2024-05-01T11:59:30Z")),
    ]);
    let data = commit_frame("did:plc:poster", 8, &[("app.bsky.feed.post/3k2", record)]);
    h.dispatcher.handle_message(&data).await.unwrap();
    assert!(h.action_rx.recv().await.is_some());
}

#[tokio::test]
async fn duplicate_cid_block_is_skipped_without_halting() {
    let mut h = harness(&["slur|bad|track=true,report=true,match=substring|"]);

    let dup = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("harmless")),
        ("createdAt", text("2024-05-01T11:59:00Z")),
    ]);
    let hit = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("a slur here")),
        ("createdAt", text("2024-05-01T11:59:10Z")),
    ]);
    let mut dup_payload = Vec::new();
    cbor::encode(&dup, &mut dup_payload);
    let dup_cid = car::cid_for(&dup_payload);
    let mut hit_payload = Vec::new();
    cbor::encode(&hit, &mut hit_payload);
    let hit_cid = car::cid_for(&hit_payload);

    let envelope = car::build_envelope_raw(
        &map(vec![("version", Value::Int(1))]),
        &[
            (dup_cid.clone(), dup_payload.clone()),
            (dup_cid.clone(), dup_payload),
            (hit_cid.clone(), hit_payload),
        ],
    );
    let body = map(vec![
        ("repo", text("did:plc:offender")),
        ("seq", Value::Int(100)),
        ("time", text("2024-05-01T12:00:00Z")),
        (
            "ops",
            Value::Array(vec![
                map(vec![
                    ("path", text("app.bsky.feed.post/dup")),
                    ("action", text("create")),
                    ("cid", Value::Cid(dup_cid)),
                ]),
                map(vec![
                    ("path", text("app.bsky.feed.post/hit")),
                    ("action", text("create")),
                    ("cid", Value::Cid(hit_cid)),
                ]),
            ]),
        ),
        ("blocks", Value::Bytes(envelope)),
    ]);
    let data = frame(&map(vec![("op", Value::Int(1)), ("t", text("#commit"))]), &body);

    // The duplicate is logged and dropped; the rest of the envelope decodes.
    h.dispatcher.handle_message(&data).await.unwrap();
    let action = h.action_rx.recv().await.unwrap();
    assert_eq!(action.matches[0].0, "app.bsky.feed.post/hit");
    assert_eq!(h.cursor.sequence(), 100);
}

#[tokio::test]
async fn delete_ops_record_activity_and_advance_the_cursor() {
    let h = harness(&[]);
    let body = map(vec![
        ("repo", text("did:plc:cleaner")),
        ("seq", Value::Int(55)),
        ("time", text("2024-05-01T12:00:00Z")),
        (
            "ops",
            Value::Array(vec![map(vec![
                ("path", text("app.bsky.feed.post/3k1")),
                ("action", text("delete")),
                ("cid", Value::Null),
            ])]),
        ),
    ]);
    let data = frame(&map(vec![("op", Value::Int(1)), ("t", text("#commit"))]), &body);
    h.dispatcher.handle_message(&data).await.unwrap();
    assert_eq!(h.cursor.sequence(), 55);
}

#[tokio::test]
async fn external_embeds_flow_to_the_checker_and_match_on_title() {
    let mut h = harness(&["malware|spam|track=true,report=true,match=substring|"]);
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("check this out")),
        ("createdAt", text("2024-05-01T11:59:00Z")),
        (
            "embed",
            map(vec![
                ("$type", text("app.bsky.embed.external")),
                (
                    "external",
                    map(vec![
                        ("uri", text("https://sketchy.example/dl")),
                        ("title", text("free malware download")),
                        ("description", text("")),
                    ]),
                ),
            ]),
        ),
    ]);
    let data = commit_frame("did:plc:poster", 60, &[("app.bsky.feed.post/3k1", record)]);
    h.dispatcher.handle_message(&data).await.unwrap();

    let batch = h.embed_rx.recv().await.unwrap();
    assert_eq!(batch.did, "did:plc:poster");
    assert_eq!(
        batch.embeds,
        vec![Embed::External("https://sketchy.example/dl".to_owned())]
    );

    let action = h.action_rx.recv().await.unwrap();
    let (_, results) = &action.matches[0];
    assert!(results.iter().any(|r| r.candidate.field == "embed/external/title"));
}

#[tokio::test]
async fn quote_posts_are_classified_by_embedded_record() {
    let mut h = harness(&[]);
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("text", text("quoting this")),
        ("createdAt", text("2024-05-01T11:59:00Z")),
        (
            "embed",
            map(vec![
                ("$type", text("app.bsky.embed.record")),
                (
                    "record",
                    map(vec![(
                        "uri",
                        text("at://did:plc:original/app.bsky.feed.post/3x"),
                    )]),
                ),
            ]),
        ),
    ]);
    let data = commit_frame("did:plc:quoter", 61, &[("app.bsky.feed.post/3k1", record)]);
    h.dispatcher.handle_message(&data).await.unwrap();
    // No rules installed: nothing routed, nothing queued for embeds.
    assert!(h.action_rx.try_recv().is_err());
    assert!(h.embed_rx.try_recv().is_err());
}

#[tokio::test]
async fn identity_handle_becomes_a_candidate() {
    let mut h = harness(&["grift|scam|track=true,report=true,match=substring|"]);
    let body = map(vec![
        ("did", text("did:plc:renamed")),
        ("handle", text("grift-central.example.com")),
        ("time", text("2024-05-01T12:00:00Z")),
    ]);
    let data = frame(
        &map(vec![("op", Value::Int(1)), ("t", text("#identity"))]),
        &body,
    );
    h.dispatcher.handle_message(&data).await.unwrap();

    let action = h.action_rx.recv().await.unwrap();
    assert_eq!(action.did, "did:plc:renamed");
    assert_eq!(action.matches[0].0, "handle");
    assert_eq!(action.matches[0].1[0].candidate.record_type, "#identity");
}

#[tokio::test]
async fn error_frames_are_counted_and_skipped() {
    let h = harness(&[]);
    let data = frame(
        &map(vec![("op", Value::Int(-1))]),
        &map(vec![
            ("error", text("FutureCursor")),
            ("message", text("cursor is in the future")),
        ]),
    );
    h.dispatcher.handle_message(&data).await.unwrap();
    assert_eq!(h.cursor.sequence(), 0);
}

#[tokio::test]
async fn truncated_frames_error_without_panic() {
    let h = harness(&[]);
    let data = commit_frame("did:plc:any", 9, &[]);
    assert!(h.dispatcher.handle_message(&data[..data.len() / 2]).await.is_err());
}
