// firehose-client: real-time moderation pipeline over the replication
// stream.
//
// The datasource ingests framed binary messages over secure WebSocket, the
// payload dispatcher decodes CAR/DAG-CBOR commits and classifies records,
// the matcher flags candidates, the activity recorder tracks per-account
// behavior, and the moderation subsystems (action router, report agent,
// list manager, embed checker) turn matches into reports, labels, and
// block-list membership.

pub mod client;
pub mod config;
pub mod controller;
pub mod cursor;
pub mod datasource;
pub mod metrics;
pub mod moderation;
pub mod payload;
pub mod session;
