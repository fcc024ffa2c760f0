// fh-activity: bounded per-account behavioral tracking.
//
// The event cache maps did -> account statistics with LFU eviction; each
// account nests an LFU cache of per-content hit counters. A single
// recorder task owns the cache, serializing all mutation. Alerts fire on
// exponentially spaced counter milestones.

pub mod account;
pub mod cache;
pub mod events;
pub mod lfu;
pub mod metrics;
pub mod rate;
pub mod recorder;

pub use account::{Account, ContentHitCount, alert_needed};
pub use cache::{EventCache, Outcome};
pub use events::{DownReason, Event, TimedEvent};
pub use lfu::LfuCache;
pub use metrics::ActivityMetrics;
pub use rate::RateObserver;
pub use recorder::EventRecorder;
