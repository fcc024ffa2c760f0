//! Prometheus instruments for the activity subsystem, registered into the
//! process-wide registry handed down from the service container.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

#[derive(Clone)]
pub struct ActivityMetrics {
    /// Alert events by account-level category.
    pub realtime_alerts: IntCounterVec,
    /// Cache eviction outcomes by scope (account/content) and state
    /// (flagged/clean).
    pub evictions: IntCounterVec,
    /// Live cached item counts by scope.
    pub cached_items: IntGaugeVec,
    /// Recorder queue depth.
    pub backlog: IntGaugeVec,
}

impl ActivityMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let realtime_alerts = IntCounterVec::new(
            Opts::new("realtime_alerts", "Account behavior alerts by category"),
            &["account"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new("cache_evictions", "LFU evictions by scope and state"),
            &["scope", "state"],
        )?;
        let cached_items = IntGaugeVec::new(
            Opts::new("cached_items", "Live cache entries by scope"),
            &["scope"],
        )?;
        let backlog = IntGaugeVec::new(
            Opts::new("process_backlog", "Queue depth by subsystem"),
            &["subsystem"],
        )?;
        registry.register(Box::new(realtime_alerts.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(cached_items.clone()))?;
        registry.register(Box::new(backlog.clone()))?;
        Ok(ActivityMetrics {
            realtime_alerts,
            evictions,
            cached_items,
            backlog,
        })
    }

    /// Unregistered instruments for tests.
    pub fn detached() -> Self {
        Self::register(&Registry::new()).expect("fresh registry accepts instruments")
    }

    pub fn alert(&self, category: &str) {
        self.realtime_alerts.with_label_values(&[category]).inc();
    }
}
