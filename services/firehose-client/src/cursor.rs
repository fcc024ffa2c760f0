//! Shared firehose cursor: a monotone sequence number plus the upstream
//! timestamp that accompanied it.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct Cursor {
    seq: AtomicI64,
    emitted_at: Mutex<Option<String>>,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance to `seq`; regressions are ignored so the persisted value is
    /// non-decreasing no matter how messages interleave.
    pub fn advance(&self, seq: i64, emitted_at: &str) {
        let previous = self.seq.fetch_max(seq, Ordering::AcqRel);
        if seq >= previous {
            *self.emitted_at.lock().expect("cursor lock poisoned") = Some(emitted_at.to_owned());
        }
    }

    /// Seed from the persisted rewind point at startup.
    pub fn seed(&self, seq: i64) {
        self.seq.fetch_max(seq, Ordering::AcqRel);
    }

    pub fn sequence(&self) -> i64 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn emitted_at(&self) -> Option<String> {
        self.emitted_at.lock().expect("cursor lock poisoned").clone()
    }
}
