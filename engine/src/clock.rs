//! Enqueue clock for ordering durable commands.
//!
//! Commands are replayed in the order they were enqueued, across restarts. A
//! wall-clock timestamp alone does not give that: two commands can share a
//! millisecond and the clock can step backwards. The clock hands out stamps
//! that are strictly increasing within a process, and is advanced past every
//! stamp loaded from disk on startup.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Position of one command in the queue.
///
/// Ordering rules:
/// 1. Earlier `millis` first
/// 2. If equal, lower `counter` first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueStamp {
    /// Milliseconds since the Unix epoch
    pub millis: i64,
    /// Tie-breaker within one millisecond
    pub counter: u32,
}

impl EnqueueStamp {
    pub fn new(millis: i64, counter: u32) -> Self {
        Self { millis, counter }
    }

    /// Fixed-width hex form, `{millis:016x}_{counter:08x}`; sorts lexically in
    /// stamp order.
    pub fn to_hex(&self) -> String {
        format!("{:016x}_{:08x}", self.millis.max(0) as u64, self.counter)
    }

    /// Parse the output of [`to_hex`](Self::to_hex).
    pub fn from_hex(text: &str) -> Option<Self> {
        let (millis, counter) = text.split_once('_')?;
        if millis.len() != 16 || counter.len() != 8 {
            return None;
        }
        let millis = u64::from_str_radix(millis, 16).ok()?;
        Some(Self {
            millis: i64::try_from(millis).ok()?,
            counter: u32::from_str_radix(counter, 16).ok()?,
        })
    }
}

impl Ord for EnqueueStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.millis.cmp(&other.millis) {
            Ordering::Equal => self.counter.cmp(&other.counter),
            other => other,
        }
    }
}

impl PartialOrd for EnqueueStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Source of strictly increasing [`EnqueueStamp`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueClock {
    last: Option<EnqueueStamp>,
}

impl EnqueueClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last stamp handed out or merged.
    pub fn last(&self) -> Option<EnqueueStamp> {
        self.last
    }

    /// Stamp for a command enqueued at `now_millis`.
    ///
    /// If the wall clock has not moved past the last stamp, the last
    /// millisecond is kept and the counter advances.
    pub fn tick(&mut self, now_millis: i64) -> EnqueueStamp {
        let next = match self.last {
            Some(last) if now_millis <= last.millis => {
                EnqueueStamp::new(last.millis, last.counter.saturating_add(1))
            }
            _ => EnqueueStamp::new(now_millis, 0),
        };
        self.last = Some(next);
        next
    }

    /// Make every later tick come after `stamp`. Used when loading persisted
    /// commands.
    pub fn merge(&mut self, stamp: EnqueueStamp) {
        if self.last.map_or(true, |last| stamp > last) {
            self.last = Some(stamp);
        }
    }
}
