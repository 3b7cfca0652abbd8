use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long a single sweep needs before its traces can be read.
///
/// The HP4195A gives no completion signal over the bus, so the worker
/// waits for a duration derived from the resolution bandwidth.
pub trait SettlePolicy: Send + Sync {
    fn settle_time(&self, resolution_bandwidth: f64) -> Duration;
}

/// One row of an [`RbwSettleTable`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SettleEntry {
    pub resolution_bandwidth: f64,
    #[serde(with = "duration_secs")]
    pub settle: Duration,
}

/// Settle times measured on the instrument, keyed by RBW.
///
/// Narrower bandwidths sweep slower, so a request uses the widest entry
/// whose RBW does not exceed the requested one. A request narrower than
/// every entry gets the narrowest (slowest) entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RbwSettleTable {
    entries: Vec<SettleEntry>,
}

impl RbwSettleTable {
    pub fn new(mut entries: Vec<SettleEntry>) -> Self {
        entries.retain(|e| e.resolution_bandwidth.is_finite() && e.resolution_bandwidth > 0.0);
        entries.sort_by(|a, b| a.resolution_bandwidth.total_cmp(&b.resolution_bandwidth));
        Self { entries }
    }

    pub fn entries(&self) -> &[SettleEntry] {
        &self.entries
    }
}

impl Default for RbwSettleTable {
    fn default() -> Self {
        Self::new(vec![
            SettleEntry {
                resolution_bandwidth: 10.0,
                settle: Duration::from_secs(218),
            },
            SettleEntry {
                resolution_bandwidth: 100.0,
                settle: Duration::from_secs(41),
            },
        ])
    }
}

impl SettlePolicy for RbwSettleTable {
    fn settle_time(&self, resolution_bandwidth: f64) -> Duration {
        self.entries
            .iter()
            .rev()
            .find(|e| e.resolution_bandwidth <= resolution_bandwidth)
            .or(self.entries.first())
            .map(|e| e.settle)
            .unwrap_or(Duration::ZERO)
    }
}

/// Same wait regardless of RBW. Zero in tests and simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixedSettle(pub Duration);

impl SettlePolicy for FixedSettle {
    fn settle_time(&self, _resolution_bandwidth: f64) -> Duration {
        self.0
    }
}

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Sleep for `duration` in short slices.
///
/// Returns `false` if `abort` was raised before the time was up.
pub(crate) fn wait(duration: Duration, abort: &AtomicBool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if abort.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_instrument_timings() {
        let table = RbwSettleTable::default();
        assert_eq!(table.settle_time(10.0), Duration::from_secs(218));
        assert_eq!(table.settle_time(100.0), Duration::from_secs(41));
    }

    #[test]
    fn test_between_entries_uses_slower_neighbour() {
        let table = RbwSettleTable::default();
        assert_eq!(table.settle_time(30.0), Duration::from_secs(218));
        assert!(table.settle_time(30.0) > table.settle_time(100.0));
        // Narrower than anything measured: slowest entry
        assert_eq!(table.settle_time(3.0), Duration::from_secs(218));
        // Wider than anything measured: fastest entry
        assert_eq!(table.settle_time(1000.0), Duration::from_secs(41));
    }

    #[test]
    fn test_empty_table_does_not_wait() {
        let table = RbwSettleTable::new(Vec::new());
        assert_eq!(table.settle_time(100.0), Duration::ZERO);
    }

    #[test]
    fn test_wait_aborts_early() {
        let abort = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!wait(Duration::from_secs(10), &abort));
        assert!(start.elapsed() < Duration::from_secs(1));

        let abort = AtomicBool::new(false);
        assert!(wait(Duration::from_millis(20), &abort));
    }
}
