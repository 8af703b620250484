//! Server time reconciliation.

use crate::clock::AppClock;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// The outcome of one server time query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServerTimeSample {
    /// Server time mapped onto the application timeline.
    pub server_time: DateTime<Utc>,
    /// Seconds added to local time to approximate server time.
    pub offset: i64,
}

/// Computes the local/server clock offset and remembers the latest one.
pub struct ServerTimeReconciler {
    clock: Arc<dyn AppClock>,
    max_acceptable_offset_secs: i64,
    latest: RwLock<Option<ServerTimeSample>>,
}

impl ServerTimeReconciler {
    /// Creates a reconciler with no known offset.
    pub fn new(clock: Arc<dyn AppClock>, max_acceptable_offset_secs: i64) -> Self {
        Self {
            clock,
            max_acceptable_offset_secs,
            latest: RwLock::new(None),
        }
    }

    /// Records a server time query result.
    ///
    /// Returns `None` and keeps the previous sample when the query failed.
    pub fn reconcile(&self, server_time: Option<DateTime<Utc>>) -> Option<ServerTimeSample> {
        let server_time = self.clock.application_time(server_time?);
        let offset = (server_time - self.clock.now()).num_seconds();
        let sample = ServerTimeSample {
            server_time,
            offset,
        };
        debug!(offset, %server_time, "server time reconciled");
        *self.latest.write() = Some(sample);
        Some(sample)
    }

    /// The latest sample, if any query has succeeded.
    pub fn latest(&self) -> Option<ServerTimeSample> {
        *self.latest.read()
    }

    /// The latest offset in seconds.
    pub fn offset(&self) -> Option<i64> {
        self.latest().map(|sample| sample.offset)
    }

    /// Returns true if an offset is known and its magnitude is acceptable.
    pub fn is_within_acceptable_range(&self) -> bool {
        self.offset()
            .is_some_and(|offset| self.is_acceptable(offset))
    }

    /// Returns true if `offset` is within the acceptable range.
    pub fn is_acceptable(&self, offset: i64) -> bool {
        offset.abs() <= self.max_acceptable_offset_secs
    }

    /// Forgets the latest sample.
    pub fn clear(&self) {
        *self.latest.write() = None;
    }
}

impl std::fmt::Debug for ServerTimeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTimeReconciler")
            .field("latest", &self.latest())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{AcceleratedClock, ManualClock};
    use chrono::{Duration, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn offset_is_server_minus_local() {
        let clock = Arc::new(ManualClock::new(at(1_700_000_000)));
        let reconciler = ServerTimeReconciler::new(clock, 60);

        let sample = reconciler.reconcile(Some(at(1_700_000_090))).unwrap();
        assert_eq!(sample.offset, 90);
        assert_eq!(reconciler.offset(), Some(90));
        assert!(!reconciler.is_within_acceptable_range());

        reconciler.reconcile(Some(at(1_699_999_970))).unwrap();
        assert_eq!(reconciler.offset(), Some(-30));
        assert!(reconciler.is_within_acceptable_range());
    }

    #[test]
    fn offset_truncates_toward_zero() {
        let clock = Arc::new(ManualClock::new(at(1_700_000_000)));
        let reconciler = ServerTimeReconciler::new(clock, 60);
        let server = at(1_700_000_000) - Duration::milliseconds(1_500);
        assert_eq!(reconciler.reconcile(Some(server)).unwrap().offset, -1);
    }

    #[test]
    fn failed_query_keeps_previous_sample() {
        let clock = Arc::new(ManualClock::new(at(1_700_000_000)));
        let reconciler = ServerTimeReconciler::new(clock, 60);
        reconciler.reconcile(Some(at(1_700_000_010)));

        assert!(reconciler.reconcile(None).is_none());
        assert_eq!(reconciler.offset(), Some(10));

        reconciler.clear();
        assert_eq!(reconciler.offset(), None);
        assert!(!reconciler.is_within_acceptable_range());
    }

    #[test]
    fn server_time_mapped_onto_accelerated_timeline() {
        let real = at(1_700_000_000);
        let app = at(1_600_000_000);
        let clock = Arc::new(AcceleratedClock::anchored(real, app, 60));
        let reconciler = ServerTimeReconciler::new(clock, 60);

        let sample = reconciler.reconcile(Some(real)).unwrap();
        assert_eq!(sample.server_time, app);
    }
}
