//! Observable counters. Every dropped event and every failed mission bumps
//! exactly one of these.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct Counters {
            $($field: AtomicU64,)*
        }

        #[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
        pub struct CounterSnapshot {
            $(pub $field: u64,)*
        }

        impl Counters {
            $(
                pub fn $field(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters!(
    events_received,
    events_unknown_source,
    events_malformed,
    events_suppressed,
    events_below_threshold,
    events_overflowed,
    events_refused,
    events_abandoned,
    events_enqueued,
    planning_failed,
    missions_dispatched,
    missions_completed,
    missions_failed,
    returns_completed,
    returns_failed,
    aborts_requested,
);

impl CounterSnapshot {
    /// Events that never became a mission.
    pub fn events_dropped(&self) -> u64 {
        self.events_unknown_source
            + self.events_malformed
            + self.events_suppressed
            + self.events_below_threshold
            + self.events_overflowed
            + self.events_refused
            + self.events_abandoned
            + self.planning_failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_increments() {
        let counters = Counters::default();
        counters.events_received();
        counters.events_received();
        counters.events_overflowed();
        let snap = counters.snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.events_overflowed, 1);
        assert_eq!(snap.events_dropped(), 1);
    }
}
