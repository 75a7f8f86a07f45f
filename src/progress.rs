// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use crate::model::EpochMillis;

/// Events emitted during a sync cycle for progress reporting
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A cycle started, pulling changes made after `since`
    CycleStarted { since: EpochMillis },

    /// Episode actions arrived from the server
    EpisodesPulled { count: usize },

    /// Pulled episode actions were reconciled with local state
    EpisodesApplied {
        /// Written to the local store
        applied: usize,
        /// Older than or as old as the local record
        stale: usize,
        /// Not playback actions
        ignored: usize,
    },

    /// Local episode states were sent to the server
    EpisodesPushed { count: usize },

    /// Subscription changes arrived from the server
    SubscriptionsPulled { added: usize, removed: usize },

    /// Pulled subscription changes were applied to the local set
    SubscriptionsApplied { added: usize, removed: usize },

    /// Local subscription changes were sent to the server
    SubscriptionsPushed { added: usize, removed: usize },

    /// The cycle finished and the cursor moved
    CycleCompleted { cursor: EpochMillis },

    /// The cycle aborted; the cursor was left untouched
    CycleFailed { error: String },
}

/// Trait for reporting progress events during synchronization.
///
/// Implementations can use this to display spinners, log messages,
/// or collect statistics.
pub trait ProgressReporter: Send + Sync {
    /// Report a progress event
    fn report(&self, event: ProgressEvent);
}

/// A shared reference to a progress reporter
pub type SharedProgressReporter = Arc<dyn ProgressReporter>;

/// A no-op progress reporter that silently ignores all events.
/// Useful for tests or quiet mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn report(&self, _event: ProgressEvent) {}
}

impl NoopReporter {
    /// Create a new NoopReporter wrapped in an Arc
    pub fn shared() -> SharedProgressReporter {
        Arc::new(Self)
    }
}

/// Reporter that keeps every event, for tests
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingReporter {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

#[cfg(test)]
impl RecordingReporter {
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl ProgressReporter for RecordingReporter {
    fn report(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_handles_all_events() {
        let reporter = NoopReporter::shared();

        reporter.report(ProgressEvent::CycleStarted { since: 0 });
        reporter.report(ProgressEvent::EpisodesPulled { count: 3 });
        reporter.report(ProgressEvent::EpisodesApplied {
            applied: 1,
            stale: 1,
            ignored: 1,
        });
        reporter.report(ProgressEvent::EpisodesPushed { count: 2 });
        reporter.report(ProgressEvent::SubscriptionsPulled {
            added: 1,
            removed: 0,
        });
        reporter.report(ProgressEvent::SubscriptionsApplied {
            added: 1,
            removed: 0,
        });
        reporter.report(ProgressEvent::SubscriptionsPushed {
            added: 0,
            removed: 1,
        });
        reporter.report(ProgressEvent::CycleCompleted {
            cursor: 1_705_312_800_000,
        });
        reporter.report(ProgressEvent::CycleFailed {
            error: "Connection timeout".to_string(),
        });
    }

    #[test]
    fn recording_reporter_keeps_order() {
        let reporter = RecordingReporter::default();

        reporter.report(ProgressEvent::CycleStarted { since: 5 });
        reporter.report(ProgressEvent::CycleCompleted { cursor: 10 });

        let events = reporter.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProgressEvent::CycleStarted { since: 5 }));
        assert!(matches!(events[1], ProgressEvent::CycleCompleted { cursor: 10 }));
    }
}
