// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One reconciliation cycle between the local store and a sync server.
//!
//! Episode states are merged last-write-wins per episode; subscriptions are
//! merged as add/remove deltas with set semantics. The stored cursor is the
//! only commit point and is written after everything else succeeded, so an
//! aborted cycle is simply repeated by the next one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncOperation};
use crate::feed::{BareMetadataResolver, MetadataResolver};
use crate::model::{EpochMillis, RemoteUpdate, Subscription, SubscriptionDelta};
use crate::progress::{NoopReporter, ProgressEvent, SharedProgressReporter};
use crate::protocol::SyncProtocol;
use crate::store::LocalStore;

/// How far the cursor is rewound before pulling
pub const DEFAULT_CURSOR_OVERLAP: Duration = Duration::from_secs(600);

/// Subscription changes made by the user since the last cycle
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Feeds the user subscribed to
    pub add_subscriptions: Vec<String>,
    /// Feeds the user unsubscribed from
    pub remove_subscriptions: Vec<String>,
}

impl SyncOptions {
    fn outgoing_delta(&self) -> SubscriptionDelta {
        SubscriptionDelta::new(
            self.add_subscriptions.clone(),
            self.remove_subscriptions.clone(),
        )
        .normalized()
    }
}

/// Result of a completed sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Episode actions received from the server
    pub episodes_pulled: usize,
    /// Remote playback states written locally
    pub episodes_applied: usize,
    /// Remote playback states not newer than the local record
    pub episodes_stale: usize,
    /// Remote actions that are not playback actions
    pub episodes_ignored: usize,
    /// Local playback states sent to the server
    pub episodes_pushed: usize,
    /// Feeds added to the local subscription set
    pub subscriptions_added: usize,
    /// Feeds removed from the local subscription set
    pub subscriptions_removed: usize,
    /// Add and remove entries sent to the server
    pub subscriptions_pushed: usize,
    /// Cursor stored at the end of the cycle
    pub cursor: EpochMillis,
}

/// Runs sync cycles against one store and one server
pub struct SyncEngine {
    store: Arc<dyn LocalStore>,
    protocol: Arc<dyn SyncProtocol>,
    resolver: Arc<dyn MetadataResolver>,
    reporter: SharedProgressReporter,
    cursor_overlap: Duration,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn LocalStore>, protocol: Arc<dyn SyncProtocol>) -> Self {
        Self {
            store,
            protocol,
            resolver: Arc::new(BareMetadataResolver),
            reporter: NoopReporter::shared(),
            cursor_overlap: DEFAULT_CURSOR_OVERLAP,
        }
    }

    /// Resolve display metadata of feeds added by other devices
    pub fn with_resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cursor_overlap(mut self, overlap: Duration) -> Self {
        self.cursor_overlap = overlap;
        self
    }

    /// Run one full cycle. On failure the cursor is left untouched.
    pub async fn run_cycle(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        match self.cycle(options).await {
            Ok(report) => {
                self.reporter.report(ProgressEvent::CycleCompleted {
                    cursor: report.cursor,
                });
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "Sync cycle aborted");
                self.reporter.report(ProgressEvent::CycleFailed {
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn cycle(&self, options: &SyncOptions) -> Result<SyncReport, SyncError> {
        let cursor = self.store.last_sync_timestamp().await?;
        let overlap = EpochMillis::try_from(self.cursor_overlap.as_millis()).unwrap_or(EpochMillis::MAX);
        let since = cursor.saturating_sub(overlap).max(0);

        info!(cursor, since, protocol = %self.protocol.kind(), "Starting sync cycle");
        self.reporter.report(ProgressEvent::CycleStarted { since });

        let mut report = SyncReport::default();
        self.reconcile_episodes(since, &mut report).await?;
        self.reconcile_subscriptions(since, options, &mut report).await?;

        // The device clock may have been set back since the last cycle
        let now = Utc::now().timestamp_millis();
        report.cursor = now.max(cursor);
        self.store.set_last_sync_timestamp(report.cursor).await?;

        info!(
            applied = report.episodes_applied,
            pushed = report.episodes_pushed,
            subscriptions_added = report.subscriptions_added,
            subscriptions_removed = report.subscriptions_removed,
            cursor = report.cursor,
            "Sync cycle completed"
        );
        Ok(report)
    }

    async fn reconcile_episodes(&self, since: EpochMillis, report: &mut SyncReport) -> Result<(), SyncError> {
        let pulled = self
            .protocol
            .pull_episode_updates(since)
            .await
            .map_err(|e| SyncError::from_protocol(SyncOperation::PullEpisodes, e))?;

        report.episodes_pulled = pulled.len();
        self.reporter.report(ProgressEvent::EpisodesPulled {
            count: pulled.len(),
        });

        let (plays, others): (Vec<_>, Vec<_>) = pulled.into_iter().partition(RemoteUpdate::is_play);
        report.episodes_ignored = others.len();
        let play_count = plays.len();

        let newest = newest_per_episode(plays);
        for update in newest.values() {
            if self.store.upsert_episode_state(update.to_episode_state()).await? {
                debug!(episode = %update.episode, timestamp = update.timestamp, "Applied remote playback state");
                report.episodes_applied += 1;
            }
        }
        report.episodes_stale = play_count - report.episodes_applied;

        self.reporter.report(ProgressEvent::EpisodesApplied {
            applied: report.episodes_applied,
            stale: report.episodes_stale,
            ignored: report.episodes_ignored,
        });

        // Read after applying, and never send back a state the server
        // already knows something at least as recent about.
        let outgoing: Vec<RemoteUpdate> = self
            .store
            .episode_states_since(since)
            .await?
            .iter()
            .filter(|state| {
                newest
                    .get(&state.episode_id)
                    .is_none_or(|remote| state.timestamp > remote.timestamp)
            })
            .map(RemoteUpdate::from)
            .collect();

        if outgoing.is_empty() {
            debug!("No local playback changes to push");
            return Ok(());
        }

        self.protocol
            .push_episode_updates(&outgoing)
            .await
            .map_err(|e| SyncError::from_protocol(SyncOperation::PushEpisodes, e))?;

        report.episodes_pushed = outgoing.len();
        self.reporter.report(ProgressEvent::EpisodesPushed {
            count: outgoing.len(),
        });
        Ok(())
    }

    async fn reconcile_subscriptions(
        &self,
        since: EpochMillis,
        options: &SyncOptions,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let remote = self
            .protocol
            .pull_subscription_updates(since)
            .await
            .map_err(|e| SyncError::from_protocol(SyncOperation::PullSubscriptions, e))?;

        self.reporter.report(ProgressEvent::SubscriptionsPulled {
            added: remote.add.len(),
            removed: remote.remove.len(),
        });

        // Remote changes first, then the user's own, so that what this
        // device decided is what it ends up with.
        let outgoing = options.outgoing_delta();
        self.apply_delta(&remote, report).await?;
        self.apply_delta(&outgoing, report).await?;

        self.reporter.report(ProgressEvent::SubscriptionsApplied {
            added: report.subscriptions_added,
            removed: report.subscriptions_removed,
        });

        if outgoing.is_empty() {
            debug!("No local subscription changes to push");
            return Ok(());
        }

        self.protocol
            .push_subscription_updates(&outgoing)
            .await
            .map_err(|e| SyncError::from_protocol(SyncOperation::PushSubscriptions, e))?;

        report.subscriptions_pushed = outgoing.add.len() + outgoing.remove.len();
        self.reporter.report(ProgressEvent::SubscriptionsPushed {
            added: outgoing.add.len(),
            removed: outgoing.remove.len(),
        });
        Ok(())
    }

    /// Apply removals, then additions, with set semantics
    async fn apply_delta(&self, delta: &SubscriptionDelta, report: &mut SyncReport) -> Result<(), SyncError> {
        for feed_url in &delta.remove {
            if self.store.remove_subscription(feed_url).await? {
                info!(feed = %feed_url, "Unsubscribed");
                report.subscriptions_removed += 1;
            }
        }

        for feed_url in &delta.add {
            if self.store.is_subscribed(feed_url).await? {
                continue;
            }
            let subscription = self.resolve(feed_url).await;
            if self.store.add_subscription(subscription).await? {
                info!(feed = %feed_url, "Subscribed");
                report.subscriptions_added += 1;
            }
        }
        Ok(())
    }

    async fn resolve(&self, feed_url: &str) -> Subscription {
        match self.resolver.resolve(feed_url).await {
            Ok(metadata) => Subscription {
                feed_url: feed_url.to_string(),
                metadata,
            },
            Err(e) => {
                warn!(feed = %feed_url, error = %e, "Could not resolve feed metadata, subscribing without it");
                Subscription::bare(feed_url)
            }
        }
    }
}

/// Keep only the most recent update of each episode
fn newest_per_episode(updates: Vec<RemoteUpdate>) -> HashMap<String, RemoteUpdate> {
    let mut newest: HashMap<String, RemoteUpdate> = HashMap::new();
    for update in updates {
        match newest.get(&update.episode) {
            Some(existing) if existing.timestamp >= update.timestamp => {}
            _ => {
                newest.insert(update.episode.clone(), update);
            }
        }
    }
    newest
}
