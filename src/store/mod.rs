// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Local state store: episode playback state, the subscription set and
//! miscellaneous settings.
//!
//! The store is the source of truth for this device. The sync engine only
//! talks to it through [`LocalStore`].

mod data;
mod file;
mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{EpisodeState, EpochMillis, Subscription};

pub use data::StoreData;
pub use file::JsonFileStore;
pub(crate) use file::partial_path;
pub use memory::MemoryStore;

/// Misc key holding the cursor of the last successful sync cycle
pub const LAST_SYNC_KEY: &str = "lastSync";

/// Misc key holding the base64 credential cipher key
pub const SYNC_KEY: &str = "syncKey";

/// Query contract of the local state store
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// All episode states with a timestamp strictly after `since`
    async fn episode_states_since(&self, since: EpochMillis) -> Result<Vec<EpisodeState>, StoreError>;

    /// Current state of a single episode
    async fn episode_state(&self, episode_id: &str) -> Result<Option<EpisodeState>, StoreError>;

    /// Write an episode state if its timestamp is strictly newer than the
    /// stored one. Returns whether the write was applied.
    async fn upsert_episode_state(&self, state: EpisodeState) -> Result<bool, StoreError>;

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError>;

    /// Add a subscription unless its feed is already subscribed. Returns
    /// whether the set changed.
    async fn add_subscription(&self, subscription: Subscription) -> Result<bool, StoreError>;

    /// Remove a subscription by feed URL. Returns whether the set changed.
    async fn remove_subscription(&self, feed_url: &str) -> Result<bool, StoreError>;

    async fn misc_value(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_misc_value(&self, key: &str, value: &str) -> Result<(), StoreError>;

    async fn is_subscribed(&self, feed_url: &str) -> Result<bool, StoreError> {
        Ok(self
            .subscriptions()
            .await?
            .iter()
            .any(|sub| sub.feed_url == feed_url))
    }

    /// Cursor of the last successful sync, 0 if never synced
    async fn last_sync_timestamp(&self) -> Result<EpochMillis, StoreError> {
        match self.misc_value(LAST_SYNC_KEY).await? {
            None => Ok(0),
            Some(value) => value.trim().parse().map_err(|_| StoreError::InvalidValue {
                key: LAST_SYNC_KEY.to_string(),
                value,
            }),
        }
    }

    async fn set_last_sync_timestamp(&self, timestamp: EpochMillis) -> Result<(), StoreError> {
        self.set_misc_value(LAST_SYNC_KEY, &timestamp.to_string())
            .await
    }

    async fn sync_key(&self) -> Result<Option<String>, StoreError> {
        self.misc_value(SYNC_KEY).await
    }

    async fn set_sync_key(&self, key: &str) -> Result<(), StoreError> {
        self.set_misc_value(SYNC_KEY, key).await
    }
}
