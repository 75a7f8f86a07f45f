// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{LocalStore, StoreData};
use crate::error::StoreError;
use crate::model::{EpisodeState, EpochMillis, Subscription};

/// A volatile store, useful for tests and for hosts that keep their own
/// persistence
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(data: StoreData) -> Self {
        Self {
            data: Mutex::new(data),
        }
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> StoreData {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, StoreData> {
        // A poisoned lock still holds consistent data: every mutation is a
        // single map operation.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn episode_states_since(&self, since: EpochMillis) -> Result<Vec<EpisodeState>, StoreError> {
        Ok(self.lock().episode_states_since(since))
    }

    async fn episode_state(&self, episode_id: &str) -> Result<Option<EpisodeState>, StoreError> {
        Ok(self.lock().episodes.get(episode_id).cloned())
    }

    async fn upsert_episode_state(&self, state: EpisodeState) -> Result<bool, StoreError> {
        Ok(self.lock().upsert_episode_state(state))
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.lock().subscriptions.values().cloned().collect())
    }

    async fn add_subscription(&self, subscription: Subscription) -> Result<bool, StoreError> {
        Ok(self.lock().add_subscription(subscription))
    }

    async fn remove_subscription(&self, feed_url: &str) -> Result<bool, StoreError> {
        Ok(self.lock().remove_subscription(feed_url))
    }

    async fn misc_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.lock().misc.get(key).cloned())
    }

    async fn set_misc_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.lock().misc.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
