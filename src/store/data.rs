// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{EpisodeState, EpochMillis, Subscription};

/// In-memory contents of a local store, shared by the store backends
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub episodes: BTreeMap<String, EpisodeState>,
    #[serde(default)]
    pub subscriptions: BTreeMap<String, Subscription>,
    #[serde(default)]
    pub misc: BTreeMap<String, String>,
}

impl StoreData {
    pub fn episode_states_since(&self, since: EpochMillis) -> Vec<EpisodeState> {
        self.episodes
            .values()
            .filter(|state| state.timestamp > since)
            .cloned()
            .collect()
    }

    /// Last-write-wins upsert at the row level
    pub fn upsert_episode_state(&mut self, state: EpisodeState) -> bool {
        let state = EpisodeState::normalized(
            state.episode_id,
            state.podcast_id,
            state.position,
            state.total,
            state.timestamp,
        );

        if let Some(existing) = self.episodes.get(&state.episode_id)
            && !existing.is_superseded_by(state.timestamp)
        {
            return false;
        }

        self.episodes.insert(state.episode_id.clone(), state);
        true
    }

    pub fn add_subscription(&mut self, subscription: Subscription) -> bool {
        if self.subscriptions.contains_key(&subscription.feed_url) {
            return false;
        }
        self.subscriptions
            .insert(subscription.feed_url.clone(), subscription);
        true
    }

    pub fn remove_subscription(&mut self, feed_url: &str) -> bool {
        self.subscriptions.remove(feed_url).is_some()
    }
}
