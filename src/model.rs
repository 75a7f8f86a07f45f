// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the only time unit used by the engine
pub type EpochMillis = i64;

/// Playback state of a single episode
///
/// The episode key is the enclosure URL; the podcast is identified by its
/// feed URL. Positions and totals are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeState {
    pub podcast_id: String,
    pub episode_id: String,
    pub position: f64,
    pub total: f64,
    pub timestamp: EpochMillis,
}

impl EpisodeState {
    /// Build a state with position and total normalized the way the store
    /// records them: whole seconds, position never past the total.
    pub fn normalized(
        episode_id: impl Into<String>,
        podcast_id: impl Into<String>,
        position: f64,
        total: f64,
        timestamp: EpochMillis,
    ) -> Self {
        let position = position.max(0.0).floor();
        let total = total.max(0.0).floor();

        Self {
            podcast_id: podcast_id.into(),
            episode_id: episode_id.into(),
            position: position.min(total),
            total: position.max(total),
            timestamp,
        }
    }

    /// Whether a write carrying `timestamp` may replace this record
    pub fn is_superseded_by(&self, timestamp: EpochMillis) -> bool {
        timestamp > self.timestamp
    }
}

/// Display metadata of a subscribed podcast, owned by the local store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodcastMetadata {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_url_large: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A subscribed feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub feed_url: String,
    pub metadata: PodcastMetadata,
}

impl Subscription {
    /// A subscription without resolved metadata, named after its feed URL
    pub fn bare(feed_url: impl Into<String>) -> Self {
        let feed_url = feed_url.into();
        Self {
            metadata: PodcastMetadata {
                name: feed_url.clone(),
                ..Default::default()
            },
            feed_url,
        }
    }
}

/// Add/remove changes to a subscription set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDelta {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl SubscriptionDelta {
    pub fn new(add: Vec<String>, remove: Vec<String>) -> Self {
        Self { add, remove }
    }

    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }

    /// Deduplicate both lists. A feed listed in both ends up subscribed, so
    /// it is kept in `add` only.
    pub fn normalized(&self) -> Self {
        let add: BTreeSet<&String> = self.add.iter().collect();
        let remove: BTreeSet<&String> = self
            .remove
            .iter()
            .filter(|url| !add.contains(url))
            .collect();

        Self {
            add: add.into_iter().cloned().collect(),
            remove: remove.into_iter().cloned().collect(),
        }
    }
}

/// Episode action kinds of the gpodder episode API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EpisodeAction {
    Download,
    Play,
    Delete,
    New,
}

impl EpisodeAction {
    /// Parse an action name case-insensitively
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "DOWNLOAD" => Some(Self::Download),
            "PLAY" => Some(Self::Play),
            "DELETE" => Some(Self::Delete),
            "NEW" => Some(Self::New),
            _ => None,
        }
    }
}

/// An episode action exchanged with a sync server, with its timestamp
/// already normalized to epoch millis
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteUpdate {
    pub podcast: String,
    pub episode: String,
    pub position: f64,
    pub total: f64,
    pub timestamp: EpochMillis,
    pub action: EpisodeAction,
}

impl RemoteUpdate {
    /// Only `PLAY` actions carry playback state
    pub fn is_play(&self) -> bool {
        self.action == EpisodeAction::Play
    }

    /// The local record this update would write
    pub fn to_episode_state(&self) -> EpisodeState {
        EpisodeState::normalized(
            self.episode.clone(),
            self.podcast.clone(),
            self.position,
            self.total,
            self.timestamp,
        )
    }
}

impl From<&EpisodeState> for RemoteUpdate {
    fn from(state: &EpisodeState) -> Self {
        Self {
            podcast: state.podcast_id.clone(),
            episode: state.episode_id.clone(),
            position: state.position,
            total: state.total,
            timestamp: state.timestamp,
            action: EpisodeAction::Play,
        }
    }
}
