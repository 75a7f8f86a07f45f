// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{LocalStore, StoreData};
use crate::error::StoreError;
use crate::model::{EpisodeState, EpochMillis, Subscription};

/// Name of the store document inside a data directory
pub const STORE_FILENAME: &str = "state.json";

/// A store persisted as a single JSON document
///
/// Every mutation rewrites the document through a `.partial` sibling that
/// is renamed over the target, so an interrupted write leaves the previous
/// version in place.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl JsonFileStore {
    /// Open the store at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let data = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| StoreError::JsonParseFailed {
                    path: path.clone(),
                    source: e,
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => return Err(StoreError::ReadFailed { path, source: e }),
        };

        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    /// Open `state.json` inside a data directory, creating the directory
    pub async fn open_in_dir(dir: &Path) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: dir.to_path_buf(),
                source: e,
            })?;
        Self::open(dir.join(STORE_FILENAME)).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the data, which replaces the held data
    /// only once it is written. Returns what `change` returned.
    async fn modify(
        &self,
        change: impl FnOnce(&mut StoreData) -> bool + Send,
    ) -> Result<bool, StoreError> {
        let mut data = self.data.lock().await;
        let mut next = data.clone();
        if !change(&mut next) {
            return Ok(false);
        }
        self.persist(&next).await?;
        *data = next;
        Ok(true)
    }

    async fn persist(&self, data: &StoreData) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(data)?;
        let partial = partial_path(&self.path);

        tokio::fs::write(&partial, json)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: partial.clone(),
                source: e,
            })?;

        tokio::fs::rename(&partial, &self.path)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: self.path.clone(),
                source: e,
            })
    }
}

/// Sibling of `path` that a new version is written to before the rename
pub(crate) fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".partial");
    path.with_file_name(name)
}

#[async_trait]
impl LocalStore for JsonFileStore {
    async fn episode_states_since(&self, since: EpochMillis) -> Result<Vec<EpisodeState>, StoreError> {
        Ok(self.data.lock().await.episode_states_since(since))
    }

    async fn episode_state(&self, episode_id: &str) -> Result<Option<EpisodeState>, StoreError> {
        Ok(self.data.lock().await.episodes.get(episode_id).cloned())
    }

    async fn upsert_episode_state(&self, state: EpisodeState) -> Result<bool, StoreError> {
        self.modify(|data| data.upsert_episode_state(state)).await
    }

    async fn subscriptions(&self) -> Result<Vec<Subscription>, StoreError> {
        Ok(self.data.lock().await.subscriptions.values().cloned().collect())
    }

    async fn add_subscription(&self, subscription: Subscription) -> Result<bool, StoreError> {
        self.modify(|data| data.add_subscription(subscription)).await
    }

    async fn remove_subscription(&self, feed_url: &str) -> Result<bool, StoreError> {
        self.modify(|data| data.remove_subscription(feed_url)).await
    }

    async fn misc_value(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.data.lock().await.misc.get(key).cloned())
    }

    async fn set_misc_value(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify(|data| {
            data.misc.insert(key.to_string(), value.to_string());
            true
        })
        .await?;
        Ok(())
    }
}
