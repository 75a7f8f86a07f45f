// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Display metadata for feeds that another device subscribed to.

mod fetch;
mod parse;

use async_trait::async_trait;

use crate::error::FeedError;
use crate::http::HttpClient;
use crate::model::{PodcastMetadata, Subscription};

pub use fetch::fetch_feed_bytes;
pub use parse::parse_podcast_metadata;

/// Looks up display metadata for a feed URL
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, feed_url: &str) -> Result<PodcastMetadata, FeedError>;
}

/// Resolves metadata by fetching and parsing the RSS feed
pub struct FeedMetadataResolver<C: HttpClient> {
    client: C,
}

impl<C: HttpClient> FeedMetadataResolver<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> MetadataResolver for FeedMetadataResolver<C> {
    async fn resolve(&self, feed_url: &str) -> Result<PodcastMetadata, FeedError> {
        let bytes = fetch_feed_bytes(&self.client, feed_url).await?;
        parse_podcast_metadata(&bytes)
    }
}

/// Resolves every feed to bare metadata named after its URL, without
/// touching the network
#[derive(Debug, Default, Clone, Copy)]
pub struct BareMetadataResolver;

#[async_trait]
impl MetadataResolver for BareMetadataResolver {
    async fn resolve(&self, feed_url: &str) -> Result<PodcastMetadata, FeedError> {
        Ok(Subscription::bare(feed_url).metadata)
    }
}
