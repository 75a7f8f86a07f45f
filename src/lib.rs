// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod feed;
pub mod http;
pub mod model;
pub mod progress;
pub mod protocol;
pub mod session;
pub mod store;

// Re-export main types for convenience
pub use config::{SyncConfig, SyncSettings, SyncSettingsUpdate};
pub use credentials::{CredentialStore, Credentials, FileCredentialStore};
pub use engine::{SyncEngine, SyncOptions, SyncReport};
pub use error::{
    ConfigError, CredentialError, FeedError, ProtocolError, StoreError, SyncError, SyncOperation,
};
pub use feed::{BareMetadataResolver, FeedMetadataResolver, MetadataResolver};
pub use http::{HttpClient, HttpRequest, HttpResponse, ReqwestClient, SharedHttpClient};
pub use model::{
    EpisodeAction, EpisodeState, EpochMillis, PodcastMetadata, RemoteUpdate, Subscription,
    SubscriptionDelta,
};
pub use progress::{NoopReporter, ProgressEvent, ProgressReporter, SharedProgressReporter};
pub use protocol::{Protocol, ProtocolKind, ProtocolOptions, SyncProtocol};
pub use session::{SyncOutcome, SyncSession, SyncStatus};
pub use store::{JsonFileStore, LocalStore, MemoryStore};
