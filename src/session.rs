// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The sync session: the single entry point hosts call to synchronize.
//!
//! The session owns the status state machine
//! (`standby -> synchronizing -> ok | error`), guarantees that at most one
//! cycle runs at a time and holds the protocol client selected at login.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{SyncSettings, SyncSettingsUpdate};
use crate::credentials::{
    clear_credentials, load_credentials, store_credentials, CredentialStore, Credentials,
};
use crate::engine::{SyncEngine, SyncOptions, SyncReport};
use crate::error::{CredentialError, SyncError};
use crate::feed::{FeedMetadataResolver, MetadataResolver};
use crate::http::SharedHttpClient;
use crate::model::EpochMillis;
use crate::progress::{NoopReporter, SharedProgressReporter};
use crate::protocol::{LoginFlow, Protocol, ProtocolKind, ProtocolOptions, SyncProtocol};
use crate::store::LocalStore;

/// Externally observable state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Standby,
    Synchronizing,
    Ok,
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStatus::Standby => "standby",
            SyncStatus::Synchronizing => "synchronizing",
            SyncStatus::Ok => "ok",
            SyncStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// What a call to [`SyncSession::perform_sync`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another cycle was in progress; nothing was done
    AlreadyRunning,
}

/// Marks the cycle failed if it is dropped before finishing
struct CycleGuard<'a> {
    status: &'a watch::Sender<SyncStatus>,
    finished: bool,
}

impl CycleGuard<'_> {
    fn finish(mut self, status: SyncStatus) {
        self.finished = true;
        self.status.send_replace(status);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.status.send_replace(SyncStatus::Error);
        }
    }
}

pub struct SyncSession {
    store: Arc<dyn LocalStore>,
    credentials: Arc<dyn CredentialStore>,
    http: SharedHttpClient,
    resolver: Arc<dyn MetadataResolver>,
    reporter: SharedProgressReporter,
    options: ProtocolOptions,
    settings: Mutex<SyncSettings>,
    status: watch::Sender<SyncStatus>,
    last_error: Mutex<Option<String>>,
    protocol: tokio::sync::Mutex<Option<Arc<dyn SyncProtocol>>>,
}

impl SyncSession {
    pub fn new(
        store: Arc<dyn LocalStore>,
        credentials: Arc<dyn CredentialStore>,
        http: SharedHttpClient,
        settings: SyncSettings,
        options: ProtocolOptions,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Standby);
        Self {
            resolver: Arc::new(FeedMetadataResolver::new(http.clone())),
            store,
            credentials,
            http,
            reporter: NoopReporter::shared(),
            options,
            settings: Mutex::new(settings),
            status,
            last_error: Mutex::new(None),
            protocol: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn MetadataResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_reporter(mut self, reporter: SharedProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status transition
    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    /// Message of the most recent failed cycle, cleared by a successful one
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn settings(&self) -> SyncSettings {
        lock(&self.settings).clone()
    }

    pub fn update_settings(&self, update: &SyncSettingsUpdate) -> SyncSettings {
        let mut settings = lock(&self.settings);
        settings.apply(update);
        settings.clone()
    }

    /// Protocol with stored credentials, if any
    pub async fn active_protocol(&self) -> Result<Option<ProtocolKind>, CredentialError> {
        self.credentials.active_protocol().await
    }

    /// Cursor of the last successful cycle, 0 if never synced
    pub async fn last_sync(&self) -> Result<EpochMillis, SyncError> {
        Ok(self.store.last_sync_timestamp().await?)
    }

    /// Use `protocol` for the following cycles instead of one built from the
    /// stored credentials
    pub async fn use_protocol(&self, protocol: Arc<dyn SyncProtocol>) {
        *self.protocol.lock().await = Some(protocol);
    }

    /// Run one sync cycle.
    ///
    /// Fails without touching the status or the network when no usable
    /// credentials are stored. Returns [`SyncOutcome::AlreadyRunning`] when
    /// a cycle is already in progress.
    pub async fn perform_sync(&self, options: SyncOptions) -> Result<SyncOutcome, SyncError> {
        let protocol = self.protocol().await?;

        let started = self.status.send_if_modified(|status| {
            if *status == SyncStatus::Synchronizing {
                false
            } else {
                *status = SyncStatus::Synchronizing;
                true
            }
        });
        if !started {
            debug!("Sync already in progress, ignoring request");
            return Ok(SyncOutcome::AlreadyRunning);
        }

        let guard = CycleGuard {
            status: &self.status,
            finished: false,
        };

        let engine = SyncEngine::new(self.store.clone(), protocol)
            .with_resolver(self.resolver.clone())
            .with_reporter(self.reporter.clone())
            .with_cursor_overlap(self.settings().cursor_overlap());

        match engine.run_cycle(&options).await {
            Ok(report) => {
                *lock(&self.last_error) = None;
                guard.finish(SyncStatus::Ok);
                Ok(SyncOutcome::Completed(report))
            }
            Err(e) => {
                *lock(&self.last_error) = Some(e.to_string());
                guard.finish(SyncStatus::Error);
                Err(e)
            }
        }
    }

    /// Sync after start-up if enabled in the settings
    pub async fn on_app_start(&self) -> Result<Option<SyncOutcome>, SyncError> {
        if !self.settings().sync_after_app_start {
            return Ok(None);
        }
        self.perform_sync(SyncOptions::default()).await.map(Some)
    }

    /// Sync before shutting down if enabled in the settings
    pub async fn on_app_close(&self) -> Result<Option<SyncOutcome>, SyncError> {
        if !self.settings().sync_before_app_close {
            return Ok(None);
        }
        self.perform_sync(SyncOptions::default()).await.map(Some)
    }

    /// Validate `credentials` against their server and store them.
    ///
    /// Fails with [`CredentialError::AlreadyLoggedIn`] while another
    /// protocol is logged in.
    pub async fn login(&self, credentials: Credentials) -> Result<(), CredentialError> {
        if let Some(active) = self.credentials.active_protocol().await?
            && active != credentials.protocol
        {
            return Err(CredentialError::AlreadyLoggedIn(active.to_string()));
        }

        let protocol = Protocol::connect(self.http.clone(), credentials.clone(), self.options)?;
        if !protocol.login().await? {
            return Err(CredentialError::Rejected);
        }

        store_credentials(self.store.as_ref(), self.credentials.as_ref(), &credentials).await?;
        *self.protocol.lock().await = Some(Arc::new(protocol));

        info!(protocol = %credentials.protocol, "Logged in");
        Ok(())
    }

    /// Run the Nextcloud login flow: `on_login_url` receives the URL the
    /// user has to open, then the session polls until access is granted.
    pub async fn login_nextcloud<F>(&self, server: &str, on_login_url: F) -> Result<(), CredentialError>
    where
        F: FnOnce(&str),
    {
        if let Some(active) = self.credentials.active_protocol().await?
            && active != ProtocolKind::Nextcloud
        {
            return Err(CredentialError::AlreadyLoggedIn(active.to_string()));
        }

        let flow = LoginFlow::start(self.http.as_ref(), server).await?;
        on_login_url(&flow.login_url);
        let credentials = flow.wait(self.http.as_ref(), &self.options).await?;

        self.login(credentials).await
    }

    /// Forget the stored credentials and the protocol client
    pub async fn logout(&self) -> Result<Option<ProtocolKind>, CredentialError> {
        let removed = clear_credentials(self.credentials.as_ref()).await?;
        *self.protocol.lock().await = None;
        self.status.send_if_modified(|status| {
            if *status == SyncStatus::Synchronizing || *status == SyncStatus::Standby {
                false
            } else {
                *status = SyncStatus::Standby;
                true
            }
        });
        Ok(removed)
    }

    async fn protocol(&self) -> Result<Arc<dyn SyncProtocol>, SyncError> {
        let mut cached = self.protocol.lock().await;
        if let Some(protocol) = cached.as_ref() {
            return Ok(protocol.clone());
        }

        let credentials = load_credentials(self.store.as_ref(), self.credentials.as_ref()).await?;
        let protocol: Arc<dyn SyncProtocol> = Arc::new(
            Protocol::connect(self.http.clone(), credentials, self.options)
                .map_err(CredentialError::from)?,
        );
        *cached = Some(protocol.clone());
        Ok(protocol)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tempfile::tempdir;
    use tokio::sync::Notify;

    use crate::credentials::FileCredentialStore;
    use crate::engine::fake::FakeProtocol;
    use crate::error::{ProtocolError, SyncOperation};
    use crate::feed::BareMetadataResolver;
    use crate::model::{EpisodeState, EpochMillis, RemoteUpdate, SubscriptionDelta};
    use crate::protocol::mock::MockHttpClient;
    use crate::store::MemoryStore;

    struct Harness {
        store: Arc<MemoryStore>,
        http: Arc<MockHttpClient>,
        session: SyncSession,
        _dir: tempfile::TempDir,
    }

    fn harness(http: MockHttpClient) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let http = Arc::new(http);
        let session = SyncSession::new(
            store.clone(),
            Arc::new(FileCredentialStore::in_dir(dir.path())),
            http.clone(),
            SyncSettings::default(),
            ProtocolOptions {
                poll_interval: Duration::ZERO,
                poll_attempts: 3,
                ..Default::default()
            },
        )
        .with_resolver(Arc::new(BareMetadataResolver));

        Harness {
            store,
            http,
            session,
            _dir: dir,
        }
    }

    fn gpodder_credentials() -> Credentials {
        Credentials::new(
            ProtocolKind::Gpodder,
            "https://gpodder.example.com",
            "alice",
            "secret",
        )
    }

    #[tokio::test]
    async fn sync_without_credentials_is_not_logged_in() {
        let h = harness(MockHttpClient::new());
        let status = h.session.subscribe_status();

        let err = h
            .session
            .perform_sync(SyncOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NotLoggedIn));
        assert!(h.http.requests().is_empty());
        assert_eq!(h.session.status(), SyncStatus::Standby);
        assert!(!status.has_changed().unwrap());
        assert!(h.session.last_error().is_none());
    }

    #[tokio::test]
    async fn sync_with_lost_key_is_missing_cipher_key() {
        let h = harness(MockHttpClient::new().respond(200, ""));
        h.session.login(gpodder_credentials()).await.unwrap();
        h.store.set_sync_key(&crate::credentials::generate_key()).await.unwrap();
        // Drop the cached client so the credentials are read again
        *h.session.protocol.lock().await = None;

        let err = h
            .session
            .perform_sync(SyncOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::MissingCipherKey));
        assert_eq!(h.session.status(), SyncStatus::Standby);
        assert_eq!(h.http.requests().len(), 1);
    }

    #[tokio::test]
    async fn successful_cycle_sets_ok() {
        let h = harness(MockHttpClient::new());
        let protocol = Arc::new(FakeProtocol::default());
        h.session.use_protocol(protocol).await;
        let mut status = h.session.subscribe_status();

        let outcome = h.session.perform_sync(SyncOptions::default()).await.unwrap();

        assert!(matches!(outcome, SyncOutcome::Completed(_)));
        assert_eq!(h.session.status(), SyncStatus::Ok);
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SyncStatus::Ok);
    }

    #[tokio::test]
    async fn failed_cycle_sets_error_and_message() {
        let h = harness(MockHttpClient::new());
        let protocol = Arc::new(FakeProtocol::default());
        protocol.fail_on(Some(SyncOperation::PullSubscriptions));
        h.session.use_protocol(protocol.clone()).await;

        let err = h
            .session
            .perform_sync(SyncOptions::default())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert_eq!(h.session.status(), SyncStatus::Error);
        assert!(h.session.last_error().unwrap().contains("pulling subscriptions"));
        assert_eq!(h.store.last_sync_timestamp().await.unwrap(), 0);

        protocol.fail_on(None);
        h.session.perform_sync(SyncOptions::default()).await.unwrap();
        assert_eq!(h.session.status(), SyncStatus::Ok);
        assert!(h.session.last_error().is_none());
    }

    /// Holds the first episode pull until released
    #[derive(Default)]
    struct GatedProtocol {
        inner: FakeProtocol,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SyncProtocol for GatedProtocol {
        fn kind(&self) -> ProtocolKind {
            self.inner.kind()
        }

        async fn login(&self) -> Result<bool, ProtocolError> {
            self.inner.login().await
        }

        async fn pull_episode_updates(&self, since: EpochMillis) -> Result<Vec<RemoteUpdate>, ProtocolError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.pull_episode_updates(since).await
        }

        async fn pull_subscription_updates(&self, since: EpochMillis) -> Result<SubscriptionDelta, ProtocolError> {
            self.inner.pull_subscription_updates(since).await
        }

        async fn push_episode_updates(&self, updates: &[RemoteUpdate]) -> Result<(), ProtocolError> {
            self.inner.push_episode_updates(updates).await
        }

        async fn push_subscription_updates(&self, delta: &SubscriptionDelta) -> Result<(), ProtocolError> {
            self.inner.push_subscription_updates(delta).await
        }
    }

    #[tokio::test]
    async fn overlapping_syncs_run_one_cycle() {
        let h = harness(MockHttpClient::new());
        let protocol = Arc::new(GatedProtocol::default());
        h.session.use_protocol(protocol.clone()).await;

        let first = h.session.perform_sync(SyncOptions::default());
        let second = async {
            protocol.entered.notified().await;
            assert_eq!(h.session.status(), SyncStatus::Synchronizing);
            let outcome = h.session.perform_sync(SyncOptions::default()).await;
            protocol.release.notify_one();
            outcome
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first.unwrap(), SyncOutcome::Completed(_)));
        assert_eq!(second.unwrap(), SyncOutcome::AlreadyRunning);
        assert_eq!(h.session.status(), SyncStatus::Ok);
        assert_eq!(protocol.inner.pulled_since.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_cycle_leaves_error_status() {
        let h = harness(MockHttpClient::new());
        {
            let _guard = CycleGuard {
                status: &h.session.status,
                finished: false,
            };
            assert_eq!(h.session.status(), SyncStatus::Standby);
        }
        assert_eq!(h.session.status(), SyncStatus::Error);
    }

    #[tokio::test]
    async fn app_hooks_follow_settings() {
        let h = harness(MockHttpClient::new());
        let protocol = Arc::new(FakeProtocol::default());
        h.session.use_protocol(protocol.clone()).await;

        assert!(h.session.on_app_start().await.unwrap().is_none());
        assert!(h.session.on_app_close().await.unwrap().is_none());
        assert_eq!(h.session.status(), SyncStatus::Standby);

        h.session.update_settings(&SyncSettingsUpdate {
            sync_after_app_start: Some(true),
            sync_before_app_close: Some(true),
            ..Default::default()
        });

        assert!(h.session.on_app_start().await.unwrap().is_some());
        assert!(h.session.on_app_close().await.unwrap().is_some());
        assert_eq!(protocol.pulled_since.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn login_is_exclusive_until_logout() {
        let h = harness(MockHttpClient::new().respond(200, "").respond(200, ""));
        h.session.login(gpodder_credentials()).await.unwrap();

        let nextcloud = Credentials::new(
            ProtocolKind::Nextcloud,
            "https://cloud.example.com",
            "alice",
            "app-password",
        );
        let err = h.session.login(nextcloud.clone()).await.unwrap_err();
        assert!(matches!(err, CredentialError::AlreadyLoggedIn(_)));
        // Rejected before contacting the second server
        assert_eq!(h.http.requests().len(), 1);

        assert_eq!(h.session.logout().await.unwrap(), Some(ProtocolKind::Gpodder));
        h.session.login(nextcloud).await.unwrap();
        assert_eq!(
            h.session.active_protocol().await.unwrap(),
            Some(ProtocolKind::Nextcloud)
        );
    }

    #[tokio::test]
    async fn rejected_login_stores_nothing() {
        let h = harness(MockHttpClient::new().respond(401, ""));

        let err = h.session.login(gpodder_credentials()).await.unwrap_err();

        assert!(matches!(err, CredentialError::Rejected));
        assert_eq!(h.session.active_protocol().await.unwrap(), None);
    }

    #[tokio::test]
    async fn logout_forgets_protocol() {
        let h = harness(MockHttpClient::new().respond(200, ""));
        h.session.login(gpodder_credentials()).await.unwrap();
        h.session.logout().await.unwrap();

        let err = h
            .session
            .perform_sync(SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotLoggedIn));
    }

    #[tokio::test]
    async fn nextcloud_login_flow_stores_credentials() {
        let h = harness(
            MockHttpClient::new()
                .respond(
                    200,
                    r#"{"poll": {"token": "tok", "endpoint": "https://cloud.example.com/login/v2/poll"},
                        "login": "https://cloud.example.com/login/v2/flow/abc"}"#,
                )
                .respond(404, "")
                .respond(
                    200,
                    r#"{"server": "https://cloud.example.com", "loginName": "alice", "appPassword": "app-pw"}"#,
                )
                .respond(200, r#"{"ocs": {"data": {"id": "alice"}}}"#),
        );

        let mut seen = None;
        h.session
            .login_nextcloud("https://cloud.example.com/index.php", |url| {
                seen = Some(url.to_string())
            })
            .await
            .unwrap();

        assert_eq!(
            seen.as_deref(),
            Some("https://cloud.example.com/login/v2/flow/abc")
        );
        assert_eq!(
            h.session.active_protocol().await.unwrap(),
            Some(ProtocolKind::Nextcloud)
        );
        assert_eq!(h.http.requests().len(), 4);
    }

    #[tokio::test]
    async fn full_cycle_through_gpodder_client() {
        let h = harness(
            MockHttpClient::new()
                // login
                .respond(200, "")
                // pull episodes: newer remote state for e1
                .respond(
                    200,
                    r#"{"actions": [{"podcast": "https://example.com/feed.xml",
                        "episode": "https://example.com/e1.mp3", "action": "PLAY",
                        "timestamp": "2024-01-15T10:00:00", "position": 590, "total": 600}],
                        "timestamp": 1705312800}"#,
                )
                // push episodes
                .respond(200, "{}")
                // pull subscriptions
                .respond(200, r#"{"add": ["https://example.com/feed.xml"], "remove": [], "timestamp": 1}"#),
        );
        h.session.login(gpodder_credentials()).await.unwrap();
        h.store
            .upsert_episode_state(EpisodeState::normalized(
                "https://example.com/e1.mp3",
                "https://example.com/feed.xml",
                100.0,
                600.0,
                1_000,
            ))
            .await
            .unwrap();
        h.store
            .upsert_episode_state(EpisodeState::normalized(
                "https://example.com/e2.mp3",
                "https://example.com/feed.xml",
                42.0,
                300.0,
                2_000,
            ))
            .await
            .unwrap();

        let outcome = h.session.perform_sync(SyncOptions::default()).await.unwrap();

        let SyncOutcome::Completed(report) = outcome else {
            panic!("expected a completed cycle");
        };
        assert_eq!(report.episodes_applied, 1);
        assert_eq!(report.episodes_pushed, 1);
        assert_eq!(report.subscriptions_added, 1);

        let e1 = h
            .store
            .episode_state("https://example.com/e1.mp3")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(e1.position, 590.0);
        assert_eq!(e1.timestamp, 1_705_312_800_000);

        let requests = h.http.requests();
        assert_eq!(requests.len(), 4);
        let pushed: serde_json::Value =
            serde_json::from_slice(requests[2].body.as_ref().unwrap()).unwrap();
        assert_eq!(pushed.as_array().unwrap().len(), 1);
        assert_eq!(pushed[0]["episode"], "https://example.com/e2.mp3");
        assert_eq!(pushed[0]["position"], 42);
        assert_eq!(h.session.status(), SyncStatus::Ok);
    }
}
