// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::wire::{
    self, EpisodeActionsResponse, OutgoingEpisodeAction, SubscriptionChangesResponse,
};
use super::{ProtocolKind, ProtocolOptions, SyncProtocol};
use crate::credentials::Credentials;
use crate::error::ProtocolError;
use crate::http::{HttpClient, HttpRequest};
use crate::model::{EpochMillis, RemoteUpdate, SubscriptionDelta};

/// Strip anything from `index.php` on and trailing slashes; subpath
/// installs cannot be detected without it
pub fn base_url(server: &str) -> String {
    let base = server.split("index.php").next().unwrap_or(server);
    base.trim_end_matches('/').to_string()
}

/// Client for the Nextcloud gpoddersync app
pub struct NextcloudClient<C: HttpClient> {
    http: C,
    base: String,
    credentials: Credentials,
    options: ProtocolOptions,
}

impl<C: HttpClient> NextcloudClient<C> {
    pub fn new(http: C, credentials: Credentials, options: ProtocolOptions) -> Self {
        Self {
            http,
            base: base_url(&credentials.server),
            credentials,
            options,
        }
    }

    fn app_url(&self, path: &str) -> String {
        format!("{}/index.php/apps/gpoddersync/{path}", self.base)
    }

    fn request(&self, request: HttpRequest) -> HttpRequest {
        request
            .header("OCS-APIRequest", "true")
            .header("Authorization", self.credentials.basic_auth_header())
    }
}

#[async_trait]
impl<C: HttpClient> SyncProtocol for NextcloudClient<C> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Nextcloud
    }

    async fn login(&self) -> Result<bool, ProtocolError> {
        let url = format!("{}/ocs/v2.php/cloud/user?format=json", self.base);

        match wire::send(&self.http, self.request(HttpRequest::get(url))).await {
            Ok(_) => Ok(true),
            Err(ProtocolError::Status { status, .. }) => {
                debug!(status, "Nextcloud rejected app password");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_episode_updates(&self, since: EpochMillis) -> Result<Vec<RemoteUpdate>, ProtocolError> {
        let url = self.app_url(&format!("episode_action?since={}", wire::since_param(since)));

        let response = wire::send(&self.http, self.request(HttpRequest::get(&url))).await?;
        let body: EpisodeActionsResponse = wire::decode(&url, &response)?;

        Ok(body.into_updates(self.options.naive_offset))
    }

    async fn pull_subscription_updates(&self, since: EpochMillis) -> Result<SubscriptionDelta, ProtocolError> {
        let url = self.app_url(&format!("subscriptions?since={}", wire::since_param(since)));

        let response = wire::send(&self.http, self.request(HttpRequest::get(&url))).await?;
        let body: SubscriptionChangesResponse = wire::decode(&url, &response)?;

        Ok(body.into())
    }

    async fn push_episode_updates(&self, updates: &[RemoteUpdate]) -> Result<(), ProtocolError> {
        let url = self.app_url("episodes/create");
        let payload: Vec<OutgoingEpisodeAction> = updates
            .iter()
            .map(|update| OutgoingEpisodeAction::new(update, wire::format_naive_utc))
            .collect();

        let request = HttpRequest::post(url).json_body(serde_json::to_vec(&payload)?);
        wire::send(&self.http, self.request(request)).await?;
        Ok(())
    }

    async fn push_subscription_updates(&self, delta: &SubscriptionDelta) -> Result<(), ProtocolError> {
        let url = self.app_url("subscription_change/create");

        let request = HttpRequest::post(url).json_body(serde_json::to_vec(delta)?);
        wire::send(&self.http, self.request(request)).await?;
        Ok(())
    }
}

/// A started Nextcloud Login Flow v2
///
/// The user must open `login_url` in a browser; [`LoginFlow::wait`] polls
/// until they grant access.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginFlow {
    #[serde(rename = "login")]
    pub login_url: String,
    poll: PollEndpoint,
    #[serde(skip)]
    base: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PollEndpoint {
    token: String,
    endpoint: String,
}

#[derive(Serialize)]
struct PollRequest<'a> {
    token: &'a str,
}

/// App password granted by a completed login flow
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextcloudLogin {
    pub server: String,
    pub login_name: String,
    pub app_password: String,
}

impl NextcloudLogin {
    /// Credentials for the sync client, bound to the server the flow was
    /// started against
    pub fn into_credentials(self, base: &str) -> Credentials {
        Credentials::new(
            ProtocolKind::Nextcloud,
            base,
            self.login_name,
            self.app_password,
        )
    }
}

impl LoginFlow {
    /// Start a login flow against `server`
    pub async fn start<C: HttpClient + ?Sized>(http: &C, server: &str) -> Result<Self, ProtocolError> {
        let base = base_url(server);
        let url = format!("{base}/index.php/login/v2");

        let response = wire::send(http, HttpRequest::post(&url)).await?;
        let mut flow: LoginFlow = wire::decode(&url, &response)?;
        flow.base = base;

        info!(login_url = %flow.login_url, "Started Nextcloud login flow");
        Ok(flow)
    }

    /// Server base URL the flow was started against
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Poll until the user grants access or the attempt budget runs out
    pub async fn wait<C: HttpClient + ?Sized>(
        &self,
        http: &C,
        options: &ProtocolOptions,
    ) -> Result<Credentials, ProtocolError> {
        let body = serde_json::to_vec(&PollRequest {
            token: &self.poll.token,
        })?;

        for attempt in 1..=options.poll_attempts {
            let request = HttpRequest::post(&self.poll.endpoint).json_body(body.clone());

            match wire::send(http, request).await {
                Ok(response) => {
                    let login: NextcloudLogin = wire::decode(&self.poll.endpoint, &response)?;
                    info!(user = %login.login_name, attempt, "Nextcloud login granted");
                    return Ok(login.into_credentials(&self.base));
                }
                Err(e) => debug!(attempt, error = %e, "Nextcloud login not granted yet"),
            }

            tokio::time::sleep(options.poll_interval).await;
        }

        Err(ProtocolError::LoginTimedOut {
            attempts: options.poll_attempts,
        })
    }
}
