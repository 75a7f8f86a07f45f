// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::wire::{
    self, EpisodeActionsResponse, OutgoingEpisodeAction, SubscriptionChangesResponse,
};
use super::{ProtocolKind, ProtocolOptions, SyncProtocol};
use crate::credentials::Credentials;
use crate::error::ProtocolError;
use crate::http::{HttpClient, HttpRequest};
use crate::model::{EpochMillis, RemoteUpdate, SubscriptionDelta};

/// Device name used for subscription uploads
const DEVICE_ID: &str = "podsync";

/// Client for a gpodder.net compatible server (API v2)
pub struct GpodderClient<C: HttpClient> {
    http: C,
    base: Url,
    credentials: Credentials,
    options: ProtocolOptions,
}

impl<C: HttpClient> GpodderClient<C> {
    pub fn new(
        http: C,
        credentials: Credentials,
        options: ProtocolOptions,
    ) -> Result<Self, ProtocolError> {
        let base = Url::parse(&credentials.server).map_err(|e| ProtocolError::InvalidServerUrl {
            url: credentials.server.clone(),
            source: e,
        })?;

        Ok(Self {
            http,
            base,
            credentials,
            options,
        })
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    fn request(&self, request: HttpRequest) -> HttpRequest {
        request.header("Authorization", self.credentials.basic_auth_header())
    }
}

#[async_trait]
impl<C: HttpClient> SyncProtocol for GpodderClient<C> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Gpodder
    }

    async fn login(&self) -> Result<bool, ProtocolError> {
        let url = self.endpoint(&format!("api/2/auth/{}/login.json", self.credentials.user));
        let request = self.request(HttpRequest::post(url.as_str()));

        match wire::send(&self.http, request).await {
            Ok(_) => Ok(true),
            Err(ProtocolError::Status { status, .. }) => {
                debug!(status, "gpodder server rejected login");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_episode_updates(&self, since: EpochMillis) -> Result<Vec<RemoteUpdate>, ProtocolError> {
        let mut url = self.endpoint(&format!("api/2/episodes/{}.json", self.credentials.user));
        url.query_pairs_mut()
            .append_pair("since", &wire::since_param(since).to_string())
            .append_pair("aggregated", "true");

        let response = wire::send(&self.http, self.request(HttpRequest::get(url.as_str()))).await?;
        let body: EpisodeActionsResponse = wire::decode(url.as_str(), &response)?;

        Ok(body.into_updates(self.options.naive_offset))
    }

    async fn pull_subscription_updates(&self, since: EpochMillis) -> Result<SubscriptionDelta, ProtocolError> {
        let mut url = self.endpoint(&format!(
            "api/2/subscriptions/{}/all.json",
            self.credentials.user
        ));
        url.query_pairs_mut()
            .append_pair("since", &wire::since_param(since).to_string());

        let response = wire::send(&self.http, self.request(HttpRequest::get(url.as_str()))).await?;
        let body: SubscriptionChangesResponse = wire::decode(url.as_str(), &response)?;

        Ok(body.into())
    }

    async fn push_episode_updates(&self, updates: &[RemoteUpdate]) -> Result<(), ProtocolError> {
        let url = self.endpoint(&format!("api/2/episodes/{}.json", self.credentials.user));
        let payload: Vec<OutgoingEpisodeAction> = updates
            .iter()
            .map(|update| OutgoingEpisodeAction::new(update, wire::format_iso_utc))
            .collect();

        let request = HttpRequest::post(url.as_str()).json_body(serde_json::to_vec(&payload)?);
        wire::send(&self.http, self.request(request)).await?;
        Ok(())
    }

    async fn push_subscription_updates(&self, delta: &SubscriptionDelta) -> Result<(), ProtocolError> {
        let url = self.endpoint(&format!(
            "api/2/subscriptions/{}/{DEVICE_ID}.json",
            self.credentials.user
        ));

        let request = HttpRequest::post(url.as_str()).json_body(serde_json::to_vec(delta)?);
        wire::send(&self.http, self.request(request)).await?;
        Ok(())
    }
}
