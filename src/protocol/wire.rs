// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! JSON shapes of the gpodder episode/subscription API shared by both
//! backends, and conversion of their timestamps to and from epoch millis.

use chrono::{DateTime, FixedOffset, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::model::{EpisodeAction, EpochMillis, RemoteUpdate, SubscriptionDelta};

/// Numbers below this are taken as epoch seconds, above as epoch millis
const SECONDS_THRESHOLD: u64 = 100_000_000_000;

/// A timestamp as sent by a server: an ISO-8601 string or a number
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Number(i64),
    Text(String),
}

impl WireTimestamp {
    /// Convert to epoch millis. Strings without an offset are interpreted
    /// in `naive_offset`.
    pub fn to_millis(&self, naive_offset: FixedOffset) -> Option<EpochMillis> {
        match self {
            WireTimestamp::Number(n) if n.unsigned_abs() < SECONDS_THRESHOLD => n.checked_mul(1000),
            WireTimestamp::Number(n) => Some(*n),
            WireTimestamp::Text(text) => parse_text_timestamp(text.trim(), naive_offset),
        }
    }
}

fn parse_text_timestamp(text: &str, naive_offset: FixedOffset) -> Option<EpochMillis> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .and_then(|naive| naive_offset.from_local_datetime(&naive).single())
        .map(|dt| dt.timestamp_millis())
}

/// gpodder push format: ISO-8601 UTC with millis and `Z`
pub fn format_iso_utc(timestamp: EpochMillis) -> String {
    to_utc(timestamp).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Nextcloud push format: UTC without fraction or offset
pub fn format_naive_utc(timestamp: EpochMillis) -> String {
    to_utc(timestamp).format("%Y-%m-%dT%H:%M:%S").to_string()
}

fn to_utc(timestamp: EpochMillis) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(timestamp)
        .single()
        .unwrap_or_default()
}

/// The `since` query parameter is in whole seconds
pub fn since_param(since: EpochMillis) -> i64 {
    since.max(0) / 1000
}

/// An episode action as returned by a server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerEpisodeAction {
    pub podcast: String,
    pub episode: String,
    pub action: String,
    pub timestamp: WireTimestamp,
    #[serde(default)]
    pub position: Option<f64>,
    #[serde(default)]
    pub total: Option<f64>,
}

impl ServerEpisodeAction {
    /// Normalize into a [`RemoteUpdate`]; unknown actions, plays without a
    /// position and unreadable timestamps yield `None`
    pub fn into_update(self, naive_offset: FixedOffset) -> Option<RemoteUpdate> {
        let Some(action) = EpisodeAction::parse(&self.action) else {
            debug!(
                action = %self.action,
                episode = %self.episode,
                "Ignoring unknown episode action"
            );
            return None;
        };

        if action == EpisodeAction::Play && self.position.is_none() {
            debug!(episode = %self.episode, "Ignoring play action without position");
            return None;
        }

        let Some(timestamp) = self.timestamp.to_millis(naive_offset) else {
            warn!(
                timestamp = ?self.timestamp,
                episode = %self.episode,
                "Ignoring episode action with unreadable timestamp"
            );
            return None;
        };

        Some(RemoteUpdate {
            podcast: self.podcast,
            episode: self.episode,
            position: self.position.unwrap_or(0.0),
            total: self.total.unwrap_or(0.0),
            timestamp,
            action,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct EpisodeActionsResponse {
    #[serde(default)]
    pub actions: Vec<ServerEpisodeAction>,
}

impl EpisodeActionsResponse {
    pub fn into_updates(self, naive_offset: FixedOffset) -> Vec<RemoteUpdate> {
        self.actions
            .into_iter()
            .filter_map(|action| action.into_update(naive_offset))
            .collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionChangesResponse {
    #[serde(default)]
    pub add: Vec<String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl From<SubscriptionChangesResponse> for SubscriptionDelta {
    fn from(response: SubscriptionChangesResponse) -> Self {
        SubscriptionDelta::new(response.add, response.remove)
    }
}

/// An episode action as pushed to a server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingEpisodeAction {
    pub podcast: String,
    pub episode: String,
    pub action: EpisodeAction,
    pub timestamp: String,
    pub started: i64,
    pub position: i64,
    pub total: i64,
}

impl OutgoingEpisodeAction {
    pub fn new(update: &RemoteUpdate, format: fn(EpochMillis) -> String) -> Self {
        let position = update.position.floor() as i64;
        Self {
            podcast: update.podcast.clone(),
            episode: update.episode.clone(),
            action: update.action,
            timestamp: format(update.timestamp),
            started: position,
            position,
            total: update.total.floor() as i64,
        }
    }
}

/// Send a request and fail on transport errors and non-2xx statuses
pub async fn send<C: HttpClient + ?Sized>(
    http: &C,
    request: HttpRequest,
) -> Result<HttpResponse, ProtocolError> {
    let url = request.url.clone();
    let response = http
        .execute(request)
        .await
        .map_err(|e| ProtocolError::Transport {
            url: url.clone(),
            source: e,
        })?;

    if !response.is_success() {
        return Err(ProtocolError::Status {
            url,
            status: response.status,
        });
    }

    Ok(response)
}

pub fn decode<T: DeserializeOwned>(url: &str, response: &HttpResponse) -> Result<T, ProtocolError> {
    serde_json::from_slice(&response.body).map_err(|e| ProtocolError::Decode {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    #[test]
    fn parses_rfc3339_with_offset() {
        let ts = WireTimestamp::Text("2024-01-15T12:00:00+02:00".into());
        assert_eq!(ts.to_millis(utc()), Some(1_705_312_800_000));
    }

    #[test]
    fn naive_timestamps_use_configured_offset() {
        let ts = WireTimestamp::Text("2024-01-15T10:00:00".into());
        assert_eq!(ts.to_millis(utc()), Some(1_705_312_800_000));

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(ts.to_millis(plus_two), Some(1_705_305_600_000));
    }

    #[test]
    fn naive_timestamps_accept_fractional_seconds() {
        let ts = WireTimestamp::Text("2024-01-15T10:00:00.250".into());
        assert_eq!(ts.to_millis(utc()), Some(1_705_312_800_250));
    }

    #[test]
    fn numbers_are_seconds_or_millis_by_magnitude() {
        assert_eq!(
            WireTimestamp::Number(1_705_312_800).to_millis(utc()),
            Some(1_705_312_800_000)
        );
        assert_eq!(
            WireTimestamp::Number(1_705_312_800_000).to_millis(utc()),
            Some(1_705_312_800_000)
        );
    }

    #[test]
    fn garbage_timestamp_is_rejected() {
        let ts = WireTimestamp::Text("last tuesday".into());
        assert_eq!(ts.to_millis(utc()), None);
    }

    #[test]
    fn push_formats() {
        assert_eq!(format_iso_utc(1_705_312_800_250), "2024-01-15T10:00:00.250Z");
        assert_eq!(format_naive_utc(1_705_312_800_250), "2024-01-15T10:00:00");
    }

    #[test]
    fn since_is_sent_in_seconds() {
        assert_eq!(since_param(1_705_312_800_999), 1_705_312_800);
        assert_eq!(since_param(-5), 0);
    }

    #[test]
    fn server_actions_normalize_and_skip_unknown() {
        let json = r#"{"actions": [
            {"podcast": "p", "episode": "e1", "action": "play", "timestamp": "2024-01-15T10:00:00", "position": 10, "total": 20},
            {"podcast": "p", "episode": "e2", "action": "download", "timestamp": "2024-01-15T10:00:00"},
            {"podcast": "p", "episode": "e3", "action": "flattr", "timestamp": "2024-01-15T10:00:00"}
        ], "timestamp": 12345}"#;

        let response: EpisodeActionsResponse = serde_json::from_str(json).unwrap();
        let updates = response.into_updates(utc());

        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].action, EpisodeAction::Play);
        assert_eq!(updates[0].position, 10.0);
        assert_eq!(updates[0].timestamp, 1_705_312_800_000);
        assert_eq!(updates[1].action, EpisodeAction::Download);
        assert_eq!(updates[1].total, 0.0);
    }

    #[test]
    fn play_without_position_is_skipped() {
        let json = r#"{"actions": [
            {"podcast": "p", "episode": "e1", "action": "play", "timestamp": "2030-01-01T00:00:00"},
            {"podcast": "p", "episode": "e2", "action": "play", "timestamp": "2030-01-01T00:00:00", "position": 0}
        ]}"#;

        let response: EpisodeActionsResponse = serde_json::from_str(json).unwrap();
        let updates = response.into_updates(utc());

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].episode, "e2");
        assert_eq!(updates[0].position, 0.0);
    }

    #[test]
    fn outgoing_action_serializes_play_in_uppercase() {
        let update = RemoteUpdate {
            podcast: "p".into(),
            episode: "e".into(),
            position: 99.7,
            total: 600.0,
            timestamp: 1_705_312_800_000,
            action: EpisodeAction::Play,
        };

        let action = OutgoingEpisodeAction::new(&update, format_naive_utc);
        let json = serde_json::to_value(action).unwrap();
        assert_eq!(json["action"], "PLAY");
        assert_eq!(json["position"], 99);
        assert_eq!(json["started"], 99);
        assert_eq!(json["total"], 600);
        assert_eq!(json["timestamp"], "2024-01-15T10:00:00");
    }
}
