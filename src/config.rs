// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration loaded from a TOML file.
//!
//! Every field has a default, so a missing file or a missing section simply
//! means the defaults.

use std::path::Path;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::ProtocolOptions;

/// Name of the config file inside the data directory
pub const CONFIG_FILENAME: &str = "podsync.toml";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub http: HttpConfig,
    pub sync: SyncSettings,
    pub protocol: ProtocolConfig,
}

/// HTTP client limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Whole-request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Connection timeout in seconds (default: 10)
    pub connect_timeout_secs: u64,
}

/// Behaviour of the sync session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// How far the cursor is rewound before pulling, in seconds (default: 600)
    pub cursor_overlap_secs: u64,
    /// Run a cycle when the application starts
    pub sync_after_app_start: bool,
    /// Run a cycle before the application closes
    pub sync_before_app_close: bool,
}

/// Protocol client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// UTC offset of server timestamps that carry none (default: "+00:00")
    pub naive_timestamp_offset: String,
    /// Delay between Nextcloud login polls in milliseconds (default: 1000)
    pub nextcloud_poll_interval_ms: u64,
    /// Nextcloud login polls before giving up (default: 300)
    pub nextcloud_poll_attempts: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_cursor_overlap_secs() -> u64 {
    600
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_poll_attempts() -> u32 {
    300
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cursor_overlap_secs: default_cursor_overlap_secs(),
            sync_after_app_start: false,
            sync_before_app_close: false,
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            naive_timestamp_offset: "+00:00".to_string(),
            nextcloud_poll_interval_ms: default_poll_interval_ms(),
            nextcloud_poll_attempts: default_poll_attempts(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a TOML file, falling back to the defaults if
    /// the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::ReadFailed {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
        };

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseFailed {
            path: path.to_path_buf(),
            source: e,
        })?;

        // Surface a bad offset at load time rather than at the first sync
        config.protocol.options()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl SyncSettings {
    pub fn cursor_overlap(&self) -> Duration {
        Duration::from_secs(self.cursor_overlap_secs)
    }

    /// Apply the fields set in `update`, leaving the others alone
    pub fn apply(&mut self, update: &SyncSettingsUpdate) {
        if let Some(secs) = update.cursor_overlap_secs {
            self.cursor_overlap_secs = secs;
        }
        if let Some(enabled) = update.sync_after_app_start {
            self.sync_after_app_start = enabled;
        }
        if let Some(enabled) = update.sync_before_app_close {
            self.sync_before_app_close = enabled;
        }
    }
}

/// A partial change of [`SyncSettings`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSettingsUpdate {
    pub cursor_overlap_secs: Option<u64>,
    pub sync_after_app_start: Option<bool>,
    pub sync_before_app_close: Option<bool>,
}

impl ProtocolConfig {
    pub fn options(&self) -> Result<ProtocolOptions, ConfigError> {
        Ok(ProtocolOptions {
            naive_offset: parse_offset(&self.naive_timestamp_offset)?,
            poll_interval: Duration::from_millis(self.nextcloud_poll_interval_ms),
            poll_attempts: self.nextcloud_poll_attempts,
        })
    }
}

/// Parse `Z`, `UTC` or a `+HH:MM` / `-HH:MM` offset
fn parse_offset(value: &str) -> Result<FixedOffset, ConfigError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return Ok(Utc.fix());
    }

    let invalid = || ConfigError::InvalidOffset(value.to_string());

    let (sign, rest) = match trimmed.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse::<u8>().map_err(|_| invalid())?.into();
    let minutes: i32 = minutes.parse::<u8>().map_err(|_| invalid())?.into();
    if minutes >= 60 {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}
