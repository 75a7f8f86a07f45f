// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when fetching or parsing RSS feeds
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Failed to fetch feed from {url}: {source}")]
    FetchFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP error {status} for feed {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Failed to parse RSS feed: {0}")]
    ParseFailed(#[from] rss::Error),

    #[error("Invalid feed URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Errors raised by the local state store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to read store file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write store file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse store JSON in {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize store: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Invalid value for setting '{key}': {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors raised by a sync protocol client
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Server rejected request to {url} with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("Unexpected response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Invalid server URL '{url}': {source}")]
    InvalidServerUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to encode request payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Login was not confirmed after {attempts} polls")]
    LoginTimedOut { attempts: u32 },
}

impl ProtocolError {
    /// Whether the request never got a response
    pub fn is_transport(&self) -> bool {
        matches!(self, ProtocolError::Transport { .. })
    }
}

/// Errors raised while storing or decrypting sync credentials
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Failed to read credentials file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write credentials file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse credentials file {path}: {source}")]
    JsonParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize credentials: {0}")]
    JsonSerializeFailed(#[from] serde_json::Error),

    #[error("Cipher key is invalid: {0}")]
    InvalidKey(String),

    #[error("Failed to encrypt credentials")]
    Encrypt,

    #[error("Failed to decrypt credentials: {0}")]
    Decrypt(String),

    #[error("Already logged in with {0}, log out first")]
    AlreadyLoggedIn(String),

    #[error("Server did not accept the credentials")]
    Rejected,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Login failed: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Errors that can occur when loading the configuration file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),

    #[error("Invalid UTC offset '{0}', expected something like +02:00")]
    InvalidOffset(String),
}

/// Sync step during which a network or protocol failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    PullEpisodes,
    PushEpisodes,
    PullSubscriptions,
    PushSubscriptions,
}

impl std::fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncOperation::PullEpisodes => "pulling episode actions",
            SyncOperation::PushEpisodes => "pushing episode actions",
            SyncOperation::PullSubscriptions => "pulling subscriptions",
            SyncOperation::PushSubscriptions => "pushing subscriptions",
        };
        f.write_str(name)
    }
}

/// Top-level errors for sync operations
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Not logged in to a sync server")]
    NotLoggedIn,

    #[error("Sync cipher key is missing or corrupt, log in again")]
    MissingCipherKey,

    #[error("Network error while {operation}: {source}")]
    Network {
        operation: SyncOperation,
        #[source]
        source: ProtocolError,
    },

    #[error("Server error while {operation}: {source}")]
    Protocol {
        operation: SyncOperation,
        #[source]
        source: ProtocolError,
    },

    #[error("Local store error: {0}")]
    LocalStore(#[from] StoreError),

    #[error("Credential error: {0}")]
    Credentials(#[source] CredentialError),
}

impl SyncError {
    /// Classify a protocol client failure by whether the server answered
    pub fn from_protocol(operation: SyncOperation, source: ProtocolError) -> Self {
        if source.is_transport() {
            SyncError::Network { operation, source }
        } else {
            SyncError::Protocol { operation, source }
        }
    }

    /// Whether running the cycle again later may succeed without user action
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Network { .. } | SyncError::Protocol { .. })
    }
}

impl From<CredentialError> for SyncError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::InvalidKey(_) => SyncError::MissingCipherKey,
            CredentialError::Store(e) => SyncError::LocalStore(e),
            other => SyncError::Credentials(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_are_protocol_errors() {
        let err = SyncError::from_protocol(
            SyncOperation::PushEpisodes,
            ProtocolError::Status {
                url: "https://example.com".into(),
                status: 400,
            },
        );
        assert!(matches!(err, SyncError::Protocol { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn login_errors_are_not_retryable() {
        assert!(!SyncError::NotLoggedIn.is_retryable());
        assert!(!SyncError::MissingCipherKey.is_retryable());
    }

    #[test]
    fn invalid_key_maps_to_missing_cipher_key() {
        let err: SyncError = CredentialError::InvalidKey("bad base64".into()).into();
        assert!(matches!(err, SyncError::MissingCipherKey));
    }

    #[test]
    fn error_messages_name_the_operation() {
        let err = SyncError::from_protocol(
            SyncOperation::PullSubscriptions,
            ProtocolError::Decode {
                url: "https://example.com".into(),
                reason: "missing field".into(),
            },
        );
        assert!(err.to_string().contains("pulling subscriptions"));
    }
}
