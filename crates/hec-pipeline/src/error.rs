// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;
use std::time::Duration;

/// Outcome of a failed delivery attempt.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The collector is temporarily unable to accept events (502, 503).
    #[error("{reason}, status code:{status}")]
    Service { status: u16, reason: String },

    /// The request can never succeed as sent (bad token, index or format).
    #[error("{reason}, status code:{status}")]
    Client { status: u16, reason: String },

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("tls handshake failed: {0}")]
    Tls(String),

    #[error("connect error: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Transport(String),

    /// The record could not be turned into a request.
    #[error("failed to build request: {0}")]
    Payload(String),
}

/// How a worker reacts to a [`DeliveryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Log and drop the record.
    Discard,
    /// Requeue the record after sleeping for the given backoff.
    Retry(Duration),
}

impl DeliveryError {
    /// Records failing with these errors are never requeued.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DeliveryError::Client { .. }
                | DeliveryError::UnknownHost(_)
                | DeliveryError::Tls(_)
                | DeliveryError::Payload(_)
        )
    }

    #[must_use]
    pub fn retry_decision(&self, retry_interval: Duration, min_backoff: Duration) -> RetryDecision {
        match self {
            _ if self.is_fatal() => RetryDecision::Discard,
            DeliveryError::Service { .. } => RetryDecision::Retry(retry_interval * 2),
            DeliveryError::Connect(_) => RetryDecision::Retry(retry_interval),
            _ => RetryDecision::Retry(min_backoff),
        }
    }

    /// Maps a `reqwest` transport failure onto the delivery taxonomy.
    ///
    /// Only the source chain is inspected. The top-level message carries the
    /// request URL, whose query holds build names and metadata.
    #[must_use]
    pub fn from_transport(err: &reqwest::Error) -> Self {
        let detail = source_chain(err).unwrap_or_else(|| err.to_string());
        if err.is_builder() {
            return DeliveryError::Payload(detail);
        }
        if !err.is_connect() {
            return DeliveryError::Transport(detail);
        }
        match connect_cause(err) {
            Some(ConnectCause::UnknownHost) => DeliveryError::UnknownHost(detail),
            Some(ConnectCause::Tls) => DeliveryError::Tls(detail),
            _ => DeliveryError::Connect(detail),
        }
    }
}

enum ConnectCause {
    UnknownHost,
    Tls,
    Io,
}

/// The connector reports resolver failures as a bare "dns error" wrapping the
/// resolver's io error. TLS failures surface as `InvalidData` io errors.
fn connect_cause(err: &(dyn StdError + 'static)) -> Option<ConnectCause> {
    let mut source = err.source();
    while let Some(cause) = source {
        let message = cause.to_string();
        if message == "dns error" || message.starts_with("failed to lookup address") {
            return Some(ConnectCause::UnknownHost);
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return Some(match io.kind() {
                std::io::ErrorKind::InvalidData => ConnectCause::Tls,
                _ => ConnectCause::Io,
            });
        }
        source = cause.source();
    }
    None
}

fn source_chain(err: &(dyn StdError + 'static)) -> Option<String> {
    let mut source = err.source();
    let mut message: Option<String> = None;
    while let Some(cause) = source {
        match message.as_mut() {
            Some(message) => {
                message.push_str(": ");
                message.push_str(&cause.to_string());
            }
            None => message = Some(cause.to_string()),
        }
        source = cause.source();
    }
    message
}

/// Errors raised while assembling or validating configuration.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the delivery service lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("delivery service already started")]
    AlreadyStarted,

    #[error("delivery service is not running")]
    NotRunning,

    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,
}

/// Per-file failure of the file sender. Siblings keep going.
#[derive(Debug, thiserror::Error)]
pub enum FileSendError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("event delivery is disabled for {0}")]
    Disabled(String),
}
