// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of work flowing through the delivery pipeline.

use std::borrow::Cow;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const SHORT_DESCRIPTION_LEN: usize = 64;

/// Fixed set of event kinds understood by the collector metadata layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BuildReport,
    BuildEvent,
    QueueInfo,
    Config,
    ConsoleLog,
    File,
    AgentInfo,
    Log,
    BatchJson,
    JsonFile,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::BuildReport,
        EventKind::BuildEvent,
        EventKind::QueueInfo,
        EventKind::Config,
        EventKind::ConsoleLog,
        EventKind::File,
        EventKind::AgentInfo,
        EventKind::Log,
        EventKind::BatchJson,
        EventKind::JsonFile,
    ];

    /// Unstructured text that must be split per line when metadata cannot be
    /// supplied once per request.
    #[must_use]
    pub fn needs_line_split(self) -> bool {
        matches!(
            self,
            EventKind::ConsoleLog | EventKind::File | EventKind::JsonFile
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BuildReport => "build_report",
            EventKind::BuildEvent => "build_event",
            EventKind::QueueInfo => "queue_info",
            EventKind::Config => "config",
            EventKind::ConsoleLog => "console_log",
            EventKind::File => "file",
            EventKind::AgentInfo => "agent_info",
            EventKind::Log => "log",
            EventKind::BatchJson => "batch_json",
            EventKind::JsonFile => "json_file",
        }
    }

    /// Metadata key for this kind, e.g. `console_log.sourcetype`.
    #[must_use]
    pub fn key(self, suffix: &str) -> String {
        format!("{}.{suffix}", self.as_str())
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<EventKind> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event content.
///
/// `Shared` holds large text weakly so that queued console output does not pin
/// memory the producer has already released. A record whose shared text is gone
/// has nothing left to send and is skipped by the worker.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Shared(Weak<str>),
}

impl Payload {
    #[must_use]
    pub fn shared(text: &Arc<str>) -> Self {
        Payload::Shared(Arc::downgrade(text))
    }

    /// Text form of the payload, or `None` if weakly held text was dropped.
    #[must_use]
    pub fn as_text(&self) -> Option<Cow<'_, str>> {
        match self {
            Payload::Text(text) => Some(Cow::Borrowed(text)),
            Payload::Bytes(bytes) => Some(String::from_utf8_lossy(bytes)),
            Payload::Json(value) => Some(Cow::Owned(value.to_string())),
            Payload::Shared(weak) => weak.upgrade().map(|text| Cow::Owned(text.to_string())),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.is_empty(),
            Payload::Bytes(bytes) => bytes.is_empty(),
            Payload::Json(value) => value.is_null(),
            Payload::Shared(weak) => weak.upgrade().map_or(true, |text| text.is_empty()),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// One queued event. Only the delivery worker mutates the retry counter and
/// the discard flag.
#[derive(Debug, Clone)]
pub struct EventRecord {
    payload: Payload,
    kind: EventKind,
    source: Option<String>,
    time: f64,
    retry_count: u32,
    discarded: bool,
}

impl EventRecord {
    #[must_use]
    pub fn new(payload: impl Into<Payload>, kind: EventKind) -> Self {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        EventRecord {
            payload: payload.into(),
            kind,
            source: None,
            time,
            retry_count: 0,
            discarded: false,
        }
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Seconds since the epoch at creation.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.time
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    pub fn discard(&mut self) {
        self.discarded = true;
    }

    /// Counts one more delivery attempt. Once the count exceeds `max_retries`
    /// the record is discarded and the worker drops it on the next take.
    pub fn increase(&mut self, max_retries: u32) {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count > max_retries {
            self.discarded = true;
        }
    }

    /// Bounded preview for log messages.
    #[must_use]
    pub fn short_description(&self) -> String {
        let preview: String = self
            .payload
            .as_text()
            .map(|text| text.chars().take(SHORT_DESCRIPTION_LEN).collect())
            .unwrap_or_else(|| "<released>".to_string());
        format!(
            "{{kind={}, retries={}, payload={:?}}}",
            self.kind, self.retry_count, preview
        )
    }
}
