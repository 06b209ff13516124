// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction and request building for the collector.
//!
//! Records are grouped into [`Batch`]es before sending:
//!
//! - **Raw mode** (line-oriented text while raw events are enabled): one
//!   request per record to the raw endpoint, metadata passed once as query
//!   parameters.
//! - **JSON mode** (everything else): records are serialized as concatenated
//!   event objects to the event endpoint, metadata embedded in every event.
//!   Line-oriented text is split into one event per line.
//!
//! Bodies above [`GZIP_THRESHOLD`] are gzip-compressed.

use std::error::Error;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::{write::GzEncoder, Compression};
use reqwest::header::{AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE};
use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::config::Config;
use crate::constants::{CONSOLE_LINE_MAX_LENGTH, GZIP_THRESHOLD, MAX_BATCH_SIZE};
use crate::error::DeliveryError;
use crate::event::{EventKind, EventRecord, Payload};

/// Builds the shared client. A bad proxy URL falls back to a direct client.
#[must_use]
pub fn get_client(config: &Arc<Config>) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "HTTP | Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "HTTP | Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &Arc<Config>,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.proxy_https {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }
    Ok(client.build()?)
}

/// Endpoint mode of a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Raw,
    Json,
}

/// One request worth of records. The records travel with the body so a failed
/// request can be retried record by record.
#[derive(Debug)]
pub struct Batch {
    pub mode: Mode,
    pub url: String,
    pub query: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    pub records: Vec<EventRecord>,
}

impl Batch {
    /// Turns the batch into a request, compressing large bodies.
    pub fn to_request(
        &self,
        client: &reqwest::Client,
        token: &str,
    ) -> Result<reqwest::RequestBuilder, DeliveryError> {
        let content_type = match self.mode {
            Mode::Raw => "text/plain; charset=utf-8",
            Mode::Json => "application/json",
        };
        let mut request = client
            .post(&self.url)
            .header(AUTHORIZATION, format!("Splunk {token}"))
            .header(CONTENT_TYPE, content_type);
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }

        if self.body.len() > GZIP_THRESHOLD {
            let compressed = gzip(&self.body).map_err(|e| DeliveryError::Payload(e.to_string()))?;
            request = request.header(CONTENT_ENCODING, "gzip").body(compressed);
        } else {
            request = request.body(self.body.clone());
        }
        Ok(request)
    }
}

pub fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    encoder.write_all(body)?;
    encoder.finish()
}

/// Splits `records` into requests against the collector at `base_url`.
/// Records with nothing left to send are dropped.
#[must_use]
pub fn build_batches(config: &Config, base_url: &str, records: Vec<EventRecord>) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut json: Option<Batch> = None;

    for record in records {
        if record.payload().is_empty() {
            debug!(
                "HTTP | Skipping record with released payload {}",
                record.short_description()
            );
            continue;
        }

        if config.can_post_raw(record.kind()) {
            if let Some(batch) = raw_batch(config, base_url, record) {
                batches.push(batch);
            }
            continue;
        }

        let events = json_events(config, &record);
        let current = json.get_or_insert_with(|| Batch {
            mode: Mode::Json,
            url: config.json_url(base_url),
            query: Vec::new(),
            body: Vec::new(),
            records: Vec::new(),
        });
        if !current.body.is_empty() && current.body.len() + events.len() > MAX_BATCH_SIZE {
            if let Some(full) = json.take() {
                batches.push(full);
            }
            json = Some(Batch {
                mode: Mode::Json,
                url: config.json_url(base_url),
                query: Vec::new(),
                body: events,
                records: vec![record],
            });
        } else {
            current.body.extend_from_slice(&events);
            current.records.push(record);
        }
    }

    if let Some(batch) = json {
        batches.push(batch);
    }
    batches
}

fn raw_batch(config: &Config, base_url: &str, record: EventRecord) -> Option<Batch> {
    let kind = record.kind();
    let body = match record.payload() {
        Payload::Bytes(bytes) => bytes.clone(),
        other => other.as_text()?.into_owned().into_bytes(),
    };
    let mut query = Vec::new();
    if let Some(index) = config.metadata.index(kind) {
        query.push(("index", index.to_string()));
    }
    if let Some(source) = record.source().or_else(|| config.metadata.source(kind)) {
        query.push(("source", source.to_string()));
    }
    if let Some(sourcetype) = config.metadata.sourcetype(kind) {
        query.push(("sourcetype", sourcetype.to_string()));
    }
    if let Some(host) = metadata_host(config) {
        query.push(("host", host.to_string()));
    }
    Some(Batch {
        mode: Mode::Raw,
        url: config.raw_url(base_url),
        query,
        body,
        records: vec![record],
    })
}

fn metadata_host(config: &Config) -> Option<&str> {
    config
        .metadata_host
        .as_deref()
        .or_else(|| config.metadata.get("host"))
}

/// Serialized event objects for one record, newline separated.
fn json_events(config: &Config, record: &EventRecord) -> Vec<u8> {
    let kind = record.kind();
    let mut envelope = Map::new();
    envelope.insert("time".to_string(), json!(record.time()));
    if let Some(host) = metadata_host(config) {
        envelope.insert("host".to_string(), json!(host));
    }
    if let Some(index) = config.metadata.index(kind) {
        envelope.insert("index".to_string(), json!(index));
    }
    if let Some(source) = record.source().or_else(|| config.metadata.source(kind)) {
        envelope.insert("source".to_string(), json!(source));
    }
    if let Some(sourcetype) = config.metadata.sourcetype(kind) {
        envelope.insert("sourcetype".to_string(), json!(sourcetype));
    }

    let mut body = Vec::new();
    for event in event_values(record) {
        let mut object = envelope.clone();
        object.insert("event".to_string(), event);
        if serde_json::to_writer(&mut body, &Value::Object(object)).is_ok() {
            body.push(b'\n');
        }
    }
    body
}

fn event_values(record: &EventRecord) -> Vec<Value> {
    match record.payload() {
        Payload::Json(Value::Array(items)) if record.kind() == EventKind::BatchJson => {
            items.clone()
        }
        Payload::Json(value) => vec![value.clone()],
        payload => {
            let Some(text) = payload.as_text() else {
                return Vec::new();
            };
            if record.kind().needs_line_split() {
                text.lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(|line| Value::String(truncate_line(line).to_string()))
                    .collect()
            } else {
                vec![Value::String(text.into_owned())]
            }
        }
    }
}

fn truncate_line(line: &str) -> &str {
    if line.len() <= CONSOLE_LINE_MAX_LENGTH {
        return line;
    }
    let mut end = CONSOLE_LINE_MAX_LENGTH;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    fn config() -> Config {
        let mut config = Config {
            enabled: true,
            host: "localhost".to_string(),
            token: "token".to_string(),
            metadata_host: Some("ci-01".to_string()),
            ..Config::default()
        };
        config.metadata.load("index=ci\nconsole_log.index=console");
        config
    }

    fn parse_events(body: &[u8]) -> Vec<Value> {
        serde_json::Deserializer::from_slice(body)
            .into_iter::<Value>()
            .map(Result::unwrap)
            .collect()
    }

    #[test]
    fn test_raw_batch_carries_metadata_in_query() {
        let record =
            EventRecord::new("line 1\nline 2\n", EventKind::ConsoleLog).with_source("job/a/1/console");
        let batches = build_batches(&config(), "http://hec:8088", vec![record]);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.mode, Mode::Raw);
        assert_eq!(batch.url, "http://hec:8088/services/collector/raw");
        assert_eq!(batch.body, b"line 1\nline 2\n");
        assert!(batch.query.contains(&("index", "console".to_string())));
        assert!(batch.query.contains(&("source", "job/a/1/console".to_string())));
        assert!(batch.query.contains(&("sourcetype", "ci:console".to_string())));
        assert!(batch.query.contains(&("host", "ci-01".to_string())));
    }

    #[test]
    fn test_json_batch_embeds_metadata_per_event() {
        let records = vec![
            EventRecord::new(json!({"result": "SUCCESS"}), EventKind::BuildReport),
            EventRecord::new("started", EventKind::BuildEvent),
        ];
        let batches = build_batches(&config(), "http://hec:8088", records);
        assert_eq!(batches.len(), 1);
        let batch = &batches[0];
        assert_eq!(batch.mode, Mode::Json);
        assert_eq!(batch.url, "http://hec:8088/services/collector/event");
        assert_eq!(batch.records.len(), 2);

        let events = parse_events(&batch.body);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["event"]["result"], "SUCCESS");
        assert_eq!(events[0]["index"], "ci");
        assert_eq!(events[0]["host"], "ci-01");
        assert_eq!(events[0]["sourcetype"], "ci:json");
        assert_eq!(events[1]["event"], "started");
    }

    #[test]
    fn test_console_text_split_per_line_without_raw_mode() {
        let mut config = config();
        config.raw_event_enabled = false;
        let record = EventRecord::new("one\n\ntwo\nthree", EventKind::ConsoleLog);
        let batches = build_batches(&config, "http://hec:8088", vec![record]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].mode, Mode::Json);
        let events = parse_events(&batches[0].body);
        let lines: Vec<_> = events.iter().map(|e| e["event"].clone()).collect();
        assert_eq!(lines, vec![json!("one"), json!("two"), json!("three")]);
        assert!(events.iter().all(|e| e["index"] == "console"));
    }

    #[test]
    fn test_batch_json_array_expands() {
        let record = EventRecord::new(json!([{"a": 1}, {"b": 2}]), EventKind::BatchJson);
        let batches = build_batches(&config(), "http://hec:8088", vec![record]);
        assert_eq!(parse_events(&batches[0].body).len(), 2);
    }

    #[test]
    fn test_released_payload_is_skipped() {
        let text: Arc<str> = Arc::from("gone");
        let record = EventRecord::new(Payload::shared(&text), EventKind::ConsoleLog);
        drop(text);
        assert!(build_batches(&config(), "http://hec:8088", vec![record]).is_empty());
    }

    #[test]
    fn test_truncate_line_respects_char_boundary() {
        let line = "é".repeat(CONSOLE_LINE_MAX_LENGTH);
        let truncated = truncate_line(&line);
        assert!(truncated.len() <= CONSOLE_LINE_MAX_LENGTH);
        assert!(truncated.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_large_body_is_gzipped() {
        let client = reqwest::Client::new();
        let record = EventRecord::new("x".repeat(4096), EventKind::ConsoleLog);
        let batches = build_batches(&config(), "http://hec:8088", vec![record]);
        let request = batches[0].to_request(&client, "secret").unwrap().build().unwrap();
        assert_eq!(request.headers()[CONTENT_ENCODING], "gzip");
        assert_eq!(request.headers()[AUTHORIZATION], "Splunk secret");

        let compressed = request.body().unwrap().as_bytes().unwrap();
        let mut decoded = String::new();
        GzDecoder::new(compressed)
            .read_to_string(&mut decoded)
            .unwrap();
        assert_eq!(decoded.len(), 4096);
    }

    #[test]
    fn test_small_body_is_sent_plain() {
        let client = reqwest::Client::new();
        let record = EventRecord::new("small", EventKind::Log);
        let batches = build_batches(&config(), "http://hec:8088", vec![record]);
        let request = batches[0].to_request(&client, "secret").unwrap().build().unwrap();
        assert!(request.headers().get(CONTENT_ENCODING).is_none());
    }
}
