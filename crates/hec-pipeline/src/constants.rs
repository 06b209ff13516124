// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Limits and tuning defaults for HTTP Event Collector delivery.
//!
//! Sizes are in bytes unless stated otherwise. Values that are tunable at
//! runtime live in [`crate::config::Config`]; the constants here are the
//! defaults and hard bounds it starts from.

use std::time::Duration;

/// Structured endpoint; metadata is embedded in every event.
pub const JSON_ENDPOINT: &str = "/services/collector/event";

/// Raw endpoint; metadata is supplied once per request as query parameters.
pub const RAW_ENDPOINT: &str = "/services/collector/raw";

/// Read chunk size and the lower bound for `max_events_batch_size`.
pub const MIN_BUFFER_SIZE: usize = 4096;

/// Default amount of buffered raw text flushed as one event (256 KiB).
pub const DEFAULT_BATCH_SIZE: usize = 1 << 18;

/// Hard upper bound of a single request body (8 MiB).
pub const MAX_BATCH_SIZE: usize = 1 << 23;

/// Bodies larger than this are gzip-compressed before sending.
pub const GZIP_THRESHOLD: usize = 1024;

/// Longest console line kept intact when splitting text into events.
pub const CONSOLE_LINE_MAX_LENGTH: usize = 100_000;

/// Default capacity of the bounded event queue.
pub const QUEUE_CAPACITY: usize = 1 << 17;

/// How long `enqueue` waits for space before falling back to a single offer.
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(3);

/// Records one synchronous producer may hold back while the queue is full.
pub const MAX_DEFERRED_RECORDS: usize = 256;

/// Above this many pending records a worker retries without sleeping.
pub const HIGH_WATER_MARK: usize = 1 << 10;

/// Maximum number of records a worker pulls into one JSON request.
pub const MAX_BATCH_RECORDS: usize = 64;

/// Upper bound on how long `stop()` waits for an in-flight send.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll step used while waiting for an in-flight send during shutdown.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default base retry interval.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Backoff used for errors that are neither service nor connect errors.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(1);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub const DEFAULT_PORT: u16 = 8088;

pub const DEFAULT_WORKER_COUNT: usize = 2;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Delayed flush buffer tuning.
pub const FLUSH_MIN_PERIOD: Duration = Duration::from_millis(1000);
pub const FLUSH_MAX_PERIOD: Duration = Duration::from_millis(10_000);
pub const FLUSH_BACKOFF_FACTOR: f64 = 1.05;
pub const FLUSH_BUFFER_SIZE: usize = 65_536;

/// How often the shared scheduler flushes sinks of dropped, unclosed buffers.
pub const RECLAIM_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on the number of per-build console captures kept alive.
pub const MAX_DECORATOR_ENTRIES: usize = 1024;

/// Files larger than this are truncated by the file sender (100 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
