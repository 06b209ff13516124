// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery workers drain the event queue and post batches to the collector.
//!
//! Each worker is a tokio task looping over:
//!
//! 1. wait for a record (`take`), opportunistically pulling more with `try_take`
//! 2. build requests ([`crate::http::build_batches`])
//! 3. send and classify the response
//! 4. on failure, drop the records or requeue them after a backoff
//!
//! | Failure | Action |
//! |---|---|
//! | unknown host, TLS, 4xx, unbuildable request | log and drop |
//! | 502 / 503 | requeue after `2 * retry_interval` |
//! | connect error | requeue after `retry_interval` |
//! | anything else | requeue after `min_backoff` |
//!
//! The backoff sleep is skipped while the queue holds `high_water_mark` or more
//! records so a backlog keeps draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::classifier::ResponseHandler;
use crate::config::Config;
use crate::constants::{MAX_BATCH_RECORDS, STOP_GRACE, STOP_POLL_INTERVAL};
use crate::error::{DeliveryError, RetryDecision};
use crate::event::EventRecord;
use crate::http::{build_batches, Batch};
use crate::queue::EventQueue;

/// Handle to a running worker task.
pub struct DeliveryWorker {
    id: usize,
    accepting: Arc<AtomicBool>,
    sending: Arc<AtomicBool>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DeliveryWorker {
    #[must_use]
    pub fn spawn(task: WorkerTask) -> Self {
        let id = task.id;
        let accepting = Arc::clone(&task.accepting);
        let sending = Arc::clone(&task.sending);
        let cancel = task.cancel.clone();
        let handle = tokio::spawn(async move { task.run().await });
        DeliveryWorker {
            id,
            accepting,
            sending,
            cancel,
            handle: Some(handle),
        }
    }

    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn is_sending(&self) -> bool {
        self.sending.load(Ordering::Acquire)
    }

    /// Stops taking new records, gives an in-flight send up to five seconds to
    /// finish, then cancels the task. A pending `take` or backoff sleep is
    /// interrupted; an in-flight request is not aborted.
    pub async fn stop(&mut self) {
        self.accepting.store(false, Ordering::Release);
        let deadline = Instant::now() + STOP_GRACE;
        while self.is_sending() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!("WORKER | worker {} task failed to join: {}", self.id, e);
            }
        }
    }
}

/// State owned by one worker task.
pub struct WorkerTask {
    id: usize,
    config: Arc<Config>,
    queue: Arc<dyn EventQueue>,
    client: reqwest::Client,
    base_url: String,
    handler: ResponseHandler,
    accepting: Arc<AtomicBool>,
    sending: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl WorkerTask {
    #[must_use]
    pub fn new(
        id: usize,
        config: Arc<Config>,
        queue: Arc<dyn EventQueue>,
        client: reqwest::Client,
        base_url: String,
        handler: ResponseHandler,
    ) -> Self {
        WorkerTask {
            id,
            config,
            queue,
            client,
            base_url,
            handler,
            accepting: Arc::new(AtomicBool::new(true)),
            sending: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
        }
    }

    async fn run(self) {
        debug!("WORKER | worker {} started for {}", self.id, self.base_url);
        while self.accepting.load(Ordering::Acquire) {
            let record = tokio::select! {
                () = self.cancel.cancelled() => break,
                record = self.queue.take() => record,
            };
            self.sending.store(true, Ordering::Release);
            let mut records = Vec::with_capacity(MAX_BATCH_RECORDS);
            self.admit(record, &mut records);
            while records.len() < MAX_BATCH_RECORDS {
                match self.queue.try_take() {
                    Some(record) => self.admit(record, &mut records),
                    None => break,
                }
            }
            if !records.is_empty() {
                self.process(records).await;
            }
            self.sending.store(false, Ordering::Release);
        }
        debug!("WORKER | worker {} stopped", self.id);
    }

    fn admit(&self, record: EventRecord, records: &mut Vec<EventRecord>) {
        if record.is_discarded() {
            error!("WORKER | Failed to send {}", record.short_description());
        } else {
            records.push(record);
        }
    }

    /// Sends `records` and applies the failure policy to each failed batch.
    pub async fn process(&self, records: Vec<EventRecord>) {
        for batch in build_batches(&self.config, &self.base_url, records) {
            if let Err(e) = self.deliver(&batch).await {
                self.handle_failure(e, batch.records).await;
            }
        }
    }

    async fn deliver(&self, batch: &Batch) -> Result<(), DeliveryError> {
        let request = batch.to_request(&self.client, &self.config.token)?;
        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::from_transport(&e))?;
        self.handler
            .handle_response(response, batch.records.len() as u64)
            .await
    }

    async fn handle_failure(&self, err: DeliveryError, records: Vec<EventRecord>) {
        match err.retry_decision(self.config.retry_interval, self.config.min_backoff) {
            RetryDecision::Discard => {
                for record in &records {
                    error!(
                        "WORKER | Message not delivered: {}: {}",
                        record.short_description(),
                        err
                    );
                }
            }
            RetryDecision::Retry(backoff) => {
                warn!(
                    "WORKER | {}, will wait {:?} and retry {} record(s)",
                    err,
                    backoff,
                    records.len()
                );
                self.handle_retry(records, backoff).await;
            }
        }
    }

    /// Bumps each record's retry count, sleeps unless the queue is backlogged,
    /// and requeues the records.
    pub async fn handle_retry(&self, mut records: Vec<EventRecord>, backoff: Duration) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!(
                "WORKER | worker {} is stopping, not retrying {} record(s)",
                self.id,
                records.len()
            );
            return;
        }
        for record in &mut records {
            record.increase(self.config.max_retries);
        }

        let mut interrupted = false;
        if self.queue.size() < self.config.high_water_mark {
            tokio::select! {
                () = self.cancel.cancelled() => interrupted = true,
                () = sleep(backoff) => {}
            }
        }

        for record in records {
            let requeued = if interrupted {
                self.queue.offer(record)
            } else {
                self.queue.enqueue(record).await
            };
            if !requeued {
                warn!("WORKER | Failed to requeue record for retry");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::event::EventKind;
    use crate::queue::create_queue;

    fn config(retry_interval: Duration) -> Arc<Config> {
        Arc::new(Config {
            enabled: true,
            host: "localhost".to_string(),
            token: "token".to_string(),
            use_ssl: false,
            retry_interval,
            min_backoff: Duration::from_millis(10),
            offer_timeout: Duration::from_millis(20),
            queue_capacity: 16,
            ..Config::default()
        })
    }

    fn task(config: Arc<Config>, queue: Arc<dyn EventQueue>, base_url: String) -> WorkerTask {
        WorkerTask::new(
            0,
            Arc::clone(&config),
            queue,
            reqwest::Client::new(),
            base_url,
            ResponseHandler::new(Arc::new(AtomicU64::new(0)), Arc::new(AtomicU64::new(0))),
        )
    }

    #[tokio::test]
    async fn test_502_requeues_with_incremented_retry_count() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/services/collector/event")
            .with_status(502)
            .expect(1)
            .create_async()
            .await;

        let config = config(Duration::from_millis(20));
        let queue = create_queue(Arc::clone(&config));
        let worker = task(config, Arc::clone(&queue), server.url());

        let started = Instant::now();
        worker
            .process(vec![EventRecord::new("report", EventKind::BuildReport)])
            .await;
        assert!(started.elapsed() >= Duration::from_millis(40));

        assert_eq!(queue.size(), 1);
        let requeued = queue.try_take().unwrap();
        assert_eq!(requeued.retry_count(), 1);
        assert!(!requeued.is_discarded());
        mock.assert_async().await;
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_400_discards_without_requeue() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/services/collector/event")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let config = config(Duration::from_millis(20));
        let queue = create_queue(Arc::clone(&config));
        let worker = task(config, Arc::clone(&queue), server.url());
        worker
            .process(vec![EventRecord::new("bad", EventKind::Log)])
            .await;

        assert_eq!(queue.size(), 0);
        assert_eq!(worker.handler.errors(), 1);
        assert!(logs_contain("Message not delivered"));
        assert!(logs_contain("incorrect index or invalid data format"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_backoff_skipped_when_backlogged() {
        let config = Arc::new(Config {
            high_water_mark: 2,
            ..(*config(Duration::from_secs(60))).clone()
        });
        let queue = create_queue(Arc::clone(&config));
        queue.offer(EventRecord::new("a", EventKind::Log));
        queue.offer(EventRecord::new("b", EventKind::Log));
        let worker = task(config, Arc::clone(&queue), "http://unused".to_string());

        let started = Instant::now();
        worker
            .handle_retry(
                vec![EventRecord::new("c", EventKind::Log)],
                Duration::from_secs(60),
            )
            .await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(queue.size(), 3);
    }

    #[tokio::test]
    async fn test_retry_past_max_retries_marks_discarded() {
        let config = config(Duration::from_millis(1));
        let queue = create_queue(Arc::clone(&config));
        let worker = task(Arc::clone(&config), Arc::clone(&queue), "http://unused".to_string());

        let mut record = EventRecord::new("x", EventKind::Log);
        for _ in 0..config.max_retries {
            record.increase(config.max_retries);
        }
        worker.handle_retry(vec![record], Duration::from_millis(1)).await;
        assert!(queue.try_take().unwrap().is_discarded());
    }

    #[tokio::test]
    async fn test_connect_error_is_retried() {
        // Nothing listens on port 9 of localhost.
        let config = config(Duration::from_millis(10));
        let queue = create_queue(Arc::clone(&config));
        let worker = task(config, Arc::clone(&queue), "http://127.0.0.1:9".to_string());
        worker
            .process(vec![EventRecord::new("x", EventKind::BuildEvent)])
            .await;
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.try_take().unwrap().retry_count(), 1);
    }

    #[tokio::test]
    async fn test_stop_interrupts_take() {
        let config = config(Duration::from_millis(10));
        let queue = create_queue(Arc::clone(&config));
        let mut worker = DeliveryWorker::spawn(task(config, queue, "http://unused".to_string()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        worker.stop().await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(worker.handle.is_none());
    }

    /// Accepts one connection and answers 200 only after `delay`.
    fn slow_collector(delay: Duration) -> (String, std::thread::JoinHandle<bool>) {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return false;
            };
            let mut request = [0u8; 4096];
            let read = stream.read(&mut request).unwrap_or(0);
            std::thread::sleep(delay);
            read > 0
                && stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                    .is_ok()
        });
        (url, server)
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_send() {
        let (url, server) = slow_collector(Duration::from_millis(1500));
        let config = config(Duration::from_millis(10));
        let queue = create_queue(Arc::clone(&config));
        let delivered = Arc::new(AtomicU64::new(0));
        let mut worker = DeliveryWorker::spawn(WorkerTask::new(
            0,
            Arc::clone(&config),
            Arc::clone(&queue),
            reqwest::Client::new(),
            url,
            ResponseHandler::new(Arc::clone(&delivered), Arc::default()),
        ));

        assert!(queue.offer(EventRecord::new("slow\n", EventKind::ConsoleLog)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !worker.is_sending() && Instant::now() < deadline {
            sleep(Duration::from_millis(5)).await;
        }
        assert!(worker.is_sending());

        worker.stop().await;
        assert!(!worker.is_sending());
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        assert!(tokio::task::spawn_blocking(move || server.join().unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_running_worker_delivers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/services/collector/raw")
            .match_query(mockito::Matcher::Any)
            .match_header("authorization", "Splunk token")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let config = config(Duration::from_millis(10));
        let queue = create_queue(Arc::clone(&config));
        let delivered = Arc::new(AtomicU64::new(0));
        let mut worker = DeliveryWorker::spawn(WorkerTask::new(
            0,
            Arc::clone(&config),
            Arc::clone(&queue),
            reqwest::Client::new(),
            server.url(),
            ResponseHandler::new(Arc::clone(&delivered), Arc::default()),
        ));

        assert!(
            queue
                .enqueue(EventRecord::new("hello\n", EventKind::ConsoleLog))
                .await
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while delivered.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        worker.stop().await;
        assert_eq!(delivered.load(Ordering::Relaxed), 1);
        mock.assert_async().await;
    }
}
