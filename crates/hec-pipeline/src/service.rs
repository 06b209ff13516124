// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide owner of the event queue, HTTP client and worker pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::classifier::ResponseHandler;
use crate::config::Config;
use crate::constants::MAX_DEFERRED_RECORDS;
use crate::error::{ConfigError, ServiceError};
use crate::event::{EventKind, EventRecord, Payload};
use crate::http::get_client;
use crate::queue::{create_queue, EventQueue};
use crate::worker::{DeliveryWorker, WorkerTask};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Stopped,
    Running,
    Stopping,
}

pub struct DeliveryService {
    config: Arc<Config>,
    queue: Arc<dyn EventQueue>,
    client: reqwest::Client,
    delivered: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
    status: RwLock<ServiceStatus>,
    workers: TokioMutex<Vec<DeliveryWorker>>,
}

impl DeliveryService {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let queue = create_queue(Arc::clone(&config));
        let client = get_client(&config);
        DeliveryService {
            config,
            queue,
            client,
            delivered: Arc::new(AtomicU64::new(0)),
            errors: Arc::new(AtomicU64::new(0)),
            status: RwLock::new(ServiceStatus::Stopped),
            workers: TokioMutex::new(Vec::new()),
        }
    }

    /// Spawns `worker_count` workers. Worker *i* posts to collector URL
    /// *i mod n*.
    pub async fn start(&self) -> Result<(), ServiceError> {
        self.config.validate()?;
        let urls = self.config.collector_urls();
        if urls.is_empty() {
            return Err(ConfigError::Invalid("no collector host configured".to_string()).into());
        }

        let mut status = self.status.write().await;
        if *status != ServiceStatus::Stopped {
            return Err(ServiceError::AlreadyStarted);
        }

        let mut workers = self.workers.lock().await;
        for id in 0..self.config.worker_count {
            let task = WorkerTask::new(
                id,
                Arc::clone(&self.config),
                Arc::clone(&self.queue),
                self.client.clone(),
                urls[id % urls.len()].clone(),
                ResponseHandler::new(Arc::clone(&self.delivered), Arc::clone(&self.errors)),
            );
            workers.push(DeliveryWorker::spawn(task));
        }
        *status = ServiceStatus::Running;
        info!(
            "SERVICE | Started {} delivery worker(s) for {}",
            workers.len(),
            urls.join(",")
        );
        Ok(())
    }

    /// Queues a new record built from `payload`. Returns `false` when the kind
    /// is disabled or the queue could not take it.
    pub async fn send(
        &self,
        payload: impl Into<Payload>,
        kind: EventKind,
        source: Option<&str>,
    ) -> bool {
        let mut record = EventRecord::new(payload, kind);
        if let Some(source) = source {
            record = record.with_source(source);
        }
        self.enqueue(record).await
    }

    pub async fn enqueue(&self, record: EventRecord) -> bool {
        self.queue.enqueue(record).await
    }

    /// Non-blocking; also skips records of disabled kinds.
    pub fn offer(&self, record: EventRecord) -> bool {
        if self.config.is_event_disabled(record.kind()) {
            return false;
        }
        self.queue.offer(record)
    }

    /// Ordered hand-off for one synchronous producer, such as a console
    /// stream.
    #[must_use]
    pub fn submitter(self: &Arc<Self>) -> Submitter {
        Submitter {
            service: Arc::clone(self),
            deferred: Arc::new(StdMutex::new(Deferred::default())),
        }
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<dyn EventQueue> {
        &self.queue
    }

    #[must_use]
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Records acknowledged by the collector.
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    /// Stops every worker. Records still queued are kept until the service is
    /// dropped.
    pub async fn stop_workers(&self) -> Result<(), ServiceError> {
        {
            let mut status = self.status.write().await;
            if *status != ServiceStatus::Running {
                return Err(ServiceError::NotRunning);
            }
            *status = ServiceStatus::Stopping;
        }

        let mut workers = self.workers.lock().await;
        join_all(workers.iter_mut().map(DeliveryWorker::stop)).await;
        debug!("SERVICE | Stopped {} delivery worker(s)", workers.len());
        workers.clear();

        *self.status.write().await = ServiceStatus::Stopped;
        Ok(())
    }

    /// Waits until the queue is empty and no worker is mid-send.
    pub async fn wait_until_drained(&self, timeout: Duration) -> Result<(), ServiceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let busy = {
                let workers = self.workers.lock().await;
                workers.iter().any(DeliveryWorker::is_sending)
            };
            if self.queue.size() == 0 && !busy {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::ShutdownTimeout);
            }
            sleep(DRAIN_POLL_INTERVAL).await;
        }
    }
}

#[derive(Default)]
struct Deferred {
    records: VecDeque<EventRecord>,
    draining: bool,
}

/// Per-producer hand-off that never blocks the caller.
///
/// Records are offered to the queue directly while nothing is held back. Once
/// the queue turns one away, it and every later record wait in a bounded
/// backlog that a single background task feeds through `enqueue`, so the
/// producer's records reach the queue in the order they were submitted.
pub struct Submitter {
    service: Arc<DeliveryService>,
    deferred: Arc<StdMutex<Deferred>>,
}

impl Submitter {
    /// Returns `false` when the record was dropped: disabled kind, full
    /// backlog, or no runtime to drain it on.
    pub fn submit(&self, record: EventRecord) -> bool {
        if self.service.config.is_event_disabled(record.kind()) {
            return false;
        }
        let mut deferred = self.deferred.lock().unwrap_or_else(PoisonError::into_inner);
        if deferred.draining {
            if deferred.records.len() >= MAX_DEFERRED_RECORDS {
                warn!(
                    "SERVICE | Deferred backlog is full, dropping {}",
                    record.short_description()
                );
                return false;
            }
            deferred.records.push_back(record);
            return true;
        }

        let record = match self.service.queue.try_offer(record) {
            Ok(()) => return true,
            Err(record) => record,
        };
        let Ok(runtime) = Handle::try_current() else {
            warn!(
                "SERVICE | Queue is full and no runtime is available, dropping {}",
                record.short_description()
            );
            return false;
        };
        deferred.records.push_back(record);
        deferred.draining = true;
        drop(deferred);

        let service = Arc::clone(&self.service);
        let backlog = Arc::clone(&self.deferred);
        runtime.spawn(async move { drain_deferred(service, backlog).await });
        true
    }

    #[must_use]
    pub fn deferred_count(&self) -> usize {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }
}

async fn drain_deferred(service: Arc<DeliveryService>, backlog: Arc<StdMutex<Deferred>>) {
    loop {
        let next = {
            let mut deferred = backlog.lock().unwrap_or_else(PoisonError::into_inner);
            let next = deferred.records.pop_front();
            if next.is_none() {
                deferred.draining = false;
            }
            next
        };
        let Some(record) = next else {
            return;
        };
        if !service.enqueue(record).await {
            debug!("SERVICE | Record dropped after bounded enqueue");
        }
    }
}
