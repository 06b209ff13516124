// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded, admission-controlled FIFO between producers and delivery workers.
//!
//! Producers call [`EventQueue::enqueue`] (bounded wait) or
//! [`EventQueue::offer`] (fail fast); workers call [`EventQueue::take`].
//!
//! When the queue stays full past the bounded wait, the queue runs a
//! congestion drain: every queued record is removed and only
//! [`EventKind::BuildReport`] records are put back, in their original order.
//! Console, file and other verbose records are dropped so that build summaries
//! keep flowing under sustained overload. The record that triggered the drain
//! is rejected either way.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

use crate::config::{Config, QueueKind};
use crate::event::{EventKind, EventRecord};

#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Admits `record` unless its kind is disabled. Waits up to the configured
    /// offer timeout for space, then tries once more without waiting, then
    /// falls back to a congestion drain and reports `false`.
    async fn enqueue(&self, record: EventRecord) -> bool;

    /// Non-blocking insert. Hands the record back when the queue is full.
    fn try_offer(&self, record: EventRecord) -> Result<(), EventRecord>;

    /// Non-blocking insert. Fails when the queue is full.
    fn offer(&self, record: EventRecord) -> bool {
        self.try_offer(record).is_ok()
    }

    /// Waits until a record is available. Dropping the future cancels the wait.
    async fn take(&self) -> EventRecord;

    fn try_take(&self) -> Option<EventRecord>;

    fn size(&self) -> usize;

    fn capacity(&self) -> usize;

    fn clear(&self);

    /// Runs the congestion drain now. Returns the number of surviving records,
    /// or `None` when another drain is already running.
    fn drain_congested(&self) -> Option<usize>;
}

/// Builds the queue implementation selected by `config.queue_kind`.
#[must_use]
pub fn create_queue(config: Arc<Config>) -> Arc<dyn EventQueue> {
    match config.queue_kind {
        QueueKind::Default => Arc::new(DefaultEventQueue::new(config)),
    }
}

pub struct DefaultEventQueue {
    config: Arc<Config>,
    capacity: usize,
    offer_timeout: Duration,
    records: Mutex<VecDeque<EventRecord>>,
    not_empty: Notify,
    not_full: Notify,
    // tokio's mutex grants the lock in FIFO order
    maintenance: tokio::sync::Mutex<()>,
}

impl DefaultEventQueue {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let capacity = config.queue_capacity.max(1);
        let offer_timeout = config.offer_timeout;
        DefaultEventQueue {
            config,
            capacity,
            offer_timeout,
            records: Mutex::new(VecDeque::new()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            maintenance: tokio::sync::Mutex::new(()),
        }
    }

    fn records(&self) -> MutexGuard<'_, VecDeque<EventRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the record back when the queue is full.
    fn try_push(&self, record: EventRecord) -> Result<(), EventRecord> {
        {
            let mut records = self.records();
            if records.len() >= self.capacity {
                return Err(record);
            }
            records.push_back(record);
        }
        self.not_empty.notify_one();
        Ok(())
    }
}

#[async_trait]
impl EventQueue for DefaultEventQueue {
    async fn enqueue(&self, record: EventRecord) -> bool {
        if self.config.is_event_disabled(record.kind()) {
            debug!("QUEUE | {} events are disabled, skipping", record.kind());
            return false;
        }

        let deadline = Instant::now() + self.offer_timeout;
        let mut record = record;
        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            match self.try_push(record) {
                Ok(()) => return true,
                Err(rejected) => record = rejected,
            }
            if timeout_at(deadline, space).await.is_err() {
                break;
            }
        }

        if self.try_push(record).is_ok() {
            return true;
        }

        warn!(
            "QUEUE | Queue is full ({} records), starting congestion recovery",
            self.capacity
        );
        self.drain_congested();
        false
    }

    fn try_offer(&self, record: EventRecord) -> Result<(), EventRecord> {
        self.try_push(record)
    }

    async fn take(&self) -> EventRecord {
        loop {
            let available = self.not_empty.notified();
            tokio::pin!(available);
            available.as_mut().enable();
            if let Some(record) = self.try_take() {
                return record;
            }
            available.await;
        }
    }

    fn try_take(&self) -> Option<EventRecord> {
        let record = self.records().pop_front();
        if record.is_some() {
            self.not_full.notify_one();
        }
        record
    }

    fn size(&self) -> usize {
        self.records().len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&self) {
        self.records().clear();
        self.not_full.notify_waiters();
    }

    fn drain_congested(&self) -> Option<usize> {
        let Ok(_guard) = self.maintenance.try_lock() else {
            debug!("QUEUE | Congestion recovery already running, rejecting record");
            return None;
        };

        let drained: Vec<EventRecord> = self.records().drain(..).collect();
        let total = drained.len();
        let mut kept = 0;
        for record in drained
            .into_iter()
            .filter(|record| record.kind() == EventKind::BuildReport)
        {
            if self.try_push(record).is_err() {
                break;
            }
            kept += 1;
        }
        self.not_full.notify_waiters();

        warn!(
            "QUEUE | Congestion recovery dropped {} of {} queued records, kept {} build reports",
            total - kept,
            total,
            kept
        );
        Some(kept)
    }
}
