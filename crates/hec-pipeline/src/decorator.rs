// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! At most one [`ConsoleCapture`] per running build.
//!
//! Entries hold the build weakly. Every lookup or invalidation purges entries
//! whose build is gone and closes their captures. Past capacity the oldest
//! entry is evicted. Builds are expected to call
//! [`DecoratorCache::invalidate`] once, when they complete.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tracing::debug;

use crate::config::Config;
use crate::console::ConsoleCapture;
use crate::event::EventKind;
use crate::flush_scheduler::FlushScheduler;
use crate::service::DeliveryService;

/// What the cache needs to know about a build.
pub trait BuildContext: Send + Sync {
    /// Stable identity, unique among running builds.
    fn key(&self) -> &str;

    /// Build URL relative to the CI root, e.g. `job/app/12/`.
    fn url(&self) -> &str;
}

struct Entry {
    build: Weak<dyn BuildContext>,
    capture: Arc<ConsoleCapture>,
    created: u64,
}

impl Entry {
    fn is_live(&self) -> bool {
        self.build.strong_count() > 0
    }
}

pub struct DecoratorCache {
    config: Arc<Config>,
    service: Arc<DeliveryService>,
    scheduler: Arc<FlushScheduler>,
    entries: DashMap<String, Entry>,
    sequence: AtomicU64,
    max_entries: usize,
}

impl DecoratorCache {
    #[must_use]
    pub fn new(service: Arc<DeliveryService>, scheduler: Arc<FlushScheduler>) -> Self {
        let config = Arc::clone(service.config());
        let max_entries = config.max_decorator_entries.max(1);
        DecoratorCache {
            config,
            service,
            scheduler,
            entries: DashMap::new(),
            sequence: AtomicU64::new(0),
            max_entries,
        }
    }

    /// Capture for `build`, created on first use. `None` when console capture
    /// is switched off, console events are disabled, or the build is ignored.
    #[must_use]
    pub fn of(&self, build: &Arc<dyn BuildContext>) -> Option<Arc<ConsoleCapture>> {
        if !self.config.pipeline_filter || self.config.is_event_disabled(EventKind::ConsoleLog) {
            return None;
        }
        if self.config.is_build_ignored(build.url()) {
            debug!("CONSOLE | {} is ignored, not capturing console", build.url());
            return None;
        }

        let key = build.key().to_string();
        if let Some(entry) = self.entries.get(&key) {
            if entry.is_live() {
                return Some(Arc::clone(&entry.capture));
            }
        }

        let mut replaced = None;
        let capture = match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                if !occupied.get().is_live() {
                    replaced = Some(occupied.insert(self.new_entry(build)));
                }
                Arc::clone(&occupied.get().capture)
            }
            MapEntry::Vacant(vacant) => {
                let entry = self.new_entry(build);
                let capture = Arc::clone(&entry.capture);
                vacant.insert(entry);
                capture
            }
        };
        if let Some(stale) = replaced {
            stale.capture.close();
        }
        self.purge_dead();
        self.evict(&key);
        Some(capture)
    }

    fn new_entry(&self, build: &Arc<dyn BuildContext>) -> Entry {
        Entry {
            build: Arc::downgrade(build),
            capture: Arc::new(ConsoleCapture::new(
                build.key().to_string(),
                build.url(),
                Arc::clone(&self.service),
                Arc::clone(&self.scheduler),
            )),
            created: self.sequence.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Removes the entry for `build` and closes its capture.
    pub fn invalidate(&self, build: &dyn BuildContext) {
        if let Some((key, entry)) = self.entries.remove(build.key()) {
            let closed = entry.capture.close();
            debug!("CONSOLE | Invalidated {} ({} stream(s) closed)", key, closed);
        }
        self.purge_dead();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops entries whose build has been reclaimed and closes their
    /// captures.
    fn purge_dead(&self) {
        let dead: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_live())
            .map(|entry| entry.key().clone())
            .collect();
        for key in dead {
            if let Some((key, entry)) = self.entries.remove_if(&key, |_, entry| !entry.is_live()) {
                let closed = entry.capture.close();
                debug!(
                    "CONSOLE | Reclaimed capture of finished build {} ({} stream(s) closed)",
                    key, closed
                );
            }
        }
    }

    fn evict(&self, keep: &str) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .iter()
                .filter(|entry| entry.key() != keep)
                .min_by_key(|entry| entry.value().created)
                .map(|entry| entry.key().clone());
            match oldest {
                Some(key) => {
                    debug!("CONSOLE | Evicting console capture for {}", key);
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}
