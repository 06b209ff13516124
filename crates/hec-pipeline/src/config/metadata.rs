// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-kind event metadata (`index`, `source`, `sourcetype`, `enabled`).
//!
//! Metadata is written as `key=value` lines. A key is either global
//! (`index=ci`) or scoped to one event kind (`console_log.index=ci-console`);
//! the scoped key wins.

use std::collections::HashMap;

use crate::event::EventKind;

const DEFAULT_METADATA: &str = "\
sourcetype=ci:json
console_log.sourcetype=ci:console
file.sourcetype=ci:file
json_file.sourcetype=ci:json_file
";

#[derive(Debug, Clone, PartialEq)]
pub struct Metadata {
    items: HashMap<String, String>,
}

impl Default for Metadata {
    fn default() -> Self {
        let mut metadata = Metadata {
            items: HashMap::new(),
        };
        metadata.load(DEFAULT_METADATA);
        metadata
    }
}

impl Metadata {
    /// Merges `key=value` lines; blank lines and `#` comments are skipped.
    pub fn load(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            self.insert(key.trim(), value.trim());
        }
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        self.items.insert(key.to_string(), value.to_string());
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(String::as_str)
    }

    /// Kind-scoped value, falling back to the global key.
    #[must_use]
    pub fn resolve(&self, kind: EventKind, key: &str) -> Option<&str> {
        self.get(&kind.key(key))
            .or_else(|| self.get(key))
            .filter(|value| !value.is_empty())
    }

    #[must_use]
    pub fn is_disabled(&self, kind: EventKind) -> bool {
        self.get(&kind.key("enabled")) == Some("false")
    }

    #[must_use]
    pub fn index(&self, kind: EventKind) -> Option<&str> {
        self.resolve(kind, "index")
    }

    #[must_use]
    pub fn source(&self, kind: EventKind) -> Option<&str> {
        self.resolve(kind, "source")
    }

    #[must_use]
    pub fn sourcetype(&self, kind: EventKind) -> Option<&str> {
        self.resolve(kind, "sourcetype")
    }
}
