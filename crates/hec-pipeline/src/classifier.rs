// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Maps collector responses onto success or a [`DeliveryError`].
//!
//! | Status | Outcome |
//! |---|---|
//! | 200 | delivered |
//! | 502, 503 | [`DeliveryError::Service`], retried after twice the base interval |
//! | 400, 401, 403 | [`DeliveryError::Client`], never retried |
//! | other | [`DeliveryError::Client`] with the reason phrase |

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::DeliveryError;

#[must_use = "a classified response must be handled"]
pub fn classify(status: u16, reason: &str) -> Result<(), DeliveryError> {
    match status {
        200 => Ok(()),
        503 => Err(DeliveryError::Service {
            status,
            reason: "Server is busy, maybe caused by blocked queue".to_string(),
        }),
        502 => Err(DeliveryError::Service {
            status,
            reason: "Bad gateway, target may have closed the connection".to_string(),
        }),
        401 | 403 => Err(DeliveryError::Client {
            status,
            reason: format!("{reason}, http event collector token is invalid"),
        }),
        400 => Err(DeliveryError::Client {
            status,
            reason: format!("{reason}, incorrect index or invalid data format"),
        }),
        _ => Err(DeliveryError::Client {
            status,
            reason: reason.to_string(),
        }),
    }
}

/// Consumes collector responses and keeps the delivered and error counters.
#[derive(Debug, Clone)]
pub struct ResponseHandler {
    delivered: Arc<AtomicU64>,
    errors: Arc<AtomicU64>,
}

impl ResponseHandler {
    #[must_use]
    pub fn new(delivered: Arc<AtomicU64>, errors: Arc<AtomicU64>) -> Self {
        ResponseHandler { delivered, errors }
    }

    /// Reads the body to the end so the pooled connection can be reused, then
    /// classifies the status. `records` is the number of events the request
    /// carried.
    pub async fn handle_response(
        &self,
        response: reqwest::Response,
        records: u64,
    ) -> Result<(), DeliveryError> {
        let status = response.status();
        let reason = status.canonical_reason().unwrap_or("Unknown");
        let body = response.bytes().await;
        match classify(status.as_u16(), reason) {
            Ok(()) => {
                self.delivered.fetch_add(records, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if let Ok(body) = body {
                    debug!(
                        "WORKER | Collector rejected request: {}",
                        String::from_utf8_lossy(&body)
                    );
                }
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
