// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![allow(dead_code)]

use std::sync::Arc;

use hec_pipeline::config::Config;
use hec_pipeline::service::DeliveryService;
use mockito::ServerGuard;
use tokio::time::{sleep, Duration, Instant};

pub const TOKEN: &str = "11111111-2222-3333-4444-555555555555";

/// Plain-HTTP config pointed at the mock collector, with short retry timers.
pub fn collector_config(server: &ServerGuard) -> Config {
    let address = server.host_with_port();
    let (host, port) = address
        .rsplit_once(':')
        .expect("mock server address has a port");
    Config {
        enabled: true,
        host: host.to_string(),
        port: port.parse().expect("mock server port is numeric"),
        use_ssl: false,
        token: TOKEN.to_string(),
        worker_count: 1,
        retry_interval: Duration::from_millis(10),
        min_backoff: Duration::from_millis(10),
        ..Config::default()
    }
}

pub async fn started(config: Config) -> Arc<DeliveryService> {
    let service = Arc::new(DeliveryService::new(Arc::new(config)));
    service.start().await.expect("service starts");
    service
}

/// Polls `done` until it holds or five seconds pass.
pub async fn eventually(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    done()
}
