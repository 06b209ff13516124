// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Forwards a build's console output (stdin) and artifact files to an HTTP
//! Event Collector.
//!
//! ```text
//! some-build-step 2>&1 | hec-forwarder job/app/12/ target/report.json target/*.log
//! ```
//!
//! Settings come from `hec.yaml` in `HEC_CONFIG_DIR` (default: the current
//! directory) and `HEC_*` environment variables.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::io::Write;
use std::path::PathBuf;
use std::{env, sync::Arc};

use tokio::io::AsyncReadExt;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hec_pipeline::{
    config::get_config,
    console::ConsoleCapture,
    constants::MIN_BUFFER_SIZE,
    decorator::{BuildContext, DecoratorCache},
    file_sender::FileSender,
    flush_scheduler::FlushScheduler,
    logger::Formatter,
    service::DeliveryService,
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_BUILD_URL: &str = "job/local/1/";

struct LocalBuild {
    url: String,
}

impl BuildContext for LocalBuild {
    fn key(&self) -> &str {
        &self.url
    }

    fn url(&self) -> &str {
        &self.url
    }
}

#[tokio::main]
pub async fn main() {
    let config_dir = env::var("HEC_CONFIG_DIR").map_or_else(|_| PathBuf::from("."), PathBuf::from);
    let config = get_config(&config_dir);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(config.log_level.env_filter())
                .expect("could not parse log level in configuration"),
        )
        .event_format(Formatter)
        .with_writer(std::io::stderr)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    if let Err(e) = config.validate() {
        error!("FORWARDER | Invalid configuration: {e}");
        return;
    }
    if !config.is_valid() {
        error!("FORWARDER | Event collector is disabled or has no host or token, nothing to forward");
        return;
    }

    let mut args = env::args().skip(1);
    let mut build_url = args.next().unwrap_or_else(|| DEFAULT_BUILD_URL.to_string());
    if !build_url.ends_with('/') {
        build_url.push('/');
    }
    let files: Vec<PathBuf> = args.map(PathBuf::from).collect();
    let workspace = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let service = Arc::new(DeliveryService::new(Arc::new(config)));
    if let Err(e) = service.start().await {
        error!("FORWARDER | Failed to start delivery service: {e}");
        return;
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("FORWARDER | Interrupted, flushing what was read so far");
            signal_cancel.cancel();
        }
    });

    let scheduler = FlushScheduler::new();
    let cache = DecoratorCache::new(Arc::clone(&service), Arc::clone(&scheduler));
    let build: Arc<dyn BuildContext> = Arc::new(LocalBuild {
        url: build_url.clone(),
    });

    if let Some(capture) = cache.of(&build) {
        forward_stdin(&capture, &cancel).await;
    }
    cache.invalidate(build.as_ref());

    if !files.is_empty() && !cancel.is_cancelled() {
        let sender = FileSender::new(Arc::clone(&service), &workspace, &build_url);
        let sent = sender.send_files(&files).await;
        info!("FORWARDER | Queued {} file record(s) from {} path(s)", sent, files.len());
    }

    scheduler.shutdown();
    if let Err(e) = service.wait_until_drained(DRAIN_TIMEOUT).await {
        warn!(
            "FORWARDER | {e}, {} record(s) left in the queue",
            service.queue_size()
        );
    }
    if let Err(e) = service.stop_workers().await {
        warn!("FORWARDER | Failed to stop delivery workers: {e}");
    }
    info!(
        "FORWARDER | Delivered {} event(s), {} failed request(s)",
        service.sent_count(),
        service.error_count()
    );
}

async fn forward_stdin(capture: &ConsoleCapture, cancel: &CancellationToken) {
    let Some(mut stream) = capture.open_stream() else {
        return;
    };
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; MIN_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => break,
            read = stdin.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    error!("FORWARDER | Failed to read stdin: {e}");
                    break;
                }
            },
        };
        if let Err(e) = stream.write_all(&buf[..n]) {
            warn!("FORWARDER | Console stream rejected output: {e}");
            break;
        }
    }
}
