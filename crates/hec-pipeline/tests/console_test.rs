// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use std::io::Write;
use std::sync::Arc;

use hec_pipeline::decorator::{BuildContext, DecoratorCache};
use hec_pipeline::flush_scheduler::FlushScheduler;
use mockito::{Matcher, Server};

use common::{collector_config, eventually, started};

struct Build;

impl BuildContext for Build {
    fn key(&self) -> &str {
        "app#7"
    }

    fn url(&self) -> &str {
        "job/app/7/"
    }
}

#[tokio::test]
async fn console_output_reaches_collector_on_close() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/services/collector/raw")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("source".to_string(), "job/app/7/console".to_string()),
            Matcher::UrlEncoded("sourcetype".to_string(), "ci:console".to_string()),
        ]))
        .match_body(Matcher::Regex("Started by user".to_string()))
        .with_status(200)
        .expect_at_least(1)
        .create_async()
        .await;

    let service = started(collector_config(&server)).await;
    let scheduler = FlushScheduler::new();
    let cache = DecoratorCache::new(Arc::clone(&service), Arc::clone(&scheduler));
    let build: Arc<dyn BuildContext> = Arc::new(Build);

    let capture = cache.of(&build).unwrap();
    assert!(Arc::ptr_eq(&capture, &cache.of(&build).unwrap()));

    let mut stream = capture.open_stream().unwrap();
    stream.write_all(b"Started by user admin\n").unwrap();
    stream.write_all(b"Building in workspace /ws\n").unwrap();
    // the close below flushes what the timer has not
    cache.invalidate(build.as_ref());
    assert!(capture.is_closed());
    assert!(stream.write_all(b"late\n").is_err());

    assert!(eventually(|| service.sent_count() >= 1).await);
    service.stop_workers().await.unwrap();
    scheduler.shutdown();
    mock.assert_async().await;
}

#[tokio::test]
async fn forgotten_stream_is_delivered_by_reclaim() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/services/collector/raw")
        .match_query(Matcher::Any)
        .match_body("leaked output\n")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let service = started(collector_config(&server)).await;
    let scheduler = FlushScheduler::new();
    let cache = DecoratorCache::new(Arc::clone(&service), Arc::clone(&scheduler));
    let build: Arc<dyn BuildContext> = Arc::new(Build);

    {
        let capture = cache.of(&build).unwrap();
        let mut stream = capture.open_stream().unwrap();
        stream.write_all(b"leaked output\n").unwrap();
        // stream dropped without close
    }
    assert_eq!(scheduler.poll_reclaimed(), 1);

    assert!(eventually(|| service.sent_count() == 1).await);
    service.stop_workers().await.unwrap();
    scheduler.shutdown();
    mock.assert_async().await;
}
