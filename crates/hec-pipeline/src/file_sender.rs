// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ships build artifacts as `file` and `json_file` events.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, error, info};

use crate::constants::MIN_BUFFER_SIZE;
use crate::error::FileSendError;
use crate::event::EventKind;
use crate::service::DeliveryService;

pub struct FileSender {
    service: Arc<DeliveryService>,
    workspace: String,
    build_url: String,
}

impl FileSender {
    /// `workspace` is stripped from file paths before they are prefixed with
    /// `build_url` to form the event source.
    #[must_use]
    pub fn new(service: Arc<DeliveryService>, workspace: &Path, build_url: &str) -> Self {
        FileSender {
            service,
            workspace: posix_path(&workspace.to_string_lossy()),
            build_url: build_url.to_string(),
        }
    }

    /// Sends every regular file in `paths`. Directories are skipped and a
    /// failing file does not stop the others. Returns the number of records
    /// queued.
    pub async fn send_files(&self, paths: &[PathBuf]) -> usize {
        let mut count = 0;
        for path in paths {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.is_dir() => continue,
                Ok(_) => {}
                Err(e) => {
                    error!("FILE | Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            }
            match self.send_file(path).await {
                Ok(sent) => {
                    debug!("FILE | Sent {} in {} record(s)", path.display(), sent);
                    count += sent;
                }
                Err(e) => error!("FILE | Archiving file failed: {}", e),
            }
        }
        count
    }

    pub async fn send_file(&self, path: &Path) -> Result<usize, FileSendError> {
        let name = path.to_string_lossy();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| FileSendError::Io {
                path: name.to_string(),
                source,
            })?;
        info!("FILE | Uploading {}", name);
        self.send(&name, file).await
    }

    /// Reads `input` to the end, queueing a record whenever a line boundary
    /// is reached past the throttle size.
    pub async fn send<R>(&self, file_name: &str, mut input: R) -> Result<usize, FileSendError>
    where
        R: AsyncRead + Unpin,
    {
        let config = self.service.config();
        if config.is_event_disabled(EventKind::File) {
            return Err(FileSendError::Disabled(file_name.to_string()));
        }

        let mut throttle = config.max_events_batch_size as u64;
        if !config.raw_event_enabled {
            // every line carries its own envelope
            throttle /= 2;
        }
        let mut kind = EventKind::File;
        if file_name.ends_with(".json") && config.raw_event_enabled {
            throttle = config.max_file_size;
            kind = EventKind::JsonFile;
        }
        let max_file_size = config.max_file_size;
        let source = self.source_name(file_name);

        let mut pending = Vec::with_capacity(MIN_BUFFER_SIZE);
        let mut chunk = vec![0u8; MIN_BUFFER_SIZE];
        let mut total: u64 = 0;
        let mut count = 0;
        loop {
            let n = input
                .read(&mut chunk)
                .await
                .map_err(|source| FileSendError::Io {
                    path: file_name.to_string(),
                    source,
                })?;
            if n == 0 {
                break;
            }
            total += n as u64;

            let mut rest = &chunk[..n];
            while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
                pending.extend_from_slice(&rest[..=pos]);
                rest = &rest[pos + 1..];
                if pending.len() as u64 > throttle {
                    // too big for a single request
                    kind = EventKind::File;
                    self.flush(&source, &mut pending, kind).await;
                    count += 1;
                }
            }
            pending.extend_from_slice(rest);

            if max_file_size != 0 && total > max_file_size {
                pending.extend_from_slice(format!("file truncated to size:{total}").as_bytes());
                self.service
                    .send(format!("{source} too large"), EventKind::Log, Some("large_file"))
                    .await;
                break;
            }
        }
        if !pending.is_empty() {
            self.flush(&source, &mut pending, kind).await;
            count += 1;
        }
        Ok(count)
    }

    /// Posix form of `file_name` relative to the workspace, prefixed with the
    /// build URL.
    #[must_use]
    pub fn source_name(&self, file_name: &str) -> String {
        let path = posix_path(file_name);
        let relative = path
            .strip_prefix(&self.workspace)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(&path);
        format!("{}{}", self.build_url, relative)
    }

    async fn flush(&self, source: &str, pending: &mut Vec<u8>, kind: EventKind) {
        let bytes = std::mem::take(pending);
        if !self.service.send(bytes, kind, Some(source)).await {
            debug!("FILE | A {} record of {} was not queued", kind, source);
        }
    }
}

fn posix_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::event::EventRecord;
    use std::io::Write;

    fn service(config: Config) -> Arc<DeliveryService> {
        Arc::new(DeliveryService::new(Arc::new(Config {
            enabled: true,
            host: "localhost".to_string(),
            token: "token".to_string(),
            ..config
        })))
    }

    fn queued(service: &DeliveryService) -> Vec<EventRecord> {
        std::iter::from_fn(|| service.queue().try_take()).collect()
    }

    fn text(record: &EventRecord) -> String {
        record.payload().as_text().unwrap().into_owned()
    }

    #[test]
    fn test_source_name() {
        let sender = FileSender::new(
            service(Config::default()),
            Path::new(r"C:\ws\app"),
            "job/app/3/",
        );
        assert_eq!(
            sender.source_name(r"C:\ws\app\target\out.log"),
            "job/app/3/target/out.log"
        );
        assert_eq!(sender.source_name("other.log"), "job/app/3/other.log");
    }

    #[tokio::test]
    async fn test_small_file_is_one_record() {
        let service = service(Config::default());
        let sender = FileSender::new(Arc::clone(&service), Path::new("/ws"), "job/a/1/");

        let sent = sender
            .send("/ws/build.log", &b"line one\nline two\n"[..])
            .await
            .unwrap();

        assert_eq!(sent, 1);
        let records = queued(&service);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), EventKind::File);
        assert_eq!(records[0].source(), Some("job/a/1/build.log"));
        assert_eq!(text(&records[0]), "line one\nline two\n");
    }

    #[tokio::test]
    async fn test_chunks_at_line_boundaries_past_throttle() {
        // raw disabled halves the throttle to 2048
        let service = service(Config {
            raw_event_enabled: false,
            max_events_batch_size: 4096,
            ..Config::default()
        });
        let sender = FileSender::new(Arc::clone(&service), Path::new("/ws"), "job/a/1/");
        let line = format!("{}\n", "x".repeat(99));
        let content = line.repeat(50);

        let sent = sender.send("/ws/big.log", content.as_bytes()).await.unwrap();

        let records = queued(&service);
        assert_eq!(sent, records.len());
        assert_eq!(sent, 3);
        let rebuilt: String = records.iter().map(text).collect();
        assert_eq!(rebuilt, content);
        for record in &records {
            assert!(text(record).ends_with('\n'));
        }
    }

    #[tokio::test]
    async fn test_json_file_sent_whole_when_raw_enabled() {
        let service = service(Config {
            max_events_batch_size: 4096,
            ..Config::default()
        });
        let sender = FileSender::new(Arc::clone(&service), Path::new("/ws"), "job/a/1/");
        let content = "{\"a\":1}\n".repeat(1000);

        let sent = sender.send("/ws/report.json", content.as_bytes()).await.unwrap();

        assert_eq!(sent, 1);
        let records = queued(&service);
        assert_eq!(records[0].kind(), EventKind::JsonFile);
        assert_eq!(text(&records[0]).len(), content.len());
    }

    #[tokio::test]
    async fn test_json_file_is_plain_file_without_raw() {
        let service = service(Config {
            raw_event_enabled: false,
            ..Config::default()
        });
        let sender = FileSender::new(Arc::clone(&service), Path::new("/ws"), "job/a/1/");
        sender.send("/ws/report.json", &b"{}\n"[..]).await.unwrap();
        assert_eq!(queued(&service)[0].kind(), EventKind::File);
    }

    #[tokio::test]
    async fn test_truncates_large_file() {
        let service = service(Config {
            max_file_size: 5000,
            ..Config::default()
        });
        let sender = FileSender::new(Arc::clone(&service), Path::new("/ws"), "job/a/1/");
        let content = "y".repeat(20_000);

        sender.send("/ws/huge.log", content.as_bytes()).await.unwrap();

        let records = queued(&service);
        let notice = records
            .iter()
            .find(|r| r.kind() == EventKind::Log)
            .unwrap();
        assert_eq!(notice.source(), Some("large_file"));
        assert_eq!(text(notice), "job/a/1/huge.log too large");

        let file = records
            .iter()
            .find(|r| r.kind() == EventKind::File)
            .unwrap();
        let body = text(file);
        assert!(body.ends_with("file truncated to size:8192"));
        assert!(body.len() < content.len());
    }

    #[tokio::test]
    async fn test_send_files_skips_directories_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = std::fs::File::create(dir.path().join("a.log")).unwrap();
        log.write_all(b"hello\n").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let service = service(Config::default());
        let sender = FileSender::new(Arc::clone(&service), dir.path(), "job/a/1/");
        let sent = sender
            .send_files(&[
                dir.path().join("missing.log"),
                dir.path().join("nested"),
                dir.path().join("a.log"),
            ])
            .await;

        assert_eq!(sent, 1);
        let records = queued(&service);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source(), Some("job/a/1/a.log"));
    }

    #[tokio::test]
    async fn test_disabled_file_events() {
        let mut config = Config::default();
        config.metadata.load("file.enabled=false");
        let sender = FileSender::new(service(config), Path::new("/ws"), "job/a/1/");
        let result = sender.send("/ws/a.log", &b"x\n"[..]).await;
        assert!(matches!(result, Err(FileSendError::Disabled(_))));
    }
}
