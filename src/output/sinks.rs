//! File-backed ingest sinks
//!
//! Both sinks open their file in append mode so a resumed run extends the
//! output of the interrupted one. Records are serialized on the calling task;
//! the file write itself runs on tokio's blocking pool.

use crate::crawler::Page;
use crate::output::{Ingest, IngestError};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize)]
struct PageLine<'a> {
    url: &'a str,
    final_url: &'a str,
    status: u16,
    content_type: Option<&'a str>,
    fetched_at: String,
    body: &'a str,
}

#[derive(Debug, Serialize)]
struct PageRow {
    url: String,
    final_url: String,
    status: u16,
    content_type: String,
    fetched_at: String,
    body_bytes: usize,
}

fn open_append(path: &Path) -> Result<(File, bool), IngestError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_empty = file.metadata()?.len() == 0;
    Ok((file, is_empty))
}

/// One JSON object per fetched page
pub struct JsonlSink {
    writer: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlSink {
    pub fn create(path: &Path) -> Result<Self, IngestError> {
        let (file, _) = open_append(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }
}

#[async_trait]
impl Ingest for JsonlSink {
    async fn ingest(&self, page: &Page) -> Result<(), IngestError> {
        let line = serde_json::to_string(&PageLine {
            url: &page.url,
            final_url: &page.final_url,
            status: page.status,
            content_type: page.content_type.as_deref(),
            fetched_at: page.fetched_at.to_rfc3339(),
            body: &page.body,
        })?;

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> Result<(), IngestError> {
            let mut writer = writer.lock().map_err(|_| IngestError::LockPoisoned)?;
            writeln!(writer, "{}", line)?;
            writer.flush()?;
            Ok(())
        })
        .await?
    }
}

/// One CSV row of page metadata per fetched page
pub struct CsvSink {
    writer: Arc<Mutex<csv::Writer<File>>>,
}

impl CsvSink {
    pub fn create(path: &Path) -> Result<Self, IngestError> {
        let (file, is_empty) = open_append(path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(is_empty)
            .from_writer(file);
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
        })
    }
}

#[async_trait]
impl Ingest for CsvSink {
    async fn ingest(&self, page: &Page) -> Result<(), IngestError> {
        let row = PageRow {
            url: page.url.clone(),
            final_url: page.final_url.clone(),
            status: page.status,
            content_type: page.content_type.clone().unwrap_or_default(),
            fetched_at: page.fetched_at.to_rfc3339(),
            body_bytes: page.body.len(),
        };

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || -> Result<(), IngestError> {
            let mut writer = writer.lock().map_err(|_| IngestError::LockPoisoned)?;
            writer.serialize(row)?;
            writer.flush()?;
            Ok(())
        })
        .await?
    }
}

/// Discards every page
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait]
impl Ingest for NullSink {
    async fn ingest(&self, _page: &Page) -> Result<(), IngestError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_jsonl_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/pages.jsonl");

        let sink = JsonlSink::create(&path).unwrap();
        sink.ingest(&Page::html("https://a.test/1", "<p>one</p>"))
            .await
            .unwrap();
        drop(sink);

        let sink = JsonlSink::create(&path).unwrap();
        sink.ingest(&Page::html("https://a.test/2", "<p>two</p>"))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["url"], "https://a.test/2");
        assert_eq!(lines[0]["body"], "<p>one</p>");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingest_keeps_lines_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.jsonl");
        let sink = Arc::new(JsonlSink::create(&path).unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..20 {
            let sink = Arc::clone(&sink);
            tasks.spawn(async move {
                let body = "x".repeat(4096);
                sink.ingest(&Page::html(&format!("https://a.test/{}", n), body))
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let mut urls: Vec<String> = content
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["url"].to_string())
            .collect();
        urls.sort();
        urls.dedup();
        assert_eq!(urls.len(), 20);
    }

    #[tokio::test]
    async fn test_csv_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pages.csv");

        for n in 0..2 {
            let sink = CsvSink::create(&path).unwrap();
            sink.ingest(&Page::html(&format!("https://a.test/{}", n), "abc"))
                .await
                .unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("url,final_url,status"));
        assert!(lines[2].starts_with("https://a.test/1,"));
        assert!(lines[2].ends_with(",3"));
    }
}
