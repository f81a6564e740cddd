//! Version feeds — where upstream releases are discovered.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use serde::{Deserialize, Serialize};

use modelgate_core::FeedConfig;

use crate::error::FeedError;

const MAX_VERSION_ID_LEN: usize = 128;

/// One release as reported by a feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub version_id: String,
    #[serde(default)]
    pub changelog: String,
    /// Upstream release time, unix seconds.
    #[serde(default)]
    pub available_at: Option<u64>,
    /// Upstream no longer serves this release.
    #[serde(default)]
    pub withdrawn: bool,
}

impl FeedEntry {
    pub fn new(version_id: &str) -> Self {
        Self {
            version_id: version_id.to_string(),
            changelog: String::new(),
            available_at: None,
            withdrawn: false,
        }
    }

    /// Reject ids that cannot be stored or routed safely.
    pub fn validate(&self, slot_id: &str) -> Result<(), FeedError> {
        let id = &self.version_id;
        let reason = if id.is_empty() {
            Some("empty version id")
        } else if id.len() > MAX_VERSION_ID_LEN {
            Some("version id too long")
        } else if id.contains(':') {
            Some("version id contains ':'")
        } else if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
            Some("version id contains whitespace")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(FeedError::CandidateInvalid {
                slot: slot_id.to_string(),
                version: id.clone(),
                reason: reason.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Pull interface to an upstream release feed.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Every release currently listed for `slot_id`.
    async fn fetch(&self, slot_id: &str) -> anyhow::Result<Vec<FeedEntry>>;

    /// Whether `version_id` can still be served. Rollback refuses to
    /// restore a version for which this returns `false`.
    async fn is_servable(&self, slot_id: &str, version_id: &str) -> anyhow::Result<bool> {
        let entries = self.fetch(slot_id).await?;
        Ok(!entries
            .iter()
            .any(|e| e.version_id == version_id && e.withdrawn))
    }
}

/// Build the configured feed.
pub fn from_config(config: &FeedConfig) -> Arc<dyn VersionSource> {
    match config {
        FeedConfig::File { path } => Arc::new(FileFeed::new(path.clone())),
        FeedConfig::Http {
            address,
            path,
            timeout_ms,
        } => Arc::new(
            HttpFeed::new(address, path).with_timeout(Duration::from_millis(*timeout_ms)),
        ),
    }
}

/// JSON document `{ "<slot_id>": [FeedEntry, ...] }`, re-read on every fetch.
#[derive(Debug, Clone)]
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl VersionSource for FileFeed {
    async fn fetch(&self, slot_id: &str) -> anyhow::Result<Vec<FeedEntry>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading version feed {}", self.path.display()))?;
        let mut doc: HashMap<String, Vec<FeedEntry>> = serde_json::from_str(&content)
            .with_context(|| format!("parsing version feed {}", self.path.display()))?;
        Ok(doc.remove(slot_id).unwrap_or_default())
    }
}

/// `GET http://{address}{path}/{slot_id}` returning a JSON list of entries.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    address: String,
    path: String,
    timeout: Duration,
}

impl HttpFeed {
    pub fn new(address: &str, path: &str) -> Self {
        Self {
            address: address.to_string(),
            path: path.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn get(&self, uri: &str) -> anyhow::Result<Bytes> {
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connecting to version feed at {}", self.address))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("version feed handshake")?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(uri)
            .header("host", &self.address)
            .header("accept", "application/json")
            .header("user-agent", "modelgate-monitor/0.1")
            .body(Empty::<Bytes>::new())?;

        let resp = sender.send_request(req).await.context("version feed request")?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            bail!("version feed returned {status} for {uri}");
        }
        Ok(body)
    }
}

#[async_trait]
impl VersionSource for HttpFeed {
    async fn fetch(&self, slot_id: &str) -> anyhow::Result<Vec<FeedEntry>> {
        let uri = format!("http://{}{}/{}", self.address, self.path, slot_id);
        let body = tokio::time::timeout(self.timeout, self.get(&uri))
            .await
            .with_context(|| format!("version feed timed out after {:?}", self.timeout))??;
        serde_json::from_slice(&body).context("decoding version feed response")
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn validation_rules() {
        assert!(FeedEntry::new("2026.03.1").validate("img").is_ok());
        for bad in ["", "a:b", "has space", "tab\tid"] {
            let err = FeedEntry::new(bad).validate("img").unwrap_err();
            assert!(matches!(err, FeedError::CandidateInvalid { .. }), "{bad:?}");
        }
        assert!(FeedEntry::new(&"x".repeat(200)).validate("img").is_err());
    }

    #[tokio::test]
    async fn file_feed_reads_slot_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.json");
        std::fs::write(
            &path,
            r#"{"img":[{"version_id":"v1","changelog":"first","available_at":10},
                       {"version_id":"v0","withdrawn":true}],
               "mesh":[]}"#,
        )
        .unwrap();
        let feed = FileFeed::new(path);

        let entries = feed.fetch("img").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].changelog, "first");
        assert!(feed.fetch("unknown").await.unwrap().is_empty());

        assert!(feed.is_servable("img", "v1").await.unwrap());
        assert!(!feed.is_servable("img", "v0").await.unwrap());
        // Releases that fell off the listing are still servable.
        assert!(feed.is_servable("img", "ancient").await.unwrap());
    }

    #[tokio::test]
    async fn file_feed_missing_file_is_an_error() {
        let feed = FileFeed::new(PathBuf::from("/nonexistent/feed.json"));
        assert!(feed.fetch("img").await.is_err());
    }

    #[tokio::test]
    async fn http_feed_fetches_slot_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = sock.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            let body = r#"[{"version_id":"v7","changelog":"faster"}]"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            sock.write_all(resp.as_bytes()).await.unwrap();
            request
        });

        let entries = HttpFeed::new(&addr, "/versions/").fetch("img").await.unwrap();
        assert_eq!(entries, vec![FeedEntry {
            version_id: "v7".into(),
            changelog: "faster".into(),
            available_at: None,
            withdrawn: false,
        }]);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET "));
        assert!(request.contains("/versions/img"));
    }
}
