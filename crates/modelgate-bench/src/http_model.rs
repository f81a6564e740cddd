//! HTTP model adapter.
//!
//! `POST http://{address}/v1/benchmark` with
//! `{"version_id", "sample_id", "input", "reference"}`; the adapter replies
//! with a [`ModelOutput`] JSON body.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use tracing::debug;

use crate::corpus::Sample;
use crate::model::{ModelOutput, ScorableModel};

#[derive(Debug, Clone)]
pub struct HttpModel {
    address: String,
    path: String,
    timeout: Duration,
}

impl HttpModel {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            path: "/v1/benchmark".to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post(&self, body: Vec<u8>) -> anyhow::Result<Bytes> {
        let uri = format!("http://{}{}", self.address, self.path);

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("connecting to model adapter at {}", self.address))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .context("model adapter handshake")?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", &self.address)
            .header("content-type", "application/json")
            .header("user-agent", "modelgate-bench/0.1")
            .body(Full::new(Bytes::from(body)))?;

        let resp = sender.send_request(req).await.context("model adapter request")?;
        let status = resp.status();
        let body = resp.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            bail!("model adapter returned {status} for {uri}");
        }
        Ok(body)
    }
}

#[async_trait]
impl ScorableModel for HttpModel {
    async fn invoke(&self, version_id: &str, sample: &Sample) -> anyhow::Result<ModelOutput> {
        let body = serde_json::to_vec(&serde_json::json!({
            "version_id": version_id,
            "sample_id": sample.id,
            "input": sample.input,
            "reference": sample.reference,
        }))?;

        let bytes = tokio::time::timeout(self.timeout, self.post(body))
            .await
            .with_context(|| format!("model adapter timed out after {:?}", self.timeout))??;
        let output: ModelOutput =
            serde_json::from_slice(&bytes).context("decoding model adapter response")?;
        debug!(version = %version_id, sample = %sample.id, "model invoked");
        Ok(output)
    }
}
