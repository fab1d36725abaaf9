//! Delivery transports.
//! `HttpTransport` POSTs packed chunks (`?index=&length=`) and GETs the bundle.
//! `MemoryTransport` keeps delivered chunks in-process and serves them back as
//! a bundle; it also injects failures and latency.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::codec::{self, UnpackedChunk};
use crate::config::HttpTransportConfig;
use crate::error::{BufferError, Result};
use crate::store::PackedChunk;

#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Deliver one packed chunk. Any error leaves the chunk queued.
    async fn submit(&self, chunk: &PackedChunk) -> Result<serde_json::Value>;

    /// Fetch every persisted chunk in bundle form.
    async fn fetch_bundle(&self) -> Result<Bytes>;
}

/// Error body returned by the remote store.
#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &HttpTransportConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
        })
    }

    async fn failure_message(resp: reqwest::Response) -> (u16, String) {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        (status.as_u16(), error_message(status, &body))
    }
}

/// Message from a `{"message": ...}` body, else the status line.
fn error_message(status: reqwest::StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| format!("server responded {status}"))
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn submit(&self, chunk: &PackedChunk) -> Result<serde_json::Value> {
        let delivery_error = |status: Option<u16>, message: String| BufferError::Delivery {
            chunk: chunk.index,
            status,
            message,
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .query(&[("index", chunk.index), ("length", chunk.chunk_length)])
            .header("Content-Type", "application/octet-stream")
            .body(chunk.body.clone())
            .send()
            .await
            .map_err(|e| delivery_error(None, e.to_string()))?;

        if !resp.status().is_success() {
            let (status, message) = Self::failure_message(resp).await;
            return Err(delivery_error(Some(status), message));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| delivery_error(None, format!("invalid response body: {e}")))
    }

    async fn fetch_bundle(&self) -> Result<Bytes> {
        let resp = self
            .http
            .get(&self.endpoint)
            .send()
            .await
            .map_err(|e| BufferError::Load(e.to_string()))?;
        if !resp.status().is_success() {
            let (_, message) = Self::failure_message(resp).await;
            return Err(BufferError::Load(message));
        }
        Ok(resp.bytes().await?)
    }
}

#[derive(Default)]
struct MemoryState {
    chunks: BTreeMap<usize, UnpackedChunk>,
    /// Chunk index of every submit call, in arrival order.
    requests: Vec<usize>,
    fail_remaining: usize,
}

/// In-process remote store.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every request by `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Reject the next `n` submissions with a 503.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().fail_remaining = n;
    }

    pub fn requests(&self) -> Vec<usize> {
        self.state.lock().requests.clone()
    }

    pub fn stored(&self, index: usize) -> Option<UnpackedChunk> {
        self.state.lock().chunks.get(&index).cloned()
    }

    pub fn stored_count(&self) -> usize {
        self.state.lock().chunks.len()
    }
}

#[async_trait]
impl ChunkTransport for MemoryTransport {
    async fn submit(&self, chunk: &PackedChunk) -> Result<serde_json::Value> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock();
        state.requests.push(chunk.index);
        if state.fail_remaining > 0 {
            state.fail_remaining -= 1;
            warn!(chunk = chunk.index, "memory transport: injected failure");
            return Err(BufferError::Delivery {
                chunk: chunk.index,
                status: Some(503),
                message: "injected failure".into(),
            });
        }
        let decoded = codec::unpack_chunk(&chunk.body).map_err(|e| BufferError::Delivery {
            chunk: chunk.index,
            status: Some(400),
            message: e.to_string(),
        })?;
        state.chunks.insert(chunk.index, decoded);
        debug!(chunk = chunk.index, bytes = chunk.body.len(), "memory transport: stored");
        Ok(serde_json::json!({ "index": chunk.index, "length": chunk.chunk_length }))
    }

    async fn fetch_bundle(&self) -> Result<Bytes> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let state = self.state.lock();
        let Some((&last, sample)) = state.chunks.iter().next_back() else {
            return codec::pack_bundle(&[]);
        };
        let (chunk_length, record_size) = (sample.chunk_length, sample.record_size);
        let bundle: Vec<UnpackedChunk> = (0..=last)
            .map(|i| {
                state
                    .chunks
                    .get(&i)
                    .cloned()
                    .unwrap_or_else(|| UnpackedChunk::empty(chunk_length, record_size))
            })
            .collect();
        codec::pack_bundle(&bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(index: usize) -> PackedChunk {
        let body = codec::pack_chunk(&[0.5, 1.0, 0.0, 0.0], &[1, 0], &[], 2, 2).unwrap();
        PackedChunk {
            index,
            chunk_length: 2,
            write_seq: 1,
            body,
        }
    }

    #[tokio::test]
    async fn memory_transport_serves_gapless_bundle() {
        let transport = MemoryTransport::new();
        transport.submit(&packed(2)).await.unwrap();
        let bundle = codec::unpack_chunk_bundle(&transport.fetch_bundle().await.unwrap()).unwrap();
        assert_eq!(bundle.len(), 3);
        assert_eq!(bundle[0], UnpackedChunk::empty(2, 2));
        assert_eq!(bundle[2].presence, vec![1, 0]);
    }

    #[tokio::test]
    async fn injected_failures_are_counted() {
        let transport = MemoryTransport::new();
        transport.fail_next(1);
        let err = transport.submit(&packed(0)).await.unwrap_err();
        assert!(matches!(err, BufferError::Delivery { status: Some(503), .. }));
        transport.submit(&packed(0)).await.unwrap();
        assert_eq!(transport.requests(), vec![0, 0]);
        assert_eq!(transport.stored_count(), 1);
    }

    #[test]
    fn error_message_prefers_body_message() {
        let status = reqwest::StatusCode::INTERNAL_SERVER_ERROR;
        assert_eq!(error_message(status, r#"{"message": "disk full"}"#), "disk full");
        assert_eq!(
            error_message(status, "<html>oops</html>"),
            "server responded 500 Internal Server Error"
        );
        assert_eq!(error_message(status, r#"{"error": 1}"#), "server responded 500 Internal Server Error");
    }

    #[test]
    fn http_transport_builds_from_config() {
        let config = HttpTransportConfig {
            endpoint: "http://127.0.0.1:9/chunks".into(),
            request_timeout: 2.0,
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(transport.endpoint, "http://127.0.0.1:9/chunks");
    }

    #[test]
    fn http_transport_rejects_invalid_timeout() {
        let config: HttpTransportConfig = serde_json::from_str(r#"{"requestTimeout": -1}"#).unwrap();
        assert!(matches!(HttpTransport::new(&config), Err(BufferError::InvalidConfig(_))));
    }

    /// One request as seen by the canned server.
    struct Captured {
        request_line: String,
        headers: String,
        body: Vec<u8>,
    }

    /// Answer a single request with `status` and `body`, then close.
    /// Returns a transport pointed at `/chunks` on that server.
    async fn serve_once(
        status: &'static str,
        body: &'static [u8],
    ) -> (HttpTransport, tokio::task::JoinHandle<Captured>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            let head_end = loop {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before sending headers");
                raw.extend_from_slice(&buf[..n]);
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos;
                }
            };
            let head = String::from_utf8(raw[..head_end].to_vec()).unwrap();
            let (request_line, headers) = head.split_once("\r\n").unwrap_or((head.as_str(), ""));
            let headers = headers.to_ascii_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map_or(0, |v| v.trim().parse::<usize>().unwrap());
            let mut request_body = raw[head_end + 4..].to_vec();
            while request_body.len() < content_length {
                let n = stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed mid-body");
                request_body.extend_from_slice(&buf[..n]);
            }

            let reply = format!(
                "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
            stream.write_all(body).await.unwrap();
            stream.shutdown().await.unwrap();

            Captured {
                request_line: request_line.to_string(),
                headers,
                body: request_body,
            }
        });

        let config = HttpTransportConfig {
            endpoint: format!("http://{addr}/chunks"),
            request_timeout: 5.0,
        };
        (HttpTransport::new(&config).unwrap(), server)
    }

    #[tokio::test]
    async fn submit_posts_query_and_packed_body() {
        let (transport, server) = serve_once("200 OK", br#"{"stored": true}"#).await;
        let chunk = packed(3);

        let reply = transport.submit(&chunk).await.unwrap();
        assert_eq!(reply, serde_json::json!({"stored": true}));

        let seen = server.await.unwrap();
        assert_eq!(seen.request_line, "POST /chunks?index=3&length=2 HTTP/1.1");
        assert!(seen.headers.contains("content-type: application/octet-stream"));
        assert_eq!(seen.body, chunk.body.to_vec());
        assert_eq!(codec::unpack_chunk(&seen.body).unwrap().presence, vec![1, 0]);
    }

    #[tokio::test]
    async fn error_status_uses_message_field() {
        let (transport, server) =
            serve_once("507 Insufficient Storage", br#"{"message": "disk full"}"#).await;
        let err = transport.submit(&packed(1)).await.unwrap_err();
        assert_eq!(
            err,
            BufferError::Delivery {
                chunk: 1,
                status: Some(507),
                message: "disk full".into(),
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn error_status_without_message_falls_back_to_status() {
        let (transport, server) = serve_once("500 Internal Server Error", b"oops").await;
        let err = transport.submit(&packed(0)).await.unwrap_err();
        assert_eq!(
            err,
            BufferError::Delivery {
                chunk: 0,
                status: Some(500),
                message: "server responded 500 Internal Server Error".into(),
            }
        );
        server.await.unwrap();
    }

    #[tokio::test]
    async fn success_with_non_json_body_is_a_delivery_failure() {
        let (transport, server) = serve_once("200 OK", b"not json").await;
        let err = transport.submit(&packed(2)).await.unwrap_err();
        match err {
            BufferError::Delivery { chunk, status, message } => {
                assert_eq!(chunk, 2);
                assert_eq!(status, None);
                assert!(message.starts_with("invalid response body"), "{message}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn fetch_bundle_gets_raw_bytes() {
        const BUNDLE: &[u8] = &[0, 0, 0, 0];
        let (transport, server) = serve_once("200 OK", BUNDLE).await;
        let bytes = transport.fetch_bundle().await.unwrap();
        assert_eq!(&bytes[..], BUNDLE);

        let seen = server.await.unwrap();
        assert_eq!(seen.request_line, "GET /chunks HTTP/1.1");
        assert!(seen.body.is_empty());
    }

    #[tokio::test]
    async fn fetch_bundle_error_is_a_load_failure() {
        let (transport, server) = serve_once("404 Not Found", br#"{"message": "no session"}"#).await;
        let err = transport.fetch_bundle().await.unwrap_err();
        assert_eq!(err, BufferError::Load("no session".into()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_delivery_failure() {
        let config = HttpTransportConfig {
            endpoint: "http://127.0.0.1:9/chunks".into(),
            request_timeout: 2.0,
        };
        let transport = HttpTransport::new(&config).unwrap();
        let err = transport.submit(&packed(3)).await.unwrap_err();
        assert!(matches!(err, BufferError::Delivery { chunk: 3, status: None, .. }));
    }

    #[tokio::test]
    async fn empty_store_returns_empty_bundle() {
        let transport = MemoryTransport::new();
        let bytes = transport.fetch_bundle().await.unwrap();
        assert!(codec::unpack_chunk_bundle(&bytes).unwrap().is_empty());
    }
}
