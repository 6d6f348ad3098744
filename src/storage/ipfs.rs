/// IPFS storage tier via the Kubo HTTP API.
///
/// Uploads use CIDv1 with raw leaves, so a payload that fits in one block
/// gets the same CID the local tiers compute for it. IPFS does not
/// guarantee persistence on its own; uploads are pinned on add and can be
/// re-pinned explicitly.
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;

use super::{StorageBackend, TierKind};
use crate::error::{AnchorError, Result};
use crate::record::ContentLocator;

/// Configuration for the IPFS HTTP API.
#[derive(Debug, Clone)]
pub struct IpfsConfig {
    /// API endpoint (e.g., "http://localhost:5001" or "https://ipfs.infura.io:5001").
    pub api_url: String,
    /// Basic-auth credentials for hosted pinning services.
    pub credentials: Option<(String, String)>,
}

impl IpfsConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            credentials: None,
        }
    }
}

/// IPFS storage tier.
pub struct IpfsBackend {
    client: Client,
    config: IpfsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct IpfsAddResponse {
    hash: String,
}

impl IpfsBackend {
    pub fn new(config: IpfsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v0/{path}", self.config.api_url.trim_end_matches('/'))
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(self.endpoint(path));
        match &self.config.credentials {
            Some((user, pass)) => req.basic_auth(user, Some(pass)),
            None => req,
        }
    }

    async fn send(&self, req: reqwest::RequestBuilder, op: &str) -> Result<reqwest::Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| AnchorError::Storage(format!("IPFS {op} request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(AnchorError::Storage(format!(
                "IPFS {op} failed ({status}): {body}"
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl StorageBackend for IpfsBackend {
    fn name(&self) -> &str {
        "ipfs"
    }

    fn kind(&self) -> TierKind {
        TierKind::Network
    }

    async fn put(&self, data: &[u8]) -> Result<ContentLocator> {
        let part = multipart::Part::bytes(data.to_vec()).file_name("record.json");
        let form = multipart::Form::new().part("file", part);

        let req = self
            .post("add")
            .query(&[("pin", "true"), ("cid-version", "1"), ("raw-leaves", "true")])
            .multipart(form);
        let resp = self.send(req, "add").await?;

        let add_resp: IpfsAddResponse = resp
            .json()
            .await
            .map_err(|e| AnchorError::Storage(format!("IPFS add response parse error: {e}")))?;

        Ok(ContentLocator::new(add_resp.hash))
    }

    async fn get(&self, locator: &ContentLocator) -> Result<Vec<u8>> {
        let req = self.post("cat").query(&[("arg", locator.as_str())]);
        let resp = self.send(req, "cat").await?;

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AnchorError::Storage(format!("IPFS cat body error: {e}")))?;

        Ok(bytes.to_vec())
    }

    async fn pin(&self, locator: &ContentLocator) -> Result<()> {
        let req = self.post("pin/add").query(&[("arg", locator.as_str())]);
        self.send(req, "pin/add").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::body::Bytes;
    use axum::extract::{Query, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;

    use super::*;
    use crate::crypto::hash;

    type Blocks = Arc<Mutex<HashMap<String, Vec<u8>>>>;

    /// Minimal stand-in for the Kubo API: multipart add, cat, pin/add.
    async fn spawn_mock_node() -> (String, Blocks) {
        let blocks: Blocks = Arc::default();

        async fn add(State(blocks): State<Blocks>, body: Bytes) -> Json<serde_json::Value> {
            // Pull the file part out of the multipart body.
            let text = body.to_vec();
            let start = text.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
            let end = text[start..]
                .windows(4)
                .position(|w| w == b"\r\n--")
                .unwrap()
                + start;
            let data = text[start..end].to_vec();
            let cid = hash::content_locator(&data).to_string();
            blocks.lock().insert(cid.clone(), data);
            Json(serde_json::json!({"Name": "record.json", "Hash": cid, "Size": "1"}))
        }

        async fn cat(
            State(blocks): State<Blocks>,
            Query(q): Query<HashMap<String, String>>,
        ) -> Result<Vec<u8>, StatusCode> {
            blocks
                .lock()
                .get(&q["arg"])
                .cloned()
                .ok_or(StatusCode::INTERNAL_SERVER_ERROR)
        }

        async fn pin(
            State(blocks): State<Blocks>,
            Query(q): Query<HashMap<String, String>>,
        ) -> StatusCode {
            if blocks.lock().contains_key(&q["arg"]) {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }

        let app = Router::new()
            .route("/api/v0/add", post(add))
            .route("/api/v0/cat", post(cat))
            .route("/api/v0/pin/add", post(pin))
            .with_state(blocks.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}"), blocks)
    }

    #[tokio::test]
    async fn test_put_get_pin_against_node() {
        let (url, blocks) = spawn_mock_node().await;
        let backend = IpfsBackend::new(IpfsConfig::new(url));

        let payload = br#"{"amount":500,"type":"theft"}"#;
        let locator = backend.put(payload).await.unwrap();

        assert_eq!(locator, hash::content_locator(payload));
        assert_eq!(blocks.lock().len(), 1);
        assert_eq!(backend.get(&locator).await.unwrap(), payload.to_vec());
        backend.pin(&locator).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_content_is_storage_error() {
        let (url, _blocks) = spawn_mock_node().await;
        let backend = IpfsBackend::new(IpfsConfig::new(url));

        let missing = hash::content_locator(b"never uploaded");
        assert!(matches!(
            backend.get(&missing).await,
            Err(AnchorError::Storage(_))
        ));
        assert!(matches!(
            backend.pin(&missing).await,
            Err(AnchorError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let backend = IpfsBackend::new(IpfsConfig::new("http://127.0.0.1:9"));
        assert!(matches!(
            backend.put(b"data").await,
            Err(AnchorError::Storage(_))
        ));
    }
}
