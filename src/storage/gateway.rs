/// Public IPFS HTTP gateway tier (read-only).
///
/// Used as a read fallback when the API node is unreachable. Gateways do
/// not accept uploads or pins, so this tier is skipped for writes.
use async_trait::async_trait;
use reqwest::Client;

use super::{StorageBackend, TierKind};
use crate::error::{AnchorError, Result};
use crate::record::ContentLocator;

/// Public gateway tier.
pub struct GatewayBackend {
    client: Client,
    base_url: String,
}

impl GatewayBackend {
    /// `base_url` is the gateway root, e.g. "https://ipfs.io".
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Human-facing link to the content.
    pub fn url_for(&self, locator: &ContentLocator) -> String {
        gateway_url(&self.base_url, locator)
    }
}

/// Link to `locator` under an arbitrary gateway root.
pub fn gateway_url(base_url: &str, locator: &ContentLocator) -> String {
    format!("{}/ipfs/{locator}", base_url.trim_end_matches('/'))
}

#[async_trait]
impl StorageBackend for GatewayBackend {
    fn name(&self) -> &str {
        "gateway"
    }

    fn kind(&self) -> TierKind {
        TierKind::Gateway
    }

    fn writable(&self) -> bool {
        false
    }

    async fn put(&self, _data: &[u8]) -> Result<ContentLocator> {
        Err(AnchorError::Storage("gateway tier is read-only".into()))
    }

    async fn get(&self, locator: &ContentLocator) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(self.url_for(locator))
            .send()
            .await
            .map_err(|e| AnchorError::Storage(format!("gateway request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AnchorError::Storage(format!(
                "gateway fetch failed: {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AnchorError::Storage(format!("gateway body error: {e}")))?;

        Ok(bytes.to_vec())
    }

    async fn pin(&self, _locator: &ContentLocator) -> Result<()> {
        Err(AnchorError::Storage("gateway tier cannot pin".into()))
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    use super::*;

    async fn spawn_gateway() -> String {
        async fn serve_block(Path(cid): Path<String>) -> Result<&'static str, StatusCode> {
            if cid == "bafkreiexample" {
                Ok("{\"type\":\"theft\"}")
            } else {
                Err(StatusCode::NOT_FOUND)
            }
        }

        let app = Router::new().route("/ipfs/{cid}", get(serve_block));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[test]
    fn test_gateway_url() {
        let locator = ContentLocator::new("bafkreiabc");
        assert_eq!(
            gateway_url("https://ipfs.io/", &locator),
            "https://ipfs.io/ipfs/bafkreiabc"
        );
    }

    #[tokio::test]
    async fn test_get_and_not_found() {
        let gateway = GatewayBackend::new(spawn_gateway().await);

        let data = gateway
            .get(&ContentLocator::new("bafkreiexample"))
            .await
            .unwrap();
        assert_eq!(data, b"{\"type\":\"theft\"}".to_vec());

        assert!(gateway
            .get(&ContentLocator::new("bafkreimissing"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_read_only() {
        let gateway = GatewayBackend::new("http://127.0.0.1:9");
        assert!(!gateway.writable());
        assert!(gateway.put(b"x").await.is_err());
        assert!(gateway.pin(&ContentLocator::new("x")).await.is_err());
    }
}
