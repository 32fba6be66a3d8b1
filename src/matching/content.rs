use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::error::ContentError;

/// Resolved off-ledger blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Resolves a content reference to bytes
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch(&self, reference: &str) -> Result<Content, ContentError>;
}

/// Content store backed by an IPFS HTTP gateway
pub struct IpfsGateway {
    client: Client,
    gateway: String,
    max_bytes: usize,
}

impl IpfsGateway {
    pub fn new(gateway: &str, max_bytes: usize, timeout: Duration) -> Result<Self, ContentError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ContentError::Fetch {
                reference: gateway.to_string(),
                message: format!("client setup failed: {}", e),
            })?;

        Ok(Self {
            client,
            gateway: gateway.trim_end_matches('/').to_string(),
            max_bytes,
        })
    }

    fn url_for(&self, reference: &str) -> String {
        let cid = reference
            .trim()
            .trim_start_matches("ipfs://")
            .trim_start_matches("/ipfs/");
        format!("{}/ipfs/{}", self.gateway, cid)
    }
}

#[async_trait]
impl ContentStore for IpfsGateway {
    async fn fetch(&self, reference: &str) -> Result<Content, ContentError> {
        let url = self.url_for(reference);
        let fetch_error = |message: String| ContentError::Fetch {
            reference: reference.to_string(),
            message,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if !response.status().is_success() {
            return Err(fetch_error(format!("gateway returned HTTP {}", response.status())));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_bytes {
                return Err(ContentError::TooLarge {
                    reference: reference.to_string(),
                    limit: self.max_bytes,
                });
            }
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .filter(|v| v.starts_with("image/"))
            .unwrap_or_else(|| "image/jpeg".to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        if bytes.len() > self.max_bytes {
            return Err(ContentError::TooLarge {
                reference: reference.to_string(),
                limit: self.max_bytes,
            });
        }

        debug!("Fetched {} ({} bytes, {})", reference, bytes.len(), mime_type);

        Ok(Content {
            mime_type,
            bytes: bytes.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, routing::get, Router};

    async fn spawn_gateway() -> String {
        let app = Router::new()
            .route(
                "/ipfs/small",
                get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![1u8, 2, 3]) }),
            )
            .route("/ipfs/large", get(|| async { vec![0u8; 64] }));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_url_for_strips_scheme() {
        let gateway = IpfsGateway::new("https://ipfs.io/", 1024, Duration::from_secs(1)).unwrap();
        assert_eq!(gateway.url_for("ipfs://bafyabc"), "https://ipfs.io/ipfs/bafyabc");
        assert_eq!(gateway.url_for("bafyabc"), "https://ipfs.io/ipfs/bafyabc");
    }

    #[tokio::test]
    async fn test_fetch_respects_size_cap() {
        let base = spawn_gateway().await;
        let gateway = IpfsGateway::new(&base, 16, Duration::from_secs(5)).unwrap();

        let content = gateway.fetch("ipfs://small").await.unwrap();
        assert_eq!(content.mime_type, "image/png");
        assert_eq!(content.bytes, vec![1, 2, 3]);

        assert!(matches!(
            gateway.fetch("large").await,
            Err(ContentError::TooLarge { .. })
        ));
        assert!(matches!(
            gateway.fetch("missing").await,
            Err(ContentError::Fetch { .. })
        ));
    }
}
