//! Plain HTTP fallback download.

use std::time::Duration;

use async_trait::async_trait;

use super::{FallbackSource, HttpBody};
use crate::error::SourceError;

pub struct HttpFallback {
    client: reqwest::Client,
}

impl HttpFallback {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dataferry/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Network {
                message: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FallbackSource for HttpFallback {
    async fn get_bytes(&self, url: &str) -> Result<HttpBody, SourceError> {
        let parsed = url::Url::parse(url).map_err(|e| SourceError::Network {
            message: format!("invalid fallback URL '{}': {}", url, e),
        })?;
        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| SourceError::Network {
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| SourceError::Network {
            message: e.to_string(),
        })?;
        Ok(HttpBody {
            status,
            bytes: bytes.to_vec(),
        })
    }
}
