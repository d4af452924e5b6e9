//! Descriptor extraction delegated to an HTTP sidecar hosting the face model.
//!
//! Protocol: `POST <url>` with the raw image as the body. `200` carries
//! `{"embedding": [f32, ...] | null}`; `422` means the image could not be
//! decoded. Anything else is treated as the backend being unavailable.

use reqwest::StatusCode;
use rollcall_core::{Descriptor, DescriptorExtractor, Embedding, ExtractError};
use serde::Deserialize;
use std::time::Duration;
use tokio::runtime::Handle;

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Option<Vec<f32>>,
}

pub struct RemoteExtractor {
    client: reqwest::Client,
    url: String,
    runtime: Handle,
}

impl RemoteExtractor {
    pub fn new(url: &str, timeout: Duration, runtime: Handle) -> Result<Self, ExtractError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            runtime,
        })
    }

    async fn request(&self, image: Vec<u8>) -> Result<Descriptor, ExtractError> {
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image)
            .send()
            .await
            .map_err(|e| ExtractError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::UNPROCESSABLE_ENTITY => return Ok(Descriptor::NoFace),
            status => {
                return Err(ExtractError::Unavailable(format!(
                    "descriptor service returned {status}"
                )))
            }
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::Malformed(e.to_string()))?;
        Ok(parse_embedding(body.embedding))
    }
}

fn parse_embedding(values: Option<Vec<f32>>) -> Descriptor {
    match values {
        Some(values) if !values.is_empty() => Descriptor::Face(Embedding::new(values)),
        _ => Descriptor::NoFace,
    }
}

impl DescriptorExtractor for RemoteExtractor {
    fn extract(&mut self, image: &[u8]) -> Result<Descriptor, ExtractError> {
        self.runtime.block_on(self.request(image.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing() {
        let face: EmbedResponse = serde_json::from_str(r#"{"embedding":[0.5,-0.5]}"#).unwrap();
        assert_eq!(
            parse_embedding(face.embedding),
            Descriptor::Face(Embedding::new(vec![0.5, -0.5]))
        );

        let none: EmbedResponse = serde_json::from_str(r#"{"embedding":null}"#).unwrap();
        assert_eq!(parse_embedding(none.embedding), Descriptor::NoFace);

        assert_eq!(parse_embedding(Some(vec![])), Descriptor::NoFace);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_unreachable_backend_is_retryable() {
        let runtime = Handle::current();
        let err = tokio::task::spawn_blocking(move || {
            // Port 9 (discard) on localhost is not expected to serve HTTP.
            let mut ex =
                RemoteExtractor::new("http://127.0.0.1:9/embed", Duration::from_secs(2), runtime)
                    .unwrap();
            ex.extract(b"frame")
        })
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.is_retryable());
    }
}
