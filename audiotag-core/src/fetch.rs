//! Downloading source audio.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AudiotagError, Result};

/// Async HTTP(S) downloader with its own deadline, independent of the
/// request deadline, and a cap on the body size.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl Fetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("audiotag/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AudiotagError::Other(anyhow::anyhow!("http client init: {e}")))?;
        Ok(Self {
            client,
            max_bytes: max_bytes.max(1),
        })
    }

    /// Fetch the body at `url`.
    ///
    /// A declared `Content-Length` over the cap is refused before any body
    /// is read; otherwise the body is read chunk by chunk and abandoned as
    /// soon as the running total passes the cap.
    ///
    /// # Errors
    /// `Download` on transport failure, timeout, a non-success status or an
    /// oversized body.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, "download failed");
                AudiotagError::Download(e.to_string())
            })?;
        let declared = response.content_length();
        if let Some(len) = declared.filter(|&len| len > self.max_bytes) {
            warn!(declared = len, limit = self.max_bytes, "download refused: body too large");
            return Err(self.too_large());
        }

        let mut body = Vec::with_capacity(declared.unwrap_or(0) as usize);
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| AudiotagError::Download(e.to_string()))?
        {
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                warn!(limit = self.max_bytes, "download aborted: body too large");
                return Err(self.too_large());
            }
            body.extend_from_slice(&chunk);
        }
        debug!(bytes = body.len(), "downloaded source audio");
        Ok(body)
    }

    fn too_large(&self) -> AudiotagError {
        AudiotagError::Download(format!("body exceeds {} bytes", self.max_bytes))
    }
}

/// Trimmed URL, or `InvalidRequest` when empty. A malformed or non-HTTP URL
/// is a `Download` error, the same as a fetch that fails.
pub fn validate_url(url: &str) -> Result<String> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AudiotagError::InvalidRequest("No file URL provided.".into()));
    }
    let parsed =
        reqwest::Url::parse(url).map_err(|e| AudiotagError::Download(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(AudiotagError::Download(format!(
            "unsupported URL scheme {other:?}"
        ))),
    }
}
