//! Firmware download strategies for the manager.
//!
//! `HttpDownloader` is the default: one GET, read to the end, verify.
//! `ChunkedDownloader` fetches with Range requests and exists as a
//! secondary strategy; its per-chunk timeouts help on links that stall
//! mid-transfer.

use crate::client::{compute_digest, verify_digest};
use crate::types::UpdateInfo;
use async_trait::async_trait;
use edgelink_core::error::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Progress callback: `(downloaded, total, percentage)`.
pub type ProgressCallback = Arc<dyn Fn(u64, u64, f64) + Send + Sync>;

/// Downloads and verifies firmware images.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        info: &UpdateInfo,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<u8>>;

    fn verify(&self, data: &[u8], info: &UpdateInfo) -> Result<()> {
        verify_digest(info.digest_method, &info.digest, data)
    }
}

/// Single-request HTTP downloader.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30 * 60))
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        info: &UpdateInfo,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(&info.url)
            .send()
            .await
            .map_err(|e| Error::ota(format!("failed to download: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::ota(format!(
                "unexpected status code: {}",
                response.status().as_u16()
            )));
        }

        let total = response.content_length().unwrap_or(info.size).max(1);
        let mut data = Vec::with_capacity(total as usize);
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::ota(format!("failed to read response: {e}")))?;
            data.extend_from_slice(&chunk);
            if let Some(progress) = &progress {
                let downloaded = data.len() as u64;
                progress(downloaded, total, downloaded as f64 * 100.0 / total as f64);
            }
        }

        if data.len() as u64 != info.size {
            return Err(Error::ota(format!(
                "size mismatch: got {} bytes, expected {} bytes",
                data.len(),
                info.size
            )));
        }
        Ok(data)
    }
}

/// Range-request downloader, the secondary strategy.
pub struct ChunkedDownloader {
    client: reqwest::Client,
    chunk_size: u64,
}

impl ChunkedDownloader {
    pub fn new(chunk_size: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            chunk_size: chunk_size.max(1),
        })
    }

    async fn download_chunk(&self, url: &str, start: u64, end: u64) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header("Range", format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|e| Error::ota(format!("failed to download chunk: {e}")))?;

        let status = response.status().as_u16();
        if status != 206 && status != 200 {
            return Err(Error::ota(format!("unexpected status code: {status}")));
        }
        Ok(response
            .bytes()
            .await
            .map_err(|e| Error::ota(format!("failed to read chunk: {e}")))?
            .to_vec())
    }
}

#[async_trait]
impl Downloader for ChunkedDownloader {
    async fn download(
        &self,
        info: &UpdateInfo,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<u8>> {
        let total = info.size;
        let mut data: Vec<u8> = Vec::with_capacity(total as usize);

        while (data.len() as u64) < total {
            let start = data.len() as u64;
            let end = (start + self.chunk_size - 1).min(total - 1);
            let chunk = self
                .download_chunk(&info.url, start, end)
                .await
                .map_err(|e| Error::ota(format!("chunk {start}-{end}: {e}")))?;
            if chunk.is_empty() {
                return Err(Error::ota(format!(
                    "download incomplete: got {} bytes, expected {} bytes",
                    data.len(),
                    total
                )));
            }
            data.extend_from_slice(&chunk);
            if let Some(progress) = &progress {
                let downloaded = data.len() as u64;
                progress(downloaded, total, downloaded as f64 * 100.0 / total as f64);
            }
        }
        Ok(data)
    }
}

/// Digest helper shared by implementations and tests.
pub fn digest_of(info: &UpdateInfo, data: &[u8]) -> String {
    compute_digest(info.digest_method, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DigestMethod;

    fn info_for(data: &[u8]) -> UpdateInfo {
        UpdateInfo {
            version: "1.0.1".to_string(),
            url: "https://firmware.example/fw.bin".to_string(),
            size: data.len() as u64,
            digest: compute_digest(DigestMethod::Md5, data),
            digest_method: DigestMethod::Md5,
            description: None,
        }
    }

    #[test]
    fn test_verify_accepts_matching_digest() {
        let downloader = HttpDownloader::new().unwrap();
        let data = b"firmware image";
        assert!(downloader.verify(data, &info_for(data)).is_ok());
    }

    #[test]
    fn test_verify_rejects_tampered_bytes() {
        let downloader = HttpDownloader::new().unwrap();
        let info = info_for(b"firmware image");
        assert!(downloader.verify(b"tampered image!", &info).is_err());
    }
}
