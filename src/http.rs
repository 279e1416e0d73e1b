// src/http.rs

//! HTTP client for package indices, reference packages and webhooks
//!
//! A wrapper around the blocking reqwest client with a fixed timeout and
//! retry on transport errors. HTTP error statuses are not retried.

use crate::error::{Error, Result};
use reqwest::blocking::Client;
use serde::Serialize;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (30 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum attempts for failed requests
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// HTTP client wrapper with retry support
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    max_retries: u32,
}

impl HttpClient {
    pub fn new() -> Result<Self> {
        Self::with_timeout(HTTP_TIMEOUT)
    }

    /// Client whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("autodeb/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            max_retries: MAX_RETRIES,
        })
    }

    fn send_with_retry(&self, url: &str) -> Result<reqwest::blocking::Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.get(url).send() {
                Ok(response) => {
                    if !response.status().is_success() {
                        return Err(Error::DownloadError(format!(
                            "HTTP {} from {}",
                            response.status(),
                            url
                        )));
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(Error::DownloadError(format!(
                            "Failed to fetch {url} after {attempt} attempts: {e}"
                        )));
                    }
                    warn!("Fetch attempt {} for {} failed: {}, retrying...", attempt, url, e);
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
                }
            }
        }
    }

    /// Fetch a URL into memory
    pub fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!("Fetching {}", url);
        let bytes = self
            .send_with_retry(url)?
            .bytes()
            .map_err(|e| Error::DownloadError(format!("Failed to read response from {url}: {e}")))?;
        Ok(bytes.to_vec())
    }

    /// Fetch a URL as UTF-8 text
    pub fn fetch_text(&self, url: &str) -> Result<String> {
        String::from_utf8(self.fetch(url)?)
            .map_err(|e| Error::ParseError(format!("Invalid UTF-8 in response from {url}: {e}")))
    }

    /// Download a file to `dest_path`, through a temporary file
    pub fn download_file(&self, url: &str, dest_path: &Path) -> Result<()> {
        info!("Downloading {} to {}", url, dest_path.display());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create directory {}: {e}", parent.display()))
            })?;
        }

        let mut response = self.send_with_retry(url)?;
        let temp_path = dest_path.with_extension("tmp");
        let mut file = File::create(&temp_path).map_err(|e| {
            Error::IoError(format!("Failed to create file {}: {e}", temp_path.display()))
        })?;
        io::copy(&mut response, &mut file)
            .map_err(|e| Error::DownloadError(format!("Failed to write downloaded data: {e}")))?;

        fs::rename(&temp_path, dest_path).map_err(|e| {
            Error::IoError(format!(
                "Failed to move {} to {}: {e}",
                temp_path.display(),
                dest_path.display()
            ))
        })?;
        Ok(())
    }

    /// POST a JSON body; no retry
    pub fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to post: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!(
                "HTTP {} from webhook",
                response.status()
            )));
        }
        Ok(())
    }
}
