//! Blob fetcher
//!
//! Streams a remote resource to a local sink in fixed-size chunks. Every
//! transfer is bounded in duration and in total bytes. The byte bound of a
//! transfer is the smaller of the policy ceiling and the budget the caller
//! still has left. `http`, `https` and `file` URLs are supported.

use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use ydm_common::config::ImportSettings;

use crate::utils::{retry_with_backoff, RetryPolicy};

const FILE_CHUNK_BYTES: usize = 64 * 1024;
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Download failure
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("transfer did not finish within {0:?}")]
    Timeout(Duration),

    #[error("server responded with status {0}")]
    BadStatus(u16),

    #[error("resource exceeds the {limit} byte limit")]
    SizeExceeded { limit: u64 },

    #[error("resource not found")]
    NotFound,

    #[error("unsupported URL: {0}")]
    InvalidUrl(String),

    #[error("writing download to scratch space failed: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Unreachable(_) => "unreachable",
            FetchError::Timeout(_) => "timeout",
            FetchError::BadStatus(_) => "bad_status",
            FetchError::SizeExceeded { .. } => "size_exceeded",
            FetchError::NotFound => "not_found",
            FetchError::InvalidUrl(_) => "invalid_url",
            FetchError::Io(_) => "io",
        }
    }

    /// Network trouble and server-side errors are worth another attempt;
    /// client errors and local failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Unreachable(_) | FetchError::Timeout(_) => true,
            FetchError::BadStatus(status) => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Bounds applied to every transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPolicy {
    /// Wall-clock budget for one attempt, connect through last byte
    pub timeout: Duration,
    /// Ceiling on all bytes fetched for one dataset
    pub max_bytes: u64,
    pub retry: RetryPolicy,
}

impl FetchPolicy {
    pub fn from_settings(settings: &ImportSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.fetch_timeout_secs),
            max_bytes: settings.max_dataset_bytes,
            retry: RetryPolicy::new(
                settings.fetch_max_attempts,
                Duration::from_millis(settings.fetch_initial_backoff_ms),
            ),
        }
    }
}

/// Result of a completed download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedBlob {
    pub bytes: u64,
    /// Length announced by the server, when it sent one
    pub content_length: Option<u64>,
    pub attempts: u32,
}

/// Download that failed after its final attempt
#[derive(Debug, Error)]
#[error("{source} (after {attempts} attempt(s))")]
pub struct FetchFailure {
    pub attempts: u32,
    #[source]
    pub source: FetchError,
}

enum Source {
    Http(reqwest::Response),
    File(tokio::fs::File),
}

/// An open transfer yielding chunks until exhausted
pub struct BlobStream {
    source: Source,
    content_length: Option<u64>,
    received: u64,
    max_bytes: u64,
    deadline: Instant,
    timeout: Duration,
}

impl BlobStream {
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Bytes handed out so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Next chunk, `None` at end of stream
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, FetchError> {
        let timeout = self.timeout;
        let chunk = match &mut self.source {
            Source::Http(response) => {
                let chunk = tokio::time::timeout_at(self.deadline, response.chunk())
                    .await
                    .map_err(|_| FetchError::Timeout(timeout))?
                    .map_err(|e| classify_reqwest_error(e, timeout))?;
                chunk.map(|bytes| bytes.to_vec())
            }
            Source::File(file) => {
                let mut buffer = vec![0u8; FILE_CHUNK_BYTES];
                let read = tokio::time::timeout_at(self.deadline, file.read(&mut buffer))
                    .await
                    .map_err(|_| FetchError::Timeout(timeout))??;
                if read == 0 {
                    None
                } else {
                    buffer.truncate(read);
                    Some(buffer)
                }
            }
        };

        if let Some(bytes) = &chunk {
            self.received += bytes.len() as u64;
            if self.received > self.max_bytes {
                return Err(FetchError::SizeExceeded {
                    limit: self.max_bytes,
                });
            }
        }
        Ok(chunk)
    }
}

fn classify_reqwest_error(err: reqwest::Error, timeout: Duration) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout)
    } else if let Some(status) = err.status() {
        FetchError::BadStatus(status.as_u16())
    } else {
        FetchError::Unreachable(err.without_url().to_string())
    }
}

/// Streams remote resources under a [`FetchPolicy`]
#[derive(Clone)]
pub struct BlobFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl BlobFetcher {
    pub fn new(policy: FetchPolicy) -> ydm_common::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(policy.timeout.min(MAX_CONNECT_TIMEOUT))
            .user_agent(concat!("ydm-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ydm_common::Error::Internal(format!("HTTP client setup failed: {}", e)))?;

        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Open a single transfer without retry, accepting at most `budget` bytes
    pub async fn open(&self, url: &str, budget: u64) -> Result<BlobStream, FetchError> {
        let max_bytes = budget.min(self.policy.max_bytes);
        let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let deadline = Instant::now() + self.policy.timeout;

        let scheme = parsed.scheme().to_ascii_lowercase();
        let (source, content_length) = match scheme.as_str() {
            "http" | "https" => {
                let response = tokio::time::timeout_at(deadline, self.client.get(parsed).send())
                    .await
                    .map_err(|_| FetchError::Timeout(self.policy.timeout))?
                    .map_err(|e| classify_reqwest_error(e, self.policy.timeout))?;

                let status = response.status();
                if !status.is_success() {
                    return Err(FetchError::BadStatus(status.as_u16()));
                }
                let length = response.content_length();
                (Source::Http(response), length)
            }
            "file" => {
                let path = parsed
                    .to_file_path()
                    .map_err(|_| FetchError::InvalidUrl("file URL has no local path".to_string()))?;
                let file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(FetchError::NotFound)
                    }
                    Err(e) => return Err(FetchError::Io(e)),
                };
                let length = file.metadata().await?.len();
                (Source::File(file), Some(length))
            }
            other => {
                return Err(FetchError::InvalidUrl(format!("scheme '{}' is not supported", other)))
            }
        };

        if let Some(length) = content_length {
            if length > max_bytes {
                return Err(FetchError::SizeExceeded { limit: max_bytes });
            }
        }

        Ok(BlobStream {
            source,
            content_length,
            received: 0,
            max_bytes,
            deadline,
            timeout: self.policy.timeout,
        })
    }

    /// Download `url` into `dest`, retrying retryable failures with backoff.
    ///
    /// `budget` is what remains of the dataset's byte ceiling; a resource
    /// larger than that fails with [`FetchError::SizeExceeded`].
    pub async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        budget: u64,
    ) -> Result<FetchedBlob, FetchFailure> {
        let mut attempts = 0u32;
        let result = retry_with_backoff("blob_fetch", self.policy.retry, FetchError::is_retryable, || {
            attempts += 1;
            self.fetch_once(url, dest, budget)
        })
        .await;

        match result {
            Ok((bytes, content_length)) => Ok(FetchedBlob {
                bytes,
                content_length,
                attempts,
            }),
            Err(exhausted) => {
                // Don't leave a partial download behind
                let _ = tokio::fs::remove_file(dest).await;
                Err(FetchFailure {
                    attempts: exhausted.attempts,
                    source: exhausted.last_error,
                })
            }
        }
    }

    async fn fetch_once(
        &self,
        url: &str,
        dest: &Path,
        budget: u64,
    ) -> Result<(u64, Option<u64>), FetchError> {
        let mut stream = self.open(url, budget).await?;
        let mut file = tokio::fs::File::create(dest).await?;

        while let Some(chunk) = stream.next_chunk().await? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        let received = stream.received();
        if let Some(expected) = stream.content_length() {
            if received != expected {
                return Err(FetchError::Unreachable(format!(
                    "connection closed after {} of {} bytes",
                    received, expected
                )));
            }
        }

        tracing::debug!(bytes = received, "Download finished");
        Ok((received, stream.content_length()))
    }
}
