use std::io::{BufWriter, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::checksum;
use crate::domain::{Checksum, FetchOutcome};
use crate::error::AtbError;
use crate::store::{publish, stage_file};

pub trait ArchiveSource: Send + Sync {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, AtbError>;
}

#[derive(Clone)]
pub struct HttpArchiveSource {
    client: Client,
}

impl HttpArchiveSource {
    pub fn new(timeout: Duration) -> Result<Self, AtbError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("kira-atb/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| AtbError::Network(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| AtbError::Network(err.to_string()))?;
        Ok(Self { client })
    }
}

impl ArchiveSource for HttpArchiveSource {
    fn download(&self, url: &str, sink: &mut dyn Write) -> Result<u64, AtbError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|err| AtbError::Network(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "archive request failed".to_string());
            return Err(AtbError::Status { status, message });
        }
        std::io::copy(&mut response, sink).map_err(|err| AtbError::Network(err.to_string()))
    }
}

pub fn retry_delay(retry_count: u32, base: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(retry_count);
    base.saturating_mul(multiplier)
}

pub fn backoff_schedule(max_attempts: u32, base: Duration) -> Vec<Duration> {
    (0..max_attempts.saturating_sub(1))
        .map(|retry| retry_delay(retry, base))
        .collect()
}

#[derive(Clone)]
pub struct ArchiveFetcher<S: ArchiveSource> {
    source: S,
    base_delay: Duration,
}

impl<S: ArchiveSource> ArchiveFetcher<S> {
    pub fn new(source: S, base_delay: Duration) -> Self {
        Self { source, base_delay }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Makes `dest` hold the archive behind `url`.
    ///
    /// Returns `AlreadyValid` without touching the network when `dest` already
    /// matches `expected`. Otherwise makes up to `max_attempts` downloads; every
    /// failure ends up in the returned outcome rather than as an error.
    pub fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected: Option<&Checksum>,
        max_attempts: u32,
        sink: &dyn ProgressSink,
    ) -> FetchOutcome {
        if checksum::verify(dest, expected) {
            debug!(dest = %dest.display(), "archive already valid");
            return FetchOutcome::AlreadyValid;
        }

        let max_attempts = max_attempts.max(1);
        let mut delays = backoff_schedule(max_attempts, self.base_delay).into_iter();
        let mut attempts = 0;
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            attempts = attempt;
            match self.attempt(url, dest, expected) {
                Ok(bytes) => {
                    debug!(dest = %dest.display(), attempt, bytes, "archive downloaded");
                    return FetchOutcome::Downloaded { attempts, bytes };
                }
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(url, attempt, max_attempts, error = %err, "archive download failed");
                    last_error = Some(err);
                    if !retryable {
                        break;
                    }
                    let Some(delay) = delays.next() else {
                        break;
                    };
                    let archive = dest
                        .file_name()
                        .map(|name| name.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    sink.event(ProgressEvent {
                        message: format!(
                            "fetch.retry archive={archive} attempt={} delay_ms={}",
                            attempt + 1,
                            delay.as_millis()
                        ),
                        elapsed: None,
                    });
                    thread::sleep(delay);
                }
            }
        }

        FetchOutcome::Failed {
            reason: last_error
                .map(|err| err.to_string())
                .unwrap_or_else(|| "no attempt made".to_string()),
            attempts,
        }
    }

    fn attempt(&self, url: &str, dest: &Path, expected: Option<&Checksum>) -> Result<u64, AtbError> {
        let mut staged = stage_file(dest, ".part")?;
        let bytes = {
            let mut writer = BufWriter::new(staged.as_file_mut());
            let bytes = self.source.download(url, &mut writer)?;
            writer
                .flush()
                .map_err(|err| AtbError::Network(err.to_string()))?;
            bytes
        };

        if let Some(expected) = expected {
            let actual = checksum::file_digest(staged.path(), expected.algorithm())
                .map_err(|err| AtbError::Filesystem(err.to_string()))?;
            if !expected.matches(&actual) {
                return Err(AtbError::ChecksumMismatch {
                    expected: expected.hex().to_string(),
                    actual,
                });
            }
        }

        publish(staged, dest)?;
        Ok(bytes)
    }
}
