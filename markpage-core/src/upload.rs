//! Hand-off of finished documents to durable storage.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[async_trait]
pub trait Uploader: Send + Sync {
    /// Stores `bytes` under `name` and returns a stable reference to it.
    async fn upload(&self, name: &str, bytes: Vec<u8>) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Uploads with linear back-off. The last error is returned when every
/// attempt fails.
pub async fn upload_with_retry<U: Uploader + ?Sized>(
    uploader: &U,
    name: &str,
    bytes: Vec<u8>,
    policy: RetryPolicy,
) -> Result<String> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match uploader.upload(name, bytes.clone()).await {
            Ok(reference) => {
                info!(name, attempt, %reference, "upload finished");
                return Ok(reference);
            }
            Err(err) => {
                warn!(name, attempt, attempts, error = %err, "upload attempt failed");
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff * attempt).await;
                }
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| anyhow!("upload of {name} was never attempted"))
        .context(format!("giving up on {name} after {attempts} attempts")))
}

/// Caller-supplied bookkeeping (student, subject, …). Only used to name the
/// saved output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionMeta {
    fields: BTreeMap<String, String>,
}

impl SubmissionMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// `key-value` pairs joined with `_`, sanitised for use in file names.
    /// Falls back to `fallback` when no metadata was supplied.
    pub fn stem(&self, fallback: &str) -> String {
        if self.fields.is_empty() {
            return sanitize(fallback);
        }
        self.fields
            .iter()
            .map(|(key, value)| format!("{}-{}", sanitize(key), sanitize(value)))
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn document_name(&self, fallback: &str) -> String {
        format!("{}_annotated.pdf", self.stem(fallback))
    }

    pub fn marks_name(&self, fallback: &str) -> String {
        format!("{}_marks.json", self.stem(fallback))
    }
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyUploader {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyUploader {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Uploader for FlakyUploader {
        async fn upload(&self, name: &str, _bytes: Vec<u8>) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow!("storage unavailable"));
            }
            Ok(format!("store://{name}"))
        }
    }

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let uploader = FlakyUploader::new(2);
        let reference = upload_with_retry(&uploader, "a.pdf", vec![1], quick(3))
            .await
            .unwrap();
        assert_eq!(reference, "store://a.pdf");
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_the_last_error_after_exhausting_attempts() {
        let uploader = FlakyUploader::new(5);
        let err = upload_with_retry(&uploader, "a.pdf", vec![1], quick(2))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("storage unavailable"));
        assert_eq!(uploader.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn names_are_derived_from_metadata() {
        let mut meta = SubmissionMeta::new();
        meta.insert("subject", "Maths 101");
        meta.insert("student", "s/42");
        assert_eq!(meta.get("student"), Some("s/42"));
        assert_eq!(
            meta.document_name("answers"),
            "student-s-42_subject-Maths-101_annotated.pdf"
        );
        assert_eq!(SubmissionMeta::new().marks_name("answers.pdf"), "answers.pdf_marks.json");
    }
}
