//! Remote generator artifacts.
//!
//! A workflow may name an `s3://bucket/key` blob that must be present in the
//! generator's working directory before the command runs. Only the S3 scheme
//! is recognized.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact {0:?} is not an s3://bucket/key location")]
    Malformed(String),

    #[error("failed to download s3://{bucket}/{key}: {reason}")]
    Download {
        bucket: String,
        key: String,
        reason: String,
    },

    #[error("failed to write artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A parsed `s3://bucket/key` location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn parse(url: &str) -> Result<Self, ArtifactError> {
        let malformed = || ArtifactError::Malformed(url.to_string());
        let rest = url.strip_prefix("s3://").ok_or_else(malformed)?;
        let (bucket, key) = rest.split_once('/').ok_or_else(malformed)?;
        if bucket.is_empty() || key.is_empty() || bucket.contains(' ') || key.contains(' ') {
            return Err(malformed());
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Local file name for the downloaded object: the last key segment.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(self.key.as_str())
    }
}

/// Fetches a remote artifact into a local directory.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `location` into `dest_dir` and return the file path.
    async fn fetch(&self, location: &S3Location, dest_dir: &Path)
        -> Result<PathBuf, ArtifactError>;
}

/// Thin glue over the AWS SDK S3 client.
pub struct S3Fetcher {
    client: aws_sdk_s3::Client,
}

impl S3Fetcher {
    /// Build a client from the ambient AWS configuration (env, profile, or
    /// instance role).
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
        }
    }

    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArtifactFetcher for S3Fetcher {
    async fn fetch(
        &self,
        location: &S3Location,
        dest_dir: &Path,
    ) -> Result<PathBuf, ArtifactError> {
        let download_err = |reason: String| ArtifactError::Download {
            bucket: location.bucket.clone(),
            key: location.key.clone(),
            reason,
        };

        let object = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|err| download_err(err.to_string()))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|err| download_err(err.to_string()))?
            .into_bytes();

        let path = dest_dir.join(location.file_name());
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| ArtifactError::Io {
                path: path.display().to_string(),
                source,
            })?;
        info!(path = %path.display(), "downloaded generator artifact");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_and_key() {
        let location = S3Location::parse("s3://jobs/releases/v2/run.jar").unwrap();
        assert_eq!(location.bucket, "jobs");
        assert_eq!(location.key, "releases/v2/run.jar");
        assert_eq!(location.file_name(), "run.jar");
    }

    #[test]
    fn single_segment_key_is_its_own_file_name() {
        let location = S3Location::parse("s3://jobs/run.jar").unwrap();
        assert_eq!(location.key, "run.jar");
        assert_eq!(location.file_name(), "run.jar");
    }

    #[test]
    fn rejects_other_schemes_and_malformed_urls() {
        for url in [
            "https://jobs/run.jar",
            "s3://",
            "s3://bucket-only",
            "s3:///key",
            "s3://bucket/",
            "s3://bu cket/key",
            "local/path.jar",
        ] {
            assert!(
                matches!(S3Location::parse(url), Err(ArtifactError::Malformed(_))),
                "expected {url:?} to be rejected"
            );
        }
    }
}
