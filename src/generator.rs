//! Payload generation for dispatch.
//!
//! Each workflow carries a *generator*: a JSON-encoded argv whose stdout is a
//! JSON array of strings, one Orchard-create payload per element. Generators
//! either run in the baseline working directory or, when the workflow names a
//! remote artifact, in a fresh temporary directory holding the downloaded
//! blob.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::artifact::{ArtifactError, ArtifactFetcher, S3Location};

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("invalid generator command {command:?}: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("artifact {0:?} is not supported, only s3://bucket/key is recognized")]
    UnsupportedArtifact(String),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("failed to create scratch directory: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to run generator {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("generator exited with {status}: {output}")]
    Failed { status: String, output: String },

    #[error("generator stdout is not a JSON array of strings: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Produces the Orchard payloads for one tick of a workflow.
#[async_trait]
pub trait PayloadGenerator: Send + Sync {
    async fn generate(&self, artifact: &str, command: &str)
        -> Result<Vec<String>, GeneratorError>;
}

/// Runs the generator as a subprocess and parses its stdout.
pub struct StdoutGenerator {
    base_dir: PathBuf,
    fetcher: Arc<dyn ArtifactFetcher>,
}

impl StdoutGenerator {
    /// `base_dir` is the working directory for workflows without an artifact.
    pub fn new(base_dir: impl Into<PathBuf>, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        Self {
            base_dir: base_dir.into(),
            fetcher,
        }
    }

    async fn run_command(&self, command: &str, dir: &Path) -> Result<Vec<String>, GeneratorError> {
        let invalid = |reason: &str| GeneratorError::InvalidCommand {
            command: command.to_string(),
            reason: reason.to_string(),
        };
        let argv: Vec<String> = serde_json::from_str(command)
            .map_err(|err| invalid(&format!("not a JSON array of strings: {err}")))?;
        let (program, args) = argv.split_first().ok_or_else(|| invalid("empty argv"))?;

        debug!(program, dir = %dir.display(), "running payload generator");
        let output = tokio::process::Command::new(program)
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|source| GeneratorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GeneratorError::Failed {
                status: output.status.to_string(),
                output: format!("{stdout}\n{stderr}"),
            });
        }

        serde_json::from_str(&stdout).map_err(GeneratorError::Malformed)
    }
}

#[async_trait]
impl PayloadGenerator for StdoutGenerator {
    async fn generate(
        &self,
        artifact: &str,
        command: &str,
    ) -> Result<Vec<String>, GeneratorError> {
        if artifact.is_empty() {
            return self.run_command(command, &self.base_dir).await;
        }
        if !artifact.starts_with("s3://") {
            return Err(GeneratorError::UnsupportedArtifact(artifact.to_string()));
        }
        let location = S3Location::parse(artifact)?;

        // A fresh directory per run keeps concurrent workers off each
        // other's downloads; TempDir removes it on every exit path.
        let scratch = tempfile::tempdir().map_err(GeneratorError::Scratch)?;
        self.fetcher.fetch(&location, scratch.path()).await?;
        self.run_command(command, scratch.path()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoFetch;

    #[async_trait]
    impl ArtifactFetcher for NoFetch {
        async fn fetch(
            &self,
            location: &S3Location,
            _dest_dir: &Path,
        ) -> Result<PathBuf, ArtifactError> {
            Err(ArtifactError::Download {
                bucket: location.bucket.clone(),
                key: location.key.clone(),
                reason: "offline".to_string(),
            })
        }
    }

    struct WriteMarker;

    #[async_trait]
    impl ArtifactFetcher for WriteMarker {
        async fn fetch(
            &self,
            location: &S3Location,
            dest_dir: &Path,
        ) -> Result<PathBuf, ArtifactError> {
            let path = dest_dir.join(location.file_name());
            std::fs::write(&path, b"marker").map_err(|source| ArtifactError::Io {
                path: path.display().to_string(),
                source,
            })?;
            Ok(path)
        }
    }

    fn generator() -> StdoutGenerator {
        StdoutGenerator::new(".", Arc::new(NoFetch))
    }

    #[tokio::test]
    async fn parses_generator_stdout() {
        let payloads = generator()
            .generate("", r#"["echo", "[\"pa\", \"pb\"]"]"#)
            .await
            .unwrap();
        assert_eq!(payloads, vec!["pa", "pb"]);
    }

    #[tokio::test]
    async fn empty_payload_array_is_valid() {
        let payloads = generator().generate("", r#"["echo", "[]"]"#).await.unwrap();
        assert!(payloads.is_empty());
    }

    #[tokio::test]
    async fn process_failure_carries_combined_output() {
        let err = generator()
            .generate("", r#"["sh", "-c", "echo out; echo err >&2; exit 3"]"#)
            .await
            .unwrap_err();
        match err {
            GeneratorError::Failed { output, .. } => {
                assert!(output.contains("out"));
                assert!(output.contains("err"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_array_stdout_is_rejected() {
        let err = generator()
            .generate("", r#"["echo", "{\"not\": \"an array\"}"]"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::Malformed(_)));
    }

    #[tokio::test]
    async fn rejects_malformed_command_and_empty_argv() {
        assert!(matches!(
            generator().generate("", "echo hi").await.unwrap_err(),
            GeneratorError::InvalidCommand { .. }
        ));
        assert!(matches!(
            generator().generate("", "[]").await.unwrap_err(),
            GeneratorError::InvalidCommand { .. }
        ));
    }

    #[tokio::test]
    async fn rejects_non_s3_artifacts() {
        let err = generator()
            .generate("https://example.com/run.jar", r#"["echo", "[]"]"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::UnsupportedArtifact(_)));
    }

    #[tokio::test]
    async fn artifact_runs_land_in_a_scratch_directory() {
        let generator = StdoutGenerator::new("/nonexistent-base", Arc::new(WriteMarker));
        // cat-ing the downloaded file proves the working directory is the
        // scratch dir, not base_dir.
        let payloads = generator
            .generate(
                "s3://bucket/run.txt",
                r#"["sh", "-c", "test -f run.txt && echo '[\"ok\"]'"]"#,
            )
            .await
            .unwrap();
        assert_eq!(payloads, vec!["ok"]);
    }

    #[tokio::test]
    async fn fetch_failure_aborts_generation() {
        let err = generator()
            .generate("s3://bucket/run.jar", r#"["echo", "[]"]"#)
            .await
            .unwrap_err();
        assert!(matches!(err, GeneratorError::Artifact(_)));
    }
}
