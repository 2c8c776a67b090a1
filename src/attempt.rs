//! Compile attempt orchestration.
//!
//! [`CompileService`] owns everything a single `POST /api/compile` needs:
//! request validation, source preparation, workspace lifetime, the
//! compiler run, and artifact verification. One attempt maps to exactly
//! one `Result` and releases its workspace on every path out.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::{
    capture::LogTail,
    compiler::{CompilerRunner, ProcessOutcome},
    config::Config,
    error::CompileError,
    source,
    workspace::Workspace,
};

/// Magic prefix every acceptable artifact must carry.
const PDF_MAGIC: &[u8] = b"%PDF";

/// One client submission, as it arrived off the wire.
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
}

/// A verified PDF produced by a successful attempt.
#[derive(Debug, Clone)]
pub struct CompileArtifact {
    bytes: Vec<u8>,
}

impl CompileArtifact {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Stateless-per-attempt compile front end. Shared behind an `Arc` by the
/// HTTP handlers and the warmup task.
pub struct CompileService {
    runner: CompilerRunner,
    timeout: Duration,
    limiter: Option<Arc<Semaphore>>,
    spawns: AtomicU64,
}

impl CompileService {
    pub fn new(config: &Config) -> Self {
        Self {
            runner: CompilerRunner::new(
                config.compiler_path.clone(),
                config.compiler_flags.clone(),
            ),
            timeout: config.compile_timeout,
            limiter: config
                .max_concurrent_compiles
                .map(|n| Arc::new(Semaphore::new(n))),
            spawns: AtomicU64::new(0),
        }
    }

    /// Number of compiler processes this service has attempted to spawn.
    /// Rejected requests never move this counter.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Runs one attempt under the service's configured deadline.
    pub async fn compile(&self, request: CompileRequest) -> Result<CompileArtifact, CompileError> {
        self.compile_with_deadline(request, self.timeout).await
    }

    /// Runs one attempt under an explicit deadline (warmup uses a longer
    /// one than interactive requests).
    pub async fn compile_with_deadline(
        &self,
        request: CompileRequest,
        deadline: Duration,
    ) -> Result<CompileArtifact, CompileError> {
        validate(&request)?;
        let text = String::from_utf8_lossy(&request.body);
        let prepared = source::prepare(&text);

        let _permit = self.admit().await?;

        let mut workspace = Workspace::acquire().await.map_err(|err| CompileError::Spawn {
            message: format!("Failed to prepare compile workspace: {err}"),
        })?;
        let result = self.run_in(&workspace, &prepared, deadline).await;
        workspace.release().await;
        result
    }

    /// Waits for an admission permit when a concurrency cap is configured.
    async fn admit(&self) -> Result<Option<OwnedSemaphorePermit>, CompileError> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        if limiter.available_permits() == 0 {
            debug!("attempt queued behind concurrent compiles");
        }
        match Arc::clone(limiter).acquire_owned().await {
            Ok(permit) => Ok(Some(permit)),
            Err(_) => Err(CompileError::Internal {
                detail: "admission semaphore closed".to_string(),
            }),
        }
    }

    async fn run_in(
        &self,
        workspace: &Workspace,
        prepared: &str,
        deadline: Duration,
    ) -> Result<CompileArtifact, CompileError> {
        workspace
            .write_source(prepared)
            .await
            .map_err(|err| CompileError::Internal {
                detail: format!("failed to write source file: {err}"),
            })?;

        self.spawns.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("galley_compiles_total").increment(1);
        match self.runner.run(workspace, deadline).await {
            ProcessOutcome::Completed {
                code: Some(0),
                stdout_tail,
                stderr_tail,
            } => {
                debug!(
                    stdout_bytes = stdout_tail.total_seen(),
                    "compiler reported success"
                );
                self.read_artifact(workspace, stderr_tail).await
            }
            ProcessOutcome::Completed {
                code,
                stdout_tail,
                stderr_tail,
            } => {
                info!(
                    code,
                    stdout_bytes = stdout_tail.total_seen(),
                    stderr_bytes = stderr_tail.total_seen(),
                    "compile failed"
                );
                metrics::counter!("galley_compile_failures_total").increment(1);
                Err(CompileError::Compile {
                    log: stderr_tail.into_string(),
                })
            }
            ProcessOutcome::TimedOut => Err(CompileError::Timeout {
                limit_ms: deadline.as_millis() as u64,
            }),
            ProcessOutcome::SpawnFailed { message } => Err(CompileError::Spawn { message }),
        }
    }

    /// Reads the artifact back while the workspace still exists and
    /// verifies it looks like a PDF.
    async fn read_artifact(
        &self,
        workspace: &Workspace,
        stderr_tail: LogTail,
    ) -> Result<CompileArtifact, CompileError> {
        match tokio::fs::read(workspace.artifact_path()).await {
            Ok(bytes) if bytes.starts_with(PDF_MAGIC) => {
                info!(bytes = bytes.len(), "compile produced pdf");
                Ok(CompileArtifact { bytes })
            }
            Ok(bytes) => {
                warn!(bytes = bytes.len(), "compiler output is not a pdf");
                metrics::counter!("galley_invalid_artifacts_total").increment(1);
                Err(CompileError::InvalidArtifact {
                    log: stderr_tail.into_string(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!("compiler exited cleanly but produced no artifact");
                metrics::counter!("galley_invalid_artifacts_total").increment(1);
                Err(CompileError::InvalidArtifact {
                    log: stderr_tail.into_string(),
                })
            }
            Err(err) => Err(CompileError::ArtifactRead {
                detail: err.to_string(),
            }),
        }
    }
}

/// Rejects a request before any filesystem or process activity.
/// Check order: content type, then emptiness, then binary content.
fn validate(request: &CompileRequest) -> Result<(), CompileError> {
    if let Some(content_type) = &request.content_type {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if !essence.is_empty() && !essence.starts_with("text/") {
            return Err(CompileError::UnsupportedContentType {
                received: Some(content_type.clone()),
            });
        }
    }
    if request.body.is_empty() || request.body.iter().all(u8::is_ascii_whitespace) {
        return Err(CompileError::EmptyBody);
    }
    if request.body.contains(&0) {
        return Err(CompileError::BinaryBody);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(body: &[u8], content_type: Option<&str>) -> CompileRequest {
        CompileRequest {
            body: body.to_vec(),
            content_type: content_type.map(str::to_owned),
        }
    }

    #[test]
    fn test_text_content_types_are_accepted() {
        for content_type in [
            Some("text/plain"),
            Some("text/plain; charset=utf-8"),
            Some("TEXT/X-TEX"),
            Some(""),
            None,
        ] {
            assert!(
                validate(&request(b"hello", content_type)).is_ok(),
                "rejected {content_type:?}"
            );
        }
    }

    #[test]
    fn test_non_text_content_types_are_rejected() {
        for content_type in ["application/json", "application/pdf", "image/png"] {
            let err = validate(&request(b"hello", Some(content_type)))
                .expect_err("should reject non-text");
            assert!(matches!(
                err,
                CompileError::UnsupportedContentType { .. }
            ));
        }
    }

    #[test]
    fn test_check_order_is_content_type_then_empty_then_binary() {
        // All three violations at once: content type wins.
        let err = validate(&request(b"", Some("application/json"))).expect_err("reject");
        assert!(matches!(err, CompileError::UnsupportedContentType { .. }));
        // Empty beats binary when both could apply to a whitespace body.
        let err = validate(&request(b"  \t\r\n ", None)).expect_err("reject");
        assert!(matches!(err, CompileError::EmptyBody));
        let err = validate(&request(b"abc\0def", None)).expect_err("reject");
        assert!(matches!(err, CompileError::BinaryBody));
    }

    #[tokio::test]
    async fn test_rejected_requests_never_spawn() {
        let service = CompileService::new(&Config::default());
        for req in [
            request(b"{}", Some("application/json")),
            request(b"", None),
            request(b"   \n\t  ", None),
            request(b"bad\0input", None),
        ] {
            assert!(service.compile(req).await.is_err());
        }
        assert_eq!(service.spawn_count(), 0);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;
        use tempfile::TempDir;

        fn stub_compiler(dir: &TempDir, body: &str) -> PathBuf {
            let path = dir.path().join("stub-compiler.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write stub");
            let mut perms = std::fs::metadata(&path).expect("stat stub").permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).expect("chmod stub");
            path
        }

        fn service_with(stub: PathBuf) -> CompileService {
            CompileService::new(&Config {
                compiler_path: stub,
                compile_timeout: Duration::from_secs(10),
                ..Config::default()
            })
        }

        #[tokio::test]
        async fn test_successful_attempt_returns_the_pdf_bytes() {
            let dir = TempDir::new().expect("tempdir");
            let stub = stub_compiler(&dir, "printf '%%PDF-1.5 stub artifact' > main.pdf\n");
            let service = service_with(stub);
            let artifact = service
                .compile(request(b"Hello.", Some("text/plain")))
                .await
                .expect("compile");
            assert!(artifact.as_bytes().starts_with(b"%PDF"));
            assert!(artifact.as_bytes().ends_with(b"stub artifact"));
            assert_eq!(service.spawn_count(), 1);
        }

        #[tokio::test]
        async fn test_clean_exit_without_artifact_is_invalid() {
            let dir = TempDir::new().expect("tempdir");
            let stub = stub_compiler(&dir, "exit 0\n");
            let service = service_with(stub);
            let err = service
                .compile(request(b"Hello.", None))
                .await
                .expect_err("no artifact");
            assert!(matches!(err, CompileError::InvalidArtifact { .. }));
        }

        #[tokio::test]
        async fn test_nonzero_exit_reports_compile_failure_with_log() {
            let dir = TempDir::new().expect("tempdir");
            let stub = stub_compiler(&dir, "echo '! Undefined control sequence.' >&2\nexit 1\n");
            let service = service_with(stub);
            let err = service
                .compile(request(b"\\oops", None))
                .await
                .expect_err("failed compile");
            match err {
                CompileError::Compile { log } => {
                    assert!(log.contains("Undefined control sequence"));
                }
                other => panic!("expected Compile, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_concurrency_cap_serializes_attempts() {
            let dir = TempDir::new().expect("tempdir");
            let stub = stub_compiler(&dir, "sleep 0.3\nprintf '%%PDF-1.5 ok' > main.pdf\n");
            let service = Arc::new(CompileService::new(&Config {
                compiler_path: stub,
                compile_timeout: Duration::from_secs(10),
                max_concurrent_compiles: Some(1),
                ..Config::default()
            }));

            let started = std::time::Instant::now();
            let a = tokio::spawn({
                let service = Arc::clone(&service);
                async move { service.compile(request(b"first", None)).await }
            });
            let b = tokio::spawn({
                let service = Arc::clone(&service);
                async move { service.compile(request(b"second", None)).await }
            });
            let (a, b) = tokio::join!(a, b);
            assert!(a.expect("join").is_ok());
            assert!(b.expect("join").is_ok());
            // With one permit the two 300 ms compiles cannot overlap.
            assert!(started.elapsed() >= Duration::from_millis(600));
        }
    }
}
