//! One-shot warmup compile at startup.
//!
//! The first compile on a cold host pays for cache population: format
//! files, fonts, support packages the compiler may fetch over the
//! network. Compiling a trivial document once at boot moves that cost off
//! the first user request. The warmup shares the regular attempt pipeline
//! under a longer deadline, and its result only ever gets logged and
//! surfaced through the health endpoint; requests never wait for it.

use std::{
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    attempt::{CompileRequest, CompileService},
    config::Config,
    error::CompileError,
};

/// Trivial always-valid document compiled during warmup.
pub const WARMUP_SOURCE: &str =
    "\\documentclass{article}\n\\begin{document}\nWarmup\n\\end{document}\n";

/// How the warmup compile ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupOutcome {
    Succeeded,
    Failed,
    TimedOut,
    /// The compiler binary could not be started at all.
    Unavailable,
}

/// Point-in-time view of the warmup lifecycle, reported by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct WarmupStatus {
    pub enabled: bool,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WarmupOutcome>,
}

/// Write-once warmup bookkeeping.
#[derive(Debug, Default)]
pub struct WarmupState {
    enabled: OnceLock<bool>,
    outcome: OnceLock<WarmupOutcome>,
}

impl WarmupState {
    pub const fn new() -> Self {
        Self {
            enabled: OnceLock::new(),
            outcome: OnceLock::new(),
        }
    }

    /// Records the startup decision. Returns false when warmup was already
    /// decided for this process, which makes repeat spawns no-ops.
    fn record_start(&self, enabled: bool) -> bool {
        self.enabled.set(enabled).is_ok()
    }

    fn record_outcome(&self, outcome: WarmupOutcome) {
        let _ = self.outcome.set(outcome);
    }

    pub fn status(&self) -> WarmupStatus {
        WarmupStatus {
            enabled: self.enabled.get().copied().unwrap_or(false),
            completed: self.outcome.get().is_some(),
            outcome: self.outcome.get().copied(),
        }
    }
}

static STATE: WarmupState = WarmupState::new();

/// Status of the process-wide warmup.
pub fn status() -> WarmupStatus {
    STATE.status()
}

/// Kicks off the warmup compile in the background.
///
/// Fires at most once per process; repeat calls, and configs with warmup
/// disabled, return `None` without compiling anything.
pub fn spawn(service: Arc<CompileService>, config: &Config) -> Option<JoinHandle<()>> {
    spawn_with_state(&STATE, service, config.warmup, config.warmup_timeout)
}

fn spawn_with_state(
    state: &'static WarmupState,
    service: Arc<CompileService>,
    enabled: bool,
    deadline: Duration,
) -> Option<JoinHandle<()>> {
    if !state.record_start(enabled) {
        warn!("warmup already ran in this process, ignoring");
        return None;
    }
    if !enabled {
        info!("warmup disabled via GALLEY_WARMUP");
        return None;
    }
    Some(tokio::spawn(run(state, service, deadline)))
}

async fn run(state: &'static WarmupState, service: Arc<CompileService>, deadline: Duration) {
    info!(
        deadline_ms = deadline.as_millis() as u64,
        "starting warmup compile"
    );
    let request = CompileRequest {
        body: WARMUP_SOURCE.as_bytes().to_vec(),
        content_type: Some("text/plain".to_string()),
    };
    let started = Instant::now();
    let outcome = match service.compile_with_deadline(request, deadline).await {
        Ok(artifact) => {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                bytes = artifact.len(),
                "warmup compile succeeded"
            );
            WarmupOutcome::Succeeded
        }
        Err(CompileError::Timeout { limit_ms }) => {
            warn!(limit_ms, "warmup compile timed out");
            WarmupOutcome::TimedOut
        }
        Err(CompileError::Spawn { message }) => {
            warn!(%message, "warmup could not start the compiler");
            WarmupOutcome::Unavailable
        }
        Err(CompileError::Compile { log } | CompileError::InvalidArtifact { log }) => {
            warn!(%log, "warmup compile failed");
            WarmupOutcome::Failed
        }
        Err(err) => {
            warn!(error = %err, "warmup compile failed");
            WarmupOutcome::Failed
        }
    };
    state.record_outcome(outcome);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_state() -> &'static WarmupState {
        Box::leak(Box::new(WarmupState::new()))
    }

    fn service_with_missing_compiler() -> Arc<CompileService> {
        Arc::new(CompileService::new(&Config {
            compiler_path: "/nonexistent/galley-compiler".into(),
            ..Config::default()
        }))
    }

    #[tokio::test]
    async fn test_warmup_fires_at_most_once_per_state() {
        let state = leaked_state();
        let service = service_with_missing_compiler();

        let first = spawn_with_state(state, Arc::clone(&service), true, Duration::from_secs(5));
        let handle = first.expect("first spawn should run");
        handle.await.expect("warmup task");

        let status = state.status();
        assert!(status.enabled);
        assert!(status.completed);
        assert_eq!(status.outcome, Some(WarmupOutcome::Unavailable));

        let second = spawn_with_state(state, service, true, Duration::from_secs(5));
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_disabled_warmup_never_compiles() {
        let state = leaked_state();
        let service = service_with_missing_compiler();

        let handle = spawn_with_state(state, Arc::clone(&service), false, Duration::from_secs(5));
        assert!(handle.is_none());

        let status = state.status();
        assert!(!status.enabled);
        assert!(!status.completed);
        assert_eq!(status.outcome, None);
        assert_eq!(service.spawn_count(), 0);
    }

    #[test]
    fn test_status_serializes_outcome_in_snake_case() {
        let state = leaked_state();
        state.record_start(true);
        state.record_outcome(WarmupOutcome::TimedOut);
        let json = serde_json::to_value(state.status()).expect("serialize");
        assert_eq!(json["enabled"], true);
        assert_eq!(json["completed"], true);
        assert_eq!(json["outcome"], "timed_out");
    }

    #[test]
    fn test_pending_status_omits_outcome() {
        let state = leaked_state();
        state.record_start(true);
        let json = serde_json::to_value(state.status()).expect("serialize");
        assert_eq!(json["completed"], false);
        assert!(json.get("outcome").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_warmup_records_success() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().expect("tempdir");
        let stub = dir.path().join("stub-compiler.sh");
        std::fs::write(&stub, "#!/bin/sh\nprintf '%%PDF-1.5 warm' > main.pdf\n")
            .expect("write stub");
        let mut perms = std::fs::metadata(&stub).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&stub, perms).expect("chmod");

        let state = leaked_state();
        let service = Arc::new(CompileService::new(&Config {
            compiler_path: stub,
            ..Config::default()
        }));
        let handle = spawn_with_state(state, service, true, Duration::from_secs(10))
            .expect("spawn warmup");
        handle.await.expect("warmup task");

        assert_eq!(state.status().outcome, Some(WarmupOutcome::Succeeded));
    }
}
