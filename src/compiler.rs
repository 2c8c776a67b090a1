//! Compiler subprocess management.
//!
//! One [`CompilerRunner::run`] call covers the whole lifetime of a single
//! compiler process: spawn, incremental stream capture, deadline
//! enforcement, forced termination, and reaping. The caller never touches
//! the process directly.

use std::{
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::capture::{DEFAULT_LOG_CAP, LogTail};
use crate::workspace::{SOURCE_FILE, Workspace};

/// Terminal result of one compiler process, before artifact validation.
#[derive(Debug)]
pub enum ProcessOutcome {
    /// The process exited on its own within the deadline. `code` is `None`
    /// when the process died to a signal we did not send.
    Completed {
        code: Option<i32>,
        stdout_tail: LogTail,
        stderr_tail: LogTail,
    },
    /// The deadline fired first; the process (and its group) was killed.
    TimedOut,
    /// The process never started, or could not be monitored.
    SpawnFailed { message: String },
}

/// Exactly-once gate between the deadline watchdog and the natural-exit
/// path. Whichever claims first finalizes the attempt; the loser must
/// treat its event as already handled.
#[derive(Debug, Default)]
pub struct FinalizeGuard {
    claimed: AtomicBool,
}

impl FinalizeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for exactly one caller over the guard's lifetime.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

/// Spawns and supervises compiler processes against a fixed binary and
/// flag set. Stateless across attempts; one runner serves the whole
/// service.
#[derive(Debug, Clone)]
pub struct CompilerRunner {
    program: PathBuf,
    extra_args: Vec<String>,
    log_cap: usize,
}

impl CompilerRunner {
    pub fn new(program: impl Into<PathBuf>, extra_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            extra_args,
            log_cap: DEFAULT_LOG_CAP,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `<program> -o <workspace> [extra flags] main.tex`, run from inside
    /// the workspace so relative `\input` paths resolve there.
    fn command(&self, workspace: &Workspace) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-o")
            .arg(workspace.dir())
            .args(&self.extra_args)
            .arg(SOURCE_FILE)
            .current_dir(workspace.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    /// Runs one compile to completion or until `deadline` elapses.
    ///
    /// The deadline is enforced by a watchdog task racing the process's
    /// own exit; a [`FinalizeGuard`] keeps the two from both finalizing
    /// when they fire near-simultaneously. On timeout the process group is
    /// SIGKILLed and reaped before this returns, so no attempt ever leaks
    /// a running compiler.
    pub async fn run(&self, workspace: &Workspace, deadline: Duration) -> ProcessOutcome {
        let mut child = match self.command(workspace).spawn() {
            Ok(child) => child,
            Err(err) => return self.spawn_failure(&err),
        };
        debug!(
            pid = child.id(),
            program = %self.program.display(),
            dir = %workspace.dir().display(),
            "compiler spawned"
        );

        let stdout_task = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(drain(stream, self.log_cap)));
        let stderr_task = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(drain(stream, self.log_cap)));

        let finalize = Arc::new(FinalizeGuard::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let watchdog = tokio::spawn({
            let finalize = Arc::clone(&finalize);
            async move {
                tokio::time::sleep(deadline).await;
                if finalize.claim() {
                    let _ = kill_tx.send(());
                }
            }
        });

        // Race the process's own exit against the watchdog's kill signal.
        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill_rx => None,
        };
        watchdog.abort();

        match exited {
            Some(status) => {
                if finalize.claim() {
                    self.finish_completed(status, stdout_task, stderr_task).await
                } else {
                    // The watchdog claimed the attempt while the process was
                    // exiting on its own; it stays timed out either way.
                    abort_readers(stdout_task, stderr_task);
                    ProcessOutcome::TimedOut
                }
            }
            None => {
                warn!(
                    pid = child.id(),
                    deadline_ms = deadline.as_millis() as u64,
                    "compile deadline expired, killing compiler"
                );
                metrics::counter!("galley_compile_timeouts_total").increment(1);
                kill_process_tree(&mut child);
                let _ = child.wait().await;
                abort_readers(stdout_task, stderr_task);
                ProcessOutcome::TimedOut
            }
        }
    }

    async fn finish_completed(
        &self,
        status: io::Result<std::process::ExitStatus>,
        stdout_task: Option<JoinHandle<LogTail>>,
        stderr_task: Option<JoinHandle<LogTail>>,
    ) -> ProcessOutcome {
        let status = match status {
            Ok(status) => status,
            Err(err) => {
                warn!(%err, "failed to monitor compiler process");
                return ProcessOutcome::SpawnFailed {
                    message: format!("Failed to monitor compiler: {err}"),
                };
            }
        };
        let stdout_tail = join_reader(stdout_task).await;
        let stderr_tail = join_reader(stderr_task).await;
        debug!(
            code = status.code(),
            stdout_bytes = stdout_tail.total_seen(),
            stderr_bytes = stderr_tail.total_seen(),
            "compiler exited"
        );
        ProcessOutcome::Completed {
            code: status.code(),
            stdout_tail,
            stderr_tail,
        }
    }

    fn spawn_failure(&self, err: &io::Error) -> ProcessOutcome {
        metrics::counter!("galley_compile_spawn_failures_total").increment(1);
        warn!(program = %self.program.display(), %err, "failed to spawn compiler");
        let message = if err.kind() == io::ErrorKind::NotFound {
            "Tectonic is not installed on the server. Install it and ensure it is on PATH, \
             or point GALLEY_COMPILER_PATH at the binary."
                .to_string()
        } else {
            format!("Failed to start compiler: {err}")
        };
        ProcessOutcome::SpawnFailed { message }
    }
}

/// Reads a stream to EOF in small chunks, keeping only the bounded tail.
async fn drain(mut stream: impl AsyncRead + Unpin, cap: usize) -> LogTail {
    let mut tail = LogTail::new(cap);
    let mut chunk = [0u8; 2048];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => tail.append(&chunk[..n]),
            Err(err) => {
                debug!(%err, "compiler stream closed with error");
                break;
            }
        }
    }
    tail
}

async fn join_reader(task: Option<JoinHandle<LogTail>>) -> LogTail {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => LogTail::new(0),
    }
}

fn abort_readers(stdout_task: Option<JoinHandle<LogTail>>, stderr_task: Option<JoinHandle<LogTail>>) {
    if let Some(task) = stdout_task {
        task.abort();
    }
    if let Some(task) = stderr_task {
        task.abort();
    }
}

/// SIGKILLs the child's whole process group, falling back to the child
/// alone on platforms without process groups.
fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // Spawned with process_group(0), so -pid addresses the group and
        // takes shell-spawned grandchildren down too.
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(err) = child.start_kill() {
        debug!(%err, "compiler already gone before kill");
    }
}
