//! Per-attempt scratch directories.
//!
//! Every compile attempt gets a private directory under the system temp
//! root, holding exactly two interesting paths: the source file handed to
//! the compiler and the artifact it is expected to produce. The directory
//! never outlives the attempt.

use std::{
    env, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};
use uuid::Uuid;

/// File name the prepared source is written to inside the workspace.
pub const SOURCE_FILE: &str = "main.tex";
/// File name the compiler is expected to produce inside the workspace.
pub const ARTIFACT_FILE: &str = "main.pdf";

const DIR_PREFIX: &str = "galley-";

/// A uniquely-named scratch directory owned by a single compile attempt.
///
/// Directories are laid down next to each other under `env::temp_dir()`,
/// so no two attempts can ever share a path. [`Workspace::release`] is the
/// normal teardown; `Drop` is a backstop for paths that panic or get
/// cancelled before reaching it.
#[derive(Debug)]
pub struct Workspace {
    dir: PathBuf,
    released: bool,
}

impl Workspace {
    /// Creates a fresh directory for one attempt.
    pub async fn acquire() -> io::Result<Self> {
        let dir = env::temp_dir().join(format!("{DIR_PREFIX}{}", Uuid::new_v4()));
        tokio::fs::create_dir(&dir).await?;
        debug!(dir = %dir.display(), "workspace created");
        Ok(Self {
            dir,
            released: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn source_path(&self) -> PathBuf {
        self.dir.join(SOURCE_FILE)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.dir.join(ARTIFACT_FILE)
    }

    /// Writes the prepared source where the compiler will look for it.
    pub async fn write_source(&self, contents: &str) -> io::Result<()> {
        tokio::fs::write(self.source_path(), contents).await
    }

    /// Removes the directory and everything in it. Idempotent: repeat
    /// calls and already-missing paths are silent no-ops, and failures are
    /// logged rather than surfaced so cleanup can never mask the attempt's
    /// real outcome.
    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => debug!(dir = %self.dir.display(), "workspace removed"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                metrics::counter!("galley_workspace_cleanup_failures_total").increment(1);
                warn!(dir = %self.dir.display(), %err, "failed to remove workspace");
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(dir = %self.dir.display(), "workspace dropped without release");
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_a_unique_directory() {
        let mut a = Workspace::acquire().await.expect("acquire");
        let mut b = Workspace::acquire().await.expect("acquire");
        assert_ne!(a.dir(), b.dir());
        assert!(a.dir().is_dir());
        assert!(a.dir().starts_with(env::temp_dir()));
        a.release().await;
        b.release().await;
    }

    #[tokio::test]
    async fn test_write_source_lands_at_the_expected_path() {
        let mut ws = Workspace::acquire().await.expect("acquire");
        ws.write_source("\\documentclass{article}").await.expect("write");
        let read = tokio::fs::read_to_string(ws.source_path()).await.expect("read");
        assert_eq!(read, "\\documentclass{article}");
        assert_eq!(ws.source_path().file_name().unwrap(), SOURCE_FILE);
        assert_eq!(ws.artifact_path().file_name().unwrap(), ARTIFACT_FILE);
        ws.release().await;
    }

    #[tokio::test]
    async fn test_release_removes_directory_and_contents() {
        let mut ws = Workspace::acquire().await.expect("acquire");
        ws.write_source("body").await.expect("write");
        let dir = ws.dir().to_path_buf();
        ws.release().await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let mut ws = Workspace::acquire().await.expect("acquire");
        ws.release().await;
        ws.release().await;
    }

    #[tokio::test]
    async fn test_release_tolerates_externally_removed_directory() {
        let mut ws = Workspace::acquire().await.expect("acquire");
        std::fs::remove_dir_all(ws.dir()).expect("external removal");
        ws.release().await;
    }

    #[tokio::test]
    async fn test_drop_backstop_removes_unreleased_directory() {
        let dir = {
            let ws = Workspace::acquire().await.expect("acquire");
            ws.write_source("leak?").await.expect("write");
            ws.dir().to_path_buf()
        };
        assert!(!dir.exists());
    }
}
