//! Galley - on-demand LaTeX to PDF compilation service.

pub mod attempt;
pub mod capture;
pub mod compiler;
pub mod config;
pub mod error;
pub mod server;
pub mod source;
pub mod warmup;
pub mod workspace;

pub use attempt::{CompileArtifact, CompileRequest, CompileService};
pub use capture::LogTail;
pub use compiler::{CompilerRunner, FinalizeGuard, ProcessOutcome};
pub use config::Config;
pub use error::CompileError;
pub use server::{AppState, CompileServer, MAX_BODY_BYTES, router};
pub use warmup::{WarmupOutcome, WarmupStatus};
pub use workspace::Workspace;
