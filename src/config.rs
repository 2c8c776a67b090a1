//! Configuration loading from environment variables.
//!
//! Uses the following environment variables (all optional):
//! - `GALLEY_ADDR`: HTTP listen address (default: 0.0.0.0:3000)
//! - `GALLEY_COMPILER_PATH`: compiler binary to invoke (default: `tectonic` from PATH)
//! - `GALLEY_COMPILER_FLAGS`: extra compiler flags, whitespace-separated (default: none)
//! - `GALLEY_COMPILE_TIMEOUT_MS`: per-request compile deadline (default: 15000)
//! - `GALLEY_WARMUP`: set to `0` or `false` to skip the startup warmup compile (default: enabled)
//! - `GALLEY_WARMUP_TIMEOUT_MS`: warmup compile deadline (default: 60000)
//! - `GALLEY_MAX_CONCURRENT_COMPILES`: cap on simultaneous compiler processes (default: unlimited)

use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{Context, Result};

/// Default address for the HTTP server
pub const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Default compiler binary, resolved through PATH
pub const DEFAULT_COMPILER: &str = "tectonic";

/// Default per-request compile deadline in milliseconds
pub const DEFAULT_COMPILE_TIMEOUT_MS: u64 = 15_000;

/// Default warmup compile deadline in milliseconds
pub const DEFAULT_WARMUP_TIMEOUT_MS: u64 = 60_000;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address (host:port)
    pub addr: SocketAddr,

    /// Compiler binary to invoke
    pub compiler_path: PathBuf,

    /// Extra flags inserted between the output-directory flag and the
    /// source file name
    pub compiler_flags: Vec<String>,

    /// Deadline for interactive compile requests
    pub compile_timeout: Duration,

    /// Whether to run a warmup compile at startup
    pub warmup: bool,

    /// Deadline for the warmup compile (longer than interactive requests,
    /// since it may pull support files into cold caches)
    pub warmup_timeout: Duration,

    /// Maximum simultaneous compiler processes.
    /// None means no limit (every request compiles immediately).
    pub max_concurrent_compiles: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.parse().unwrap(),
            compiler_path: PathBuf::from(DEFAULT_COMPILER),
            compiler_flags: Vec::new(),
            compile_timeout: Duration::from_millis(DEFAULT_COMPILE_TIMEOUT_MS),
            warmup: true,
            warmup_timeout: Duration::from_millis(DEFAULT_WARMUP_TIMEOUT_MS),
            max_concurrent_compiles: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let defaults = Self::default();

        let addr = env::var("GALLEY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        let addr = SocketAddr::from_str(&addr).context("invalid GALLEY_ADDR format")?;

        let compiler_path = env::var("GALLEY_COMPILER_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.compiler_path);

        let compiler_flags = env::var("GALLEY_COMPILER_FLAGS")
            .map(|raw| split_flags(&raw))
            .unwrap_or_default();

        let compile_timeout = env::var("GALLEY_COMPILE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.compile_timeout);

        let warmup = env::var("GALLEY_WARMUP")
            .map(|raw| warmup_enabled(&raw))
            .unwrap_or(true);

        let warmup_timeout = env::var("GALLEY_WARMUP_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.warmup_timeout);

        let max_concurrent_compiles = env::var("GALLEY_MAX_CONCURRENT_COMPILES")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0);

        Ok(Self {
            addr,
            compiler_path,
            compiler_flags,
            compile_timeout,
            warmup,
            warmup_timeout,
            max_concurrent_compiles,
        })
    }
}

fn split_flags(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_owned).collect()
}

fn warmup_enabled(raw: &str) -> bool {
    !matches!(raw.trim(), "0" | "false")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.addr, DEFAULT_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(config.compiler_path, PathBuf::from("tectonic"));
        assert!(config.compiler_flags.is_empty());
        assert_eq!(config.compile_timeout, Duration::from_secs(15));
        assert!(config.warmup);
        assert_eq!(config.warmup_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_compiles, None);
    }

    #[test]
    fn test_flags_split_on_any_whitespace() {
        assert_eq!(
            split_flags("--keep-logs  -Z\tshell-escape\n"),
            vec!["--keep-logs", "-Z", "shell-escape"]
        );
        assert!(split_flags("").is_empty());
        assert!(split_flags("   ").is_empty());
    }

    #[test]
    fn test_warmup_disabled_only_by_zero_or_false() {
        assert!(!warmup_enabled("0"));
        assert!(!warmup_enabled("false"));
        assert!(!warmup_enabled(" false "));
        assert!(warmup_enabled("1"));
        assert!(warmup_enabled("true"));
        assert!(warmup_enabled(""));
        assert!(warmup_enabled("off"));
    }
}
