//! Repository configuration (§6): worker pool sizing, lock timeouts, the
//! physical-time source list, and subscriber notification timeouts.
//!
//! Loadable from TOML via the workspace's `config`/`toml` crates, mirroring
//! how the teacher's `toka-orchestration-service` and `toka-llm-gateway`
//! wire the external `config` crate in front of a plain `serde`-derived
//! struct rather than hand-rolling a parser.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`crate::Repository`], matching §6's configuration
/// table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Number of worker tasks draining the command consumer's intake queue.
    pub worker_count: usize,
    /// Bounded intake queue capacity; `publish` waits once full.
    pub queue_depth: usize,
    /// Per-lock acquisition timeout, in milliseconds.
    pub lock_timeout_ms: u64,
    /// NTP servers backing the physical time source. Only the interface
    /// lives in `aeon-clock`; this list is carried through configuration so
    /// a deployment can wire its own NTP-disciplined source without the
    /// repository needing to know how.
    pub ntp_servers: Vec<String>,
    /// Per-subscriber notification timeout, in milliseconds.
    pub subscriber_timeout_ms: u64,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queue_depth: 1024,
            lock_timeout_ms: 30_000,
            ntp_servers: vec!["pool.ntp.org".to_string()],
            subscriber_timeout_ms: 5_000,
        }
    }
}

impl RepositoryConfig {
    /// Per-lock acquisition timeout as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Per-subscriber notification timeout as a [`Duration`].
    pub fn subscriber_timeout(&self) -> Duration {
        Duration::from_millis(self.subscriber_timeout_ms)
    }

    /// Parse a configuration from a TOML document, falling back to
    /// [`Default`] for any field the document omits.
    pub fn from_toml_str(source: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    /// Load a configuration from a TOML file on disk, same fallback
    /// semantics as [`Self::from_toml_str`].
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RepositoryConfig::default();
        assert!(cfg.worker_count >= 1);
        assert_eq!(cfg.queue_depth, 1024);
        assert_eq!(cfg.lock_timeout_ms, 30_000);
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg = RepositoryConfig::from_toml_str("worker_count = 2\n").unwrap();
        assert_eq!(cfg.worker_count, 2);
        assert_eq!(cfg.queue_depth, 1024);
    }

    #[test]
    fn full_toml_overrides_every_field() {
        let toml = r#"
            worker_count = 8
            queue_depth = 64
            lock_timeout_ms = 10
            ntp_servers = ["time.example.com"]
            subscriber_timeout_ms = 250
        "#;
        let cfg = RepositoryConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.worker_count, 8);
        assert_eq!(cfg.queue_depth, 64);
        assert_eq!(cfg.lock_timeout_ms, 10);
        assert_eq!(cfg.ntp_servers, vec!["time.example.com".to_string()]);
        assert_eq!(cfg.subscriber_timeout_ms, 250);
    }
}
