//! Engine configuration (§11): socket path, timing knobs, backup schedule,
//! and log filter, loaded from the environment via `dotenvy`.
//!
//! There is no config-file format — matching the teacher crate, which
//! configures itself purely from environment variables plus programmatic
//! defaults.

use std::time::Duration;

/// All the knobs a `Manager` needs beyond the DAG itself.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub socket_path: String,
    pub tick_delay: Duration,
    pub accept_timeout: Duration,
    pub io_drain_timeout: Duration,
    pub backup_path: Option<String>,
    pub backup_interval: Option<Duration>,
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            socket_path: "/tmp/autotrail.socket".to_string(),
            tick_delay: Duration::from_millis(50),
            accept_timeout: Duration::from_secs(1),
            io_drain_timeout: Duration::from_millis(100),
            backup_path: None,
            backup_interval: None,
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load `.env` (if present) and overlay environment variables onto the
    /// defaults. Unset variables keep the default; malformed numeric/bool
    /// values fall back to the default rather than failing the whole load,
    /// since a bad env var here should not prevent the engine from starting.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = EngineConfig::default();

        if let Ok(path) = std::env::var("AUTOTRAIL_SOCKET_PATH") {
            config.socket_path = path;
        }
        if let Some(ms) = parse_env_u64("AUTOTRAIL_TICK_DELAY_MS") {
            config.tick_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64("AUTOTRAIL_ACCEPT_TIMEOUT_MS") {
            config.accept_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env_u64("AUTOTRAIL_IO_DRAIN_TIMEOUT_MS") {
            config.io_drain_timeout = Duration::from_millis(ms);
        }
        if let Ok(path) = std::env::var("AUTOTRAIL_BACKUP_PATH") {
            config.backup_path = Some(path);
        }
        if let Some(secs) = parse_env_u64("AUTOTRAIL_BACKUP_INTERVAL_SECS") {
            config.backup_interval = Some(Duration::from_secs(secs));
        }
        if let Ok(filter) = std::env::var("AUTOTRAIL_LOG") {
            config.log_filter = filter;
        }

        config
    }

    /// Derive a unique-ish default socket path for a given run id, matching
    /// §6's `/tmp/autotrail.socket.<id>` convention.
    #[must_use]
    pub fn socket_path_for(run_id: &str) -> String {
        format!("/tmp/autotrail.socket.{run_id}")
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_timings() {
        let config = EngineConfig::default();
        assert!(config.tick_delay > Duration::ZERO);
        assert!(config.accept_timeout > Duration::ZERO);
    }

    #[test]
    fn socket_path_for_includes_run_id() {
        assert_eq!(EngineConfig::socket_path_for("abc"), "/tmp/autotrail.socket.abc");
    }
}
