//! Connection configuration

use std::time::Duration;

use crate::exit::DEFAULT_STDERR_LIMIT;

/// Tunables shared by the spawner, the connection and the dialer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnConfig {
    /// Time between the termination request and a forced kill in `close()`
    pub grace_period: Duration,

    /// Number of trailing stderr bytes kept for diagnostics
    pub stderr_limit: usize,

    /// How long a read waits for the helper to exit after its stdout ends
    pub exit_wait: Duration,

    /// Extra flags for the built-in ssh helper
    pub ssh_flags: Vec<String>,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            stderr_limit: DEFAULT_STDERR_LIMIT,
            exit_wait: Duration::from_secs(10),
            ssh_flags: Vec::new(),
        }
    }
}

impl ConnConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// This will look for:
    /// - `HELPERCONN_GRACE_PERIOD_MS` for the close grace period
    /// - `HELPERCONN_STDERR_LIMIT` for the retained stderr size in bytes
    /// - `HELPERCONN_EXIT_WAIT_MS` for the post-EOF exit wait
    /// - `HELPERCONN_SSH_OPTS` for whitespace-separated ssh flags
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(ms) = lookup("HELPERCONN_GRACE_PERIOD_MS").and_then(|v| v.parse().ok()) {
            config.grace_period = Duration::from_millis(ms);
        }

        if let Some(limit) = lookup("HELPERCONN_STDERR_LIMIT").and_then(|v| v.parse().ok()) {
            config.stderr_limit = limit;
        }

        if let Some(ms) = lookup("HELPERCONN_EXIT_WAIT_MS").and_then(|v| v.parse().ok()) {
            config.exit_wait = Duration::from_millis(ms);
        }

        if let Some(opts) = lookup("HELPERCONN_SSH_OPTS") {
            config.ssh_flags = opts.split_whitespace().map(str::to_string).collect();
        }

        config
    }

    /// Set the close grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Set the retained stderr size
    pub fn with_stderr_limit(mut self, limit: usize) -> Self {
        self.stderr_limit = limit;
        self
    }

    /// Set the post-EOF exit wait
    pub fn with_exit_wait(mut self, exit_wait: Duration) -> Self {
        self.exit_wait = exit_wait;
        self
    }

    /// Add a flag for the built-in ssh helper
    pub fn with_ssh_flag(mut self, flag: impl Into<String>) -> Self {
        self.ssh_flags.push(flag.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = ConnConfig::default();
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert_eq!(config.stderr_limit, 4096);
        assert_eq!(config.exit_wait, Duration::from_secs(10));
        assert!(config.ssh_flags.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let config = ConnConfig::new()
            .with_grace_period(Duration::from_millis(250))
            .with_stderr_limit(128)
            .with_exit_wait(Duration::from_secs(1))
            .with_ssh_flag("-v");

        assert_eq!(config.grace_period, Duration::from_millis(250));
        assert_eq!(config.stderr_limit, 128);
        assert_eq!(config.exit_wait, Duration::from_secs(1));
        assert_eq!(config.ssh_flags, vec!["-v".to_string()]);
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("HELPERCONN_GRACE_PERIOD_MS", "100"),
            ("HELPERCONN_STDERR_LIMIT", "not-a-number"),
            ("HELPERCONN_SSH_OPTS", "-o  StrictHostKeyChecking=no"),
        ]);
        let config = ConnConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.grace_period, Duration::from_millis(100));
        assert_eq!(config.stderr_limit, 4096);
        assert_eq!(config.exit_wait, Duration::from_secs(10));
        assert_eq!(config.ssh_flags, vec!["-o", "StrictHostKeyChecking=no"]);
    }

    #[test]
    fn test_config_from_env_variables() {
        temp_env::with_vars(
            [
                ("HELPERCONN_GRACE_PERIOD_MS", Some("750")),
                ("HELPERCONN_EXIT_WAIT_MS", Some("2000")),
                ("HELPERCONN_STDERR_LIMIT", None),
                ("HELPERCONN_SSH_OPTS", Some("-v -o BatchMode=yes")),
            ],
            || {
                let config = ConnConfig::from_env();
                assert_eq!(config.grace_period, Duration::from_millis(750));
                assert_eq!(config.exit_wait, Duration::from_secs(2));
                assert_eq!(config.stderr_limit, 4096);
                assert_eq!(config.ssh_flags, vec!["-v", "-o", "BatchMode=yes"]);
            },
        );
    }
}
