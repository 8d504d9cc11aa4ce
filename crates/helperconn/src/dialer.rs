//! Helper dialer
//!
//! Resolves a helper URL to a command line through the registry, starts
//! the helper, and hands back a connected [`CommandConn`].

use std::sync::Arc;

use url::Url;

use crate::attributes::{PlatformAttributes, ProcessAttributes};
use crate::config::ConnConfig;
use crate::conn::CommandConn;
use crate::error::{ConnError, Result};
use crate::registry::{Helper, HelperRegistry};
use crate::spawner::{CommandSpec, ProcessSpawner};
use crate::ssh::SshSpec;

/// Dials connections through registered helper programs
#[derive(Debug)]
pub struct HelperDialer {
    registry: HelperRegistry,
    spawner: ProcessSpawner,
    config: ConnConfig,
}

impl Default for HelperDialer {
    fn default() -> Self {
        Self::new(HelperRegistry::with_defaults(), ConnConfig::default())
    }
}

impl HelperDialer {
    /// Create a dialer using the platform's process attributes
    pub fn new(registry: HelperRegistry, config: ConnConfig) -> Self {
        Self::with_attributes(registry, config, Arc::new(PlatformAttributes))
    }

    /// Create a dialer with custom process attributes
    pub fn with_attributes(
        registry: HelperRegistry,
        config: ConnConfig,
        attributes: Arc<dyn ProcessAttributes>,
    ) -> Self {
        let spawner = ProcessSpawner::new(attributes).with_stderr_limit(config.stderr_limit);
        Self {
            registry,
            spawner,
            config,
        }
    }

    /// The registry helpers are resolved from
    pub fn registry(&self) -> &HelperRegistry {
        &self.registry
    }

    /// The spawner used to start helpers
    pub fn spawner(&self) -> &ProcessSpawner {
        &self.spawner
    }

    /// Connection configuration
    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Build the command line for `helper_url` without starting anything
    ///
    /// # Errors
    ///
    /// - [`ConnError::InvalidHelperUrl`] if the URL does not parse, or the
    ///   built-in ssh helper rejects it
    /// - [`ConnError::UnsupportedScheme`] if no helper is registered for the
    ///   URL's scheme
    pub fn resolve(&self, helper_url: &str, target_address: &str) -> Result<CommandSpec> {
        let url =
            Url::parse(helper_url).map_err(|e| ConnError::invalid_url(helper_url, e.to_string()))?;

        match self.registry.get(url.scheme()) {
            Some(Helper::Ssh) => Ok(SshSpec::from_url(&url)?.command(&self.config.ssh_flags)),
            Some(Helper::Command(template)) => Ok(template.render(&url, target_address)),
            None => Err(ConnError::UnsupportedScheme(url.scheme().to_string())),
        }
    }

    /// Start the helper for `helper_url` and connect to it
    ///
    /// `target_address` is substituted into `{address}` placeholders of
    /// command templates; the built-in ssh helper ignores it.
    ///
    /// # Errors
    ///
    /// Fails immediately with the errors of [`resolve`](Self::resolve), or
    /// with [`ConnError::Spawn`] if the helper cannot be started. No process
    /// is started when resolution fails.
    pub async fn dial(&self, helper_url: &str, target_address: &str) -> Result<CommandConn> {
        let spec = self.resolve(helper_url, target_address)?;
        tracing::debug!(helper_url, command = %spec, "dialing through helper");

        let process = self.spawner.spawn(&spec)?;
        Ok(CommandConn::new(process, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HelperTemplate;

    fn dialer() -> HelperDialer {
        let registry = HelperRegistry::with_defaults()
            .with_helper("echo", Helper::Command(HelperTemplate::new("cat", Vec::<String>::new())))
            .with_helper(
                "nc",
                Helper::Command(HelperTemplate::new("nc", ["{host}", "{port}"])),
            );
        HelperDialer::new(registry, ConnConfig::default().with_ssh_flag("-v"))
    }

    #[test]
    fn test_resolve_command_template() {
        let spec = dialer().resolve("nc://daemon.internal:2375", "ignored").unwrap();
        assert_eq!(spec.program(), "nc");
        assert_eq!(spec.args(), ["daemon.internal", "2375"]);
    }

    #[test]
    fn test_resolve_ssh_uses_configured_flags() {
        let spec = dialer().resolve("ssh://me@host", "ignored").unwrap();
        assert_eq!(spec.program(), "ssh");
        assert_eq!(spec.args()[0], "-v");
        assert!(spec.args().ends_with(&[
            "--".to_string(),
            "host".to_string(),
            "docker".to_string(),
            "system".to_string(),
            "dial-stdio".to_string()
        ]));
    }

    #[test]
    fn test_resolve_unsupported_scheme() {
        let err = dialer().resolve("tcp://127.0.0.1:2375", "x").unwrap_err();
        assert!(matches!(err, ConnError::UnsupportedScheme(ref scheme) if scheme == "tcp"));
    }

    #[test]
    fn test_resolve_unparseable_url() {
        let err = dialer().resolve("not a url", "x").unwrap_err();
        assert!(matches!(err, ConnError::InvalidHelperUrl { .. }));
    }

    #[tokio::test]
    async fn test_dial_unsupported_scheme_starts_nothing() {
        let dialer = dialer();
        let err = dialer.dial("unix:///var/run/docker.sock", "x").await.unwrap_err();
        assert!(matches!(err, ConnError::UnsupportedScheme(_)));
        assert_eq!(dialer.spawner().spawn_count(), 0);
    }
}
