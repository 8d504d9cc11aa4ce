//! Scheme to helper mapping
//!
//! The registry is the in-process form of whatever configuration maps URL
//! schemes to helper programs. It is serde-friendly so callers can load it
//! from their own config files:
//!
//! ```
//! use helperconn::{Helper, HelperRegistry, HelperTemplate};
//!
//! let registry = HelperRegistry::with_defaults()
//!     .with_helper("socat", Helper::Command(HelperTemplate::new("socat", ["-", "TCP:{host}:{port}"])));
//! assert!(registry.get("ssh").is_some());
//! assert!(registry.get("SOCAT").is_some());
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::spawner::CommandSpec;

/// Argument template of a command helper
///
/// Arguments may contain placeholders that are substituted at dial time:
///
/// | placeholder | value |
/// |---|---|
/// | `{address}` | target address passed to `dial` |
/// | `{host}` | host of the helper URL |
/// | `{port}` | port of the helper URL |
/// | `{user}` | user name of the helper URL |
/// | `{path}` | path of the helper URL |
///
/// The target address is never appended implicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperTemplate {
    /// Program to run, looked up on `PATH`
    pub program: String,

    /// Argument template
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlay
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Working directory
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
}

impl HelperTemplate {
    /// Create a template
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            current_dir: None,
        }
    }

    /// Overlay an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Substitute placeholders and build the command spec
    pub fn render(&self, url: &Url, target_address: &str) -> CommandSpec {
        let port = url.port().map(|p| p.to_string()).unwrap_or_default();
        let substitute = |arg: &String| {
            arg.replace("{address}", target_address)
                .replace("{host}", url.host_str().unwrap_or_default())
                .replace("{port}", &port)
                .replace("{user}", url.username())
                .replace("{path}", url.path())
        };

        let mut spec = CommandSpec::new(self.program.clone(), self.args.iter().map(substitute));
        for (key, value) in &self.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        if let Some(dir) = &self.current_dir {
            spec = spec.with_current_dir(dir.clone());
        }
        spec
    }
}

/// How a scheme is turned into a helper command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Helper {
    /// Built-in ssh tunnel to `docker system dial-stdio`
    Ssh,

    /// Arbitrary program with an argument template
    Command(HelperTemplate),
}

/// Registered helpers, keyed by lower-case scheme
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, Helper>",
    into = "BTreeMap<String, Helper>"
)]
pub struct HelperRegistry {
    helpers: BTreeMap<String, Helper>,
}

impl HelperRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `ssh` helper
    pub fn with_defaults() -> Self {
        Self::new().with_helper("ssh", Helper::Ssh)
    }

    /// Register a helper, replacing any previous one for the scheme
    pub fn register(&mut self, scheme: impl AsRef<str>, helper: Helper) {
        self.helpers
            .insert(scheme.as_ref().to_ascii_lowercase(), helper);
    }

    /// Register a helper, builder style
    pub fn with_helper(mut self, scheme: impl AsRef<str>, helper: Helper) -> Self {
        self.register(scheme, helper);
        self
    }

    /// Helper registered for `scheme`
    pub fn get(&self, scheme: &str) -> Option<&Helper> {
        self.helpers.get(&scheme.to_ascii_lowercase())
    }

    /// Registered schemes
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.helpers.keys().map(String::as_str)
    }
}

impl From<BTreeMap<String, Helper>> for HelperRegistry {
    fn from(helpers: BTreeMap<String, Helper>) -> Self {
        helpers
            .into_iter()
            .fold(Self::new(), |registry, (scheme, helper)| {
                registry.with_helper(scheme, helper)
            })
    }
}

impl From<HelperRegistry> for BTreeMap<String, Helper> {
    fn from(registry: HelperRegistry) -> Self {
        registry.helpers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(vec!["cat"], "ignored", vec!["cat"])]
    #[case(vec!["nc", "{address}"], "10.0.0.1:2375", vec!["nc", "10.0.0.1:2375"])]
    #[case(vec!["-", "TCP:{host}:{port}"], "x", vec!["-", "TCP:example.com:2376"])]
    #[case(vec!["--user={user}", "--sock={path}"], "x", vec!["--user=me", "--sock=/run/docker.sock"])]
    fn test_template_render(
        #[case] args: Vec<&str>,
        #[case] address: &str,
        #[case] expected: Vec<&str>,
    ) {
        let url = Url::parse("helper://me@example.com:2376/run/docker.sock").unwrap();
        let spec = HelperTemplate::new("prog", args).render(&url, address);
        assert_eq!(spec.program(), "prog");
        assert_eq!(spec.args(), expected.as_slice());
    }

    #[test]
    fn test_template_render_carries_env_and_dir() {
        let url = Url::parse("helper://").unwrap();
        let spec = HelperTemplate::new("prog", Vec::<String>::new())
            .with_env("A", "1")
            .with_current_dir("/srv")
            .render(&url, "addr");
        assert_eq!(spec.env().get("A"), Some(&"1".to_string()));
        assert_eq!(spec.current_dir(), Some(std::path::Path::new("/srv")));
    }

    #[test]
    fn test_registry_is_case_insensitive() {
        let registry = HelperRegistry::new().with_helper("MySSH", Helper::Ssh);
        assert_eq!(registry.get("myssh"), Some(&Helper::Ssh));
        assert_eq!(registry.schemes().collect::<Vec<_>>(), vec!["myssh"]);
    }

    #[test]
    fn test_registry_deserializes_from_json() {
        let registry: HelperRegistry = serde_json::from_value(serde_json::json!({
            "SSH": { "kind": "ssh" },
            "echo": { "kind": "command", "program": "cat" },
            "nc": {
                "kind": "command",
                "program": "nc",
                "args": ["{host}", "{port}"],
                "env": { "LC_ALL": "C" }
            }
        }))
        .unwrap();

        assert_eq!(registry.get("ssh"), Some(&Helper::Ssh));
        assert_eq!(
            registry.get("echo"),
            Some(&Helper::Command(HelperTemplate::new("cat", Vec::<String>::new())))
        );
        match registry.get("nc") {
            Some(Helper::Command(template)) => {
                assert_eq!(template.args, vec!["{host}", "{port}"]);
                assert_eq!(template.env.get("LC_ALL"), Some(&"C".to_string()));
            }
            other => panic!("unexpected helper: {other:?}"),
        }
    }
}
