//! Built-in ssh helper
//!
//! `ssh://[user@]host[:port][/socket/path]` is tunnelled through the local
//! `ssh` binary running `docker system dial-stdio` on the remote side, which
//! splices the remote daemon socket onto ssh's stdin/stdout.

use url::Url;

use crate::error::{ConnError, Result};
use crate::spawner::CommandSpec;

/// Parsed `ssh://` helper URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSpec {
    /// Login name, passed as `-l`
    pub user: Option<String>,
    /// Remote host
    pub host: String,
    /// Remote port, passed as `-p`
    pub port: Option<u16>,
    /// Remote daemon socket path, if not the default
    pub path: Option<String>,
}

impl SshSpec {
    /// Parse an `ssh://` URL
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::InvalidHelperUrl`] for a missing host, an
    /// embedded password, or a trailing query or fragment.
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw).map_err(|e| ConnError::invalid_url(raw, e.to_string()))?;
        Self::from_url(&url)
    }

    pub(crate) fn from_url(url: &Url) -> Result<Self> {
        let invalid = |reason: &str| ConnError::invalid_url(url.as_str(), reason);

        if url.scheme() != "ssh" {
            return Err(invalid("expected the ssh scheme"));
        }
        if url.password().is_some() {
            return Err(invalid("plain-text password is not supported"));
        }
        if url.query().is_some() {
            return Err(invalid("extra query after the host"));
        }
        if url.fragment().is_some() {
            return Err(invalid("extra fragment after the host"));
        }
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("no host specified"))?;

        let user = Some(url.username())
            .filter(|user| !user.is_empty())
            .map(str::to_string);
        let path = Some(url.path())
            .filter(|path| !path.is_empty() && *path != "/")
            .map(str::to_string);

        Ok(Self {
            user,
            host: host.to_string(),
            port: url.port(),
            path,
        })
    }

    /// ssh arguments that run `remote` on the host, after `flags`
    pub fn args(&self, flags: &[String], remote: &[String]) -> Vec<String> {
        let mut args = default_flags(flags);
        if let Some(user) = &self.user {
            args.push("-l".to_string());
            args.push(user.clone());
        }
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push("--".to_string());
        args.push(self.host.clone());
        args.extend(remote.iter().cloned());
        args
    }

    /// Remote command bridging the daemon socket to stdio
    pub fn dial_stdio_command(&self) -> Vec<String> {
        let mut remote = vec!["docker".to_string()];
        if let Some(path) = &self.path {
            remote.push("--host".to_string());
            remote.push(format!("unix://{path}"));
        }
        remote.push("system".to_string());
        remote.push("dial-stdio".to_string());
        remote
    }

    /// Full command spec for the ssh helper
    pub fn command(&self, flags: &[String]) -> CommandSpec {
        CommandSpec::new("ssh", self.args(flags, &self.dial_stdio_command()))
    }
}

/// Caller flags plus a connect timeout and disabled pty allocation, unless
/// the caller already chose either
fn default_flags(flags: &[String]) -> Vec<String> {
    let mut args = flags.to_vec();
    if !flags.iter().any(|flag| flag.contains("ConnectTimeout")) {
        args.push("-o".to_string());
        args.push("ConnectTimeout=30".to_string());
    }
    if !flags.iter().any(|flag| matches!(flag.as_str(), "-t" | "-tt" | "-T")) {
        args.push("-T".to_string());
    }
    args
}
