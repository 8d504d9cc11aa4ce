//! Helper process spawning
//!
//! Starts a helper with its stdin and stdout wired to in-process pipes and
//! its stderr drained into a bounded diagnostic buffer.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::attributes::{PlatformAttributes, ProcessAttributes};
use crate::error::{ConnError, Result};
use crate::exit::{DEFAULT_STDERR_LIMIT, StderrTail, spawn_drain};

/// Command line of a helper process
///
/// Built once by the dialer and only read afterwards. The helper inherits
/// the caller's environment; `env` entries are layered on top, which keeps
/// ssh agents and config files reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
}

impl CommandSpec {
    /// Create a command spec
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Set the working directory
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Overlay an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Program to run
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments, excluding the program
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Working directory, if any
    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    /// Environment overlay
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// A started helper and its pipes
///
/// Owned by exactly one [`CommandConn`](crate::CommandConn). The child is
/// spawned with `kill_on_drop`, so a process that is dropped without being
/// closed does not leak.
#[derive(Debug)]
pub struct SpawnedProcess {
    pub(crate) command: String,
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: Arc<StderrTail>,
    pub(crate) stderr_task: JoinHandle<()>,
    pub(crate) attributes: Arc<dyn ProcessAttributes>,
}

impl SpawnedProcess {
    /// OS process id of the helper, `None` once reaped
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Command line the helper was started with
    pub fn command(&self) -> &str {
        &self.command
    }
}

/// Starts helper processes
#[derive(Debug)]
pub struct ProcessSpawner {
    attributes: Arc<dyn ProcessAttributes>,
    stderr_limit: usize,
    spawned: AtomicUsize,
}

impl Default for ProcessSpawner {
    fn default() -> Self {
        Self::new(Arc::new(PlatformAttributes))
    }
}

impl ProcessSpawner {
    /// Create a spawner applying `attributes` to every helper
    pub fn new(attributes: Arc<dyn ProcessAttributes>) -> Self {
        Self {
            attributes,
            stderr_limit: DEFAULT_STDERR_LIMIT,
            spawned: AtomicUsize::new(0),
        }
    }

    /// Set the number of trailing stderr bytes kept per helper
    pub fn with_stderr_limit(mut self, limit: usize) -> Self {
        self.stderr_limit = limit;
        self
    }

    /// Number of helpers this spawner has started
    pub fn spawn_count(&self) -> usize {
        self.spawned.load(Ordering::Relaxed)
    }

    /// Start the helper described by `spec`
    ///
    /// Must be called from within a tokio runtime; a task is spawned to drain
    /// the helper's stderr. The caller owns the returned process and is
    /// responsible for reaping it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnError::Spawn`] if the program cannot be found, the
    /// attributes cannot be applied, or exec fails.
    pub fn spawn(&self, spec: &CommandSpec) -> Result<SpawnedProcess> {
        let mut command = Command::new(spec.program());
        command
            .args(spec.args())
            .envs(spec.env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = spec.current_dir() {
            command.current_dir(dir);
        }

        self.attributes
            .apply(&mut command)
            .map_err(|e| ConnError::spawn(spec.program(), e))?;

        let mut child = command.spawn().map_err(|e| {
            tracing::debug!(program = spec.program(), error = %e, "failed to spawn helper");
            ConnError::spawn(spec.program(), e)
        })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnError::spawn(spec.program(), io::Error::other("stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnError::spawn(spec.program(), io::Error::other("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ConnError::spawn(spec.program(), io::Error::other("stderr not piped")))?;

        let pid = child.id();
        let tail = Arc::new(StderrTail::new(self.stderr_limit));
        let stderr_task = spawn_drain(stderr, tail.clone(), pid);

        tracing::debug!(pid, command = %spec, "spawned helper");

        Ok(SpawnedProcess {
            command: spec.to_string(),
            child,
            stdin,
            stdout,
            stderr: tail,
            stderr_task,
            attributes: self.attributes.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_builder() {
        let spec = CommandSpec::new("ssh", ["-T", "--", "host"])
            .with_current_dir("/tmp")
            .with_env("LC_ALL", "C");

        assert_eq!(spec.program(), "ssh");
        assert_eq!(spec.args(), ["-T", "--", "host"]);
        assert_eq!(spec.current_dir(), Some(Path::new("/tmp")));
        assert_eq!(spec.env().get("LC_ALL"), Some(&"C".to_string()));
        assert_eq!(spec.to_string(), "ssh -T -- host");
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let spawner = ProcessSpawner::default();
        let spec = CommandSpec::new("helperconn-definitely-not-installed", Vec::<String>::new());

        let err = spawner.spawn(&spec).unwrap_err();
        match err {
            ConnError::Spawn { program, source } => {
                assert_eq!(program, "helperconn-definitely-not-installed");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
        assert_eq!(spawner.spawn_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_applies_env_and_dir() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let spawner = ProcessSpawner::default();
        let spec = CommandSpec::new("sh", ["-c", "printf '%s %s' \"$HELPER_VAR\" \"$(pwd -P)\""])
            .with_env("HELPER_VAR", "hello")
            .with_current_dir(dir.path());

        let mut process = spawner.spawn(&spec).unwrap();
        assert_eq!(spawner.spawn_count(), 1);

        let mut out = String::new();
        process.stdout.read_to_string(&mut out).await.unwrap();
        let expected_dir = dir.path().canonicalize().unwrap();
        assert_eq!(out, format!("hello {}", expected_dir.display()));
        process.child.wait().await.unwrap();
    }
}
