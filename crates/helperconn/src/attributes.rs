//! Platform process attributes
//!
//! Helpers are started in their own session on Unix so that a terminal
//! interrupt delivered to the client's process group does not tear down a
//! tunnel in the middle of a request. The same hook owns the termination
//! request sent on close, since the right signal target depends on how the
//! child was grouped.

use std::fmt;
use std::io;

use tokio::process::{Child, Command};

/// Configures how a helper process is grouped before start and how it is
/// asked to terminate
pub trait ProcessAttributes: Send + Sync + fmt::Debug {
    /// Apply attributes to a command that has not been started yet
    ///
    /// Must not start the process.
    fn apply(&self, command: &mut Command) -> io::Result<()>;

    /// Ask a running helper to terminate
    ///
    /// Called at most once per connection, only if the helper has not
    /// already exited. A forced kill follows after the grace period.
    fn terminate(&self, child: &mut Child) -> io::Result<()>;
}

/// Attributes appropriate for the current platform
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformAttributes;

#[cfg(unix)]
impl ProcessAttributes for PlatformAttributes {
    #[allow(unsafe_code)]
    fn apply(&self, command: &mut Command) -> io::Result<()> {
        // SAFETY: the hook runs in the forked child before exec and only calls
        // setsid, which is async-signal-safe.
        // PR_SET_PDEATHSIG is not used: it follows the spawning thread, and
        // helpers must outlive the thread that dialed them.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()?;
                Ok(())
            });
        }
        Ok(())
    }

    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

        // The helper leads its own session, so its pgid is its pid and the
        // whole group (ProxyCommand children included) gets the signal.
        match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => {
                tracing::warn!(pid, %errno, "killpg failed, signalling helper directly");
                child.start_kill()
            }
        }
    }
}

#[cfg(not(unix))]
impl ProcessAttributes for PlatformAttributes {
    fn apply(&self, _command: &mut Command) -> io::Result<()> {
        Ok(())
    }

    fn terminate(&self, child: &mut Child) -> io::Result<()> {
        child.start_kill()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_helper_leads_its_own_session() {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg("cut -d' ' -f6 /proc/$$/stat")
            .stdout(Stdio::piped());
        PlatformAttributes.apply(&mut command).unwrap();

        let child = command.spawn().unwrap();
        let pid = child.id().unwrap();
        let output = child.wait_with_output().await.unwrap();
        let sid: u32 = String::from_utf8_lossy(&output.stdout).trim().parse().unwrap();
        assert_eq!(sid, pid);
    }

    #[tokio::test]
    async fn test_terminate_stops_helper() {
        let mut command = Command::new("sleep");
        command.arg("30");
        PlatformAttributes.apply(&mut command).unwrap();

        let mut child = command.spawn().unwrap();
        PlatformAttributes.terminate(&mut child).unwrap();
        let status = child.wait().await.unwrap();

        use std::os::unix::process::ExitStatusExt;
        assert_eq!(status.signal(), Some(nix::sys::signal::Signal::SIGTERM as i32));
    }

    #[tokio::test]
    async fn test_terminate_after_exit_is_harmless() {
        let mut command = Command::new("true");
        PlatformAttributes.apply(&mut command).unwrap();

        let mut child = command.spawn().unwrap();
        child.wait().await.unwrap();
        PlatformAttributes.terminate(&mut child).unwrap();
    }
}
