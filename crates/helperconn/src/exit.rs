//! Exit diagnostics for helper processes
//!
//! The helper's stderr is free-form text; the last few kilobytes are kept so
//! that an exit can be explained with the helper's own words (for example
//! `ssh: Could not resolve hostname`).

use std::collections::VecDeque;
use std::fmt;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Default number of stderr bytes retained per helper
pub const DEFAULT_STDERR_LIMIT: usize = 4096;

/// Exit status and trailing diagnostic output of a helper process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitState {
    /// Helper command line, for messages
    pub command: String,

    /// Exit status, `None` if the helper had not exited when observed
    pub status: Option<ExitStatus>,

    /// Last bytes the helper wrote to stderr, lossily decoded
    pub stderr: String,
}

impl ExitState {
    /// Exit code, if the helper exited normally
    pub fn code(&self) -> Option<i32> {
        self.status.and_then(|status| status.code())
    }

    /// Signal that terminated the helper, if any
    #[cfg(unix)]
    pub fn signal(&self) -> Option<i32> {
        use std::os::unix::process::ExitStatusExt;
        self.status.and_then(|status| status.signal())
    }

    /// Signal that terminated the helper, if any
    #[cfg(not(unix))]
    pub fn signal(&self) -> Option<i32> {
        None
    }

    /// Whether the helper exited with status 0
    pub fn success(&self) -> bool {
        self.status.is_some_and(|status| status.success())
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "command `{}` has exited with {}", self.command, status)?,
            None => write!(f, "command `{}` did not exit", self.command)?,
        }
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            write!(f, ": stderr={stderr}")?;
        }
        Ok(())
    }
}

/// Bounded tail of a helper's stderr
///
/// Append-only while the helper runs; [`StderrTail::seal`] freezes it once
/// the drain task has finished, after which readers see an immutable copy.
#[derive(Debug)]
pub struct StderrTail {
    limit: usize,
    live: Mutex<VecDeque<u8>>,
    sealed: OnceLock<Arc<str>>,
}

impl StderrTail {
    /// Create an empty tail keeping at most `limit` bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            live: Mutex::new(VecDeque::with_capacity(limit.min(DEFAULT_STDERR_LIMIT))),
            sealed: OnceLock::new(),
        }
    }

    /// Append a chunk, discarding the oldest bytes beyond the limit
    pub fn append(&self, chunk: &[u8]) {
        if self.sealed.get().is_some() || self.limit == 0 {
            return;
        }
        let chunk = &chunk[chunk.len().saturating_sub(self.limit)..];
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let overflow = (live.len() + chunk.len()).saturating_sub(self.limit);
        live.drain(..overflow);
        live.extend(chunk);
    }

    /// Freeze the buffer; later appends are ignored
    pub fn seal(&self) -> Arc<str> {
        self.sealed
            .get_or_init(|| Arc::from(self.render_live()))
            .clone()
    }

    /// Current contents, lossily decoded
    pub fn snapshot(&self) -> String {
        match self.sealed.get() {
            Some(text) => text.to_string(),
            None => self.render_live(),
        }
    }

    fn render_live(&self) -> String {
        let live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let (front, back) = live.as_slices();
        let mut bytes = Vec::with_capacity(live.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Drain `stream` into `tail` until EOF, logging each chunk
pub(crate) fn spawn_drain<R>(stream: R, tail: Arc<StderrTail>, pid: Option<u32>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = stream;
        let mut chunk = [0u8; 1024];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    tracing::trace!(
                        target: "helperconn::stderr",
                        pid,
                        "{}",
                        String::from_utf8_lossy(&chunk[..n]).trim_end()
                    );
                    tail.append(&chunk[..n]);
                }
                Err(err) => {
                    tracing::warn!(pid, error = %err, "failed to read helper stderr");
                    break;
                }
            }
        }
        tail.seal();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_last_bytes() {
        let tail = StderrTail::new(8);
        tail.append(b"hello ");
        tail.append(b"world");
        assert_eq!(tail.snapshot(), "lo world");
    }

    #[test]
    fn test_tail_oversized_chunk() {
        let tail = StderrTail::new(4);
        tail.append(b"abcdefgh");
        assert_eq!(tail.snapshot(), "efgh");
    }

    #[test]
    fn test_tail_is_immutable_after_seal() {
        let tail = StderrTail::new(16);
        tail.append(b"boom");
        assert_eq!(&*tail.seal(), "boom");
        tail.append(b" again");
        assert_eq!(tail.snapshot(), "boom");
    }

    #[test]
    fn test_zero_limit_keeps_nothing() {
        let tail = StderrTail::new(0);
        tail.append(b"ignored");
        assert_eq!(tail.snapshot(), "");
    }

    #[tokio::test]
    async fn test_drain_seals_on_eof() {
        let tail = Arc::new(StderrTail::new(64));
        let reader: &'static [u8] = b"ssh: Could not resolve hostname nowhere\n";
        spawn_drain(reader, tail.clone(), None).await.unwrap();
        assert!(tail.snapshot().contains("Could not resolve hostname"));
        tail.append(b"late");
        assert!(!tail.snapshot().contains("late"));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_drain_logs_chunks_at_trace_level() {
        for (level, logged) in [(tracing::Level::DEBUG, false), (tracing::Level::TRACE, true)] {
            let log = CapturedLog::default();
            let writer = log.clone();
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(move || writer.clone())
                .finish();
            let _guard = tracing::subscriber::set_default(subscriber);

            let tail = Arc::new(StderrTail::new(64));
            let reader: &'static [u8] = b"Permission denied (publickey)\n";
            spawn_drain(reader, tail, Some(7)).await.unwrap();

            let output = String::from_utf8_lossy(&log.0.lock().unwrap()).into_owned();
            assert_eq!(output.contains("Permission denied"), logged, "{level}: {output}");
            if logged {
                assert!(output.contains("helperconn::stderr"), "{output}");
            }
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_state_display() {
        use std::os::unix::process::ExitStatusExt;

        let state = ExitState {
            command: "ssh -- host".to_string(),
            status: Some(ExitStatus::from_raw(2 << 8)),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(state.code(), Some(2));
        assert!(!state.success());
        assert_eq!(
            state.to_string(),
            "command `ssh -- host` has exited with exit status: 2: stderr=boom"
        );
    }
}
