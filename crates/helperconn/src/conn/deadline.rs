//! Deadline emulation over blocking pipe I/O
//!
//! Pipes have no native deadlines, so an operation is raced against a timer
//! that is re-armed whenever the deadline changes. Expiry only abandons the
//! pending operation; the pipe itself stays open.

use std::future::{Future, pending};

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

use crate::error::{ConnError, Result};

/// Connection half an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    fn closed_error(self) -> ConnError {
        match self {
            Direction::Read => ConnError::ClosedRead,
            Direction::Write => ConnError::ClosedWrite,
        }
    }
}

/// Open/closed flags of a connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnState {
    /// `close_read` was called
    pub read_closed: bool,
    /// `close_write` was called
    pub write_closed: bool,
    /// `close` was called; terminal
    pub closed: bool,
}

impl ConnState {
    /// Error an operation in `direction` must fail with, if any
    pub(crate) fn refusal(&self, direction: Direction) -> Option<ConnError> {
        let half_closed = match direction {
            Direction::Read => self.read_closed,
            Direction::Write => self.write_closed,
        };
        (self.closed || half_closed).then(|| direction.closed_error())
    }
}

/// Settable deadline for one direction
#[derive(Debug)]
pub(crate) struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        Self {
            tx: watch::channel(None).0,
        }
    }

    pub(crate) fn set(&self, at: Option<Instant>) {
        self.tx.send_replace(at);
    }

    pub(crate) fn get(&self) -> Option<Instant> {
        *self.tx.borrow()
    }

    /// Run `op` until it completes, the deadline passes, or `state` refuses
    /// further operations in `direction`
    pub(crate) async fn race<T, F>(
        &self,
        direction: Direction,
        state: &watch::Sender<ConnState>,
        op: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut deadline_rx = self.tx.subscribe();
        let mut state_rx = state.subscribe();
        tokio::pin!(op);

        loop {
            let at = *deadline_rx.borrow_and_update();
            if at.is_some_and(|at| at <= Instant::now()) {
                return Err(ConnError::Timeout);
            }
            let expiry = async move {
                match at {
                    Some(at) => sleep_until(at).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                biased;
                res = &mut op => return res,
                _ = state_rx.wait_for(|s| s.refusal(direction).is_some()) => {
                    return Err(direction.closed_error());
                }
                () = expiry => return Err(ConnError::Timeout),
                changed = deadline_rx.changed() => {
                    if changed.is_err() {
                        return Err(direction.closed_error());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_race_completes_without_deadline() {
        let deadline = Deadline::new();
        let state = watch::channel(ConnState::default()).0;
        let res = deadline
            .race(Direction::Read, &state, async { Ok::<_, ConnError>(7) })
            .await
            .unwrap();
        assert_eq!(res, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out() {
        let deadline = Deadline::new();
        deadline.set(Some(Instant::now() + Duration::from_millis(50)));
        let state = watch::channel(ConnState::default()).0;

        let err = deadline
            .race(Direction::Read, &state, pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_past_deadline_fails_immediately() {
        let deadline = Deadline::new();
        deadline.set(Some(Instant::now()));
        let state = watch::channel(ConnState::default()).0;

        let err = deadline
            .race(Direction::Write, &state, async { Ok::<_, ConnError>(()) })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_rearmed_while_in_flight() {
        let deadline = std::sync::Arc::new(Deadline::new());
        let state = watch::channel(ConnState::default()).0;

        let setter = deadline.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(Some(Instant::now() + Duration::from_millis(20)));
        });

        let start = Instant::now();
        let err = deadline
            .race(Direction::Read, &state, pending::<Result<()>>())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_operation() {
        let deadline = Deadline::new();
        let state = watch::channel(ConnState::default()).0;

        let closer = async {
            tokio::task::yield_now().await;
            state.send_modify(|s| s.closed = true);
        };
        let (res, ()) = tokio::join!(
            deadline.race(Direction::Write, &state, pending::<Result<()>>()),
            closer
        );
        assert!(matches!(res, Err(ConnError::ClosedWrite)));
    }

    #[test]
    fn test_refusal_per_direction() {
        let state = ConnState {
            write_closed: true,
            ..Default::default()
        };
        assert!(state.refusal(Direction::Read).is_none());
        assert!(matches!(
            state.refusal(Direction::Write),
            Some(ConnError::ClosedWrite)
        ));

        let state = ConnState {
            closed: true,
            ..Default::default()
        };
        assert!(matches!(
            state.refusal(Direction::Read),
            Some(ConnError::ClosedRead)
        ));
    }
}
