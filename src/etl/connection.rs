//! Session lifecycle
//!
//! A [`Connector`] knows how to open sessions against the remote service. The
//! [`ConnectionManager`] owns at most one [`Session`] at a time and moves it
//! through `closed → open → stale → closed`. A stale session is never reused:
//! it has to be closed and reopened first.

use super::query::ResultSet;
use crate::error::QueryError;
use std::future::Future;
use std::time::Duration;

/// Ceiling for the connect timeout once it has been escalated
pub const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeouts applied when opening a session and running commands
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timeouts {
    pub connect: Duration,
    pub command: Duration,
}

impl Timeouts {
    pub fn new(connect: Duration, command: Duration) -> Self {
        Self { connect, command }
    }

    /// Multiply both timeouts by `factor`
    ///
    /// The command timeout is capped at `max_command` and the connect timeout
    /// at [`MAX_CONNECT_TIMEOUT`]. Neither ever shrinks below its current value.
    pub fn escalated(&self, factor: f64, max_command: Duration) -> Self {
        let factor = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        Self {
            connect: scale(self.connect, factor, MAX_CONNECT_TIMEOUT),
            command: scale(self.command, factor, max_command),
        }
    }
}

/// `value * factor`, saturating at `cap` (or at `value` if that is already larger)
fn scale(value: Duration, factor: f64, cap: Duration) -> Duration {
    let cap = cap.max(value);
    Duration::try_from_secs_f64(value.as_secs_f64() * factor)
        .map_or(cap, |scaled| scaled.min(cap))
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(600))
    }
}

/// Opens sessions against the remote analytical service
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Establish a new session
    ///
    /// # Errors
    /// Returns [`QueryError::Connection`] on network or authentication failure
    fn open(
        &self,
        timeouts: &Timeouts,
    ) -> impl Future<Output = Result<Self::Session, QueryError>> + Send;
}

/// A live logical connection to the remote service
pub trait Session: Send + Sync {
    /// Lightweight liveness probe. Must not fail: an unusable session is `false`.
    fn ping(&self, timeouts: &Timeouts) -> impl Future<Output = bool> + Send;

    /// Run one query and return its full tabular result
    fn query(
        &self,
        text: &str,
        timeouts: &Timeouts,
    ) -> impl Future<Output = Result<ResultSet, QueryError>> + Send;

    /// Release any buffered result data held by the session
    fn release_buffers(&self) {}

    /// Close the session
    fn close(self) -> impl Future<Output = Result<(), QueryError>> + Send;
}

/// Observable lifecycle state of the managed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Closed,
    Open,
    Stale,
}

enum Slot<S> {
    Closed,
    Open(S),
    Stale(S),
}

/// Owns the single session used by a pipeline run
pub struct ConnectionManager<C: Connector> {
    connector: C,
    slot: Slot<C::Session>,
    timeouts: Timeouts,
    opens: u32,
    recycles: u32,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, timeouts: Timeouts) -> Self {
        Self {
            connector,
            slot: Slot::Closed,
            timeouts,
            opens: 0,
            recycles: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        match self.slot {
            Slot::Closed => SessionStatus::Closed,
            Slot::Open(_) => SessionStatus::Open,
            Slot::Stale(_) => SessionStatus::Stale,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Grow the timeouts used by every later open and query
    pub fn escalate_timeouts(&mut self, factor: f64, max_command: Duration) {
        let escalated = self.timeouts.escalated(factor, max_command);
        log::debug!(
            "Escalating timeouts: connect {:?} -> {:?}, command {:?} -> {:?}",
            self.timeouts.connect,
            escalated.connect,
            self.timeouts.command,
            escalated.command
        );
        self.timeouts = escalated;
    }

    /// Number of sessions successfully opened (including reopen after recycle)
    pub fn open_count(&self) -> u32 {
        self.opens
    }

    /// Number of times [`recycle`](Self::recycle) has been called
    pub fn recycle_count(&self) -> u32 {
        self.recycles
    }

    /// The open session, if there is one. Stale sessions are not handed out.
    pub fn session(&self) -> Option<&C::Session> {
        match &self.slot {
            Slot::Open(session) => Some(session),
            _ => None,
        }
    }

    /// Open a session. A no-op if one is already open; a stale one is recycled.
    pub async fn open(&mut self) -> Result<(), QueryError> {
        match self.status() {
            SessionStatus::Open => Ok(()),
            SessionStatus::Stale => self.recycle().await,
            SessionStatus::Closed => {
                log::debug!("Opening session");
                let session = self.connector.open(&self.timeouts).await?;
                self.slot = Slot::Open(session);
                self.opens += 1;
                Ok(())
            }
        }
    }

    /// Probe the session. An open session that fails the probe becomes stale.
    pub async fn is_alive(&mut self) -> bool {
        let alive = match &self.slot {
            Slot::Open(session) => session.ping(&self.timeouts).await,
            Slot::Closed | Slot::Stale(_) => return false,
        };
        if !alive {
            log::debug!("Session failed liveness probe, marking stale");
            self.mark_stale();
        }
        alive
    }

    /// Flag the open session as unusable
    pub fn mark_stale(&mut self) {
        self.slot = match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Open(session) | Slot::Stale(session) => Slot::Stale(session),
            Slot::Closed => Slot::Closed,
        };
    }

    /// Ask the session to drop buffered result data
    pub fn release_buffers(&self) {
        if let Slot::Open(session) | Slot::Stale(session) = &self.slot {
            session.release_buffers();
        }
    }

    /// Close the session, swallowing close-time errors
    pub async fn close(&mut self) {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Open(session) | Slot::Stale(session) => {
                if let Err(e) = session.close().await {
                    log::debug!("Ignoring error while closing session: {}", e);
                }
            }
            Slot::Closed => {}
        }
    }

    /// Force close and reopen
    ///
    /// Safe on an already-closed manager. If the reopen fails the manager is
    /// left closed.
    pub async fn recycle(&mut self) -> Result<(), QueryError> {
        self.recycles += 1;
        log::debug!("Recycling session");
        self.close().await;
        let session = self.connector.open(&self.timeouts).await?;
        self.slot = Slot::Open(session);
        self.opens += 1;
        Ok(())
    }
}
