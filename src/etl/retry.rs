//! Bounded retry of one period's extraction
//!
//! Each period runs as a small state machine:
//! `attempt(1) → { success | retry(n + 1) | abandon }`. After every failure
//! the classified [`Recovery`] is applied, then the next attempt starts unless
//! the budget is spent or the failure was fatal.

use super::classify::{ErrorKind, Recovery, classify};
use super::connection::{ConnectionManager, Connector, SessionStatus};
use super::query::{QueryExecutor, QueryTemplate, ResultSet};
use super::window::Period;
use crate::error::{PeriodFailure, QueryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry budget and wait intervals
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub memory_cooldown: Duration,
    pub timeout_growth: f64,
    pub max_command_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(30),
            memory_cooldown: Duration::from_secs(60),
            timeout_growth: 2.0,
            max_command_timeout: Duration::from_secs(3600),
        }
    }
}

impl RetryPolicy {
    /// Policy with no waits, for tests and dry runs
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Duration::ZERO,
            memory_cooldown: Duration::ZERO,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// One try at extracting a period. Kept in memory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionAttempt {
    pub period: Period,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
}

/// A successful extraction and the attempts it took
#[derive(Debug, Clone)]
pub struct Extraction {
    pub result: ResultSet,
    pub attempts: Vec<ExtractionAttempt>,
}

impl Extraction {
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }
}

/// Wraps the query executor in the retry state machine
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
    executor: QueryExecutor,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            executor: QueryExecutor::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Extract one period
    ///
    /// Ends in exactly one terminal state: `Ok` with the result set, or
    /// `Err(PeriodFailure)` once the attempts are exhausted or a fatal failure
    /// occurs. On abandonment the connection is left open or closed, never
    /// stale.
    pub async fn run<C: Connector>(
        &self,
        connection: &mut ConnectionManager<C>,
        template: &QueryTemplate,
        period: &Period,
    ) -> Result<Extraction, PeriodFailure> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut attempt_number = 0;

        loop {
            attempt_number += 1;
            let started_at = Utc::now();
            log::debug!(
                "{} attempt {}/{}",
                period,
                attempt_number,
                max_attempts
            );

            let error = match self.attempt(connection, template, period).await {
                Ok(result) => {
                    attempts.push(ExtractionAttempt {
                        period: *period,
                        attempt_number,
                        started_at,
                        outcome: AttemptOutcome::Success,
                        error_kind: None,
                    });
                    return Ok(Extraction { result, attempts });
                }
                Err(e) => e,
            };

            let kind = classify(&error);
            attempts.push(ExtractionAttempt {
                period: *period,
                attempt_number,
                started_at,
                outcome: if kind.is_retryable() {
                    AttemptOutcome::RetryableFailure
                } else {
                    AttemptOutcome::FatalFailure
                },
                error_kind: Some(kind),
            });
            log::warn!(
                "{} attempt {}/{} failed ({}): {}",
                period,
                attempt_number,
                max_attempts,
                kind,
                error
            );

            if !kind.is_retryable() || attempt_number >= max_attempts {
                self.abandon(connection, kind).await;
                return Err(PeriodFailure {
                    period: *period,
                    last_error_kind: kind,
                    attempts: attempt_number,
                    message: error.to_string(),
                });
            }

            self.recover(connection, kind).await;
        }
    }

    async fn attempt<C: Connector>(
        &self,
        connection: &mut ConnectionManager<C>,
        template: &QueryTemplate,
        period: &Period,
    ) -> Result<ResultSet, QueryError> {
        connection.open().await?;
        self.executor.execute(connection, template, period).await
    }

    async fn recover<C: Connector>(&self, connection: &mut ConnectionManager<C>, kind: ErrorKind) {
        match kind.recovery() {
            Recovery::Recycle => {
                connection.mark_stale();
                if let Err(e) = connection.recycle().await {
                    log::warn!("Reconnect failed, will retry opening: {}", e);
                }
            }
            Recovery::EscalateTimeout => {
                connection.escalate_timeouts(
                    self.policy.timeout_growth,
                    self.policy.max_command_timeout,
                );
                wait(self.policy.backoff).await;
            }
            Recovery::ReleaseAndCooldown => {
                connection.release_buffers();
                log::info!(
                    "Cooling down for {}s after memory pressure",
                    self.policy.memory_cooldown.as_secs()
                );
                wait(self.policy.memory_cooldown).await;
            }
            Recovery::Backoff => wait(self.policy.backoff).await,
            Recovery::Abort => {}
        }
    }

    async fn abandon<C: Connector>(&self, connection: &mut ConnectionManager<C>, kind: ErrorKind) {
        if kind == ErrorKind::SessionExpired {
            connection.mark_stale();
        }
        if connection.status() == SessionStatus::Stale {
            connection.close().await;
        }
    }
}

async fn wait(duration: Duration) {
    if !duration.is_zero() {
        log::debug!("Waiting {:?} before retry", duration);
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::connection::{Session, Timeouts};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Scripted results, shared between the connector and its sessions
    #[derive(Clone, Default)]
    struct Script {
        replies: Arc<Mutex<VecDeque<Result<ResultSet, QueryError>>>>,
        queries: Arc<Mutex<u32>>,
        releases: Arc<Mutex<u32>>,
        last_timeouts: Arc<Mutex<Option<Timeouts>>>,
    }

    impl Script {
        fn new(replies: Vec<Result<ResultSet, QueryError>>) -> Self {
            let script = Self::default();
            *script.replies.lock().unwrap() = replies.into();
            script
        }
        fn queries(&self) -> u32 {
            *self.queries.lock().unwrap()
        }
    }

    struct ScriptSession(Script);

    impl Session for ScriptSession {
        async fn ping(&self, _timeouts: &Timeouts) -> bool {
            true
        }

        async fn query(&self, _text: &str, timeouts: &Timeouts) -> Result<ResultSet, QueryError> {
            *self.0.queries.lock().unwrap() += 1;
            *self.0.last_timeouts.lock().unwrap() = Some(*timeouts);
            self.0
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(ResultSet::default()))
        }

        fn release_buffers(&self) {
            *self.0.releases.lock().unwrap() += 1;
        }

        async fn close(self) -> Result<(), QueryError> {
            Ok(())
        }
    }

    struct ScriptConnector(Script);

    impl Connector for ScriptConnector {
        type Session = ScriptSession;

        async fn open(&self, _timeouts: &Timeouts) -> Result<ScriptSession, QueryError> {
            Ok(ScriptSession(self.0.clone()))
        }
    }

    fn rows(n: usize) -> ResultSet {
        ResultSet::new(
            vec!["value".to_string()],
            (0..n).map(|i| vec![serde_json::json!(i)]).collect(),
        )
    }

    fn setup(
        replies: Vec<Result<ResultSet, QueryError>>,
    ) -> (ConnectionManager<ScriptConnector>, Script, QueryTemplate, Period) {
        let script = Script::new(replies);
        let manager = ConnectionManager::new(ScriptConnector(script.clone()), Timeouts::default());
        let template = QueryTemplate::parse("EVALUATE T {year}").unwrap();
        (manager, script, template, Period::month(2025, 3).unwrap())
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let (mut conn, script, template, period) = setup(vec![Ok(rows(3))]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(5));

        let extraction = coordinator.run(&mut conn, &template, &period).await.unwrap();
        assert_eq!(extraction.result.len(), 3);
        assert_eq!(extraction.attempt_count(), 1);
        assert_eq!(extraction.attempts[0].outcome, AttemptOutcome::Success);
        assert_eq!(script.queries(), 1);
    }

    #[tokio::test]
    async fn test_two_timeouts_then_success() {
        let (mut conn, script, template, period) = setup(vec![
            Err(QueryError::Timeout("slow".into())),
            Err(QueryError::Timeout("slow".into())),
            Ok(rows(1)),
        ]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(5));
        let before = conn.timeouts();

        let extraction = coordinator.run(&mut conn, &template, &period).await.unwrap();
        assert_eq!(extraction.attempt_count(), 3);
        assert_eq!(extraction.attempts[0].error_kind, Some(ErrorKind::Timeout));
        assert_eq!(script.queries(), 3);

        // Timeouts grew twice and the last query ran with them
        let after = conn.timeouts();
        assert!(after.command > before.command);
        assert_eq!(*script.last_timeouts.lock().unwrap(), Some(after));
    }

    #[tokio::test]
    async fn test_exhausts_budget() {
        let failures = (0..7)
            .map(|_| Err(QueryError::Execution("internal error".into())))
            .collect();
        let (mut conn, script, template, period) = setup(failures);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(5));

        let failure = coordinator.run(&mut conn, &template, &period).await.unwrap_err();
        assert_eq!(failure.attempts, 5);
        assert_eq!(failure.last_error_kind, ErrorKind::TransientOther);
        assert_eq!(failure.period, period);
        assert_eq!(script.queries(), 5);
        assert_ne!(conn.status(), SessionStatus::Stale);
    }

    #[tokio::test]
    async fn test_fatal_aborts_after_first_attempt() {
        let (mut conn, script, template, period) = setup(vec![
            Err(QueryError::Rejected("syntax".into())),
            Ok(rows(1)),
        ]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(5));

        let failure = coordinator.run(&mut conn, &template, &period).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.last_error_kind, ErrorKind::Fatal);
        assert_eq!(script.queries(), 1);
    }

    #[tokio::test]
    async fn test_session_expired_recycles_once_per_failure() {
        let (mut conn, _script, template, period) = setup(vec![
            Err(QueryError::SessionExpired("401".into())),
            Err(QueryError::Execution("Session does not exist".into())),
            Ok(rows(2)),
        ]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(5));

        let extraction = coordinator.run(&mut conn, &template, &period).await.unwrap();
        assert_eq!(extraction.attempt_count(), 3);
        assert_eq!(conn.recycle_count(), 2);
        assert_eq!(conn.status(), SessionStatus::Open);
    }

    #[tokio::test]
    async fn test_session_expired_on_last_attempt_closes() {
        let (mut conn, _script, template, period) = setup(vec![
            Err(QueryError::SessionExpired("401".into())),
            Err(QueryError::SessionExpired("401".into())),
        ]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(2));

        let failure = coordinator.run(&mut conn, &template, &period).await.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert_eq!(failure.last_error_kind, ErrorKind::SessionExpired);
        assert_eq!(conn.status(), SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_memory_pressure_releases_buffers() {
        let (mut conn, script, template, period) = setup(vec![
            Err(QueryError::Execution("out of memory".into())),
            Ok(rows(1)),
        ]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(5));

        coordinator.run(&mut conn, &template, &period).await.unwrap();
        assert_eq!(*script.releases.lock().unwrap(), 1);
        assert_eq!(conn.recycle_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_budget_still_attempts_once() {
        let (mut conn, script, template, period) =
            setup(vec![Err(QueryError::Execution("boom".into()))]);
        let coordinator = RetryCoordinator::new(RetryPolicy::immediate(0));

        let failure = coordinator.run(&mut conn, &template, &period).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(script.queries(), 1);
    }
}
