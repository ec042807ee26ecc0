//! Failure classification
//!
//! Maps every [`QueryError`] onto a closed [`ErrorKind`], and every kind onto
//! the [`Recovery`] the retry coordinator applies before the next attempt.

use crate::error::QueryError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of failure kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    SessionExpired,
    Timeout,
    MemoryPressure,
    TransientOther,
    Fatal,
}

/// Action taken after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Recycle the connection, retry without delay
    Recycle,
    /// Grow the timeouts, retry after the fixed backoff
    EscalateTimeout,
    /// Drop result buffers, retry after the cooldown interval
    ReleaseAndCooldown,
    /// Retry after the fixed backoff, nothing else changes
    Backoff,
    /// No further attempts for this period
    Abort,
}

impl ErrorKind {
    pub fn recovery(self) -> Recovery {
        match self {
            Self::SessionExpired => Recovery::Recycle,
            Self::Timeout => Recovery::EscalateTimeout,
            Self::MemoryPressure => Recovery::ReleaseAndCooldown,
            Self::TransientOther => Recovery::Backoff,
            Self::Fatal => Recovery::Abort,
        }
    }

    pub fn is_retryable(self) -> bool {
        self != Self::Fatal
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::Timeout => "TIMEOUT",
            Self::MemoryPressure => "MEMORY_PRESSURE",
            Self::TransientOther => "TRANSIENT_OTHER",
            Self::Fatal => "FATAL",
        };
        f.write_str(name)
    }
}

const SESSION_PATTERNS: &[&str] = &[
    "session id cannot be found",
    "session does not exist",
    "session expired",
    "session has expired",
    "token expired",
    "tokenexpired",
];

const TIMEOUT_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection lost",
    "deadline exceeded",
];

const MEMORY_PATTERNS: &[&str] = &[
    "out of memory",
    "insufficient memory",
    "memory error",
    "memoryerror",
    "memory limit",
    "exceeded the available resources",
    "resource governing",
];

const FATAL_PATTERNS: &[&str] = &[
    "syntax error",
    "permission denied",
    "not authorized",
    "access denied",
    "cannot find table",
    "cannot find column",
];

/// Classify a raw failure
///
/// The variant decides first; messages of generic execution faults are then
/// matched against known signatures. Anything unrecognised is
/// [`ErrorKind::TransientOther`].
pub fn classify(error: &QueryError) -> ErrorKind {
    match error {
        QueryError::SessionExpired(_) => ErrorKind::SessionExpired,
        QueryError::Timeout(_) => ErrorKind::Timeout,
        QueryError::Rejected(_) | QueryError::Template(_) => ErrorKind::Fatal,
        QueryError::Connection(message) => match classify_message(message) {
            // A refused login will not fix itself within a period's budget
            ErrorKind::Fatal => ErrorKind::Fatal,
            _ => ErrorKind::TransientOther,
        },
        QueryError::Execution(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    let matches = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches(SESSION_PATTERNS) {
        ErrorKind::SessionExpired
    } else if matches(TIMEOUT_PATTERNS) {
        ErrorKind::Timeout
    } else if matches(MEMORY_PATTERNS) {
        ErrorKind::MemoryPressure
    } else if matches(FATAL_PATTERNS) {
        ErrorKind::Fatal
    } else {
        ErrorKind::TransientOther
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec(message: &str) -> QueryError {
        QueryError::Execution(message.to_string())
    }

    #[test]
    fn test_variant_classification() {
        assert_eq!(
            classify(&QueryError::SessionExpired("401".into())),
            ErrorKind::SessionExpired
        );
        assert_eq!(classify(&QueryError::Timeout("x".into())), ErrorKind::Timeout);
        assert_eq!(classify(&QueryError::Rejected("400".into())), ErrorKind::Fatal);
        assert_eq!(
            classify(&QueryError::Template("missing".into())),
            ErrorKind::Fatal
        );
        assert_eq!(
            classify(&QueryError::Connection("dns failure".into())),
            ErrorKind::TransientOther
        );
        assert_eq!(
            classify(&QueryError::Connection("Access denied for user".into())),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_session_signatures() {
        assert_eq!(
            classify(&exec("The session ID cannot be found.")),
            ErrorKind::SessionExpired
        );
        assert_eq!(
            classify(&exec("Session does not exist")),
            ErrorKind::SessionExpired
        );
    }

    #[test]
    fn test_timeout_signatures() {
        assert_eq!(
            classify(&exec("The connection either timed out or was lost")),
            ErrorKind::Timeout
        );
        assert_eq!(classify(&exec("Operation Timeout")), ErrorKind::Timeout);
    }

    #[test]
    fn test_memory_signatures() {
        assert_eq!(
            classify(&exec("The operation has been cancelled because there is not enough memory: out of memory")),
            ErrorKind::MemoryPressure
        );
        assert_eq!(
            classify(&exec("Query exceeded the available resources")),
            ErrorKind::MemoryPressure
        );
    }

    #[test]
    fn test_fatal_signatures() {
        assert_eq!(
            classify(&exec("Query (3, 5) Syntax error near 'EVALUATE'")),
            ErrorKind::Fatal
        );
        assert_eq!(
            classify(&exec("Cannot find table 'Billing Cases'")),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_unknown_is_transient() {
        assert_eq!(
            classify(&exec("Internal server error")),
            ErrorKind::TransientOther
        );
        assert_eq!(classify(&exec("")), ErrorKind::TransientOther);
    }

    #[test]
    fn test_recovery_per_kind() {
        assert_eq!(ErrorKind::SessionExpired.recovery(), Recovery::Recycle);
        assert_eq!(ErrorKind::Timeout.recovery(), Recovery::EscalateTimeout);
        assert_eq!(
            ErrorKind::MemoryPressure.recovery(),
            Recovery::ReleaseAndCooldown
        );
        assert_eq!(ErrorKind::TransientOther.recovery(), Recovery::Backoff);
        assert_eq!(ErrorKind::Fatal.recovery(), Recovery::Abort);
        assert!(!ErrorKind::Fatal.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&ErrorKind::MemoryPressure).unwrap();
        assert_eq!(json, "\"MEMORY_PRESSURE\"");
        assert_eq!(ErrorKind::TransientOther.to_string(), "TRANSIENT_OTHER");
    }
}
