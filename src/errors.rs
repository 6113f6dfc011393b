//! Typed error hierarchy and failure classification for the orchestrator.
//!
//! Two layers:
//! - `ConductorError` — explicitly typed failures raised by the engine itself
//! - `classify_error` — maps any raised error (typed or not) into an
//!   `ErrorKind` bucket that drives retry and circuit-breaker decisions
//!
//! Retryability for the retry loop is checked through `is_transient`, which
//! keeps its own signature list. The two lists look similar but are not the
//! same: classification answers "what bucket does this failure report under",
//! transience answers "is sleeping and trying again worth anything".

use thiserror::Error;

/// Errors raised by the orchestration engine.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Billing problem reported by the agent provider: {0}")]
    Billing(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Circuit breaker is open; retry in {retry_after_ms} ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("Operation '{operation}' timed out after {seconds}s")]
    Timeout { operation: String, seconds: u64 },

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Agent invocation failed: {0}")]
    Agent(String),

    #[error("Task lock is held by another run: {0}")]
    LockHeld(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure buckets used for retry decisions and operator reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Account state problem. Requires user action, never retried, and
    /// excluded from circuit-breaker accounting.
    Billing,
    /// Hard stop: a cost or iteration budget was exhausted.
    BudgetExceeded,
    /// The breaker itself rejected the call.
    CircuitBreaker,
    /// External call exceeded its deadline.
    Timeout,
    /// Version-control failure; needs inspection, not auto-retried.
    Git,
    /// Transport-level failure.
    Network,
    /// Data/contract problem; retrying without changed input is pointless.
    Validation,
    /// Default bucket for agent/work failures.
    Execution,
    /// Unclassifiable failure.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Billing => "billing",
            Self::BudgetExceeded => "budget_exceeded",
            Self::CircuitBreaker => "circuit_breaker",
            Self::Timeout => "timeout",
            Self::Git => "git",
            Self::Network => "network",
            Self::Validation => "validation",
            Self::Execution => "execution",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this bucket is worth retrying with backoff.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Network | Self::Execution)
    }
}

/// Result of classifying a raw failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: ErrorKind,
    pub retryable: bool,
}

impl From<ErrorKind> for Classification {
    fn from(kind: ErrorKind) -> Self {
        Self {
            kind,
            retryable: kind.retryable(),
        }
    }
}

/// Classify an error into an `ErrorKind` bucket.
///
/// Typed `ConductorError` variants are matched first; anything else falls
/// through to pattern matching over the normalized message text of the whole
/// error chain.
pub fn classify_error(err: &anyhow::Error) -> Classification {
    if let Some(typed) = err.downcast_ref::<ConductorError>() {
        return classify_typed(typed).into();
    }

    let message = normalized_message(err);
    classify_message(&message).into()
}

fn classify_typed(err: &ConductorError) -> ErrorKind {
    match err {
        ConductorError::Billing(_) => ErrorKind::Billing,
        ConductorError::BudgetExceeded(_) => ErrorKind::BudgetExceeded,
        ConductorError::CircuitOpen { .. } => ErrorKind::CircuitBreaker,
        ConductorError::Timeout { .. } => ErrorKind::Timeout,
        ConductorError::Git(_) => ErrorKind::Git,
        ConductorError::Network(_) => ErrorKind::Network,
        ConductorError::Validation(_) => ErrorKind::Validation,
        ConductorError::Agent(_) | ConductorError::LockHeld(_) => ErrorKind::Execution,
        ConductorError::Other(inner) => classify_message(&normalized_message(inner)),
    }
}

/// Collapse the error chain into one lowercase string for pattern matching.
fn normalized_message(err: &anyhow::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ").to_lowercase()
}

fn classify_message(message: &str) -> ErrorKind {
    if message.trim().is_empty() {
        return ErrorKind::Unknown;
    }
    const BILLING: &[&str] = &["billing", "credit balance", "payment required", "insufficient funds"];
    const BUDGET: &[&str] = &["budget exceeded", "budget exhausted", "cost limit"];
    const CIRCUIT: &[&str] = &["circuit breaker"];
    const TIMEOUT: &[&str] = &["timed out", "timeout", "deadline exceeded"];
    const GIT: &[&str] = &["git ", "merge conflict", "non-fast-forward", "detached head", "rebase"];
    const NETWORK: &[&str] = &[
        "network",
        "connection refused",
        "connection reset",
        "econnreset",
        "econnrefused",
        "dns",
        "socket hang up",
        "tls handshake",
        "fetch failed",
    ];
    const VALIDATION: &[&str] = &["validation", "invalid input", "schema mismatch", "missing required field"];

    let any = |needles: &[&str]| needles.iter().any(|n| message.contains(n));

    if any(BILLING) {
        ErrorKind::Billing
    } else if any(BUDGET) {
        ErrorKind::BudgetExceeded
    } else if any(CIRCUIT) {
        ErrorKind::CircuitBreaker
    } else if any(TIMEOUT) {
        ErrorKind::Timeout
    } else if any(GIT) {
        ErrorKind::Git
    } else if any(NETWORK) {
        ErrorKind::Network
    } else if any(VALIDATION) {
        ErrorKind::Validation
    } else {
        ErrorKind::Execution
    }
}

/// Transient-signature check used by the retry loop.
///
/// Kept deliberately separate from `classify_error`: this list names the
/// concrete failure signatures known to clear up on their own. Billing and
/// budget signatures are an explicit denylist and always win.
pub fn is_transient(err: &anyhow::Error) -> bool {
    let message = normalized_message(err);

    const NEVER: &[&str] = &[
        "billing",
        "credit balance",
        "payment required",
        "budget exceeded",
        "budget exhausted",
        "circuit breaker",
    ];
    if NEVER.iter().any(|n| message.contains(n)) {
        return false;
    }

    const TRANSIENT: &[&str] = &[
        "timed out",
        "timeout",
        "rate limit",
        "429",
        "overloaded",
        "529",
        "connection refused",
        "connection reset",
        "econnreset",
        "socket hang up",
        "temporarily unavailable",
        "service unavailable",
        "502",
        "503",
        "network",
    ];
    if TRANSIENT.iter().any(|n| message.contains(n)) {
        return true;
    }

    // Typed execution failures default to retryable, matching the
    // classification table's default bucket.
    matches!(
        err.downcast_ref::<ConductorError>(),
        Some(ConductorError::Agent(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_str(msg: &str) -> Classification {
        classify_error(&anyhow::anyhow!("{msg}"))
    }

    #[test]
    fn typed_variants_win_over_message_text() {
        // The message mentions "network" but the typed variant is billing.
        let err: anyhow::Error = ConductorError::Billing("network surcharge declined".into()).into();
        let c = classify_error(&err);
        assert_eq!(c.kind, ErrorKind::Billing);
        assert!(!c.retryable);
    }

    #[test]
    fn timeout_and_network_are_retryable() {
        assert_eq!(classify_str("request timed out").kind, ErrorKind::Timeout);
        assert!(classify_str("request timed out").retryable);
        assert_eq!(classify_str("ECONNRESET while reading").kind, ErrorKind::Network);
        assert!(classify_str("ECONNRESET while reading").retryable);
    }

    #[test]
    fn git_and_validation_are_not_retryable() {
        let git = classify_str("git push rejected: non-fast-forward");
        assert_eq!(git.kind, ErrorKind::Git);
        assert!(!git.retryable);

        let val = classify_str("validation failed: filesToModify empty");
        assert_eq!(val.kind, ErrorKind::Validation);
        assert!(!val.retryable);
    }

    #[test]
    fn unmatched_message_defaults_to_execution() {
        let c = classify_str("agent produced nonsense");
        assert_eq!(c.kind, ErrorKind::Execution);
        assert!(c.retryable);
    }

    #[test]
    fn blank_message_is_unknown() {
        let c = classify_str("   ");
        assert_eq!(c.kind, ErrorKind::Unknown);
        assert!(!c.retryable);
    }

    #[test]
    fn circuit_open_is_terminal() {
        let err: anyhow::Error = ConductorError::CircuitOpen { retry_after_ms: 500 }.into();
        let c = classify_error(&err);
        assert_eq!(c.kind, ErrorKind::CircuitBreaker);
        assert!(!c.retryable);
    }

    #[test]
    fn transient_check_is_independent_of_classification() {
        // "rate limit" is transient for the retry loop but classifies as
        // execution (default bucket).
        let err = anyhow::anyhow!("api rate limit reached");
        assert!(is_transient(&err));
        assert_eq!(classify_error(&err).kind, ErrorKind::Execution);
    }

    #[test]
    fn billing_is_never_transient() {
        let err = anyhow::anyhow!("your credit balance is too low");
        assert!(!is_transient(&err));
        assert_eq!(classify_error(&err).kind, ErrorKind::Billing);
    }

    #[test]
    fn source_chain_is_searched() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
        let err = anyhow::Error::new(io).context("fetching agent response");
        assert_eq!(classify_error(&err).kind, ErrorKind::Network);
        assert!(is_transient(&err));
    }
}
