//! Error taxonomy and retry/circuit-breaking policy.
//!
//! Every failure that crosses a plane boundary in Genesis is one of the
//! [`GenesisError`] kinds. RPC replies carry the kind name as a stable string
//! prefix (`"Timeout: deadline exceeded ..."`) so that peers written against a
//! different build can still classify the failure. Errors local to one hop are
//! embedded in the reply; orchestrator-level errors surface in the final reply
//! to the caller.
//!
//! The policy types live here too: [`RetryPolicy`] (exponential backoff with a
//! bounded budget, used when re-publishing advertisements and when retrying
//! idempotent tool calls) and [`CircuitBreaker`] (per-target failure tracking
//! so a degraded peer stops receiving traffic for a cool-down period).

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Unified error type for all Genesis planes.
///
/// The variants mirror the runtime's failure taxonomy one-to-one; each carries
/// a human-readable message. Use [`GenesisError::kind`] for the stable wire
/// name and [`GenesisError::to_wire`] / [`GenesisError::from_wire`] when
/// crossing an RPC boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum GenesisError {
    /// The transport cannot publish or subscribe at all. Fatal for the
    /// offending participant.
    TransportUnavailable(String),
    /// A request was issued to a service class or participant that is not
    /// currently known.
    NotRouted(String),
    /// Deadline exceeded while awaiting a reply.
    Timeout(String),
    /// An RPC tool call returned a non-zero status or exhausted its retries.
    ToolCallFailed(String),
    /// The orchestrator hit its hop cap without a terminal text response.
    ToolLoopExceeded(usize),
    /// No function, agent, or default-capable agent matched the request.
    NoCapableProvider(String),
    /// The LLM adapter signaled a provider-level failure.
    LlmUnavailable(String),
    /// An advertisement payload or RPC arguments failed schema validation.
    /// Always refused at the boundary; never propagates through the
    /// orchestrator.
    SchemaViolation(String),
    /// The participant has entered DEGRADED.
    Degraded(String),
    /// A lifecycle transition that the participant state machine forbids.
    /// Local to the process; never crosses the wire.
    IllegalTransition { from: String, to: String },
    /// Configuration could not be loaded or parsed.
    Configuration(String),
}

impl GenesisError {
    /// Stable wire name for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GenesisError::TransportUnavailable(_) => "TransportUnavailable",
            GenesisError::NotRouted(_) => "NotRouted",
            GenesisError::Timeout(_) => "Timeout",
            GenesisError::ToolCallFailed(_) => "ToolCallFailed",
            GenesisError::ToolLoopExceeded(_) => "ToolLoopExceeded",
            GenesisError::NoCapableProvider(_) => "NoCapableProvider",
            GenesisError::LlmUnavailable(_) => "LLMUnavailable",
            GenesisError::SchemaViolation(_) => "SchemaViolation",
            GenesisError::Degraded(_) => "Degraded",
            GenesisError::IllegalTransition { .. } => "IllegalTransition",
            GenesisError::Configuration(_) => "Configuration",
        }
    }

    /// Encode for an RPC reply: a non-zero status and a `"Kind: message"`
    /// error string.
    pub fn to_wire(&self) -> (i32, String) {
        (1, format!("{}: {}", self.kind(), self.message()))
    }

    /// Decode an error string produced by [`GenesisError::to_wire`].
    ///
    /// Unrecognized kinds fall back to [`GenesisError::ToolCallFailed`] so a
    /// newer peer's error is still classified as a tool failure rather than
    /// dropped.
    pub fn from_wire(error: &str) -> GenesisError {
        let (kind, message) = match error.find(": ") {
            Some(idx) => (&error[..idx], error[idx + 2..].to_string()),
            None => (error, String::new()),
        };
        match kind {
            "TransportUnavailable" => GenesisError::TransportUnavailable(message),
            "NotRouted" => GenesisError::NotRouted(message),
            "Timeout" => GenesisError::Timeout(message),
            "ToolCallFailed" => GenesisError::ToolCallFailed(message),
            "ToolLoopExceeded" => {
                GenesisError::ToolLoopExceeded(message.parse().unwrap_or(0))
            }
            "NoCapableProvider" => GenesisError::NoCapableProvider(message),
            "LLMUnavailable" => GenesisError::LlmUnavailable(message),
            "SchemaViolation" => GenesisError::SchemaViolation(message),
            "Degraded" => GenesisError::Degraded(message),
            _ => GenesisError::ToolCallFailed(format!("{}: {}", kind, message)),
        }
    }

    fn message(&self) -> String {
        match self {
            GenesisError::TransportUnavailable(m)
            | GenesisError::NotRouted(m)
            | GenesisError::Timeout(m)
            | GenesisError::ToolCallFailed(m)
            | GenesisError::NoCapableProvider(m)
            | GenesisError::LlmUnavailable(m)
            | GenesisError::SchemaViolation(m)
            | GenesisError::Degraded(m)
            | GenesisError::Configuration(m) => m.clone(),
            GenesisError::ToolLoopExceeded(hops) => hops.to_string(),
            GenesisError::IllegalTransition { from, to } => format!("{} -> {}", from, to),
        }
    }
}

impl fmt::Display for GenesisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenesisError::TransportUnavailable(m) => write!(f, "Transport unavailable: {}", m),
            GenesisError::NotRouted(m) => write!(f, "Not routed: {}", m),
            GenesisError::Timeout(m) => write!(f, "Timeout: {}", m),
            GenesisError::ToolCallFailed(m) => write!(f, "Tool call failed: {}", m),
            GenesisError::ToolLoopExceeded(hops) => {
                write!(f, "Tool loop exceeded after {} hops", hops)
            }
            GenesisError::NoCapableProvider(m) => write!(f, "No capable provider: {}", m),
            GenesisError::LlmUnavailable(m) => write!(f, "LLM unavailable: {}", m),
            GenesisError::SchemaViolation(m) => write!(f, "Schema violation: {}", m),
            GenesisError::Degraded(m) => write!(f, "Participant degraded: {}", m),
            GenesisError::IllegalTransition { from, to } => {
                write!(f, "Illegal lifecycle transition: {} -> {}", from, to)
            }
            GenesisError::Configuration(m) => write!(f, "Configuration error: {}", m),
        }
    }
}

impl Error for GenesisError {}

/// Exponential backoff with a bounded attempt budget.
///
/// Attempt numbering is zero-based: `delay_for(0)` is the pause before the
/// first retry. The delay doubles per attempt and saturates at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (the initial try plus retries).
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(0),
            max_delay: Duration::from_millis(0),
        }
    }

    /// Backoff to sleep before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Default)]
struct BreakerEntry {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Per-target circuit breaker.
///
/// Counts consecutive failures per target id; once `threshold` is reached the
/// target is "open" for `cooldown` and callers should skip it. A success at
/// any point resets the count. State mutation is serialized behind one mutex;
/// lookups are O(1) per target.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    targets: Mutex<HashMap<String, BreakerEntry>>,
}

impl CircuitBreaker {
    /// Create a breaker that opens after `threshold` consecutive failures and
    /// stays open for `cooldown`.
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful exchange with `target`, closing its circuit.
    pub fn record_success(&self, target: &str) {
        let mut targets = self.targets.lock().unwrap();
        targets.remove(target);
    }

    /// Record a failed exchange with `target`. Returns `true` if this failure
    /// opened the circuit.
    pub fn record_failure(&self, target: &str) -> bool {
        let mut targets = self.targets.lock().unwrap();
        let entry = targets.entry(target.to_string()).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold {
            entry.open_until = Some(Instant::now() + self.cooldown);
            true
        } else {
            false
        }
    }

    /// Whether calls to `target` should currently be skipped.
    pub fn is_open(&self, target: &str) -> bool {
        let mut targets = self.targets.lock().unwrap();
        if let Some(entry) = targets.get_mut(target) {
            match entry.open_until {
                Some(until) if Instant::now() < until => true,
                Some(_) => {
                    // Cool-down elapsed; allow one probe through.
                    entry.open_until = None;
                    entry.consecutive_failures = 0;
                    false
                }
                None => false,
            }
        } else {
            false
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_round_trip() {
        let err = GenesisError::Timeout("deadline exceeded after 100ms".to_string());
        let (status, wire) = err.to_wire();
        assert_eq!(status, 1);
        assert_eq!(GenesisError::from_wire(&wire), err);
    }

    #[test]
    fn unknown_kind_degrades_to_tool_call_failed() {
        let parsed = GenesisError::from_wire("FutureKind: something new");
        match parsed {
            GenesisError::ToolCallFailed(m) => assert!(m.contains("FutureKind")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn retry_backoff_doubles_and_saturates() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(10), Duration::from_millis(350));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        assert!(!breaker.record_failure("svc-1"));
        assert!(!breaker.is_open("svc-1"));
        assert!(breaker.record_failure("svc-1"));
        assert!(breaker.is_open("svc-1"));
        breaker.record_success("svc-1");
        assert!(!breaker.is_open("svc-1"));
    }
}
