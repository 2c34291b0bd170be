//! Reconciliation pass primitives.
//!
//! This library provides the building blocks of a level-triggered
//! reconciliation pass:
//!
//! - **Phases**: where a pass is in its allocate → publish → verify sequence.
//! - **Compensation**: side effects committed during a pass, undone in
//!   reverse order when a later step fails.
//! - **Requeue backoff**: bounded, growing delays for transient failures.
//! - **Content digests**: fingerprints used to skip republishing unchanged
//!   configuration.
//!
//! # Invariants
//!
//! - Every step of a pass is idempotent, so a pass may be re-entered from
//!   the start after a crash
//! - Compensating actions run at most once, newest first
//! - Backoff delays never exceed the configured maximum

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation primitive errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Invalid backoff configuration.
    #[error("invalid backoff: {0}")]
    InvalidBackoff(String),
}

// ============================================================================
// Phases
// ============================================================================

/// Phase of a single reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Pass accepted, no side effects yet.
    Pending,

    /// Obtaining (or looking up) the address allocation.
    Allocating,

    /// Pushing configuration to the external appliance.
    Publishing,

    /// Reporting the assigned address back to the service.
    Verifying,

    /// Service is served by the appliance at its assigned address.
    Converged,

    /// Tearing down allocation and external configuration.
    Deleting,

    /// All resources for the service are gone.
    Released,

    /// Pass aborted; committed side effects were compensated.
    Failed,
}

impl Phase {
    /// Stable lowercase label for logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Allocating => "allocating",
            Self::Publishing => "publishing",
            Self::Verifying => "verifying",
            Self::Converged => "converged",
            Self::Deleting => "deleting",
            Self::Released => "released",
            Self::Failed => "failed",
        }
    }

    /// Returns true if a pass ends in this phase.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Converged | Self::Released | Self::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Compensation
// ============================================================================

/// Ordered list of compensating actions accumulated during one pass.
///
/// Actions are recorded after the side effect they undo has been committed.
/// On failure the caller drains them with [`CompensationLog::unwind`] and
/// executes each one; on success it calls [`CompensationLog::commit`].
#[derive(Debug)]
pub struct CompensationLog<A> {
    actions: Vec<A>,
}

impl<A> CompensationLog<A> {
    /// Create an empty log.
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Record a compensating action for a committed side effect.
    pub fn record(&mut self, action: A) {
        self.actions.push(action);
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if nothing needs compensating.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Forget all actions; the pass succeeded.
    pub fn commit(&mut self) {
        self.actions.clear();
    }

    /// Take all actions, newest first.
    pub fn unwind(&mut self) -> Vec<A> {
        let mut actions = std::mem::take(&mut self.actions);
        actions.reverse();
        actions
    }
}

impl<A> Default for CompensationLog<A> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Requeue backoff
// ============================================================================

/// Default first requeue delay.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Default requeue delay cap.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// Default window after which an idle failure streak is forgotten.
pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Per-resource exponential requeue delays.
#[derive(Debug, Clone)]
pub struct RequeueBackoff {
    base: Duration,
    max: Duration,
    reset_window: Duration,

    /// Tracked failures: resource_key -> (consecutive count, last failure).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RequeueBackoff {
    /// Create a backoff tracker.
    pub fn new(base: Duration, max: Duration, reset_window: Duration) -> Result<Self, ReconcileError> {
        if base.is_zero() {
            return Err(ReconcileError::InvalidBackoff("base delay must be non-zero".into()));
        }
        if max < base {
            return Err(ReconcileError::InvalidBackoff(format!(
                "max {max:?} is below base {base:?}"
            )));
        }

        Ok(Self {
            base,
            max,
            reset_window,
            failures: BTreeMap::new(),
        })
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self, resource_key: &str) -> Duration {
        let now = Instant::now();

        let (count, last) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        if now.duration_since(*last) > self.reset_window {
            *count = 0;
        }

        *count = count.saturating_add(1);
        *last = now;

        let exponent = (*count - 1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    /// Number of consecutive failures recorded for a resource.
    pub fn attempts(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).map_or(0, |(count, _)| *count)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune entries idle for longer than the reset window.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.reset_window;
        self.failures
            .retain(|_, (_, last)| now.duration_since(*last) <= window);
    }
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            reset_window: DEFAULT_RESET_WINDOW,
            failures: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Content digests
// ============================================================================

/// Fingerprint of rendered configuration content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the digest of a byte string.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the digest string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_compensation_unwinds_newest_first() {
        let mut log = CompensationLog::new();
        log.record("release-ip");
        log.record("remove-config");
        assert_eq!(log.len(), 2);

        assert_eq!(log.unwind(), vec!["remove-config", "release-ip"]);
        assert!(log.is_empty());
        assert!(log.unwind().is_empty());
    }

    #[test]
    fn test_compensation_commit_forgets() {
        let mut log = CompensationLog::new();
        log.record(1);
        log.commit();
        assert!(log.unwind().is_empty());
    }

    #[rstest]
    #[case(1, 5)]
    #[case(2, 10)]
    #[case(3, 20)]
    #[case(6, 160)]
    #[case(7, 300)]
    #[case(40, 300)]
    fn test_backoff_growth(#[case] failures: u32, #[case] expected_secs: u64) {
        let mut backoff = RequeueBackoff::default();
        let mut delay = Duration::ZERO;
        for _ in 0..failures {
            delay = backoff.next_delay("default/web");
        }
        assert_eq!(delay, Duration::from_secs(expected_secs));
        assert_eq!(backoff.attempts("default/web"), failures);
    }

    #[test]
    fn test_backoff_clear_and_isolation() {
        let mut backoff = RequeueBackoff::default();
        backoff.next_delay("a/x");
        backoff.next_delay("a/x");
        assert_eq!(backoff.next_delay("b/y"), DEFAULT_BACKOFF_BASE);

        backoff.clear("a/x");
        assert_eq!(backoff.attempts("a/x"), 0);
        assert_eq!(backoff.next_delay("a/x"), DEFAULT_BACKOFF_BASE);
    }

    #[test]
    fn test_backoff_prune_with_zero_window() {
        let mut backoff =
            RequeueBackoff::new(Duration::from_millis(10), Duration::from_secs(1), Duration::ZERO)
                .unwrap();
        backoff.next_delay("a/x");
        std::thread::sleep(Duration::from_millis(2));
        backoff.prune();
        assert_eq!(backoff.attempts("a/x"), 0);
    }

    #[test]
    fn test_backoff_rejects_bad_config() {
        assert!(RequeueBackoff::new(Duration::ZERO, Duration::from_secs(1), DEFAULT_RESET_WINDOW).is_err());
        assert!(RequeueBackoff::new(Duration::from_secs(2), Duration::from_secs(1), DEFAULT_RESET_WINDOW).is_err());
    }

    #[test]
    fn test_content_digest() {
        let a = ContentDigest::of(b"stream {}\n");
        let b = ContentDigest::of(b"stream {}\n");
        let c = ContentDigest::of(b"stream { }\n");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.as_str().starts_with("sha256:"));
        assert_eq!(a.as_str().len(), "sha256:".len() + 32);
    }

    #[test]
    fn test_phase_terminality() {
        assert!(Phase::Converged.is_terminal());
        assert!(Phase::Released.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Publishing.is_terminal());
        assert_eq!(Phase::Deleting.to_string(), "deleting");
    }
}
