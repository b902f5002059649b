//! Error types for the keyed heavy-task coordinator

use thiserror::Error;

/// Errors surfaced to a [`crate::manager::KVHeavyTasksManager`] result callback.
///
/// Every variant here is recovered locally to the key that produced it: the
/// manager never panics and never lets one key's failure affect another
/// key's bookkeeping (§7).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError<E> {
    /// The waiting queue was full and this key's record was evicted to make
    /// room for a higher-priority arrival (§4.4.4).
    #[error("key evicted by priority strategy while waiting")]
    EvictedByPriorityStrategy,

    /// The provider itself reported a failure for this key.
    #[error("provider failed: {0}")]
    ProviderFailure(E),
}

impl<E> CoordinatorError<E> {
    /// True if this is an eviction rather than a provider-reported failure.
    pub fn is_eviction(&self) -> bool {
        matches!(self, CoordinatorError::EvictedByPriorityStrategy)
    }

    /// Maps the provider error type, leaving eviction untouched.
    pub fn map_provider_err<F, E2>(self, f: F) -> CoordinatorError<E2>
    where
        F: FnOnce(E) -> E2,
    {
        match self {
            CoordinatorError::EvictedByPriorityStrategy => {
                CoordinatorError::EvictedByPriorityStrategy
            }
            CoordinatorError::ProviderFailure(e) => CoordinatorError::ProviderFailure(f(e)),
        }
    }
}

/// Result alias used by the manager's public, per-key callbacks.
///
/// `Ok(Some(v))` and `Ok(None)` are both successes (a provider may
/// legitimately produce "no value"; DESIGN.md open question (c)). Invalid
/// keys never reach this type directly — the cache contract resolves them
/// to `Ok(None)` before the caller ever sees them (§4.4.8).
pub type FetchResult<V, E> = std::result::Result<Option<V>, CoordinatorError<E>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    #[test]
    fn eviction_is_eviction() {
        let e: CoordinatorError<Boom> = CoordinatorError::EvictedByPriorityStrategy;
        assert!(e.is_eviction());
    }

    #[test]
    fn provider_failure_is_not_eviction() {
        let e = CoordinatorError::ProviderFailure(Boom);
        assert!(!e.is_eviction());
    }

    #[test]
    fn map_provider_err_preserves_eviction() {
        let e: CoordinatorError<Boom> = CoordinatorError::EvictedByPriorityStrategy;
        let mapped = e.map_provider_err(|_| "mapped");
        assert!(matches!(mapped, CoordinatorError::EvictedByPriorityStrategy));
    }

    #[test]
    fn map_provider_err_transforms_failure() {
        let e = CoordinatorError::ProviderFailure(Boom);
        let mapped = e.map_provider_err(|b| format!("{b}"));
        assert!(matches!(mapped, CoordinatorError::ProviderFailure(s) if s == "boom"));
    }
}
