//! Error types and the `Outcome` sum type for the concurrency runtime core.

use std::fmt;
use thiserror::Error;

use crate::scope::ScopeId;

/// The result of a delivered cancellation: the scope whose deadline or
/// explicit `cancel()` produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled {
    pub(crate) scope: ScopeId,
}

impl Cancelled {
    pub(crate) fn new(scope: ScopeId) -> Self {
        Cancelled { scope }
    }

    /// The scope this cancellation originated from.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cancelled by scope {:?}", self.scope)
    }
}

/// Errors produced by the injection queue's entry points (`run_sync_soon`).
#[derive(Debug, Error, Clone)]
pub enum InjectionError {
    /// Posting to the queue after the drain task has closed it.
    #[error("run finished")]
    RunFinished,

    /// Returned by non-blocking attempts inside sync primitives built on
    /// this core. The core itself never returns this; it is reserved
    /// vocabulary for collaborators outside the core's scope.
    #[error("would block")]
    WouldBlock,
}

/// The core error type: everything that can flow out of a task, a nursery,
/// or `run()` itself.
#[derive(Debug, Error)]
pub enum RunError {
    /// A delivered cancellation. Normally absorbed by the scope that
    /// produced it; only escapes if code manually discards the scope
    /// guard without running its exit filter.
    #[error("{0}")]
    Cancelled(Cancelled),

    /// Several concurrent failures crossing one propagation boundary.
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// Injection-queue specific failure.
    #[error(transparent)]
    Injection(#[from] InjectionError),

    /// An unexpected failure from the reactor, an injected callback, or a
    /// system task. Fatal: the run tears down and this re-raises at the
    /// caller of `run()`.
    #[error("internal runtime error: {0}")]
    Internal(String),

    /// `ki_pending` was still set once the run's task set emptied.
    #[error("keyboard interrupt")]
    KeyboardInterrupt,
}

impl RunError {
    /// True if this is a `Cancelled` whose origin is exactly `scope`.
    pub(crate) fn cancelled_by(&self, scope: ScopeId) -> bool {
        matches!(self, RunError::Cancelled(c) if c.scope == scope)
    }
}

/// A container grouping several concurrent failures. Always holds at least
/// two causes once constructed through [`AggregateError::collect`] — a
/// single cause collapses back to a plain [`RunError`] instead of wrapping.
#[derive(Debug)]
pub struct AggregateError {
    causes: Vec<RunError>,
}

impl AggregateError {
    /// Build the appropriate error from a list of causes gathered at one
    /// propagation boundary (a nursery close being the dominant case).
    /// Returns `None` for an empty list, `Some(cause)` unwrapped for a
    /// single cause, and `Some(RunError::Aggregate(..))` otherwise. Any
    /// cause that is itself an aggregate is flattened one level so
    /// aggregates never nest.
    pub fn collect(causes: Vec<RunError>) -> Option<RunError> {
        let mut flat = Vec::with_capacity(causes.len());
        for cause in causes {
            match cause {
                RunError::Aggregate(agg) => flat.extend(agg.causes),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.into_iter().next(),
            _ => Some(RunError::Aggregate(AggregateError { causes: flat })),
        }
    }

    /// The underlying causes, in collection order.
    pub fn causes(&self) -> &[RunError] {
        &self.causes
    }

    pub(crate) fn into_causes(self) -> Vec<RunError> {
        self.causes
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} concurrent failures: ", self.causes.len())?;
        for (i, cause) in self.causes.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// A sum-type value carrying either a success value or a failure cause.
///
/// `Outcome` is the vocabulary this core uses for "the final state of a
/// task" and for "what to resume a suspended task with". It is distinct
/// from `Result` in owning `capture`/`combine`, but converts freely at API
/// boundaries.
#[derive(Debug)]
pub enum Outcome<T> {
    Value(T),
    Error(RunError),
}

impl<T> Outcome<T> {
    /// Run `f`, capturing its return as `Value` or, if `f` itself returns a
    /// `Result`-shaped failure via `TryFrom`/`?` inside the closure, as
    /// `Error`. For closures that cannot fail, prefer constructing
    /// `Outcome::Value` directly.
    pub fn capture(f: impl FnOnce() -> Result<T, RunError>) -> Self {
        match f() {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Error(e),
        }
    }

    /// Returns the success value, or re-raises the failure cause as an
    /// `Err`. Named `unwrap` to match the source vocabulary; unlike
    /// `Result::unwrap` this never panics — it returns a `Result`.
    pub fn unwrap(self) -> Result<T, RunError> {
        match self {
            Outcome::Value(v) => Ok(v),
            Outcome::Error(e) => Err(e),
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Outcome::Value(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Value(v) => Outcome::Value(f(v)),
            Outcome::Error(e) => Outcome::Error(e),
        }
    }
}

impl<T> From<Result<T, RunError>> for Outcome<T> {
    fn from(r: Result<T, RunError>) -> Self {
        match r {
            Ok(v) => Outcome::Value(v),
            Err(e) => Outcome::Error(e),
        }
    }
}

impl<T> From<Outcome<T>> for Result<T, RunError> {
    fn from(o: Outcome<T>) -> Self {
        o.unwrap()
    }
}

/// Chains two fallible outcomes so that neither error cause is lost: if
/// both `a` and `b` failed, the result is an aggregate of both causes; if
/// only one failed, that cause propagates; if neither failed, `b`'s value
/// is kept (mirroring the "next statement supersedes" behavior of
/// sequential code that both produced a value).
pub fn combine<T>(a: Outcome<()>, b: Outcome<T>) -> Outcome<T> {
    match (a, b) {
        (Outcome::Value(()), b) => b,
        (Outcome::Error(ea), Outcome::Value(v)) => {
            let _ = v;
            Outcome::Error(ea)
        }
        (Outcome::Error(ea), Outcome::Error(eb)) => {
            match AggregateError::collect(vec![ea, eb]) {
                Some(e) => Outcome::Error(e),
                None => unreachable!("two causes never collapse to none"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn capture_roundtrips_value() {
        let o = Outcome::capture(|| Ok::<_, RunError>(42));
        assert_eq!(o.unwrap().unwrap(), 42);
    }

    #[test]
    fn capture_roundtrips_error() {
        let o: Outcome<i32> = Outcome::capture(|| Err(RunError::Internal("boom".into())));
        assert!(o.unwrap().is_err());
    }

    #[test]
    fn aggregate_collapses_to_singleton() {
        let single = AggregateError::collect(vec![RunError::Internal("x".into())]).unwrap();
        assert!(matches!(single, RunError::Internal(_)));
    }

    #[test]
    fn aggregate_empty_collapses_to_none() {
        assert!(AggregateError::collect(vec![]).is_none());
    }

    #[test]
    fn aggregate_flattens_one_level() {
        let inner = AggregateError::collect(vec![
            RunError::Internal("a".into()),
            RunError::Internal("b".into()),
        ])
        .unwrap();
        let outer = AggregateError::collect(vec![inner, RunError::Internal("c".into())]).unwrap();
        match outer {
            RunError::Aggregate(agg) => assert_eq!(agg.causes().len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn combine_never_loses_an_error() {
        let a = Outcome::<()>::Error(RunError::Internal("a".into()));
        let b = Outcome::<i32>::Error(RunError::Internal("b".into()));
        match combine(a, b) {
            Outcome::Error(RunError::Aggregate(agg)) => assert_eq!(agg.causes().len(), 2),
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }
}
