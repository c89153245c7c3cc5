//! Pending results for asynchronous protocol requests.
//!
//! Every request-style operation returns a [`Deferred`]: a handle whose
//! success or error callback fires once the matching server reply arrives.
//! Callbacks are registered fluently, the handle is cheap to clone, and a
//! deferred resolves at most once. The callback slots are `FnOnce` values
//! physically taken on resolution, so a second resolution has nothing left
//! to run and is ignored.
//!
//! A deferred can be constructed in an already-failed state when the call
//! site knows the request cannot be sent (unusable channel, missing role).
//! Such a handle is rejected on the owning channel's next dispatch pass,
//! never from inside the call that created it, so callbacks always fire
//! later rather than re-entrantly.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;

type SuccessFn = Box<dyn FnOnce(Bytes) + Send>;
type ErrorFn = Box<dyn FnOnce(&str) + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Pending,
    Resolved,
}

struct Inner {
    state: State,
    on_success: Option<SuccessFn>,
    on_error: Option<ErrorFn>,
    /// Reason recorded at construction for handles born failed.
    birth_failure: Option<String>,
    /// Dependent operation whose failure follows this one.
    chain: Option<Deferred>,
}

/// Handle to one pending asynchronous result.
#[derive(Clone)]
pub struct Deferred {
    inner: Arc<Mutex<Inner>>,
}

impl Deferred {
    /// Create a pending deferred.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Pending,
                on_success: None,
                on_error: None,
                birth_failure: None,
                chain: None,
            })),
        }
    }

    /// Create a deferred that is destined to fail with `reason`.
    ///
    /// The handle is still pending: the rejection happens on the next
    /// dispatch pass, not here.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        let deferred = Self::new();
        deferred.lock().birth_failure = Some(reason.into());
        deferred
    }

    /// Register the success callback. Later registrations on an already
    /// resolved handle are dropped silently.
    #[must_use]
    pub fn on_success(self, callback: impl FnOnce(Bytes) + Send + 'static) -> Self {
        {
            let mut inner = self.lock();
            if inner.state == State::Pending {
                inner.on_success = Some(Box::new(callback));
            }
        }
        self
    }

    /// Register the error callback.
    #[must_use]
    pub fn on_error(self, callback: impl FnOnce(&str) + Send + 'static) -> Self {
        {
            let mut inner = self.lock();
            if inner.state == State::Pending {
                inner.on_error = Some(Box::new(callback));
            }
        }
        self
    }

    /// Make `next` depend on this deferred: if this one is rejected, `next`
    /// is rejected with the same reason without being re-sent.
    pub fn chain(&self, next: &Deferred) {
        self.lock().chain = Some(next.clone());
    }

    /// Whether the deferred has already resolved (either way).
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.lock().state == State::Resolved
    }

    /// Failure reason recorded at construction, if any.
    pub(crate) fn birth_failure(&self) -> Option<String> {
        self.lock().birth_failure.clone()
    }

    /// Resolve successfully with the reply payload.
    pub(crate) fn resolve(&self, payload: Bytes) {
        let callback = {
            let mut inner = self.lock();
            if inner.state == State::Resolved {
                tracing::debug!("deferred resolved twice; ignoring second resolution");
                return;
            }
            inner.state = State::Resolved;
            inner.on_error = None;
            inner.chain = None;
            inner.on_success.take()
        };
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    /// Resolve with an error, propagating the failure down the chain.
    pub(crate) fn reject(&self, reason: &str) {
        let (callback, chain) = {
            let mut inner = self.lock();
            if inner.state == State::Resolved {
                tracing::debug!("deferred rejected after resolution; ignoring");
                return;
            }
            inner.state = State::Resolved;
            inner.on_success = None;
            (inner.on_error.take(), inner.chain.take())
        };
        if let Some(callback) = callback {
            callback(reason);
        }
        if let Some(chain) = chain {
            chain.reject(reason);
        }
    }
}

impl Default for Deferred {
    fn default() -> Self {
        Self::new()
    }
}

impl Deferred {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("deferred lock")
    }
}
