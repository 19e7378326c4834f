// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! N-state lifecycle latch.
//!
//! An [`NStateLatch`] has a fixed number of states, each with an entry action
//! supplied by the caller that asks for it. Any number of holders may share
//! the current state. Moving to a different state waits until every lease on
//! the current one is released, then runs the target state's entry action
//! exactly once while no one else holds the latch.
//!
//! ```text
//!   latch(1) ──► current == 1 ? ──yes──► lease++ ──► LatchGuard
//!                    │ no
//!                    ▼
//!              leases == 0 ? ──no──► wait for release
//!                    │ yes
//!                    ▼
//!              run entry(1) ──ok──► current = 1, lease = 1
//!                    │ err
//!                    ▼
//!              current = none (next latch retries)
//! ```
//!
//! Leases are scoped: a [`LatchGuard`] releases its lease when dropped, so a
//! holder cannot leak one by returning early or failing.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug)]
struct LatchState {
    current: Option<usize>,
    leases: usize,
    transitioning: bool,
}

#[derive(Debug)]
struct Shared {
    states: usize,
    state: Mutex<LatchState>,
    changed: Notify,
}

/// Lifecycle gate with a fixed set of states.
///
/// Cloning yields another handle to the same latch.
#[derive(Debug, Clone)]
pub struct NStateLatch {
    shared: Arc<Shared>,
}

impl NStateLatch {
    /// Create an unlatched latch with `states` states, numbered `0..states`.
    ///
    /// # Panics
    ///
    /// Panics if `states` is zero.
    pub fn new(states: usize) -> Self {
        assert!(states > 0, "a latch needs at least one state");
        Self {
            shared: Arc::new(Shared {
                states,
                state: Mutex::new(LatchState {
                    current: None,
                    leases: 0,
                    transitioning: false,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Acquire a lease on `state`, running `enter` first if the latch is not
    /// already in that state.
    ///
    /// Re-latching the current state only adds a lease. If `enter` fails the
    /// error is returned, the latch is left unlatched, and the next caller for
    /// any state runs its entry action again.
    ///
    /// # Panics
    ///
    /// Panics if `state` is out of range.
    pub async fn latch<F, Fut, E>(&self, state: usize, enter: F) -> Result<LatchGuard, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        assert!(
            state < self.shared.states,
            "latch state {state} out of range (states: {})",
            self.shared.states
        );

        loop {
            // Register interest before inspecting the state so a release
            // between the check and the await is not missed.
            let notified = self.shared.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.shared.state.lock();
                if !st.transitioning {
                    if st.current == Some(state) {
                        st.leases += 1;
                        return Ok(self.guard(state));
                    }
                    if st.leases == 0 {
                        st.transitioning = true;
                        break;
                    }
                }
            }

            notified.await;
        }

        trace!(state, "Running latch entry action");
        let transition = Transition {
            shared: &self.shared,
            target: state,
            armed: true,
        };
        match enter().await {
            Ok(()) => {
                transition.complete(true);
                Ok(self.guard(state))
            }
            Err(e) => {
                transition.complete(false);
                Err(e)
            }
        }
    }

    /// Like [`latch`](Self::latch), but gives up instead of waiting when the
    /// latch is held in another state or mid-transition.
    ///
    /// Returns `None` when the latch was not available.
    pub async fn try_latch<F, Fut, E>(&self, state: usize, enter: F) -> Option<Result<LatchGuard, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        assert!(state < self.shared.states, "latch state {state} out of range");
        {
            let mut st = self.shared.state.lock();
            if st.transitioning {
                return None;
            }
            if st.current == Some(state) {
                st.leases += 1;
                return Some(Ok(self.guard(state)));
            }
            if st.leases > 0 {
                return None;
            }
            st.transitioning = true;
        }

        let transition = Transition {
            shared: &self.shared,
            target: state,
            armed: true,
        };
        Some(match enter().await {
            Ok(()) => {
                transition.complete(true);
                Ok(self.guard(state))
            }
            Err(e) => {
                transition.complete(false);
                Err(e)
            }
        })
    }

    /// Whether `state` is the current state and at least one lease is held.
    pub fn is_latched(&self, state: usize) -> bool {
        let st = self.shared.state.lock();
        st.current == Some(state) && st.leases > 0
    }

    /// The state whose entry action last completed, if any.
    pub fn current_state(&self) -> Option<usize> {
        self.shared.state.lock().current
    }

    /// Number of outstanding leases on the current state.
    pub fn leases(&self) -> usize {
        self.shared.state.lock().leases
    }

    fn guard(&self, state: usize) -> LatchGuard {
        LatchGuard {
            shared: Arc::clone(&self.shared),
            state,
        }
    }
}

/// Tracks an in-flight entry action. If the latching future is dropped while
/// the entry action is running the latch falls back to unlatched.
struct Transition<'a> {
    shared: &'a Shared,
    target: usize,
    armed: bool,
}

impl Transition<'_> {
    fn complete(mut self, entered: bool) {
        self.armed = false;
        {
            let mut st = self.shared.state.lock();
            st.transitioning = false;
            if entered {
                st.current = Some(self.target);
                st.leases = 1;
            } else {
                st.current = None;
            }
        }
        self.shared.changed.notify_waiters();
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut st = self.shared.state.lock();
                st.transitioning = false;
                st.current = None;
            }
            self.shared.changed.notify_waiters();
        }
    }
}

/// A lease on one latch state. Dropping it releases the lease.
#[must_use = "dropping the guard releases the lease immediately"]
#[derive(Debug)]
pub struct LatchGuard {
    shared: Arc<Shared>,
    state: usize,
}

impl LatchGuard {
    /// The state this lease holds.
    pub fn state(&self) -> usize {
        self.state
    }

    /// Release the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LatchGuard {
    fn drop(&mut self) {
        let drained = {
            let mut st = self.shared.state.lock();
            debug_assert_eq!(st.current, Some(self.state));
            st.leases = st.leases.saturating_sub(1);
            st.leases == 0
        };
        if drained {
            self.shared.changed.notify_waiters();
        }
    }
}
