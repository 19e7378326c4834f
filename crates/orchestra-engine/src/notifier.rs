// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exchange state notifier.
//!
//! Live exchange handles register here to hear about status changes on the
//! exchange they represent. The table holds only weak references: a handle
//! that is dropped stops receiving notifications and its entry is pruned on
//! the next pass over the table. Registration returns a [`ListenerToken`]
//! that unregisters when dropped.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

use crate::exchange::{ExchangeRecord, ExchangeStatus};

/// Receives exchange status changes.
pub trait ExchangeStateListener: Send + Sync {
    /// Called after `exchange` moved from `old` to `new`.
    ///
    /// Invoked outside of the notifier's lock; implementations may call back
    /// into the notifier.
    fn on_state_changed(&self, exchange: &ExchangeRecord, old: ExchangeStatus, new: ExchangeStatus);
}

struct Entry {
    id: u64,
    listener: Weak<dyn ExchangeStateListener>,
}

#[derive(Default)]
struct Table {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Weakly-held listener table.
#[derive(Clone, Default)]
pub struct ExchangeStateNotifier {
    table: Arc<Mutex<Table>>,
}

impl std::fmt::Debug for ExchangeStateNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeStateNotifier")
            .field("entries", &self.table.lock().entries.len())
            .finish()
    }
}

impl ExchangeStateNotifier {
    /// Create an empty notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener without keeping it alive.
    pub fn register(&self, listener: Weak<dyn ExchangeStateListener>) -> ListenerToken {
        let mut table = self.table.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push(Entry { id, listener });
        ListenerToken {
            table: Arc::downgrade(&self.table),
            id,
        }
    }

    /// Remove `listener` and every entry whose listener is gone.
    pub fn unregister<L: ExchangeStateListener + ?Sized>(&self, listener: &Arc<L>) {
        let target = Arc::as_ptr(listener);
        self.table.lock().entries.retain(|entry| {
            entry.listener.strong_count() > 0 && !std::ptr::addr_eq(entry.listener.as_ptr(), target)
        });
    }

    /// Notify live listeners that `exchange` moved from `old` to `new`.
    ///
    /// Does nothing when the status did not change. Returns the number of
    /// listeners notified.
    pub fn fire_state_changed(
        &self,
        exchange: &ExchangeRecord,
        old: ExchangeStatus,
        new: ExchangeStatus,
    ) -> usize {
        if old == new {
            return 0;
        }

        let live: Vec<Arc<dyn ExchangeStateListener>> = {
            let mut table = self.table.lock();
            let mut live = Vec::with_capacity(table.entries.len());
            table.entries.retain(|entry| match entry.listener.upgrade() {
                Some(listener) => {
                    live.push(listener);
                    true
                }
                None => false,
            });
            live
        };

        trace!(
            exchange_id = %exchange.id,
            %old,
            %new,
            listeners = live.len(),
            "Firing exchange state change"
        );
        for listener in &live {
            listener.on_state_changed(exchange, old, new);
        }
        live.len()
    }

    /// Number of registered entries whose listener is still alive.
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.listener.strong_count() > 0)
            .count()
    }

    /// Whether no live listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration handle. Dropping it removes the entry.
#[must_use = "dropping the token unregisters the listener"]
pub struct ListenerToken {
    table: Weak<Mutex<Table>>,
    id: u64,
}

impl ListenerToken {
    /// Unregister now.
    pub fn cancel(self) {
        drop(self);
    }
}

impl std::fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerToken").field("id", &self.id).finish()
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table
                .lock()
                .entries
                .retain(|entry| entry.id != self.id && entry.listener.strong_count() > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Direction, InvocationStyle};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, ExchangeStatus, ExchangeStatus)>>,
    }

    impl ExchangeStateListener for Recorder {
        fn on_state_changed(
            &self,
            exchange: &ExchangeRecord,
            old: ExchangeStatus,
            new: ExchangeStatus,
        ) {
            self.seen.lock().push((exchange.id.clone(), old, new));
        }
    }

    fn exchange() -> ExchangeRecord {
        ExchangeRecord::new("mex-7", Direction::Inbound, InvocationStyle::Unreliable)
    }

    fn weak(recorder: &Arc<Recorder>) -> Weak<dyn ExchangeStateListener> {
        let weak: Weak<Recorder> = Arc::downgrade(recorder);
        weak
    }

    #[test]
    fn test_fires_only_on_change() {
        let notifier = ExchangeStateNotifier::new();
        let recorder = Arc::new(Recorder::default());
        let _token = notifier.register(weak(&recorder));

        let mex = exchange();
        assert_eq!(
            notifier.fire_state_changed(&mex, ExchangeStatus::Active, ExchangeStatus::Active),
            0
        );
        assert_eq!(
            notifier.fire_state_changed(
                &mex,
                ExchangeStatus::Active,
                ExchangeStatus::Acknowledged
            ),
            1
        );

        let seen = recorder.seen.lock();
        assert_eq!(
            *seen,
            vec![(
                "mex-7".to_string(),
                ExchangeStatus::Active,
                ExchangeStatus::Acknowledged
            )]
        );
    }

    #[test]
    fn test_dropped_listener_is_pruned() {
        let notifier = ExchangeStateNotifier::new();
        let kept = Arc::new(Recorder::default());
        let dropped = Arc::new(Recorder::default());
        let _kept_token = notifier.register(weak(&kept));
        let dropped_token = notifier.register(weak(&dropped));
        assert_eq!(notifier.len(), 2);

        drop(dropped);
        assert_eq!(notifier.len(), 1);
        let notified = notifier.fire_state_changed(
            &exchange(),
            ExchangeStatus::Pending,
            ExchangeStatus::Active,
        );
        assert_eq!(notified, 1);
        assert_eq!(kept.seen.lock().len(), 1);

        // Token outliving its listener is harmless.
        drop(dropped_token);
        assert_eq!(notifier.len(), 1);
    }

    #[test]
    fn test_unregister_removes_matching_listener() {
        let notifier = ExchangeStateNotifier::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let _t1 = notifier.register(weak(&first));
        let _t2 = notifier.register(weak(&second));

        notifier.unregister(&first);
        notifier.fire_state_changed(&exchange(), ExchangeStatus::Pending, ExchangeStatus::Active);

        assert!(first.seen.lock().is_empty());
        assert_eq!(second.seen.lock().len(), 1);
    }

    #[test]
    fn test_token_drop_unregisters() {
        let notifier = ExchangeStateNotifier::new();
        let recorder = Arc::new(Recorder::default());
        let token = notifier.register(weak(&recorder));
        token.cancel();

        assert!(notifier.is_empty());
        assert_eq!(
            notifier.fire_state_changed(&exchange(), ExchangeStatus::Pending, ExchangeStatus::Active),
            0
        );
        assert!(recorder.seen.lock().is_empty());
    }
}
