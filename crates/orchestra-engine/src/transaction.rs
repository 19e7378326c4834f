// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transaction manager seam.
//!
//! Routing and work dispatch run their store updates inside a transaction.
//! Work that must only happen once those updates are durable (handing an
//! instance to its worker) is registered with [`TransactionManager::on_commit`].
//!
//! [`TaskLocalTransactions`] tracks the ambient transaction in a task-local,
//! so "inside a transaction" means "inside the future passed to
//! `run_in_transaction`". Tasks spawned from there are outside it.

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{EngineError, Result};

/// Work run inside a transaction.
pub type TxWork = BoxFuture<'static, Result<()>>;

/// Callback run after a successful commit.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// Runs work transactionally.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Run `work` in a transaction, committing when it returns `Ok`.
    ///
    /// Called from inside a transaction, `work` joins the ambient one.
    async fn run_in_transaction(&self, work: TxWork) -> Result<()>;

    /// Whether the calling task is inside a transaction.
    fn is_inside_transaction(&self) -> bool;

    /// Run `callback` after the ambient transaction commits. Callbacks are
    /// dropped on rollback.
    fn on_commit(&self, callback: CommitCallback) -> Result<()>;
}

struct TxScope {
    id: u64,
    on_commit: Mutex<Vec<CommitCallback>>,
}

tokio::task_local! {
    static CURRENT_TX: Arc<TxScope>;
}

/// Transaction manager for stores without their own transactions.
///
/// Commit is the successful completion of the work; rollback only discards
/// the commit callbacks.
#[derive(Debug, Default)]
pub struct TaskLocalTransactions {
    next_id: AtomicU64,
}

impl TaskLocalTransactions {
    /// Create a manager.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionManager for TaskLocalTransactions {
    async fn run_in_transaction(&self, work: TxWork) -> Result<()> {
        if self.is_inside_transaction() {
            return work.await;
        }

        let scope = Arc::new(TxScope {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            on_commit: Mutex::new(Vec::new()),
        });
        let tx_id = scope.id;

        match CURRENT_TX.scope(scope.clone(), work).await {
            Ok(()) => {
                let callbacks = std::mem::take(&mut *scope.on_commit.lock());
                debug!(tx_id, callbacks = callbacks.len(), "Transaction committed");
                for callback in callbacks {
                    callback();
                }
                Ok(())
            }
            Err(e) => {
                debug!(tx_id, error = %e, "Transaction rolled back");
                Err(e)
            }
        }
    }

    fn is_inside_transaction(&self) -> bool {
        CURRENT_TX.try_with(|_| ()).is_ok()
    }

    fn on_commit(&self, callback: CommitCallback) -> Result<()> {
        CURRENT_TX
            .try_with(|scope| scope.on_commit.lock().push(callback))
            .map_err(|_| EngineError::TransactionRequired)
    }
}
