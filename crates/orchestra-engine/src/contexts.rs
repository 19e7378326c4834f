// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Collaborators shared by every process runtime of an engine.

use std::fmt;
use std::sync::Arc;

use crate::binding::BindingContext;
use crate::expression::ExpressionLanguageProvider;
use crate::interpreter::{ExchangeInterceptor, Interpreter};
use crate::persistence::Store;
use crate::scheduler::Scheduler;
use crate::transaction::TransactionManager;

/// Engine collaborators.
#[derive(Clone)]
pub struct Contexts {
    /// Store for persistent processes.
    pub store: Arc<dyn Store>,
    /// Job scheduler.
    pub scheduler: Arc<dyn Scheduler>,
    /// Endpoint activation and partner channels.
    pub bindings: Arc<dyn BindingContext>,
    /// Transaction manager.
    pub transactions: Arc<dyn TransactionManager>,
    /// Process interpreter.
    pub interpreter: Arc<dyn Interpreter>,
    /// Expression language provider used during hydration.
    pub expressions: Arc<dyn ExpressionLanguageProvider>,
    /// Interceptors consulted before routing, in order.
    pub interceptors: Vec<Arc<dyn ExchangeInterceptor>>,
    /// Idle instance workers kept per process.
    pub worker_cache_capacity: usize,
}

impl fmt::Debug for Contexts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contexts")
            .field("store", &"...")
            .field("scheduler", &"...")
            .field("bindings", &"...")
            .field("transactions", &"...")
            .field("interpreter", &"...")
            .field("expressions", &"...")
            .field("interceptors", &self.interceptors.len())
            .field("worker_cache_capacity", &self.worker_cache_capacity)
            .finish()
    }
}
