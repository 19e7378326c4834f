// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable engine hosting deployed processes.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use orchestra_engine::{DeploymentConfig, Engine, FileDefinition};
//!
//! let engine = Engine::builder()
//!     .bindings(Arc::new(MyBindings::new()))
//!     .interpreter(Arc::new(MyInterpreter::new()))
//!     .build()?;
//!
//! let conf = DeploymentConfig::new("{urn:shop}order", Arc::new(FileDefinition::new("order.json")));
//! engine.register(conf).await?;
//! let _sweeper = engine.spawn_sweeper();
//!
//! // Scheduler deliveries:
//! engine.handle_work_event(job)?.wait().await?;
//!
//! engine.shutdown().await;
//! ```

use anyhow::anyhow;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::binding::BindingContext;
use crate::config::EngineConfig;
use crate::contexts::Contexts;
use crate::deployment::DeploymentConfig;
use crate::error::{EngineError, Result};
use crate::expression::{BuiltinLanguages, ExpressionLanguageProvider};
use crate::ids::ProcessId;
use crate::interpreter::{ExchangeInterceptor, Interpreter};
use crate::persistence::{MemoryStore, Store};
use crate::process::ProcessRuntime;
use crate::scheduler::{JobInfo, MemoryScheduler, Scheduler};
use crate::transaction::{TaskLocalTransactions, TransactionManager};
use crate::work_event::WorkEvent;
use crate::worker::WorkCompletion;

/// Builder for an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    scheduler: Option<Arc<dyn Scheduler>>,
    bindings: Option<Arc<dyn BindingContext>>,
    transactions: Option<Arc<dyn TransactionManager>>,
    interpreter: Option<Arc<dyn Interpreter>>,
    expressions: Option<Arc<dyn ExpressionLanguageProvider>>,
    interceptors: Vec<Arc<dyn ExchangeInterceptor>>,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("scheduler", &self.scheduler.as_ref().map(|_| "..."))
            .field("bindings", &self.bindings.as_ref().map(|_| "..."))
            .field("transactions", &self.transactions.as_ref().map(|_| "..."))
            .field("interpreter", &self.interpreter.as_ref().map(|_| "..."))
            .field("expressions", &self.expressions.as_ref().map(|_| "..."))
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

impl EngineBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine configuration.
    ///
    /// Default: [`EngineConfig::default`]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the durable store.
    ///
    /// Default: a [`MemoryStore`]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the job scheduler.
    ///
    /// Default: a [`MemoryScheduler`] on the engine's transaction manager
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Set the binding context (required).
    pub fn bindings(mut self, bindings: Arc<dyn BindingContext>) -> Self {
        self.bindings = Some(bindings);
        self
    }

    /// Set the transaction manager.
    ///
    /// Default: [`TaskLocalTransactions`]
    pub fn transactions(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = Some(transactions);
        self
    }

    /// Set the interpreter (required).
    pub fn interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    /// Set the expression language provider.
    ///
    /// Default: [`BuiltinLanguages`]
    pub fn expressions(mut self, expressions: Arc<dyn ExpressionLanguageProvider>) -> Self {
        self.expressions = Some(expressions);
        self
    }

    /// Add an exchange interceptor. Interceptors run in the order added.
    pub fn interceptor(mut self, interceptor: Arc<dyn ExchangeInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Build the engine.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> anyhow::Result<Engine> {
        let bindings = self
            .bindings
            .ok_or_else(|| anyhow!("binding context is required"))?;
        let interpreter = self
            .interpreter
            .ok_or_else(|| anyhow!("interpreter is required"))?;

        let transactions = self
            .transactions
            .unwrap_or_else(|| Arc::new(TaskLocalTransactions::new()));
        let scheduler = self
            .scheduler
            .unwrap_or_else(|| Arc::new(MemoryScheduler::new(Arc::clone(&transactions))));

        let contexts = Contexts {
            store: self.store.unwrap_or_else(|| Arc::new(MemoryStore::new())),
            scheduler,
            bindings,
            transactions,
            interpreter,
            expressions: self.expressions.unwrap_or_else(|| Arc::new(BuiltinLanguages)),
            interceptors: self.interceptors,
            worker_cache_capacity: self.config.worker_cache_capacity,
        };

        Ok(Engine {
            contexts,
            config: self.config,
            processes: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Hosts the process runtimes of one node.
///
/// Call [`shutdown`](Self::shutdown) to deactivate every process and stop the sweeper.
#[derive(Debug)]
pub struct Engine {
    contexts: Contexts,
    config: EngineConfig,
    processes: DashMap<ProcessId, ProcessRuntime>,
    shutdown: CancellationToken,
}

impl Engine {
    /// Create a new builder for configuring the engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Shared collaborators.
    pub fn contexts(&self) -> &Contexts {
        &self.contexts
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Deploy a process and activate its endpoints.
    pub async fn register(&self, conf: DeploymentConfig) -> Result<ProcessRuntime> {
        let process_id = conf.process_id.clone();
        if self.processes.contains_key(&process_id) {
            return Err(EngineError::Configuration {
                process_id,
                message: "process is already registered".to_string(),
            });
        }

        let runtime = ProcessRuntime::new(conf, self.contexts.clone());
        runtime.activate().await?;
        self.processes.insert(process_id.clone(), runtime.clone());
        info!(process_id = %process_id, "Process registered");
        Ok(runtime)
    }

    /// Undeploy a process. Returns `false` if it was not registered.
    pub async fn unregister(&self, process_id: &ProcessId) -> Result<bool> {
        let Some((_, runtime)) = self.processes.remove(process_id) else {
            return Ok(false);
        };
        runtime.deactivate().await?;
        runtime.workers().shutdown();
        runtime.dehydrate().await?;
        info!(process_id = %process_id, "Process unregistered");
        Ok(true)
    }

    /// Runtime of a registered process.
    pub fn process(&self, process_id: &ProcessId) -> Option<ProcessRuntime> {
        self.processes.get(process_id).map(|entry| entry.value().clone())
    }

    /// Ids of every registered process.
    pub fn process_ids(&self) -> Vec<ProcessId> {
        self.processes.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Runtime of the process providing `service`.
    pub fn route_for_service(&self, service: &str) -> Option<ProcessRuntime> {
        self.processes
            .iter()
            .find(|entry| entry.value().provides_service(service))
            .map(|entry| entry.value().clone())
    }

    /// Dispatch a scheduler job to the process it targets.
    ///
    /// Must be called outside any transaction.
    pub fn handle_work_event(&self, job: JobInfo) -> Result<WorkCompletion> {
        let event = WorkEvent::from_job(&job)?;
        let runtime = self
            .process(event.process_id())
            .ok_or_else(|| EngineError::ProcessNotFound(event.process_id().clone()))?;
        runtime.handle_work_event(job)
    }

    /// Dehydrate processes that sat idle or exceed the hydrated process cap.
    ///
    /// Processes with outstanding leases are skipped. Returns how many
    /// processes were dehydrated.
    pub async fn sweep_idle(&self) -> usize {
        let now = chrono::Utc::now();
        let mut hydrated: Vec<ProcessRuntime> = self
            .processes
            .iter()
            .filter(|entry| entry.value().hint_is_hydrated())
            .map(|entry| entry.value().clone())
            .collect();
        hydrated.sort_by_key(|runtime| runtime.last_used());

        let over_cap = self
            .config
            .max_hydrated_processes
            .map_or(0, |cap| hydrated.len().saturating_sub(cap));

        let mut dehydrated = 0;
        for (position, runtime) in hydrated.iter().enumerate() {
            let idle = self.config.dehydration_idle.is_some_and(|idle| {
                (now - runtime.last_used())
                    .to_std()
                    .is_ok_and(|elapsed| elapsed >= idle)
            });
            if !idle && position >= over_cap {
                continue;
            }
            match runtime.try_dehydrate().await {
                Ok(true) => dehydrated += 1,
                Ok(false) => debug!(process_id = %runtime.process_id(), "Process busy; not dehydrated"),
                Err(e) => warn!(process_id = %runtime.process_id(), error = %e, "Dehydration failed"),
            }
        }
        if dehydrated > 0 {
            debug!(dehydrated, "Dehydration sweep finished");
        }
        dehydrated
    }

    /// Run [`sweep_idle`](Self::sweep_idle) periodically until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        let interval = self.config.dehydration_poll_interval;
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Dehydration sweeper started");
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!("Dehydration sweeper received shutdown signal");
                        break;
                    }

                    _ = tokio::time::sleep(interval) => {
                        engine.sweep_idle().await;
                    }
                }
            }
        })
    }

    /// Stop the sweeper and deactivate every process.
    pub async fn shutdown(&self) {
        info!("Engine shutting down...");
        self.shutdown.cancel();
        for process_id in self.process_ids() {
            if let Err(e) = self.unregister(&process_id).await {
                warn!(process_id = %process_id, error = %e, "Failed to unregister process during shutdown");
            }
        }
        info!("Engine shutdown complete");
    }
}
