// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process runtime.
//!
//! A [`ProcessRuntime`] hosts one deployed process. Its derived state (the
//! decoded definition, expression runtimes and role bindings) exists only
//! while the process is hydrated:
//!
//! ```text
//!            lease()                          dehydrate()
//!  ┌────────────┐  waits for no leases  ┌──────────┐  waits for no leases
//!  │ DEHYDRATED │ ───────────────────►  │ HYDRATED │ ─────────────────────► DEHYDRATED
//!  └────────────┘   runs hydrate entry  └──────────┘   drops derived state
//! ```
//!
//! Every operation that reads derived state holds a [`ProcessLease`] for its
//! whole duration, so dehydration never pulls state out from under it.
//! Partner channels and activated my-role addresses are kept across
//! dehydration; they are created once and re-attached on every hydration.
//!
//! Submodules add the runtime's entry points:
//! - `router`: inbound message routing (`invoke_process`)
//! - `dispatcher`: scheduled work events (`handle_work_event`)
//! - `handle`: client-side my-role exchange handles

mod context;
mod dispatcher;
mod handle;
mod router;

pub use self::context::ExecutionContext;
pub use self::handle::{ExchangeView, MyRoleExchange};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::binding::PartnerRoleChannel;
use crate::contexts::Contexts;
use crate::definition::{self, ProcessDefinition, PropertyAlias};
use crate::deployment::{DeploymentConfig, Endpoint, EndpointReference};
use crate::error::{EngineError, FaultError, Result};
use crate::events::ProcessEvent;
use crate::exchange::{ExchangeRecord, ExchangeStatus, InvocationStyle};
use crate::expression::{ExpressionRuntimeRegistry, extract_property};
use crate::ids::{InstanceId, ProcessId};
use crate::latch::{LatchGuard, NStateLatch};
use crate::notifier::ExchangeStateNotifier;
use crate::persistence::{MemoryStore, ProcessEventRecord, ProcessRecord, Store};
use crate::roles::{PartnerCache, RoleBindings};
use crate::worker::{InstanceTask, InstanceWorkerCache, WorkCompletion};

/// Latch state with no derived state loaded.
pub const DEHYDRATED: usize = 0;
/// Latch state with derived state loaded.
pub const HYDRATED: usize = 1;

/// Derived state built by hydration.
#[derive(Debug, Clone)]
struct Hydrated {
    definition: Arc<ProcessDefinition>,
    fingerprint: String,
    expressions: ExpressionRuntimeRegistry,
    roles: RoleBindings,
}

/// A hydrate lease. The process stays hydrated while any lease is alive.
pub struct ProcessLease {
    runtime: ProcessRuntime,
    hydrated: Arc<Hydrated>,
    _guard: LatchGuard,
}

impl fmt::Debug for ProcessLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLease")
            .field("process_id", self.runtime.process_id())
            .field("fingerprint", &self.hydrated.fingerprint)
            .finish()
    }
}

impl ProcessLease {
    /// The leased runtime.
    pub fn runtime(&self) -> &ProcessRuntime {
        &self.runtime
    }

    /// Decoded definition.
    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.hydrated.definition
    }

    /// Fingerprint of the compiled definition.
    pub fn fingerprint(&self) -> &str {
        &self.hydrated.fingerprint
    }

    /// Role bindings.
    pub fn roles(&self) -> &RoleBindings {
        &self.hydrated.roles
    }

    /// Expression runtimes of the process.
    pub fn expressions(&self) -> &ExpressionRuntimeRegistry {
        &self.hydrated.expressions
    }
}

struct Inner {
    process_id: ProcessId,
    conf: DeploymentConfig,
    contexts: Contexts,
    store: Arc<dyn Store>,
    latch: NStateLatch,
    hydrated: RwLock<Option<Arc<Hydrated>>>,
    partners: Mutex<PartnerCache>,
    my_eprs: Mutex<HashMap<Endpoint, EndpointReference>>,
    styles: BTreeSet<InvocationStyle>,
    workers: InstanceWorkerCache,
    listeners: ExchangeStateNotifier,
    last_used_ms: AtomicI64,
}

/// Runtime of one deployed process. Cloning yields another handle.
#[derive(Clone)]
pub struct ProcessRuntime {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessRuntime")
            .field("process_id", &self.inner.process_id)
            .field("hydrated", &self.hint_is_hydrated())
            .field("transient", &self.inner.conf.transient)
            .field("workers", &self.inner.workers.len())
            .finish()
    }
}

impl ProcessRuntime {
    /// Create a dehydrated runtime for `conf`.
    ///
    /// Transient deployments get a private [`MemoryStore`]; all others use
    /// the shared store of `contexts`.
    pub fn new(conf: DeploymentConfig, contexts: Contexts) -> Self {
        let store: Arc<dyn Store> = if conf.transient {
            Arc::new(MemoryStore::new())
        } else {
            Arc::clone(&contexts.store)
        };

        let mut styles = BTreeSet::from([InvocationStyle::Unreliable]);
        if conf.transient {
            styles.insert(InvocationStyle::Transacted);
        } else {
            styles.insert(InvocationStyle::Reliable);
        }

        let process_id = conf.process_id.clone();
        let workers = InstanceWorkerCache::new(process_id.clone(), contexts.worker_cache_capacity);

        Self {
            inner: Arc::new(Inner {
                process_id,
                conf,
                contexts,
                store,
                latch: NStateLatch::new(2),
                hydrated: RwLock::new(None),
                partners: Mutex::new(PartnerCache::default()),
                my_eprs: Mutex::new(HashMap::new()),
                styles,
                workers,
                listeners: ExchangeStateNotifier::new(),
                last_used_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            }),
        }
    }

    /// Process identity.
    pub fn process_id(&self) -> &ProcessId {
        &self.inner.process_id
    }

    /// Deployment descriptor.
    pub fn deployment(&self) -> &DeploymentConfig {
        &self.inner.conf
    }

    /// Engine collaborators.
    pub fn contexts(&self) -> &Contexts {
        &self.inner.contexts
    }

    /// Store holding this process' records.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    /// Whether records are kept in memory only.
    pub fn is_in_memory(&self) -> bool {
        self.inner.conf.transient
    }

    /// Instance workers of this process.
    pub fn workers(&self) -> &InstanceWorkerCache {
        &self.inner.workers
    }

    /// Exchange state listeners of this process.
    pub fn notifier(&self) -> &ExchangeStateNotifier {
        &self.inner.listeners
    }

    /// Invocation styles clients may use.
    pub fn supported_invocation_styles(&self) -> &BTreeSet<InvocationStyle> {
        &self.inner.styles
    }

    /// Services the process provides, from its deployment.
    pub fn service_names(&self) -> BTreeSet<String> {
        self.inner
            .conf
            .provide
            .values()
            .map(|endpoint| endpoint.service.clone())
            .collect()
    }

    /// Whether the process provides `service`.
    pub fn provides_service(&self, service: &str) -> bool {
        self.inner
            .conf
            .provide
            .values()
            .any(|endpoint| endpoint.service == service)
    }

    /// Acquire a hydrate lease, hydrating first if needed.
    pub async fn lease(&self) -> Result<ProcessLease> {
        let guard = self
            .inner
            .latch
            .latch(HYDRATED, || self.enter(HYDRATED))
            .await?;
        let hydrated = self
            .inner
            .hydrated
            .read()
            .clone()
            .ok_or_else(|| EngineError::NotHydrated(self.inner.process_id.clone()))?;
        Ok(ProcessLease {
            runtime: self.clone(),
            hydrated,
            _guard: guard,
        })
    }

    /// Hydrate now if not hydrated.
    pub async fn hydrate(&self) -> Result<()> {
        self.lease().await.map(drop)
    }

    /// Dehydrate, waiting for outstanding leases to be released.
    pub async fn dehydrate(&self) -> Result<()> {
        self.inner
            .latch
            .latch(DEHYDRATED, || self.enter(DEHYDRATED))
            .await
            .map(drop)
    }

    /// Dehydrate if no lease is held. Returns whether the process is now dehydrated.
    pub async fn try_dehydrate(&self) -> Result<bool> {
        match self
            .inner
            .latch
            .try_latch(DEHYDRATED, || self.enter(DEHYDRATED))
            .await
        {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    /// Cheap check whether derived state is loaded. May be stale immediately.
    pub fn hint_is_hydrated(&self) -> bool {
        self.inner.latch.current_state() == Some(HYDRATED)
    }

    /// Record that the process was just used.
    pub fn mark_used(&self) {
        self.inner
            .last_used_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// When the process was last used.
    pub fn last_used(&self) -> DateTime<Utc> {
        let ms = self.inner.last_used_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
    }

    /// Decoded definition, hydrating if needed.
    pub async fn definition(&self) -> Result<Arc<ProcessDefinition>> {
        Ok(Arc::clone(self.lease().await?.definition()))
    }

    async fn enter(&self, state: usize) -> Result<()> {
        match state {
            HYDRATED => self.hydrate_entry().await,
            _ => {
                self.dehydrate_entry();
                Ok(())
            }
        }
    }

    #[instrument(skip(self), fields(process_id = %self.inner.process_id))]
    async fn hydrate_entry(&self) -> Result<()> {
        let process_id = &self.inner.process_id;
        self.mark_used();
        debug!("Hydrating process");

        let corrupted = |reason: String| {
            error!(reason = %reason, "Error reloading compiled process; the file appears to be corrupted");
            EngineError::CorruptDefinition {
                process_id: process_id.clone(),
                reason,
            }
        };
        let compiled = self
            .inner
            .conf
            .definition
            .read()
            .map_err(|e| corrupted(e.to_string()))?;
        let definition =
            ProcessDefinition::from_compiled(&compiled).map_err(|e| corrupted(e.to_string()))?;
        let fingerprint = definition::fingerprint(&definition, &compiled);

        let mut expressions = ExpressionRuntimeRegistry::with_json_pointer();
        for language in &definition.expression_languages {
            expressions
                .register(language, self.inner.contexts.expressions.as_ref())
                .map_err(|e| {
                    error!(uri = %language.uri, error = %e, "Expression language registration failed");
                    EngineError::ExpressionLanguage {
                        process_id: process_id.clone(),
                        uri: language.uri.clone(),
                        reason: e.to_string(),
                    }
                })?;
        }

        let mut roles = RoleBindings::build(&definition, &self.inner.conf)?;
        self.ensure_partner_channels(&roles).await?;
        roles.attach(&self.inner.partners.lock(), &self.inner.my_eprs.lock());

        self.ensure_process_record(&definition, &fingerprint).await?;

        *self.inner.hydrated.write() = Some(Arc::new(Hydrated {
            definition: Arc::new(definition),
            fingerprint,
            expressions,
            roles,
        }));
        info!("Process hydrated");
        Ok(())
    }

    fn dehydrate_entry(&self) {
        if self.inner.hydrated.write().take().is_some() {
            info!(process_id = %self.inner.process_id, "Process dehydrated");
        }
    }

    /// Open partner channels on the first hydration only.
    async fn ensure_partner_channels(&self, roles: &RoleBindings) -> Result<()> {
        if self.inner.partners.lock().hydrated_once {
            return Ok(());
        }

        let mut created: Vec<(String, Arc<dyn PartnerRoleChannel>, Option<EndpointReference>)> =
            Vec::new();
        for binding in roles.partner_roles() {
            let channel = match self
                .inner
                .contexts
                .bindings
                .create_partner_role_channel(
                    &self.inner.process_id,
                    binding.port_type(),
                    binding.initial_partner(),
                )
                .await
            {
                Ok(channel) => channel,
                Err(err) => {
                    // Nothing is published yet, so the channels opened so far are closed here.
                    for (name, channel, _) in created {
                        if let Err(close_err) = channel.close().await {
                            warn!(
                                partner_link = %name,
                                error = %close_err,
                                "Failed to close partner role channel"
                            );
                        }
                    }
                    return Err(err);
                }
            };
            debug!(
                partner_link = %binding.partner_link().name,
                port_type = %binding.port_type(),
                "Partner role channel created"
            );
            let epr = channel.initial_endpoint_reference();
            created.push((binding.partner_link().name.clone(), channel, epr));
        }

        let mut partners = self.inner.partners.lock();
        for (name, channel, epr) in created {
            if let Some(epr) = epr {
                partners.eprs.insert(name.clone(), epr);
            }
            partners.channels.insert(name, channel);
        }
        partners.hydrated_once = true;
        Ok(())
    }

    /// Create the process record, or replace it when the fingerprint changed.
    ///
    /// Joins the ambient transaction if there is one; in-memory processes
    /// never open one.
    async fn ensure_process_record(&self, definition: &ProcessDefinition, fingerprint: &str) -> Result<()> {
        let record = ProcessRecord {
            process_id: self.inner.process_id.clone(),
            definition_name: definition.name.clone(),
            guid: fingerprint.to_string(),
            version: self.inner.conf.version,
            correlators: definition.correlator_ids(),
            created_at: Utc::now(),
        };
        let store = Arc::clone(&self.inner.store);
        let transactions = &self.inner.contexts.transactions;

        if self.is_in_memory() || transactions.is_inside_transaction() {
            return bounce_process_record(store.as_ref(), record).await;
        }
        transactions
            .run_in_transaction(Box::pin(async move {
                bounce_process_record(store.as_ref(), record).await
            }))
            .await
            .inspect_err(|e| error!(error = %e, "Failed to create process record"))
    }

    /// Publish a copy of the hydrated state with current channels and addresses.
    fn reattach_bindings(&self) {
        let mut hydrated = self.inner.hydrated.write();
        if let Some(current) = hydrated.as_ref() {
            let mut next = Hydrated::clone(current);
            next.roles
                .attach(&self.inner.partners.lock(), &self.inner.my_eprs.lock());
            *hydrated = Some(Arc::new(next));
        }
    }

    /// Activate every my-role endpoint with the binding layer.
    #[instrument(skip(self), fields(process_id = %self.inner.process_id))]
    pub async fn activate(&self) -> Result<()> {
        let lease = self.lease().await?;
        for binding in lease.roles().my_roles() {
            let endpoint = binding.endpoint();
            let epr = self
                .inner
                .contexts
                .bindings
                .activate_my_role_endpoint(&self.inner.process_id, endpoint)
                .await?;
            info!(endpoint = %endpoint, address = %epr.address(), "Activated my-role endpoint");
            self.inner.my_eprs.lock().insert(endpoint.clone(), epr);
        }
        self.reattach_bindings();
        Ok(())
    }

    /// Deactivate my-role endpoints and close partner channels.
    #[instrument(skip(self), fields(process_id = %self.inner.process_id))]
    pub async fn deactivate(&self) -> Result<()> {
        let endpoints: Vec<Endpoint> = self.inner.my_eprs.lock().drain().map(|(e, _)| e).collect();
        for endpoint in endpoints {
            self.inner
                .contexts
                .bindings
                .deactivate_my_role_endpoint(&endpoint)
                .await?;
            info!(endpoint = %endpoint, "Deactivated my-role endpoint");
        }

        let channels: Vec<(String, Arc<dyn PartnerRoleChannel>)> = {
            let mut partners = self.inner.partners.lock();
            partners.hydrated_once = false;
            partners.eprs.clear();
            partners.channels.drain().collect()
        };
        for (name, channel) in channels {
            if let Err(e) = channel.close().await {
                warn!(partner_link = %name, error = %e, "Failed to close partner role channel");
            }
        }
        self.reattach_bindings();
        Ok(())
    }

    /// Address the my-role endpoint of `partner_link` was activated under.
    pub async fn initial_my_role_epr(&self, partner_link: &str) -> Result<Option<EndpointReference>> {
        let lease = self.lease().await?;
        let binding = lease
            .roles()
            .my_role_by_name(partner_link)
            .ok_or_else(|| EngineError::UnknownPartnerLink(partner_link.to_string()))?;
        Ok(binding.initial_epr().cloned())
    }

    /// Endpoint provided for the my-role of `partner_link`.
    pub async fn my_role_endpoint(&self, partner_link: &str) -> Result<Endpoint> {
        let lease = self.lease().await?;
        lease
            .roles()
            .my_role_by_name(partner_link)
            .map(|binding| binding.endpoint().clone())
            .ok_or_else(|| EngineError::UnknownPartnerLink(partner_link.to_string()))
    }

    /// Initial partner address of `partner_link`, as reported by its channel.
    pub async fn initial_partner_epr(&self, partner_link: &str) -> Result<Option<EndpointReference>> {
        let lease = self.lease().await?;
        let binding = lease
            .roles()
            .partner_role_by_name(partner_link)
            .ok_or_else(|| EngineError::UnknownPartnerLink(partner_link.to_string()))?;
        Ok(binding.initial_epr().cloned())
    }

    /// Partner endpoint named by the deployment for `partner_link`.
    pub async fn initial_partner_endpoint(&self, partner_link: &str) -> Result<Option<Endpoint>> {
        let lease = self.lease().await?;
        let binding = lease
            .roles()
            .partner_role_by_name(partner_link)
            .ok_or_else(|| EngineError::UnknownPartnerLink(partner_link.to_string()))?;
        Ok(binding.initial_partner().cloned())
    }

    /// Channel to the partner of `partner_link`.
    pub async fn partner_role_channel(&self, partner_link: &str) -> Result<Arc<dyn PartnerRoleChannel>> {
        let lease = self.lease().await?;
        let binding = lease
            .roles()
            .partner_role_by_name(partner_link)
            .ok_or_else(|| EngineError::UnknownPartnerLink(partner_link.to_string()))?;
        binding.channel().cloned().ok_or_else(|| {
            EngineError::Binding(format!(
                "no channel open for partner link {}",
                partner_link
            ))
        })
    }

    /// Send an outbound exchange through the channel of the partner link
    /// named by its `partner_link_model_id`.
    #[instrument(skip(self, exchange), fields(process_id = %self.inner.process_id, exchange_id = %exchange.id))]
    pub async fn invoke_partner(&self, exchange: &mut ExchangeRecord) -> Result<()> {
        let lease = self.lease().await?;
        let link_id = exchange
            .partner_link_model_id
            .ok_or_else(|| EngineError::UnknownPartnerLink(format!("exchange {}", exchange.id)))?;
        let binding = lease
            .roles()
            .partner_role(link_id)
            .ok_or_else(|| EngineError::UnknownPartnerLink(link_id.to_string()))?;
        let channel = binding.channel().cloned().ok_or_else(|| {
            EngineError::Binding(format!(
                "no channel open for partner link {}",
                binding.partner_link().name
            ))
        })?;

        self.mark_used();
        exchange.process_id = Some(self.inner.process_id.clone());
        let old = exchange.transition(ExchangeStatus::Active)?;
        self.inner.store.save_message_exchange(exchange).await?;
        self.fire_state_changed(exchange, old, exchange.status);

        debug!(partner_link = %binding.partner_link().name, "Invoking partner");
        channel.invoke(exchange).await
    }

    /// Record `event` if the deployment's event settings allow it.
    ///
    /// Returns whether the event was stored. Events without an instance are
    /// not stored.
    pub async fn save_event(&self, event: &ProcessEvent, instance_id: Option<InstanceId>) -> Result<bool> {
        self.mark_used();
        if !self
            .inner
            .conf
            .events
            .is_enabled(event.scopes.as_deref(), &event.kind)
        {
            trace!(kind = %event.kind, "Event disabled by deployment settings");
            return Ok(false);
        }
        let Some(instance_id) = instance_id else {
            debug!(kind = %event.kind, "No instance to save event against; event dropped");
            return Ok(false);
        };

        self.inner
            .store
            .insert_event(ProcessEventRecord {
                process_id: self.inner.process_id.clone(),
                instance_id: Some(instance_id),
                kind: event.kind.clone(),
                scopes: event.scopes.clone(),
                payload: event.payload.clone(),
                created_at: Utc::now(),
            })
            .await?;
        Ok(true)
    }

    /// Evaluate a correlation property alias against `message`.
    pub async fn extract_property(
        &self,
        message: &Value,
        alias: &PropertyAlias,
        target: &str,
    ) -> Result<String> {
        let lease = self.lease().await?;
        Ok(extract_property(lease.expressions(), message, alias, target)?)
    }

    /// Notify exchange listeners of a status change.
    pub fn fire_state_changed(&self, exchange: &ExchangeRecord, old: ExchangeStatus, new: ExchangeStatus) -> usize {
        self.inner.listeners.fire_state_changed(exchange, old, new)
    }

    /// Load a stored exchange.
    pub async fn load_exchange(&self, exchange_id: &str) -> Result<ExchangeRecord> {
        self.inner
            .store
            .get_message_exchange(exchange_id)
            .await?
            .ok_or_else(|| EngineError::ExchangeNotFound(exchange_id.to_string()))
    }

    /// Create a handle for a new inbound exchange on `service`/`operation`.
    pub async fn create_my_role_exchange(
        &self,
        style: InvocationStyle,
        service: &str,
        operation: &str,
        client_key: Option<String>,
    ) -> Result<Arc<MyRoleExchange>> {
        if !self.inner.styles.contains(&style) {
            return Err(EngineError::UnsupportedInvocationStyle {
                process_id: self.inner.process_id.clone(),
                style,
            });
        }
        let lease = self.lease().await?;
        let binding = lease
            .roles()
            .my_role_for_service(service)
            .ok_or_else(|| EngineError::NoSuchService(service.to_string()))?;
        let op = binding
            .operation(operation)
            .ok_or_else(|| EngineError::NoSuchOperation {
                service: service.to_string(),
                operation: operation.to_string(),
            })?;

        let mut record = ExchangeRecord::new(
            uuid::Uuid::new_v4().to_string(),
            crate::exchange::Direction::Inbound,
            style,
        );
        record.callee = Some(binding.endpoint().service.clone());
        record.operation = op.name.clone();
        record.partner_link_model_id = Some(binding.partner_link().id);
        record.process_id = Some(self.inner.process_id.clone());
        record.client_key = client_key;
        Ok(MyRoleExchange::register(self, record))
    }

    /// Rebuild a handle for a stored inbound exchange.
    ///
    /// Fails with [`EngineError::DbConsistency`] when the record points at a
    /// partner link, operation or my-role the definition does not have.
    pub async fn recreate_my_role_exchange(&self, record: ExchangeRecord) -> Result<Arc<MyRoleExchange>> {
        let lease = self.lease().await?;
        let dangling = |reference: String| EngineError::DbConsistency {
            exchange_id: record.id.clone(),
            reference,
        };

        let link_id = record
            .partner_link_model_id
            .ok_or_else(|| dangling("has no pLinkModelId".to_string()))?;
        let link = lease
            .definition()
            .partner_link_by_id(link_id)
            .ok_or_else(|| dangling(format!("referenced unknown pLinkModelId {}", link_id)))?;
        if link.my_role_operation(&record.operation).is_none() {
            return Err(dangling(format!(
                "referenced unknown operation {}",
                record.operation
            )));
        }
        if lease.roles().my_role(link_id).is_none() {
            return Err(dangling(format!(
                "referenced non-existant myrole on pLinkModelId {}",
                link_id
            )));
        }
        Ok(MyRoleExchange::register(self, record))
    }

    /// Ask the interpreter to recover a failed activity of `instance_id`.
    pub async fn recover_activity(
        &self,
        instance_id: InstanceId,
        channel: String,
        activity_id: i64,
        action: String,
        fault: Option<FaultError>,
    ) -> Result<()> {
        let task = self.leased_instance_task(instance_id, move |lease| async move {
            let runtime = lease.runtime().clone();
            let worker = runtime.workers().get(instance_id);
            worker
                .execute_inline(async {
                    let ctx = runtime
                        .execution_context(&lease, instance_id)
                        .await?
                        .ok_or_else(|| {
                            EngineError::Interpreter(format!("instance {} not found", instance_id))
                        })?;
                    runtime
                        .inner
                        .contexts
                        .interpreter
                        .recover_activity(&ctx, &channel, activity_id, &action, fault.as_ref())
                        .await
                })
                .await
        });
        self.inner.workers.enqueue(instance_id, task).wait().await
    }

    /// Run `work` on the worker of `instance_id` once the ambient
    /// transaction commits, or right away outside of one.
    pub(crate) fn schedule_instance_work<F, Fut>(&self, instance_id: InstanceId, work: F) -> Result<()>
    where
        F: FnOnce(ProcessLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let runtime = self.clone();
        let submit = move || {
            let task = runtime.leased_instance_task(instance_id, work);
            let _completion: WorkCompletion = runtime.inner.workers.enqueue(instance_id, task);
        };

        let transactions = &self.inner.contexts.transactions;
        if transactions.is_inside_transaction() {
            trace!(instance_id, "Instance work deferred until commit");
            transactions.on_commit(Box::new(submit))
        } else {
            submit();
            Ok(())
        }
    }

    /// Wrap `work` so it runs with a hydrate lease and logs its failure.
    fn leased_instance_task<F, Fut>(&self, instance_id: InstanceId, work: F) -> InstanceTask
    where
        F: FnOnce(ProcessLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let runtime = self.clone();
        Box::pin(async move {
            let outcome = match runtime.lease().await {
                Ok(lease) => work(lease).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                error!(
                    process_id = %runtime.inner.process_id,
                    instance_id,
                    error = %e,
                    "Instance work failed"
                );
            }
            outcome
        })
    }

    /// Build the execution context of `instance_id`, or `None` if the
    /// instance no longer exists.
    async fn execution_context(&self, lease: &ProcessLease, instance_id: InstanceId) -> Result<Option<ExecutionContext>> {
        let instance = self.inner.store.get_instance(instance_id).await?;
        Ok(instance.map(|instance| {
            ExecutionContext::new(self.clone(), Arc::clone(lease.definition()), instance)
        }))
    }

    /// Run `work` in a transaction of this engine's transaction manager.
    async fn in_transaction<Fut>(&self, work: Fut) -> Result<()>
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.inner
            .contexts
            .transactions
            .run_in_transaction(Box::pin(work))
            .await
    }
}

async fn bounce_process_record(store: &dyn Store, record: ProcessRecord) -> Result<()> {
    match store.get_process(&record.process_id).await? {
        Some(existing) if existing.guid == record.guid => {
            trace!(process_id = %record.process_id, "Process record is current");
            return Ok(());
        }
        Some(existing) => {
            info!(
                process_id = %record.process_id,
                old_guid = %existing.guid,
                new_guid = %record.guid,
                "Compiled definition changed; replacing process record"
            );
            store.delete_process(&record.process_id).await?;
        }
        None => {
            debug!(process_id = %record.process_id, "Creating process record");
        }
    }
    store.create_process(record).await
}
