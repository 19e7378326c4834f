// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for orchestra-engine integration tests.
//!
//! Provides a [`Harness`] wiring an engine to in-memory collaborators, a
//! recording interpreter and binding context, and the "order" process used
//! by every test.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use orchestra_engine::definition::{
    Expression, OperationDef, PartnerLinkDef, PropertyAlias, RoleDef,
};
use orchestra_engine::expression::JSON_POINTER_LANGUAGE;
use orchestra_engine::{
    BindingContext, CorrelationKey, DeploymentConfig, Direction, Endpoint, EndpointReference,
    Engine, EngineConfig, EngineError, ExchangeInterceptor, ExchangeRecord, ExchangeStateListener,
    ExchangeStatus, ExecutionContext, InlineDefinition, InstanceId, Interpreter, InvocationStyle,
    ListenerToken, MemoryScheduler, MemoryStore, PartnerRoleChannel, ProcessDefinition, ProcessId,
    ProcessRuntime, ReceiveToken, Result, Store, TaskLocalTransactions, TransactionManager,
};

pub const ORDER_SERVICE: &str = "OrderService";
pub const SHIPPER_SERVICE: &str = "ShipperService";

static TRACING: Once = Once::new();

/// Initialise tracing once per test binary. Honours `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Ordered log shared by the interpreter and listeners.
pub type Timeline = Arc<Mutex<Vec<String>>>;

pub fn timeline() -> Timeline {
    Arc::new(Mutex::new(Vec::new()))
}

/// Position of the first entry starting with `prefix`.
pub fn position(timeline: &Timeline, prefix: &str) -> Option<usize> {
    timeline.lock().iter().position(|entry| entry.starts_with(prefix))
}

// ============================================================================
// Interpreter
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct InterpreterOptions {
    /// Reply `{"accepted": true}` to two-way exchanges that start an instance.
    pub reply_on_instantiate: bool,
    /// After `place`, wait for `notify` on the same correlation key.
    pub receive_after_place: bool,
    /// How long `execute` takes.
    pub execute_delay: Duration,
}

/// Interpreter that records every call on a [`Timeline`].
pub struct RecordingInterpreter {
    pub timeline: Timeline,
    pub options: InterpreterOptions,
    pub fail_execute: AtomicBool,
    busy: Mutex<HashSet<InstanceId>>,
    pub overlaps: AtomicUsize,
    running: AtomicUsize,
    pub max_running: AtomicUsize,
}

impl RecordingInterpreter {
    pub fn new(timeline: Timeline, options: InterpreterOptions) -> Self {
        Self {
            timeline,
            options,
            fail_execute: AtomicBool::new(false),
            busy: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
        }
    }

    fn record(&self, entry: String) {
        self.timeline.lock().push(entry);
    }

    /// Entries starting with `prefix`.
    pub fn calls(&self, prefix: &str) -> Vec<String> {
        self.timeline
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Interpreter for RecordingInterpreter {
    async fn instantiate(&self, ctx: &ExecutionContext, exchange: &ExchangeRecord) -> Result<()> {
        self.record(format!(
            "instantiate:{}:{}",
            ctx.instance_id(),
            exchange.operation
        ));

        let one_way = exchange.status == ExchangeStatus::Acknowledged;
        if self.options.reply_on_instantiate && !one_way {
            ctx.reply(&exchange.id, json!({ "accepted": true })).await?;
        }
        if self.options.receive_after_place && exchange.operation == "place" {
            let key = exchange.correlation_key.clone().unwrap_or_default();
            if let Some(queued) = ctx
                .receive("1.notify", &key, ReceiveToken::new("pick-1", 0))
                .await?
            {
                self.record(format!("dequeued:{}:{}", ctx.instance_id(), queued));
            }
        }
        Ok(())
    }

    async fn input_message_match(
        &self,
        ctx: &ExecutionContext,
        token: &ReceiveToken,
        exchange: &ExchangeRecord,
    ) -> Result<()> {
        self.record(format!(
            "match:{}:{}:{}",
            ctx.instance_id(),
            token,
            exchange.operation
        ));
        Ok(())
    }

    async fn timer_fired(&self, ctx: &ExecutionContext, channel: &str) -> Result<()> {
        self.record(format!("timer:{}:{}", ctx.instance_id(), channel));
        Ok(())
    }

    async fn partner_response(
        &self,
        ctx: &ExecutionContext,
        exchange_id: &str,
        channel: &str,
    ) -> Result<()> {
        self.record(format!(
            "partner:{}:{}:{}",
            ctx.instance_id(),
            exchange_id,
            channel
        ));
        Ok(())
    }

    async fn correlation_matched(
        &self,
        ctx: &ExecutionContext,
        correlator_id: &str,
        key: &CorrelationKey,
    ) -> Result<()> {
        self.record(format!(
            "matcher:{}:{}:{}",
            ctx.instance_id(),
            correlator_id,
            key
        ));
        Ok(())
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        let instance_id = ctx.instance_id();
        if !self.busy.lock().insert(instance_id) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);

        if !self.options.execute_delay.is_zero() {
            tokio::time::sleep(self.options.execute_delay).await;
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.busy.lock().remove(&instance_id);

        if self.fail_execute.load(Ordering::SeqCst) {
            return Err(EngineError::Interpreter("execution failed".to_string()));
        }
        self.record(format!("execute:{}", instance_id));
        Ok(())
    }
}

// ============================================================================
// Bindings
// ============================================================================

/// Partner channel that records what it was asked to send.
pub struct LoopbackChannel {
    pub port_type: String,
    pub initial_partner: Option<Endpoint>,
    pub invoked: Mutex<Vec<String>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl PartnerRoleChannel for LoopbackChannel {
    fn initial_endpoint_reference(&self) -> Option<EndpointReference> {
        self.initial_partner
            .as_ref()
            .map(|endpoint| EndpointReference::new(format!("remote://{}", endpoint)))
    }

    async fn invoke(&self, exchange: &ExchangeRecord) -> Result<()> {
        self.invoked.lock().push(exchange.id.clone());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Binding context counting activations and channel creations.
#[derive(Default)]
pub struct CountingBindings {
    pub activated: Mutex<Vec<Endpoint>>,
    pub deactivated: Mutex<Vec<Endpoint>>,
    pub channels_created: AtomicUsize,
    pub channels: Mutex<Vec<Arc<LoopbackChannel>>>,
    /// Channel creations beyond this many fail.
    pub channel_limit: Mutex<Option<usize>>,
}

#[async_trait]
impl BindingContext for CountingBindings {
    async fn activate_my_role_endpoint(
        &self,
        _process_id: &ProcessId,
        endpoint: &Endpoint,
    ) -> Result<EndpointReference> {
        self.activated.lock().push(endpoint.clone());
        Ok(EndpointReference::new(format!(
            "local://{}/{}",
            endpoint.service, endpoint.port
        )))
    }

    async fn deactivate_my_role_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        self.deactivated.lock().push(endpoint.clone());
        Ok(())
    }

    async fn create_partner_role_channel(
        &self,
        _process_id: &ProcessId,
        port_type: &str,
        initial_partner: Option<&Endpoint>,
    ) -> Result<Arc<dyn PartnerRoleChannel>> {
        if let Some(limit) = *self.channel_limit.lock()
            && self.channels.lock().len() >= limit
        {
            return Err(EngineError::Binding(format!("no channel for {}", port_type)));
        }
        self.channels_created.fetch_add(1, Ordering::SeqCst);
        let channel = Arc::new(LoopbackChannel {
            port_type: port_type.to_string(),
            initial_partner: initial_partner.cloned(),
            invoked: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.channels.lock().push(Arc::clone(&channel));
        Ok(channel)
    }
}

// ============================================================================
// Listeners and interceptors
// ============================================================================

/// Listener writing every state change to a [`Timeline`].
pub struct RecordingListener {
    pub timeline: Timeline,
    pub changes: Mutex<Vec<(String, ExchangeStatus, ExchangeStatus)>>,
}

impl RecordingListener {
    /// Create a listener and register it with `runtime`'s notifier.
    pub fn attach(runtime: &ProcessRuntime, timeline: Timeline) -> (Arc<Self>, ListenerToken) {
        let listener = Arc::new(Self {
            timeline,
            changes: Mutex::new(Vec::new()),
        });
        let weak = Arc::downgrade(&listener) as Weak<dyn ExchangeStateListener>;
        let token = runtime.notifier().register(weak);
        (listener, token)
    }

    pub fn changes_for(&self, exchange_id: &str) -> Vec<(ExchangeStatus, ExchangeStatus)> {
        self.changes
            .lock()
            .iter()
            .filter(|(id, _, _)| id == exchange_id)
            .map(|(_, old, new)| (*old, *new))
            .collect()
    }
}

impl ExchangeStateListener for RecordingListener {
    fn on_state_changed(&self, exchange: &ExchangeRecord, old: ExchangeStatus, new: ExchangeStatus) {
        self.timeline
            .lock()
            .push(format!("state:{}:{}->{}", exchange.id, old, new));
        self.changes.lock().push((exchange.id.clone(), old, new));
    }
}

/// Interceptor that refuses every exchange.
#[derive(Default)]
pub struct RefusingInterceptor {
    pub seen: Mutex<Vec<String>>,
}

#[async_trait]
impl ExchangeInterceptor for RefusingInterceptor {
    async fn on_process_invoked(&self, exchange: &ExchangeRecord, _process_id: &ProcessId) -> Result<bool> {
        self.seen.lock().push(exchange.id.clone());
        Ok(false)
    }
}

// ============================================================================
// The order process
// ============================================================================

fn order_id_alias() -> PropertyAlias {
    PropertyAlias {
        property: "tns:orderId".to_string(),
        part: None,
        location: Some(Expression {
            language: JSON_POINTER_LANGUAGE.to_string(),
            text: "/orderId".to_string(),
        }),
    }
}

/// Order process: `client` (id 1) is the my-role side with `place`
/// (two-way, creates instances, correlated on `/orderId`), `notify` (one-way,
/// correlated on `/orderId`) and `ping` (one-way, creates instances);
/// `shipper` (id 2) is a partner role.
pub fn order_definition() -> ProcessDefinition {
    ProcessDefinition {
        name: "order".to_string(),
        partner_links: vec![
            PartnerLinkDef {
                id: 1,
                name: "client".to_string(),
                my_role: Some(RoleDef {
                    name: "orderProvider".to_string(),
                    port_type: "OrderPT".to_string(),
                    operations: vec![
                        OperationDef {
                            name: "place".to_string(),
                            one_way: false,
                            create_instance: true,
                            correlation: vec![order_id_alias()],
                        },
                        OperationDef {
                            name: "notify".to_string(),
                            one_way: true,
                            create_instance: false,
                            correlation: vec![order_id_alias()],
                        },
                        OperationDef {
                            name: "ping".to_string(),
                            one_way: true,
                            create_instance: true,
                            correlation: Vec::new(),
                        },
                    ],
                }),
                partner_role: None,
            },
            PartnerLinkDef {
                id: 2,
                name: "shipper".to_string(),
                my_role: None,
                partner_role: Some(RoleDef {
                    name: "shipper".to_string(),
                    port_type: "ShipperPT".to_string(),
                    operations: vec![OperationDef {
                        name: "ship".to_string(),
                        one_way: true,
                        create_instance: false,
                        correlation: Vec::new(),
                    }],
                }),
            },
        ],
        expression_languages: Vec::new(),
    }
}

pub fn order_process_id() -> ProcessId {
    ProcessId::new("{urn:test:shop}order-1")
}

/// Deployment of the order process.
pub fn order_deployment(process_id: ProcessId, transient: bool) -> DeploymentConfig {
    let definition = InlineDefinition::from_definition(&order_definition())
        .expect("order definition serializes");
    DeploymentConfig::new(process_id, Arc::new(definition))
        .with_transient(transient)
        .provide("client", Endpoint::new(ORDER_SERVICE, "OrderPort"))
        .invoke("shipper", Endpoint::new(SHIPPER_SERVICE, "ShipperPort"))
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub engine: Arc<Engine>,
    pub store: Arc<MemoryStore>,
    pub scheduler: Arc<MemoryScheduler>,
    pub transactions: Arc<TaskLocalTransactions>,
    pub bindings: Arc<CountingBindings>,
    pub interpreter: Arc<RecordingInterpreter>,
    pub timeline: Timeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(InterpreterOptions::default())
    }

    pub fn with_options(options: InterpreterOptions) -> Self {
        Self::build(options, EngineConfig::default(), None)
    }

    pub fn build(
        options: InterpreterOptions,
        config: EngineConfig,
        interceptor: Option<Arc<dyn ExchangeInterceptor>>,
    ) -> Self {
        Self::assemble(options, config, interceptor, |store| store as Arc<dyn Store>)
    }

    /// Harness whose engine sees the in-memory store through `wrap`.
    pub fn with_store(
        options: InterpreterOptions,
        wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn Store>,
    ) -> Self {
        Self::assemble(options, EngineConfig::default(), None, wrap)
    }

    fn assemble(
        options: InterpreterOptions,
        config: EngineConfig,
        interceptor: Option<Arc<dyn ExchangeInterceptor>>,
        wrap: impl FnOnce(Arc<MemoryStore>) -> Arc<dyn Store>,
    ) -> Self {
        init_tracing();
        let timeline = timeline();
        let store = Arc::new(MemoryStore::new());
        let transactions = Arc::new(TaskLocalTransactions::new());
        let scheduler = Arc::new(MemoryScheduler::new(
            transactions.clone() as Arc<dyn TransactionManager>
        ));
        let bindings = Arc::new(CountingBindings::default());
        let interpreter = Arc::new(RecordingInterpreter::new(timeline.clone(), options));

        let mut builder = Engine::builder()
            .config(config)
            .store(wrap(store.clone()))
            .scheduler(scheduler.clone())
            .transactions(transactions.clone())
            .bindings(bindings.clone())
            .interpreter(interpreter.clone());
        if let Some(interceptor) = interceptor {
            builder = builder.interceptor(interceptor);
        }
        let engine = Arc::new(builder.build().expect("engine builds"));

        Self {
            engine,
            store,
            scheduler,
            transactions,
            bindings,
            interpreter,
            timeline,
        }
    }

    /// Register the order process.
    pub async fn deploy(&self, transient: bool) -> ProcessRuntime {
        self.engine
            .register(order_deployment(order_process_id(), transient))
            .await
            .expect("order process registers")
    }

    /// Deliver every due scheduler job and wait for its work.
    pub async fn run_due_jobs(&self) -> Vec<Result<()>> {
        let mut outcomes = Vec::new();
        for job in self.scheduler.due_jobs(Utc::now()) {
            match self.engine.handle_work_event(job) {
                Ok(completion) => outcomes.push(completion.wait().await),
                Err(e) => outcomes.push(Err(e)),
            }
        }
        outcomes
    }
}

/// Store an active inbound exchange for `service`/`operation`.
pub async fn inbound_exchange(
    runtime: &ProcessRuntime,
    service: &str,
    operation: &str,
    request: Value,
) -> ExchangeRecord {
    let id = uuid::Uuid::new_v4().to_string();
    let mut exchange = runtime
        .store()
        .create_message_exchange(&id, Direction::Inbound, InvocationStyle::Unreliable)
        .await
        .expect("exchange created");
    exchange.callee = Some(service.to_string());
    exchange.operation = operation.to_string();
    exchange.request = Some(request);
    exchange.transition(ExchangeStatus::Active).expect("pending to active");
    runtime
        .store()
        .save_message_exchange(&exchange)
        .await
        .expect("exchange saved");
    exchange
}

/// Load an exchange, panicking if it is missing.
pub async fn stored_exchange(runtime: &ProcessRuntime, exchange_id: &str) -> ExchangeRecord {
    runtime
        .load_exchange(exchange_id)
        .await
        .expect("exchange stored")
}

/// Wait until everything queued for `instance_id` has run.
pub async fn settle(runtime: &ProcessRuntime, instance_id: InstanceId) {
    tokio::time::timeout(
        Duration::from_secs(5),
        runtime.workers().barrier(instance_id).wait(),
    )
    .await
    .expect("instance work settles")
    .expect("barrier runs");
}
