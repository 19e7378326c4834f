// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestra Engine - Process Runtime Core
//!
//! This crate hosts deployed business processes. It loads and unloads their
//! compiled definitions on demand, routes inbound message exchanges to process
//! instances, serializes the work of each instance on its own worker and
//! dispatches scheduled work events. Process logic itself runs in a pluggable
//! [`Interpreter`].
//!
//! # Architecture
//!
//! ```text
//!   clients                       scheduler
//!      │ MyRoleExchange::invoke       │ handle_work_event(job)
//!      ▼                              ▼
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │   Exchange Router    │   │  Work Event Dispatch │
//! │   invoke_process     │◄──│  MY_ROLE_INVOKE      │
//! └──────────────────────┘   └──────────────────────┘
//!      │  hydrate lease              │  hydrate lease
//!      ▼                              ▼
//! ┌─────────────────────────────────────────────────┐
//! │ ProcessRuntime                                  │
//! │  Lifecycle latch ── definition, role bindings   │
//! │  Correlation ────── CREATE / MATCH / QUEUE      │
//! │  Exchange notifier ─ live MyRoleExchange handles│
//! └─────────────────────────────────────────────────┘
//!                        │ enqueue
//!                        ▼
//! ┌─────────────────────────────────────────────────┐
//! │ Instance workers (one serial queue per instance)│
//! │   └─► Interpreter (ExecutionContext)            │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! # Collaborators
//!
//! The engine only talks to the outside world through traits:
//!
//! | Trait | Role | Provided |
//! |-------|------|----------|
//! | [`Store`] | process, instance, exchange and correlation records | [`MemoryStore`] |
//! | [`Scheduler`] | at-least-once job delivery | [`MemoryScheduler`] |
//! | [`TransactionManager`] | transactions and commit callbacks | [`TaskLocalTransactions`] |
//! | [`BindingContext`] | endpoint activation, partner channels | - |
//! | [`Interpreter`] | process execution | - |
//! | [`ExpressionLanguageProvider`] | correlation property expressions | [`BuiltinLanguages`] |
//!
//! # Hydration
//!
//! A process is *hydrated* while its definition is decoded and its role
//! bindings are built. Every entry point holds a hydrate lease for its whole
//! duration; dehydration waits until no lease is held. The engine's sweeper
//! dehydrates idle processes (see [`EngineConfig`]).
//!
//! # Work Events
//!
//! | type | scope | effect |
//! |------|-------|--------|
//! | `MY_ROLE_INVOKE` | process | route a reliably-invoked exchange |
//! | `TIMER` | instance | fire a timer wait point, then resume |
//! | `RESUME` | instance | resume execution |
//! | `PARTNER_RESPONSE` | instance | deliver a partner response, then resume |
//! | `MATCHER` | instance | retry a correlation match |
//!
//! # Configuration
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `ORCHESTRA_WORKER_CACHE_CAPACITY` | 1024 | instance workers kept per process |
//! | `ORCHESTRA_DEHYDRATION_IDLE_SECS` | 300 | idle time before dehydration (`0` disables) |
//! | `ORCHESTRA_DEHYDRATION_POLL_SECS` | 30 | sweeper interval |
//! | `ORCHESTRA_MAX_HYDRATED_PROCESSES` | 0 | hydrated process cap (`0` is unbounded) |
//!
//! # Modules
//!
//! - [`engine`]: Engine builder, process table and dehydration sweeper
//! - [`process`]: Process runtime, routing and work dispatch
//! - [`latch`]: Lifecycle latch
//! - [`worker`]: Instance worker registry
//! - [`notifier`]: Exchange state notifier
//! - [`persistence`]: Store trait and in-memory backend

#![deny(missing_docs)]

/// Endpoint activation and partner channel seam.
pub mod binding;

/// Configuration loaded from environment variables.
pub mod config;

/// Engine collaborators shared by every process.
pub mod contexts;

/// Correlation keys, receive tokens and message correlation.
pub mod correlation;

/// Compiled process definitions and where they are read from.
pub mod definition;

/// Deployment descriptors.
pub mod deployment;

/// Embeddable engine.
pub mod engine;

/// Error types with stable error codes.
pub mod error;

/// Process events and per-deployment event filters.
pub mod events;

/// Message exchange records.
pub mod exchange;

/// Expression languages for correlation properties.
pub mod expression;

/// Identifier types.
pub mod ids;

/// Interpreter and interceptor seams.
pub mod interpreter;

/// N-state lifecycle latch.
pub mod latch;

/// Exchange state notifier.
pub mod notifier;

/// Store abstraction and in-memory backend.
pub mod persistence;

/// Process runtime.
pub mod process;

/// Role bindings of a hydrated process.
pub mod roles;

/// Scheduler seam and in-memory scheduler.
pub mod scheduler;

/// Transaction manager seam.
pub mod transaction;

/// Scheduled work events.
pub mod work_event;

/// Instance worker registry.
pub mod worker;

pub use binding::{BindingContext, PartnerRoleChannel};
pub use config::{ConfigError, EngineConfig};
pub use contexts::Contexts;
pub use correlation::{CorrelationKey, CorrelationOutcome, ReceiveToken};
pub use definition::{DefinitionSource, FileDefinition, InlineDefinition, ProcessDefinition};
pub use deployment::{DeploymentConfig, Endpoint, EndpointReference};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, FaultError, Result};
pub use events::{EventFilter, EventSettings, ProcessEvent};
pub use exchange::{AckType, Direction, ExchangeRecord, ExchangeStatus, FailureType, InvocationStyle};
pub use expression::{BuiltinLanguages, ExpressionLanguageProvider, ExpressionRuntime};
pub use ids::{InstanceId, ProcessId};
pub use interpreter::{ExchangeInterceptor, Interpreter};
pub use latch::{LatchGuard, NStateLatch};
pub use notifier::{ExchangeStateListener, ExchangeStateNotifier, ListenerToken};
pub use persistence::{MemoryStore, Store};
pub use process::{ExchangeView, ExecutionContext, MyRoleExchange, ProcessLease, ProcessRuntime};
pub use scheduler::{JobInfo, MemoryScheduler, Scheduler};
pub use transaction::{TaskLocalTransactions, TransactionManager};
pub use work_event::WorkEvent;
pub use worker::{InstanceWorkerCache, WorkCompletion};
