// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for orchestra-engine.
//!
//! This module defines the store abstraction used by process runtimes and
//! the in-memory backend that transient processes (and tests) run on.

pub mod memory;

pub use self::memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::{CorrelationKey, ReceiveToken};
use crate::error::Result;
use crate::exchange::{Direction, ExchangeRecord, InvocationStyle};
use crate::ids::{InstanceId, ProcessId};

/// Process record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process identity.
    pub process_id: ProcessId,
    /// Name declared by the compiled definition.
    pub definition_name: String,
    /// Fingerprint of the compiled definition the record was created from.
    pub guid: String,
    /// Deployment version.
    pub version: i64,
    /// Correlator ids of the process, one per my-role operation.
    pub correlators: Vec<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Running or waiting.
    Active,
    /// Finished normally.
    Completed,
    /// Finished with an unhandled fault.
    Faulted,
    /// Stopped administratively.
    Terminated,
}

/// Instance record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Store-assigned id.
    pub instance_id: InstanceId,
    /// Process the instance belongs to.
    pub process_id: ProcessId,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Exchange that created the instance.
    pub created_by: Option<String>,
    /// When the instance was created.
    pub created_at: DateTime<Utc>,
    /// When the instance last did work.
    pub last_active_at: DateTime<Utc>,
}

/// A receive point of an instance waiting on a correlator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRoute {
    /// Waiting instance.
    pub instance_id: InstanceId,
    /// Receive channel the message is delivered to.
    pub token: ReceiveToken,
}

/// Process event record from the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEventRecord {
    /// Process that raised the event.
    pub process_id: ProcessId,
    /// Instance that raised the event, if any.
    pub instance_id: Option<InstanceId>,
    /// Event kind.
    pub kind: String,
    /// Enclosing scope names, innermost first.
    pub scopes: Option<Vec<String>>,
    /// Event payload.
    pub payload: Option<Value>,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// Store used by process runtimes.
///
/// Correlator operations are keyed by process, correlator id and correlation
/// key. `take_route` removes the route it returns, so a route matches at most
/// one message. `take_route_or_enqueue` and `dequeue_or_add_route` must each
/// be atomic with respect to the other: a message and a route for the same
/// slot never both end up stored.
#[async_trait]
#[allow(missing_docs)]
pub trait Store: Send + Sync {
    async fn get_process(&self, process_id: &ProcessId) -> Result<Option<ProcessRecord>>;

    async fn create_process(&self, record: ProcessRecord) -> Result<()>;

    async fn delete_process(&self, process_id: &ProcessId) -> Result<()>;

    async fn create_instance(
        &self,
        process_id: &ProcessId,
        created_by: Option<&str>,
    ) -> Result<InstanceRecord>;

    async fn get_instance(&self, instance_id: InstanceId) -> Result<Option<InstanceRecord>>;

    async fn update_instance_state(&self, instance_id: InstanceId, state: InstanceState)
    -> Result<()>;

    async fn delete_instance(&self, instance_id: InstanceId) -> Result<()>;

    async fn create_message_exchange(
        &self,
        exchange_id: &str,
        direction: Direction,
        style: InvocationStyle,
    ) -> Result<ExchangeRecord>;

    async fn get_message_exchange(&self, exchange_id: &str) -> Result<Option<ExchangeRecord>>;

    async fn save_message_exchange(&self, exchange: &ExchangeRecord) -> Result<()>;

    async fn take_route(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
    ) -> Result<Option<MessageRoute>>;

    /// Take the oldest route for the slot, or queue `exchange_id` if there is none.
    async fn take_route_or_enqueue(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
        exchange_id: &str,
    ) -> Result<Option<MessageRoute>>;

    /// Dequeue the oldest message for the slot, or register `route` if there is none.
    async fn dequeue_or_add_route(
        &self,
        process_id: &ProcessId,
        correlator_id: &str,
        key: &CorrelationKey,
        route: MessageRoute,
    ) -> Result<Option<String>>;

    async fn insert_event(&self, event: ProcessEventRecord) -> Result<()>;
}
