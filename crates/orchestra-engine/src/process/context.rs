// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution context handed to the interpreter.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::ProcessRuntime;
use crate::correlation::{CorrelationKey, ReceiveToken};
use crate::definition::ProcessDefinition;
use crate::error::{EngineError, FaultError, Result};
use crate::events::ProcessEvent;
use crate::exchange::{ExchangeRecord, ExchangeStatus};
use crate::ids::{InstanceId, ProcessId};
use crate::persistence::{InstanceRecord, InstanceState, MessageRoute, Store};
use crate::work_event::WorkEvent;

/// What the interpreter may do to the instance it is running.
///
/// Built by the engine on the instance's worker, while the process holds a
/// hydrate lease; never constructed elsewhere.
pub struct ExecutionContext {
    runtime: ProcessRuntime,
    definition: Arc<ProcessDefinition>,
    instance: InstanceRecord,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("process_id", &self.instance.process_id)
            .field("instance_id", &self.instance.instance_id)
            .finish()
    }
}

impl ExecutionContext {
    pub(super) fn new(
        runtime: ProcessRuntime,
        definition: Arc<ProcessDefinition>,
        instance: InstanceRecord,
    ) -> Self {
        Self {
            runtime,
            definition,
            instance,
        }
    }

    /// Instance record as loaded when the context was built.
    pub fn instance(&self) -> &InstanceRecord {
        &self.instance
    }

    /// Instance id.
    pub fn instance_id(&self) -> InstanceId {
        self.instance.instance_id
    }

    /// Process id.
    pub fn process_id(&self) -> &ProcessId {
        self.runtime.process_id()
    }

    /// Definition of the hydrated process.
    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    /// Store of the process.
    pub fn store(&self) -> &dyn Store {
        self.runtime.store().as_ref()
    }

    /// The owning runtime.
    pub fn runtime(&self) -> &ProcessRuntime {
        &self.runtime
    }

    /// Answer the inbound exchange `exchange_id` with `response`.
    pub async fn reply(&self, exchange_id: &str, response: Value) -> Result<()> {
        let mut exchange = self.runtime.load_exchange(exchange_id).await?;
        let old = exchange.respond(response)?;
        self.finish_reply(&exchange, old).await
    }

    /// Answer the inbound exchange `exchange_id` with `fault`.
    pub async fn reply_fault(&self, exchange_id: &str, fault: FaultError) -> Result<()> {
        let mut exchange = self.runtime.load_exchange(exchange_id).await?;
        let old = exchange.reply_fault(fault)?;
        self.finish_reply(&exchange, old).await
    }

    async fn finish_reply(&self, exchange: &ExchangeRecord, old: ExchangeStatus) -> Result<()> {
        self.runtime.store().save_message_exchange(exchange).await?;
        self.runtime.fire_state_changed(exchange, old, exchange.status);
        debug!(
            instance_id = self.instance_id(),
            exchange_id = %exchange.id,
            ack = ?exchange.ack_type,
            "Replied to exchange"
        );
        Ok(())
    }

    /// Record an event raised by the instance.
    pub async fn save_event(&self, event: &ProcessEvent) -> Result<bool> {
        self.runtime.save_event(event, Some(self.instance_id())).await
    }

    /// Send `exchange` to the partner of `partner_link`.
    pub async fn invoke_partner(&self, partner_link: &str, exchange: &mut ExchangeRecord) -> Result<()> {
        let link = self
            .definition
            .partner_link(partner_link)
            .ok_or_else(|| EngineError::UnknownPartnerLink(partner_link.to_string()))?;
        exchange.partner_link_model_id = Some(link.id);
        exchange.instance_id = Some(self.instance_id());
        self.runtime.invoke_partner(exchange).await
    }

    /// Wait for a message on `correlator_id` under `key`.
    ///
    /// Returns the id of a message already queued for the key, or registers
    /// `token` as a route and returns `None`.
    pub async fn receive(
        &self,
        correlator_id: &str,
        key: &CorrelationKey,
        token: ReceiveToken,
    ) -> Result<Option<String>> {
        let store = self.runtime.store();
        let process_id = self.runtime.process_id();
        let route = MessageRoute {
            instance_id: self.instance_id(),
            token,
        };
        let queued = store
            .dequeue_or_add_route(process_id, correlator_id, key, route)
            .await?;
        match &queued {
            Some(exchange_id) => debug!(
                instance_id = self.instance_id(),
                correlator = correlator_id,
                exchange_id = %exchange_id,
                "Receive matched queued message"
            ),
            None => debug!(
                instance_id = self.instance_id(),
                correlator = correlator_id,
                key = %key,
                "Receive waiting on correlator"
            ),
        }
        Ok(queued)
    }

    /// Schedule `event` for this process, at `at` or as soon as possible.
    pub async fn schedule(&self, event: &WorkEvent, at: Option<DateTime<Utc>>) -> Result<String> {
        if event.process_id() != self.process_id() {
            return Err(EngineError::MalformedJob(format!(
                "event for process {} scheduled from process {}",
                event.process_id(),
                self.process_id()
            )));
        }
        self.runtime
            .contexts()
            .scheduler
            .schedule(event.to_value()?, at)
            .await
    }

    /// Move the instance to a final `state`.
    pub async fn complete(&self, state: InstanceState) -> Result<()> {
        self.runtime
            .store()
            .update_instance_state(self.instance_id(), state)
            .await?;
        info!(
            process_id = %self.process_id(),
            instance_id = self.instance_id(),
            state = ?state,
            "Instance finished"
        );
        Ok(())
    }
}
