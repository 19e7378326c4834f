// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process interpreter seam.
//!
//! The interpreter executes process logic. The engine calls it on an
//! instance's worker with an [`ExecutionContext`] bound to that instance;
//! every method may suspend the instance (waiting on a receive, a timer or a
//! partner) and return.

use async_trait::async_trait;

use crate::correlation::{CorrelationKey, ReceiveToken};
use crate::error::{EngineError, FaultError, Result};
use crate::exchange::ExchangeRecord;
use crate::ids::ProcessId;
use crate::process::ExecutionContext;

/// Executes process instances.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Start a new instance with the message that created it.
    async fn instantiate(&self, ctx: &ExecutionContext, exchange: &ExchangeRecord) -> Result<()>;

    /// Deliver a correlated message to the receive waiting on `token`.
    async fn input_message_match(
        &self,
        ctx: &ExecutionContext,
        token: &ReceiveToken,
        exchange: &ExchangeRecord,
    ) -> Result<()>;

    /// Fire the timer wait point `channel`.
    async fn timer_fired(&self, ctx: &ExecutionContext, channel: &str) -> Result<()>;

    /// Deliver the partner response of `exchange_id` to wait point `channel`.
    async fn partner_response(
        &self,
        ctx: &ExecutionContext,
        exchange_id: &str,
        channel: &str,
    ) -> Result<()>;

    /// A message queued on `correlator_id` under `key` may now match.
    async fn correlation_matched(
        &self,
        ctx: &ExecutionContext,
        correlator_id: &str,
        key: &CorrelationKey,
    ) -> Result<()>;

    /// Run the instance until it suspends or completes.
    async fn execute(&self, ctx: &ExecutionContext) -> Result<()>;

    /// Apply an administrative recovery action to a failed activity.
    async fn recover_activity(
        &self,
        _ctx: &ExecutionContext,
        _channel: &str,
        _activity_id: i64,
        _action: &str,
        _fault: Option<&FaultError>,
    ) -> Result<()> {
        Err(EngineError::Unsupported("activity recovery".to_string()))
    }
}

/// Hook consulted before an inbound message is routed.
#[async_trait]
pub trait ExchangeInterceptor: Send + Sync {
    /// Return `false` to stop routing `exchange` to `process_id`. The
    /// interceptor is then responsible for the exchange's outcome.
    async fn on_process_invoked(&self, exchange: &ExchangeRecord, process_id: &ProcessId)
    -> Result<bool>;
}
