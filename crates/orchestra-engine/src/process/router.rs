// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound message routing.
//!
//! Routing failures (unknown service or operation) are not errors: they are
//! recorded on the exchange as a failure acknowledgement and reported to
//! listeners, and `invoke_process` returns `Ok`. Instance work resulting
//! from a routed message always runs on the instance's worker, never inline.

use tracing::{debug, error, info, instrument, warn};

use super::{ProcessLease, ProcessRuntime};
use crate::correlation::{CorrelationOutcome, ReceiveToken, correlate};
use crate::error::{EngineError, Result};
use crate::exchange::{AckType, ExchangeRecord, FailureType};
use crate::ids::InstanceId;

impl ProcessRuntime {
    /// Route an inbound exchange to an instance of this process.
    ///
    /// The exchange must have been stored; it is saved again with its
    /// routing outcome.
    #[instrument(
        skip(self, exchange),
        fields(process_id = %self.inner.process_id, exchange_id = %exchange.id, operation = %exchange.operation)
    )]
    pub async fn invoke_process(&self, mut exchange: ExchangeRecord) -> Result<()> {
        let lease = self.lease().await?;

        let callee = exchange.callee.clone().unwrap_or_default();
        let Some(target) = lease.roles().my_role_for_service(&callee).cloned() else {
            return self.routing_failure(exchange, FailureType::UnknownEndpoint).await;
        };
        let Some(operation) = target.operation(&exchange.operation).cloned() else {
            return self.routing_failure(exchange, FailureType::UnknownOperation).await;
        };

        if operation.one_way {
            let old = exchange.acknowledge(AckType::OneWay)?;
            self.inner.store.save_message_exchange(&exchange).await?;
            self.fire_state_changed(&exchange, old, exchange.status);
            debug!("One-way exchange acknowledged");
        }

        exchange.process_id = Some(self.inner.process_id.clone());
        exchange.partner_link_model_id = Some(target.partner_link().id);

        for interceptor in &self.inner.contexts.interceptors {
            if !interceptor
                .on_process_invoked(&exchange, &self.inner.process_id)
                .await?
            {
                info!("Exchange interceptor stopped routing");
                return self.inner.store.save_message_exchange(&exchange).await;
            }
        }

        self.mark_used();
        let outcome = match correlate(
            self.inner.store.as_ref(),
            lease.expressions(),
            &self.inner.process_id,
            &target,
            &operation,
            &mut exchange,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(EngineError::Fault(fault)) => {
                warn!(fault = %fault, "Correlation failed; replying with fault");
                let old = exchange.reply_fault(fault)?;
                self.inner.store.save_message_exchange(&exchange).await?;
                self.fire_state_changed(&exchange, old, exchange.status);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.inner.store.save_message_exchange(&exchange).await?;

        match outcome {
            CorrelationOutcome::CreateInstance { instance_id } => {
                self.schedule_instance_work(instance_id, move |lease| async move {
                    let runtime = lease.runtime().clone();
                    runtime.start_instance(&lease, instance_id, exchange).await
                })
            }
            CorrelationOutcome::Matched { instance_id, .. } => {
                self.schedule_instance_work(instance_id, move |lease| async move {
                    let runtime = lease.runtime().clone();
                    runtime.continue_instance(&lease, instance_id, exchange).await
                })
            }
            CorrelationOutcome::Queued => Ok(()),
        }
    }

    async fn routing_failure(&self, mut exchange: ExchangeRecord, failure: FailureType) -> Result<()> {
        let explanation = format!("Routing failure for message exchange {}", exchange.id);
        error!(
            callee = ?exchange.callee,
            failure = ?failure,
            "{}",
            explanation
        );
        let old = exchange.fail(failure, explanation)?;
        self.inner.store.save_message_exchange(&exchange).await?;
        self.fire_state_changed(&exchange, old, exchange.status);
        Ok(())
    }

    /// Instantiate and run a new instance with the message that created it.
    async fn start_instance(&self, lease: &ProcessLease, instance_id: InstanceId, exchange: ExchangeRecord) -> Result<()> {
        let worker = self.inner.workers.get(instance_id);
        worker
            .execute_inline(async {
                let Some(ctx) = self.execution_context(lease, instance_id).await? else {
                    debug!(instance_id, "Instance removed before it started");
                    return Ok(());
                };
                let interpreter = &self.inner.contexts.interpreter;
                interpreter.instantiate(&ctx, &exchange).await?;
                interpreter.execute(&ctx).await
            })
            .await
    }

    /// Deliver a matched message to the receive it was routed to, then resume.
    async fn continue_instance(&self, lease: &ProcessLease, instance_id: InstanceId, exchange: ExchangeRecord) -> Result<()> {
        let token = ReceiveToken::parse(exchange.channel.as_deref().unwrap_or_default())?;
        let worker = self.inner.workers.get(instance_id);
        worker
            .execute_inline(async {
                let Some(ctx) = self.execution_context(lease, instance_id).await? else {
                    debug!(instance_id, "Instance removed before message delivery");
                    return Ok(());
                };
                let interpreter = &self.inner.contexts.interpreter;
                interpreter.input_message_match(&ctx, &token, &exchange).await?;
                interpreter.execute(&ctx).await
            })
            .await
    }
}
