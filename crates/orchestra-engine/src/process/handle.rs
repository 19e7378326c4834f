// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client-side handles for inbound (my-role) exchanges.

use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;
use tracing::{debug, instrument};

use super::ProcessRuntime;
use crate::error::{EngineError, FaultError, Result};
use crate::exchange::{AckType, ExchangeRecord, ExchangeStatus, FailureType, InvocationStyle};
use crate::notifier::{ExchangeStateListener, ListenerToken};
use crate::work_event::WorkEvent;

/// Snapshot of an exchange's outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeView {
    /// Current status.
    pub status: ExchangeStatus,
    /// How the exchange was acknowledged.
    pub ack_type: Option<AckType>,
    /// Delivery failure, for failure acknowledgements.
    pub failure: Option<FailureType>,
    /// Fault returned by the process.
    pub fault: Option<FaultError>,
    /// Response message.
    pub response: Option<Value>,
}

impl ExchangeView {
    fn of(record: &ExchangeRecord) -> Self {
        Self {
            status: record.status,
            ack_type: record.ack_type,
            failure: record.failure,
            fault: record.fault.clone(),
            response: record.response.clone(),
        }
    }
}

/// A client's handle on an inbound exchange.
///
/// The handle listens for state changes of its exchange for as long as it is
/// alive; [`wait_for_ack`](Self::wait_for_ack) resolves once the exchange is
/// acknowledged.
pub struct MyRoleExchange {
    runtime: ProcessRuntime,
    record: parking_lot::Mutex<ExchangeRecord>,
    state: watch::Sender<ExchangeView>,
    registration: OnceLock<ListenerToken>,
}

impl std::fmt::Debug for MyRoleExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.record.lock();
        f.debug_struct("MyRoleExchange")
            .field("id", &record.id)
            .field("style", &record.style)
            .field("operation", &record.operation)
            .field("status", &self.state.borrow().status)
            .finish()
    }
}

impl MyRoleExchange {
    pub(super) fn register(runtime: &ProcessRuntime, record: ExchangeRecord) -> Arc<Self> {
        let (state, _) = watch::channel(ExchangeView::of(&record));
        let handle = Arc::new(Self {
            runtime: runtime.clone(),
            record: parking_lot::Mutex::new(record),
            state,
            registration: OnceLock::new(),
        });
        let weak = Arc::downgrade(&handle) as std::sync::Weak<dyn ExchangeStateListener>;
        let token = runtime.notifier().register(weak);
        let _ = handle.registration.set(token);
        handle
    }

    /// Exchange id.
    pub fn id(&self) -> String {
        self.record.lock().id.clone()
    }

    /// Invocation style.
    pub fn style(&self) -> InvocationStyle {
        self.record.lock().style
    }

    /// Target operation.
    pub fn operation(&self) -> String {
        self.record.lock().operation.clone()
    }

    /// Latest known outcome.
    pub fn view(&self) -> ExchangeView {
        self.state.borrow().clone()
    }

    /// Send `request` to the process.
    ///
    /// - `Unreliable`: routed right away in its own transaction.
    /// - `Reliable`: stored, then routed by a scheduled `MY_ROLE_INVOKE` job.
    /// - `Transacted`: routed within the caller's transaction, which must exist.
    #[instrument(skip(self, request), fields(exchange_id = %self.id()))]
    pub async fn invoke(self: &Arc<Self>, request: Value) -> Result<()> {
        let style = self.style();
        let runtime = self.runtime.clone();
        let transactions = Arc::clone(&runtime.contexts().transactions);

        match style {
            InvocationStyle::Transacted => {
                if !transactions.is_inside_transaction() {
                    return Err(EngineError::TransactionRequired);
                }
                let record = self.begin(request).await?;
                runtime.invoke_process(record).await
            }
            InvocationStyle::Unreliable => {
                let handle = Arc::clone(self);
                runtime
                    .clone()
                    .in_transaction(async move {
                        let record = handle.begin(request).await?;
                        runtime.invoke_process(record).await
                    })
                    .await
            }
            InvocationStyle::Reliable => {
                let handle = Arc::clone(self);
                runtime
                    .clone()
                    .in_transaction(async move {
                        let record = handle.begin(request).await?;
                        let event = WorkEvent::MyRoleInvoke {
                            process_id: runtime.process_id().clone(),
                            exchange_id: record.id.clone(),
                        };
                        let job_id = runtime
                            .contexts()
                            .scheduler
                            .schedule(event.to_value()?, None)
                            .await?;
                        debug!(job_id = %job_id, "Reliable invocation scheduled");
                        Ok(())
                    })
                    .await
            }
        }
    }

    /// Wait until the exchange is acknowledged and return its outcome.
    pub async fn wait_for_ack(&self) -> Result<ExchangeView> {
        let mut rx = self.state.subscribe();
        let view = rx
            .wait_for(|view| view.status == ExchangeStatus::Acknowledged)
            .await
            .map_err(|_| EngineError::WorkAbandoned)?;
        Ok(view.clone())
    }

    /// Store the exchange with `request` and mark it active.
    async fn begin(&self, request: Value) -> Result<ExchangeRecord> {
        let template = self.record.lock().clone();
        let store = self.runtime.store();

        let mut record = store
            .create_message_exchange(&template.id, template.direction, template.style)
            .await?;
        record.process_id = template.process_id;
        record.callee = template.callee;
        record.operation = template.operation;
        record.partner_link_model_id = template.partner_link_model_id;
        record.client_key = template.client_key;
        record.request = Some(request);
        let old = record.transition(ExchangeStatus::Active)?;

        store.save_message_exchange(&record).await?;
        *self.record.lock() = record.clone();
        self.runtime.fire_state_changed(&record, old, record.status);
        Ok(record)
    }
}

impl ExchangeStateListener for MyRoleExchange {
    fn on_state_changed(&self, exchange: &ExchangeRecord, _old: ExchangeStatus, _new: ExchangeStatus) {
        {
            let mut record = self.record.lock();
            if record.id != exchange.id {
                return;
            }
            *record = exchange.clone();
        }
        self.state.send_replace(ExchangeView::of(exchange));
    }
}
