// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled work dispatch.
//!
//! The scheduler delivers jobs at least once. Every handler marks its job
//! completed as the first step of the transaction doing the work, so a
//! redelivery of a job whose work committed is dropped, and a job whose work
//! rolled back is delivered again.

use tokio::sync::oneshot;
use tracing::{debug, error, instrument};

use super::{ProcessLease, ProcessRuntime};
use crate::error::{EngineError, Result};
use crate::ids::InstanceId;
use crate::scheduler::JobInfo;
use crate::work_event::WorkEvent;
use crate::worker::WorkCompletion;

impl ProcessRuntime {
    /// Handle a job delivered by the scheduler.
    ///
    /// Must be called outside any transaction. Process-scoped work runs on a
    /// spawned task; instance-scoped work is queued on the instance's worker.
    /// The returned completion resolves when the work finished.
    #[instrument(skip(self, job), fields(process_id = %self.inner.process_id, job_id = %job.job_id))]
    pub fn handle_work_event(&self, job: JobInfo) -> Result<WorkCompletion> {
        if self.inner.contexts.transactions.is_inside_transaction() {
            return Err(EngineError::UnexpectedTransaction);
        }
        let event = WorkEvent::from_job(&job)?;
        if event.process_id() != self.process_id() {
            return Err(EngineError::MalformedJob(format!(
                "job {} targets process {}",
                job.job_id,
                event.process_id()
            )));
        }
        debug!(kind = event.kind(), retry_count = job.retry_count, "Handling work event");
        self.mark_used();

        Ok(match event.instance_id() {
            None => self.dispatch_process_event(job.job_id, event),
            Some(instance_id) => self.dispatch_instance_event(instance_id, job.job_id, event),
        })
    }

    fn dispatch_process_event(&self, job_id: String, event: WorkEvent) -> WorkCompletion {
        let (done, rx) = oneshot::channel();
        let runtime = self.clone();
        tokio::spawn(async move {
            let outcome = runtime.run_process_event(job_id.clone(), event).await;
            if let Err(e) = &outcome {
                error!(process_id = %runtime.inner.process_id, job_id = %job_id, error = %e, "Process work event failed");
            }
            let _ = done.send(outcome);
        });
        WorkCompletion::new(rx)
    }

    async fn run_process_event(&self, job_id: String, event: WorkEvent) -> Result<()> {
        let kind = event.kind();
        let WorkEvent::MyRoleInvoke { exchange_id, .. } = event else {
            return Err(EngineError::MalformedJob(format!("{} is not a process event", kind)));
        };

        let _lease = self.lease().await?;
        let runtime = self.clone();
        self.in_transaction(async move {
            if !runtime.inner.contexts.scheduler.job_completed(&job_id).await? {
                debug!(job_id = %job_id, "Job already completed; dropping redelivery");
                return Ok(());
            }
            let exchange = runtime.load_exchange(&exchange_id).await?;
            runtime.invoke_process(exchange).await
        })
        .await
    }

    fn dispatch_instance_event(&self, instance_id: InstanceId, job_id: String, event: WorkEvent) -> WorkCompletion {
        let task = self.leased_instance_task(instance_id, move |lease| async move {
            let runtime = lease.runtime().clone();
            let tx_runtime = runtime.clone();
            runtime
                .in_transaction(async move {
                    if !tx_runtime.inner.contexts.scheduler.job_completed(&job_id).await? {
                        debug!(job_id = %job_id, instance_id, "Job already completed; dropping redelivery");
                        return Ok(());
                    }
                    tx_runtime.run_instance_event(&lease, instance_id, event).await
                })
                .await
        });
        self.inner.workers.enqueue(instance_id, task)
    }

    async fn run_instance_event(&self, lease: &ProcessLease, instance_id: InstanceId, event: WorkEvent) -> Result<()> {
        let worker = self.inner.workers.get(instance_id);
        worker
            .execute_inline(async {
                let Some(ctx) = self.execution_context(lease, instance_id).await? else {
                    debug!(instance_id, kind = event.kind(), "Instance no longer exists; dropping work event");
                    return Ok(());
                };
                let interpreter = &self.inner.contexts.interpreter;
                match &event {
                    WorkEvent::Timer { channel, .. } => {
                        interpreter.timer_fired(&ctx, channel).await?;
                        interpreter.execute(&ctx).await
                    }
                    WorkEvent::Resume { .. } => interpreter.execute(&ctx).await,
                    WorkEvent::PartnerResponse {
                        exchange_id,
                        channel,
                        ..
                    } => {
                        interpreter.partner_response(&ctx, exchange_id, channel).await?;
                        interpreter.execute(&ctx).await
                    }
                    WorkEvent::Matcher {
                        correlator_id,
                        correlation_key,
                        ..
                    } => {
                        interpreter
                            .correlation_matched(&ctx, correlator_id, correlation_key)
                            .await
                    }
                    WorkEvent::MyRoleInvoke { .. } => Err(EngineError::MalformedJob(format!(
                        "{} is not an instance event",
                        event.kind()
                    ))),
                }
            })
            .await
    }
}
