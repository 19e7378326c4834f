// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory scheduler.
//!
//! Jobs stay pending until completed, so [`MemoryScheduler::due_jobs`] keeps
//! returning a job that was delivered but not completed. That is the
//! redelivery behaviour a persistent scheduler has after a crash.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use super::{JobInfo, Scheduler};
use crate::error::Result;
use crate::transaction::TransactionManager;

#[derive(Debug, Clone)]
struct PendingJob {
    detail: Value,
    at: Option<DateTime<Utc>>,
    deliveries: u32,
}

#[derive(Default)]
struct Jobs {
    next_id: u64,
    pending: BTreeMap<String, PendingJob>,
    completed: HashSet<String>,
}

/// Scheduler keeping jobs in memory.
pub struct MemoryScheduler {
    transactions: Arc<dyn TransactionManager>,
    jobs: Arc<Mutex<Jobs>>,
}

impl std::fmt::Debug for MemoryScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let jobs = self.jobs.lock();
        f.debug_struct("MemoryScheduler")
            .field("pending", &jobs.pending.len())
            .field("completed", &jobs.completed.len())
            .finish()
    }
}

impl MemoryScheduler {
    /// Create a scheduler that defers completion marks to `transactions`' commits.
    pub fn new(transactions: Arc<dyn TransactionManager>) -> Self {
        Self {
            transactions,
            jobs: Arc::new(Mutex::new(Jobs::default())),
        }
    }

    /// Jobs due at `now` that are not completed, in scheduling order.
    ///
    /// Each call counts as a delivery of the returned jobs.
    pub fn due_jobs(&self, now: DateTime<Utc>) -> Vec<JobInfo> {
        let mut jobs = self.jobs.lock();
        jobs.pending
            .iter_mut()
            .filter(|(_, job)| job.at.is_none_or(|at| at <= now))
            .map(|(job_id, job)| {
                let info = JobInfo {
                    job_id: job_id.clone(),
                    detail: job.detail.clone(),
                    retry_count: job.deliveries,
                };
                job.deliveries += 1;
                info
            })
            .collect()
    }

    /// Whether `job_id` has been completed.
    pub fn is_completed(&self, job_id: &str) -> bool {
        self.jobs.lock().completed.contains(job_id)
    }

    /// Number of jobs not yet completed.
    pub fn pending_count(&self) -> usize {
        self.jobs.lock().pending.len()
    }
}

fn mark_completed(jobs: &Mutex<Jobs>, job_id: &str) -> bool {
    let mut jobs = jobs.lock();
    jobs.pending.remove(job_id);
    jobs.completed.insert(job_id.to_string())
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn schedule(&self, detail: Value, at: Option<DateTime<Utc>>) -> Result<String> {
        let mut jobs = self.jobs.lock();
        jobs.next_id += 1;
        // Zero-padded so the BTreeMap iterates in scheduling order.
        let job_id = format!("job-{:010}", jobs.next_id);
        jobs.pending.insert(
            job_id.clone(),
            PendingJob {
                detail,
                at,
                deliveries: 0,
            },
        );
        debug!(job_id = %job_id, "Job scheduled");
        Ok(job_id)
    }

    async fn job_completed(&self, job_id: &str) -> Result<bool> {
        if self.jobs.lock().completed.contains(job_id) {
            debug!(job_id = %job_id, "Job already completed");
            return Ok(false);
        }

        if self.transactions.is_inside_transaction() {
            let jobs = self.jobs.clone();
            let job_id = job_id.to_string();
            self.transactions.on_commit(Box::new(move || {
                mark_completed(&jobs, &job_id);
            }))?;
            Ok(true)
        } else {
            Ok(mark_completed(&self.jobs, job_id))
        }
    }
}
