// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler seam.
//!
//! The scheduler persists jobs and delivers them, at least once, to the
//! engine's work event dispatcher. Completion is reported back through
//! [`Scheduler::job_completed`], which also tells a redelivered job apart
//! from a first delivery.

pub mod memory;

pub use self::memory::MemoryScheduler;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// A delivered job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    /// Scheduler-assigned id.
    pub job_id: String,
    /// Job payload; for engine jobs an encoded work event.
    pub detail: Value,
    /// How many times the job was delivered before.
    #[serde(default)]
    pub retry_count: u32,
}

/// Persistent job scheduler.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Schedule `detail` to be delivered at `at`, or as soon as possible.
    async fn schedule(&self, detail: Value, at: Option<DateTime<Utc>>) -> Result<String>;

    /// Mark `job_id` completed.
    ///
    /// Inside a transaction the mark takes effect on commit. Returns `false`
    /// when the job was already completed, i.e. this delivery is a duplicate.
    async fn job_completed(&self, job_id: &str) -> Result<bool>;
}
