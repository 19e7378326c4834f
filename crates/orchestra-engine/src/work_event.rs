// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled work events.
//!
//! Work events are the payload of scheduler jobs. They are encoded as JSON
//! objects with a `type` tag:
//!
//! | type               | scope    | effect                                    |
//! |--------------------|----------|-------------------------------------------|
//! | `MY_ROLE_INVOKE`   | process  | route a stored inbound exchange           |
//! | `TIMER`            | instance | fire a timer wait, then resume            |
//! | `RESUME`           | instance | resume execution                          |
//! | `PARTNER_RESPONSE` | instance | deliver a partner response, then resume   |
//! | `MATCHER`          | instance | retry a correlation match                 |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::correlation::CorrelationKey;
use crate::error::{EngineError, Result};
use crate::ids::{InstanceId, ProcessId};
use crate::scheduler::JobInfo;

/// A unit of scheduled work for a process or one of its instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkEvent {
    /// Route a reliably-invoked inbound exchange.
    MyRoleInvoke {
        /// Target process.
        process_id: ProcessId,
        /// Stored exchange to route.
        exchange_id: String,
    },
    /// A timer wait point expired.
    Timer {
        /// Target process.
        process_id: ProcessId,
        /// Target instance.
        instance_id: InstanceId,
        /// Timer wait point.
        channel: String,
    },
    /// Resume a suspended instance.
    Resume {
        /// Target process.
        process_id: ProcessId,
        /// Target instance.
        instance_id: InstanceId,
    },
    /// A partner answered an outbound exchange.
    PartnerResponse {
        /// Target process.
        process_id: ProcessId,
        /// Target instance.
        instance_id: InstanceId,
        /// Outbound exchange that was answered.
        exchange_id: String,
        /// Wait point expecting the response.
        channel: String,
    },
    /// A queued message may now match an instance's receive.
    Matcher {
        /// Target process.
        process_id: ProcessId,
        /// Target instance.
        instance_id: InstanceId,
        /// Correlator holding the queued message.
        correlator_id: String,
        /// Key of the queued message.
        correlation_key: CorrelationKey,
    },
}

impl WorkEvent {
    /// Decode the payload of a delivered job.
    pub fn from_job(job: &JobInfo) -> Result<Self> {
        Self::from_value(&job.detail)
    }

    /// Decode a JSON payload.
    pub fn from_value(detail: &Value) -> Result<Self> {
        serde_json::from_value(detail.clone()).map_err(|e| EngineError::MalformedJob(e.to_string()))
    }

    /// Encode as a job payload.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| EngineError::MalformedJob(e.to_string()))
    }

    /// Process the event targets.
    pub fn process_id(&self) -> &ProcessId {
        match self {
            Self::MyRoleInvoke { process_id, .. }
            | Self::Timer { process_id, .. }
            | Self::Resume { process_id, .. }
            | Self::PartnerResponse { process_id, .. }
            | Self::Matcher { process_id, .. } => process_id,
        }
    }

    /// Instance the event targets; `None` for process-scoped events.
    pub fn instance_id(&self) -> Option<InstanceId> {
        match self {
            Self::MyRoleInvoke { .. } => None,
            Self::Timer { instance_id, .. }
            | Self::Resume { instance_id, .. }
            | Self::PartnerResponse { instance_id, .. }
            | Self::Matcher { instance_id, .. } => Some(*instance_id),
        }
    }

    /// Tag name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MyRoleInvoke { .. } => "MY_ROLE_INVOKE",
            Self::Timer { .. } => "TIMER",
            Self::Resume { .. } => "RESUME",
            Self::PartnerResponse { .. } => "PARTNER_RESPONSE",
            Self::Matcher { .. } => "MATCHER",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_timer_job() {
        let job = JobInfo {
            job_id: "job-1".to_string(),
            detail: json!({
                "type": "TIMER",
                "process_id": "{urn:test}order",
                "instance_id": 12,
                "channel": "wait-1"
            }),
            retry_count: 0,
        };

        let event = WorkEvent::from_job(&job).unwrap();
        assert_eq!(event.kind(), "TIMER");
        assert_eq!(event.instance_id(), Some(12));
        assert_eq!(event.process_id().as_str(), "{urn:test}order");
    }

    #[test]
    fn test_matcher_key_is_a_value_list() {
        let event = WorkEvent::from_value(&json!({
            "type": "MATCHER",
            "process_id": "p",
            "instance_id": 3,
            "correlator_id": "1.notify",
            "correlation_key": ["A-17"]
        }))
        .unwrap();
        match event {
            WorkEvent::Matcher {
                correlation_key, ..
            } => assert_eq!(correlation_key.values(), ["A-17".to_string()]),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_process_scoped_event_has_no_instance() {
        let event = WorkEvent::MyRoleInvoke {
            process_id: ProcessId::new("p"),
            exchange_id: "mex-1".to_string(),
        };
        assert_eq!(event.instance_id(), None);
        assert_eq!(event.to_value().unwrap()["type"], "MY_ROLE_INVOKE");
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let err = WorkEvent::from_value(&json!({ "type": "EXPLODE" })).unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_JOB");
    }
}
