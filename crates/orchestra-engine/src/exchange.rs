// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message exchange records.
//!
//! A message exchange is one request/response interaction, inbound to a
//! process my-role or outbound to a partner. Its status only moves forward:
//!
//! ```text
//! Pending ──► Active ──► Acknowledged(Response | Fault | Failure | OneWay)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{EngineError, FaultError, Result};
use crate::ids::{InstanceId, ProcessId};

/// How a client invokes a my-role operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStyle {
    /// Routed in a fresh transaction on the caller's task.
    Unreliable,
    /// Persisted and routed later by a scheduled job.
    Reliable,
    /// Routed inside the caller's ambient transaction.
    Transacted,
}

impl InvocationStyle {
    /// Stable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unreliable => "UNRELIABLE",
            Self::Reliable => "RELIABLE",
            Self::Transacted => "TRANSACTED",
        }
    }
}

impl fmt::Display for InvocationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a partner link the exchange belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client invoking a process my-role.
    Inbound,
    /// Process invoking a partner role.
    Outbound,
}

/// Exchange lifecycle status. Ordered: statuses never move backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeStatus {
    /// Created, not yet handed to the engine.
    Pending,
    /// Being routed or processed.
    Active,
    /// Terminal; see [`AckType`].
    Acknowledged,
}

impl fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "PENDING",
            Self::Active => "ACTIVE",
            Self::Acknowledged => "ACKNOWLEDGED",
        };
        f.write_str(name)
    }
}

/// How an exchange was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckType {
    /// A response message is available.
    Response,
    /// The process replied with a fault.
    Fault,
    /// The engine could not deliver the message.
    Failure,
    /// One-way operation accepted.
    OneWay,
}

/// Why an exchange failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// No my-role endpoint matches the target service.
    UnknownEndpoint,
    /// The endpoint does not offer the operation.
    UnknownOperation,
    /// Transport-level failure.
    CommunicationError,
    /// The message could not be processed.
    FormatError,
    /// No response arrived.
    NoResponse,
    /// Anything else.
    Other,
}

/// Persistent state of a message exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRecord {
    /// Exchange id.
    pub id: String,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Invocation style chosen by the client.
    pub style: InvocationStyle,
    /// Lifecycle status.
    pub status: ExchangeStatus,
    /// Set once acknowledged.
    pub ack_type: Option<AckType>,
    /// Set for [`AckType::Failure`].
    pub failure: Option<FailureType>,
    /// Fault raised for [`AckType::Fault`].
    pub fault: Option<FaultError>,
    /// Explanation of a failure.
    pub explanation: Option<String>,
    /// Process the exchange was routed to.
    pub process_id: Option<ProcessId>,
    /// Instance the exchange was routed to.
    pub instance_id: Option<InstanceId>,
    /// Target service name.
    pub callee: Option<String>,
    /// Operation name.
    pub operation: String,
    /// Model id of the partner link the exchange belongs to.
    pub partner_link_model_id: Option<u32>,
    /// Receive channel token (`<group>&<index>`) for matched messages.
    pub channel: Option<String>,
    /// Correlation key computed when routing.
    pub correlation_key: Option<crate::correlation::CorrelationKey>,
    /// Client-supplied key used to recognise retries.
    pub client_key: Option<String>,
    /// Request message.
    pub request: Option<Value>,
    /// Response message.
    pub response: Option<Value>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
}

impl ExchangeRecord {
    /// New pending exchange.
    pub fn new(id: impl Into<String>, direction: Direction, style: InvocationStyle) -> Self {
        Self {
            id: id.into(),
            direction,
            style,
            status: ExchangeStatus::Pending,
            ack_type: None,
            failure: None,
            fault: None,
            explanation: None,
            process_id: None,
            instance_id: None,
            callee: None,
            operation: String::new(),
            partner_link_model_id: None,
            channel: None,
            correlation_key: None,
            client_key: None,
            request: None,
            response: None,
            created_at: Utc::now(),
        }
    }

    /// Move to `to`, returning the previous status.
    ///
    /// Staying in the same status is allowed and changes nothing; moving
    /// backwards is an error.
    pub fn transition(&mut self, to: ExchangeStatus) -> Result<ExchangeStatus> {
        let from = self.status;
        if to < from {
            return Err(EngineError::InvalidStatusTransition {
                exchange_id: self.id.clone(),
                from,
                to,
            });
        }
        self.status = to;
        Ok(from)
    }

    /// Acknowledge with `ack`, returning the previous status.
    pub fn acknowledge(&mut self, ack: AckType) -> Result<ExchangeStatus> {
        let from = self.transition(ExchangeStatus::Acknowledged)?;
        self.ack_type = Some(ack);
        Ok(from)
    }

    /// Acknowledge as a delivery failure, returning the previous status.
    pub fn fail(
        &mut self,
        failure: FailureType,
        explanation: impl Into<String>,
    ) -> Result<ExchangeStatus> {
        let from = self.acknowledge(AckType::Failure)?;
        self.failure = Some(failure);
        self.explanation = Some(explanation.into());
        Ok(from)
    }

    /// Acknowledge with a response message, returning the previous status.
    pub fn respond(&mut self, response: Value) -> Result<ExchangeStatus> {
        let from = self.acknowledge(AckType::Response)?;
        self.response = Some(response);
        Ok(from)
    }

    /// Acknowledge with a fault, returning the previous status.
    ///
    /// An exchange already acknowledged (a one-way message) keeps its
    /// acknowledgement type and only records the fault.
    pub fn reply_fault(&mut self, fault: FaultError) -> Result<ExchangeStatus> {
        let from = self.status;
        if from != ExchangeStatus::Acknowledged {
            self.acknowledge(AckType::Fault)?;
        }
        self.fault = Some(fault);
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExchangeRecord {
        ExchangeRecord::new("mex-1", Direction::Inbound, InvocationStyle::Unreliable)
    }

    #[test]
    fn test_status_moves_forward_only() {
        let mut mex = record();
        assert_eq!(mex.transition(ExchangeStatus::Active).unwrap(), ExchangeStatus::Pending);
        assert_eq!(
            mex.acknowledge(AckType::Response).unwrap(),
            ExchangeStatus::Active
        );

        let err = mex.transition(ExchangeStatus::Active).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStatusTransition {
                from: ExchangeStatus::Acknowledged,
                to: ExchangeStatus::Active,
                ..
            }
        ));
        assert_eq!(mex.status, ExchangeStatus::Acknowledged);
    }

    #[test]
    fn test_same_status_transition_reports_no_change() {
        let mut mex = record();
        mex.acknowledge(AckType::OneWay).unwrap();
        let old = mex.acknowledge(AckType::OneWay).unwrap();
        assert_eq!(old, ExchangeStatus::Acknowledged);
        assert_eq!(mex.status, old);
    }

    #[test]
    fn test_fail_records_failure_and_explanation() {
        let mut mex = record();
        mex.fail(FailureType::UnknownEndpoint, "no endpoint").unwrap();
        assert_eq!(mex.ack_type, Some(AckType::Failure));
        assert_eq!(mex.failure, Some(FailureType::UnknownEndpoint));
        assert_eq!(mex.explanation.as_deref(), Some("no endpoint"));
    }

    #[test]
    fn test_fault_on_one_way_keeps_ack_type() {
        let mut mex = record();
        mex.acknowledge(AckType::OneWay).unwrap();
        mex.reply_fault(FaultError::selection_failure("empty")).unwrap();
        assert_eq!(mex.ack_type, Some(AckType::OneWay));
        assert!(mex.fault.is_some());
    }
}
