// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound message correlation.
//!
//! Each my-role operation has a correlator (`<partner link id>.<operation>`).
//! An inbound message computes its correlation key from the operation's
//! property aliases and then, in order:
//!
//! 1. matches a route an instance registered for that key, or
//! 2. creates a new instance if the operation allows it, or
//! 3. is queued on the correlator until an instance asks for it.
//!
//! Steps 1 and 3 are a single store operation, mirrored on the receive side
//! by dequeue-or-register, so an arriving message and a registering instance
//! always meet.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::definition::{OperationDef, correlator_id};
use crate::error::{EngineError, Result};
use crate::exchange::ExchangeRecord;
use crate::expression::{ExpressionRuntimeRegistry, extract_property};
use crate::ids::{InstanceId, ProcessId};
use crate::persistence::Store;
use crate::roles::MyRoleBinding;

/// Ordered property values identifying a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey {
    values: Vec<String>,
}

impl CorrelationKey {
    /// Key made of `values`.
    pub fn new(values: Vec<String>) -> Self {
        Self { values }
    }

    /// Property values in alias order.
    pub fn values(&self) -> &[String] {
        &self.values
    }

    /// Whether the key has no values (the operation declares no correlation).
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.values.join("~"))
    }
}

/// Receive channel of a waiting instance, encoded as `<group>&<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiveToken {
    /// Receive group (one per pick or receive activity).
    pub group_id: String,
    /// Index of the branch within the group.
    pub index: u32,
}

impl ReceiveToken {
    /// Token for branch `index` of `group_id`.
    pub fn new(group_id: impl Into<String>, index: u32) -> Self {
        Self {
            group_id: group_id.into(),
            index,
        }
    }

    /// Parse the `<group>&<index>` form.
    pub fn parse(token: &str) -> Result<Self> {
        let (group_id, index) = token
            .rsplit_once('&')
            .ok_or_else(|| EngineError::InvalidReceiveToken(token.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| EngineError::InvalidReceiveToken(token.to_string()))?;
        if group_id.is_empty() {
            return Err(EngineError::InvalidReceiveToken(token.to_string()));
        }
        Ok(Self::new(group_id, index))
    }
}

impl fmt::Display for ReceiveToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}&{}", self.group_id, self.index)
    }
}

/// Where an inbound message went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// A new instance was created for the message.
    CreateInstance {
        /// The new instance.
        instance_id: InstanceId,
    },
    /// An existing instance was waiting for the message.
    Matched {
        /// The waiting instance.
        instance_id: InstanceId,
        /// Its receive channel.
        token: ReceiveToken,
    },
    /// No instance wants the message yet.
    Queued,
}

/// Compute the correlation key of `exchange` for `operation`.
pub fn correlation_key(
    registry: &ExpressionRuntimeRegistry,
    correlator: &str,
    operation: &OperationDef,
    exchange: &ExchangeRecord,
) -> Result<CorrelationKey> {
    if operation.correlation.is_empty() {
        return Ok(CorrelationKey::default());
    }
    let message = exchange.request.clone().unwrap_or_default();
    let values = operation
        .correlation
        .iter()
        .map(|alias| extract_property(registry, &message, alias, correlator))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(CorrelationKey::new(values))
}

/// Route `exchange` to an instance, a new instance, or the correlator queue.
///
/// Updates the routing fields of `exchange` but does not save it. A
/// correlation fault is returned as [`EngineError::Fault`].
pub(crate) async fn correlate(
    store: &dyn Store,
    registry: &ExpressionRuntimeRegistry,
    process_id: &ProcessId,
    target: &MyRoleBinding,
    operation: &OperationDef,
    exchange: &mut ExchangeRecord,
) -> Result<CorrelationOutcome> {
    let correlator = correlator_id(target.partner_link(), &operation.name);
    let key = correlation_key(registry, &correlator, operation, exchange)?;
    exchange.correlation_key = Some(key.clone());

    let route = if operation.create_instance {
        store.take_route(process_id, &correlator, &key).await?
    } else {
        store
            .take_route_or_enqueue(process_id, &correlator, &key, &exchange.id)
            .await?
    };
    if let Some(route) = route {
        debug!(
            exchange_id = %exchange.id,
            correlator = %correlator,
            key = %key,
            instance_id = route.instance_id,
            "Message matched waiting instance"
        );
        exchange.instance_id = Some(route.instance_id);
        exchange.channel = Some(route.token.to_string());
        return Ok(CorrelationOutcome::Matched {
            instance_id: route.instance_id,
            token: route.token,
        });
    }

    if operation.create_instance {
        let instance = store
            .create_instance(process_id, Some(exchange.id.as_str()))
            .await?;
        debug!(
            exchange_id = %exchange.id,
            instance_id = instance.instance_id,
            "Message creates new instance"
        );
        exchange.instance_id = Some(instance.instance_id);
        return Ok(CorrelationOutcome::CreateInstance {
            instance_id: instance.instance_id,
        });
    }

    debug!(
        exchange_id = %exchange.id,
        correlator = %correlator,
        key = %key,
        "Message queued on correlator"
    );
    Ok(CorrelationOutcome::Queued)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_token_parse() {
        let token = ReceiveToken::parse("pick-3&1").unwrap();
        assert_eq!(token, ReceiveToken::new("pick-3", 1));
        assert_eq!(token.to_string(), "pick-3&1");

        // Group ids may themselves contain '&'; the index is after the last one.
        assert_eq!(
            ReceiveToken::parse("a&b&2").unwrap(),
            ReceiveToken::new("a&b", 2)
        );
    }

    #[test]
    fn test_receive_token_rejects_malformed() {
        for bad in ["", "nogroup", "g&", "&1", "g&x"] {
            let err = ReceiveToken::parse(bad).unwrap_err();
            assert_eq!(err.error_code(), "INVALID_RECEIVE_TOKEN", "token {:?}", bad);
        }
    }

    #[test]
    fn test_key_display() {
        let key = CorrelationKey::new(vec!["A-17".to_string(), "eu".to_string()]);
        assert_eq!(key.to_string(), "[A-17~eu]");
        assert!(CorrelationKey::default().is_empty());
    }
}
