// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Binding layer seam.
//!
//! The binding layer owns transports. The engine asks it to activate the
//! endpoints a process provides and to open channels to the partners a
//! process invokes.

use async_trait::async_trait;
use std::sync::Arc;

use crate::deployment::{Endpoint, EndpointReference};
use crate::error::Result;
use crate::exchange::ExchangeRecord;
use crate::ids::ProcessId;

/// Channel to a partner-role endpoint.
#[async_trait]
pub trait PartnerRoleChannel: Send + Sync {
    /// Address of the partner this channel initially talks to.
    fn initial_endpoint_reference(&self) -> Option<EndpointReference>;

    /// Send an outbound exchange to the partner.
    async fn invoke(&self, exchange: &ExchangeRecord) -> Result<()>;

    /// Release transport resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Endpoint activation and partner channel creation.
#[async_trait]
pub trait BindingContext: Send + Sync {
    /// Start accepting messages for `endpoint` on behalf of `process_id`.
    async fn activate_my_role_endpoint(
        &self,
        process_id: &ProcessId,
        endpoint: &Endpoint,
    ) -> Result<EndpointReference>;

    /// Stop accepting messages for `endpoint`.
    async fn deactivate_my_role_endpoint(&self, endpoint: &Endpoint) -> Result<()>;

    /// Open a channel for a partner role of `port_type`.
    async fn create_partner_role_channel(
        &self,
        process_id: &ProcessId,
        port_type: &str,
        initial_partner: Option<&Endpoint>,
    ) -> Result<Arc<dyn PartnerRoleChannel>>;
}
