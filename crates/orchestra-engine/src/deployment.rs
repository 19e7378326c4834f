// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment descriptors: which endpoints a process provides and invokes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::definition::DefinitionSource;
use crate::events::EventSettings;
use crate::ids::ProcessId;

/// A service endpoint: service name plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Qualified service name.
    pub service: String,
    /// Port within the service.
    pub port: String,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(service: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.port)
    }
}

/// Address of an activated endpoint, as handed out by the binding layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointReference(String);

impl EndpointReference {
    /// Wrap an address.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address.
    pub fn address(&self) -> &str {
        &self.0
    }
}

/// Deployment of one process version.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    /// Process identity.
    pub process_id: ProcessId,
    /// Deployment version.
    pub version: i64,
    /// Transient processes keep all runtime records in memory.
    pub transient: bool,
    /// Partner link name to the endpoint the process provides for its my-role.
    pub provide: BTreeMap<String, Endpoint>,
    /// Partner link name to the initial partner endpoint for its partner-role.
    pub invoke: BTreeMap<String, Endpoint>,
    /// Which process events are recorded.
    pub events: EventSettings,
    /// Where the compiled definition is read from.
    pub definition: Arc<dyn DefinitionSource>,
}

impl DeploymentConfig {
    /// Create a persistent, version 1 deployment with no endpoints.
    pub fn new(process_id: impl Into<ProcessId>, definition: Arc<dyn DefinitionSource>) -> Self {
        Self {
            process_id: process_id.into(),
            version: 1,
            transient: false,
            provide: BTreeMap::new(),
            invoke: BTreeMap::new(),
            events: EventSettings::default(),
            definition,
        }
    }

    /// Set the deployment version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Mark the deployment transient (in-memory only).
    pub fn with_transient(mut self, transient: bool) -> Self {
        self.transient = transient;
        self
    }

    /// Provide `endpoint` for the my-role of `partner_link`.
    pub fn provide(mut self, partner_link: impl Into<String>, endpoint: Endpoint) -> Self {
        self.provide.insert(partner_link.into(), endpoint);
        self
    }

    /// Use `endpoint` as the initial partner for the partner-role of `partner_link`.
    pub fn invoke(mut self, partner_link: impl Into<String>, endpoint: Endpoint) -> Self {
        self.invoke.insert(partner_link.into(), endpoint);
        self
    }

    /// Replace the event settings.
    pub fn with_events(mut self, events: EventSettings) -> Self {
        self.events = events;
        self
    }
}
