// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Role bindings.
//!
//! Joins the partner links of a compiled definition with the endpoints of
//! its deployment:
//!
//! | Side         | Keyed by             | Holds                                   |
//! |--------------|----------------------|-----------------------------------------|
//! | my-role      | partner link id      | provided endpoint, activated address    |
//! | my-role      | provided endpoint    | partner link id (routing lookup)        |
//! | partner-role | partner link id      | initial partner endpoint, channel, EPR  |
//!
//! Bindings are rebuilt on every hydration. Partner channels and activated
//! addresses outlive dehydration and are re-attached from [`PartnerCache`]
//! and the process' my-role address table.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::binding::PartnerRoleChannel;
use crate::definition::{OperationDef, PartnerLinkDef, ProcessDefinition};
use crate::deployment::{DeploymentConfig, Endpoint, EndpointReference};
use crate::error::{EngineError, Result};

/// My-role side of a partner link.
#[derive(Debug, Clone, PartialEq)]
pub struct MyRoleBinding {
    link: PartnerLinkDef,
    endpoint: Endpoint,
    initial_epr: Option<EndpointReference>,
}

impl MyRoleBinding {
    /// The partner link.
    pub fn partner_link(&self) -> &PartnerLinkDef {
        &self.link
    }

    /// Endpoint provided for this role.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Address handed out when the endpoint was activated.
    pub fn initial_epr(&self) -> Option<&EndpointReference> {
        self.initial_epr.as_ref()
    }

    /// Find an operation of this role.
    pub fn operation(&self, name: &str) -> Option<&OperationDef> {
        self.link.my_role_operation(name)
    }
}

/// Partner-role side of a partner link.
#[derive(Clone)]
pub struct PartnerRoleBinding {
    link: PartnerLinkDef,
    initial_partner: Option<Endpoint>,
    channel: Option<Arc<dyn PartnerRoleChannel>>,
    initial_epr: Option<EndpointReference>,
}

impl fmt::Debug for PartnerRoleBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartnerRoleBinding")
            .field("link", &self.link.name)
            .field("initial_partner", &self.initial_partner)
            .field("channel", &self.channel.as_ref().map(|_| "..."))
            .field("initial_epr", &self.initial_epr)
            .finish()
    }
}

impl PartnerRoleBinding {
    /// The partner link.
    pub fn partner_link(&self) -> &PartnerLinkDef {
        &self.link
    }

    /// Port type of the partner role.
    pub fn port_type(&self) -> &str {
        self.link
            .partner_role
            .as_ref()
            .map_or("", |role| role.port_type.as_str())
    }

    /// Partner endpoint named by the deployment, if any.
    pub fn initial_partner(&self) -> Option<&Endpoint> {
        self.initial_partner.as_ref()
    }

    /// Channel to the partner.
    pub fn channel(&self) -> Option<&Arc<dyn PartnerRoleChannel>> {
        self.channel.as_ref()
    }

    /// Initial address of the partner, as reported by the channel.
    pub fn initial_epr(&self) -> Option<&EndpointReference> {
        self.initial_epr.as_ref()
    }
}

/// Partner channels created on the first hydration, keyed by partner link name.
#[derive(Default)]
pub(crate) struct PartnerCache {
    pub(crate) hydrated_once: bool,
    pub(crate) channels: HashMap<String, Arc<dyn PartnerRoleChannel>>,
    pub(crate) eprs: HashMap<String, EndpointReference>,
}

/// All role bindings of a hydrated process.
#[derive(Debug, Clone, Default)]
pub struct RoleBindings {
    my_roles: BTreeMap<u32, MyRoleBinding>,
    endpoints: HashMap<Endpoint, u32>,
    partner_roles: BTreeMap<u32, PartnerRoleBinding>,
}

impl RoleBindings {
    /// Bind `definition` to the endpoints of `conf`.
    ///
    /// Fails when the deployment names a partner link the definition lacks,
    /// or when a my-role has no provided endpoint.
    pub fn build(definition: &ProcessDefinition, conf: &DeploymentConfig) -> Result<Self> {
        let configuration_error = |message: String| EngineError::Configuration {
            process_id: conf.process_id.clone(),
            message,
        };

        for name in conf.provide.keys().chain(conf.invoke.keys()) {
            if definition.partner_link(name).is_none() {
                return Err(configuration_error(format!(
                    "reference to unknown partner link {}",
                    name
                )));
            }
        }

        let mut bindings = Self::default();
        for link in &definition.partner_links {
            if link.my_role.is_some() {
                let endpoint = conf.provide.get(&link.name).cloned().ok_or_else(|| {
                    configuration_error(format!(
                        "no endpoint provided for my-role of partner link {}",
                        link.name
                    ))
                })?;
                bindings.endpoints.insert(endpoint.clone(), link.id);
                bindings.my_roles.insert(
                    link.id,
                    MyRoleBinding {
                        link: link.clone(),
                        endpoint,
                        initial_epr: None,
                    },
                );
            }

            if link.partner_role.is_some() {
                bindings.partner_roles.insert(
                    link.id,
                    PartnerRoleBinding {
                        link: link.clone(),
                        initial_partner: conf.invoke.get(&link.name).cloned(),
                        channel: None,
                        initial_epr: None,
                    },
                );
            }
        }
        Ok(bindings)
    }

    /// Attach cached partner channels and activated my-role addresses.
    pub(crate) fn attach(
        &mut self,
        partners: &PartnerCache,
        my_eprs: &HashMap<Endpoint, EndpointReference>,
    ) {
        for binding in self.my_roles.values_mut() {
            binding.initial_epr = my_eprs.get(&binding.endpoint).cloned();
        }
        for binding in self.partner_roles.values_mut() {
            binding.channel = partners.channels.get(&binding.link.name).cloned();
            binding.initial_epr = partners.eprs.get(&binding.link.name).cloned();
        }
    }

    /// My-role binding by partner link id.
    pub fn my_role(&self, link_id: u32) -> Option<&MyRoleBinding> {
        self.my_roles.get(&link_id)
    }

    /// My-role binding by partner link name.
    pub fn my_role_by_name(&self, name: &str) -> Option<&MyRoleBinding> {
        self.my_roles.values().find(|b| b.link.name == name)
    }

    /// My-role binding providing `endpoint`.
    pub fn my_role_for_endpoint(&self, endpoint: &Endpoint) -> Option<&MyRoleBinding> {
        self.endpoints
            .get(endpoint)
            .and_then(|id| self.my_roles.get(id))
    }

    /// My-role binding providing any port of `service`.
    pub fn my_role_for_service(&self, service: &str) -> Option<&MyRoleBinding> {
        self.my_roles.values().find(|b| b.endpoint.service == service)
    }

    /// All my-role bindings, by partner link id.
    pub fn my_roles(&self) -> impl Iterator<Item = &MyRoleBinding> {
        self.my_roles.values()
    }

    /// Partner-role binding by partner link id.
    pub fn partner_role(&self, link_id: u32) -> Option<&PartnerRoleBinding> {
        self.partner_roles.get(&link_id)
    }

    /// Partner-role binding by partner link name.
    pub fn partner_role_by_name(&self, name: &str) -> Option<&PartnerRoleBinding> {
        self.partner_roles.values().find(|b| b.link.name == name)
    }

    /// All partner-role bindings, by partner link id.
    pub fn partner_roles(&self) -> impl Iterator<Item = &PartnerRoleBinding> {
        self.partner_roles.values()
    }
}
