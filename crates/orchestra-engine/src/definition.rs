// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compiled process definitions.
//!
//! The compiled form is JSON. It carries the partner links with their roles
//! and operations, the correlation property aliases per inbound operation,
//! and the expression languages the process uses. Hydration reads it through
//! a [`DefinitionSource`] and fingerprints it so stale process records can
//! be replaced.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Compiled definition of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Process name as declared in the source.
    pub name: String,
    /// Partner links declared by the process.
    #[serde(default)]
    pub partner_links: Vec<PartnerLinkDef>,
    /// Expression languages used by the process.
    #[serde(default)]
    pub expression_languages: Vec<ExpressionLanguage>,
}

/// A partner link with optional my-role and partner-role sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerLinkDef {
    /// Model id, unique within the definition.
    pub id: u32,
    /// Name referenced by deployment descriptors.
    pub name: String,
    /// Role the process plays (inbound operations).
    #[serde(default)]
    pub my_role: Option<RoleDef>,
    /// Role the partner plays (outbound operations).
    #[serde(default)]
    pub partner_role: Option<RoleDef>,
}

/// One side of a partner link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleDef {
    /// Role name.
    pub name: String,
    /// Port type implemented by this role.
    pub port_type: String,
    /// Operations of the port type.
    #[serde(default)]
    pub operations: Vec<OperationDef>,
}

/// An operation of a port type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDef {
    /// Operation name.
    pub name: String,
    /// One-way operations have no response.
    #[serde(default)]
    pub one_way: bool,
    /// Whether a message on this operation may start a new instance.
    #[serde(default)]
    pub create_instance: bool,
    /// Property aliases that build the correlation key of inbound messages.
    #[serde(default)]
    pub correlation: Vec<PropertyAlias>,
}

/// Maps a correlation property onto a location in a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAlias {
    /// Qualified property name.
    pub property: String,
    /// Message part the query starts from. `None` uses the whole message.
    #[serde(default)]
    pub part: Option<String>,
    /// Query into the part. `None` selects the part itself.
    #[serde(default)]
    pub location: Option<Expression>,
}

impl PropertyAlias {
    /// Short description used in fault explanations.
    pub fn description(&self) -> String {
        let mut desc = self.property.clone();
        if let Some(part) = &self.part {
            desc.push_str(&format!(" part {}", part));
        }
        if let Some(location) = &self.location {
            desc.push_str(&format!(" query {}", location.text));
        }
        desc
    }
}

/// An expression in a named language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expression {
    /// Language URI.
    pub language: String,
    /// Expression text.
    pub text: String,
}

/// An expression language declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpressionLanguage {
    /// Language URI.
    pub uri: String,
    /// Provider-specific settings.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ProcessDefinition {
    /// Decode a compiled definition.
    pub fn from_compiled(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Encode to the compiled form.
    pub fn to_compiled(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Look up a partner link by name.
    pub fn partner_link(&self, name: &str) -> Option<&PartnerLinkDef> {
        self.partner_links.iter().find(|pl| pl.name == name)
    }

    /// Look up a partner link by model id.
    pub fn partner_link_by_id(&self, id: u32) -> Option<&PartnerLinkDef> {
        self.partner_links.iter().find(|pl| pl.id == id)
    }

    /// Correlator ids of every my-role operation, in declaration order.
    pub fn correlator_ids(&self) -> Vec<String> {
        self.partner_links
            .iter()
            .filter_map(|pl| pl.my_role.as_ref().map(|role| (pl, role)))
            .flat_map(|(pl, role)| role.operations.iter().map(|op| correlator_id(pl, &op.name)))
            .collect()
    }
}

impl PartnerLinkDef {
    /// Find a my-role operation by name.
    pub fn my_role_operation(&self, name: &str) -> Option<&OperationDef> {
        self.my_role
            .as_ref()
            .and_then(|role| role.operations.iter().find(|op| op.name == name))
    }
}

/// Identifier of the correlator for messages on `operation` of `link`.
pub fn correlator_id(link: &PartnerLinkDef, operation: &str) -> String {
    format!("{}.{}", link.id, operation)
}

/// Fingerprint of a compiled definition: hex SHA-256 of the bytes prefixed
/// with the process name.
pub fn fingerprint(definition: &ProcessDefinition, compiled: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(definition.name.as_bytes());
    hasher.update([0u8]);
    hasher.update(compiled);
    format!("{:x}", hasher.finalize())
}

/// Where hydration reads compiled definition bytes from.
pub trait DefinitionSource: Send + Sync + fmt::Debug {
    /// Read the compiled bytes.
    fn read(&self) -> std::io::Result<Vec<u8>>;
}

/// Compiled definition held in memory.
#[derive(Debug, Clone)]
pub struct InlineDefinition(Vec<u8>);

impl InlineDefinition {
    /// Wrap already compiled bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Compile `definition` into an in-memory source.
    pub fn from_definition(definition: &ProcessDefinition) -> serde_json::Result<Self> {
        definition.to_compiled().map(Self)
    }
}

impl DefinitionSource for InlineDefinition {
    fn read(&self) -> std::io::Result<Vec<u8>> {
        Ok(self.0.clone())
    }
}

/// Compiled definition stored in a file, re-read on every hydration.
#[derive(Debug, Clone)]
pub struct FileDefinition(PathBuf);

impl FileDefinition {
    /// Read from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }
}

impl DefinitionSource for FileDefinition {
    fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.0)
    }
}
