// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process events and the settings that decide which ones are recorded.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// An event emitted by a running process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEvent {
    /// Event kind, e.g. `ActivityExecStart`.
    pub kind: String,
    /// Names of the enclosing scopes, innermost first. `None` for process-level events.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    /// Event details.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl ProcessEvent {
    /// Create a process-level event.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scopes: None,
            payload: None,
        }
    }

    /// Attach the enclosing scope names, innermost first.
    pub fn in_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Which event kinds pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "kinds")]
pub enum EventFilter {
    /// Every kind.
    #[default]
    All,
    /// No kinds.
    None,
    /// Only the listed kinds.
    Only(BTreeSet<String>),
}

impl EventFilter {
    fn allows(&self, kind: &str) -> bool {
        match self {
            Self::All => true,
            Self::None => false,
            Self::Only(kinds) => kinds.contains(kind),
        }
    }
}

/// Event recording settings of a deployment.
///
/// A scope-level filter applies to events raised inside that scope; the
/// innermost scope with a filter wins, otherwise the process filter applies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventSettings {
    /// Filter for events with no scope-level override.
    #[serde(default)]
    pub process: EventFilter,
    /// Per-scope overrides keyed by scope name.
    #[serde(default)]
    pub scopes: BTreeMap<String, EventFilter>,
}

impl EventSettings {
    /// Settings that record nothing.
    pub fn disabled() -> Self {
        Self {
            process: EventFilter::None,
            scopes: BTreeMap::new(),
        }
    }

    /// Whether an event of `kind` raised inside `scopes` (innermost first) is recorded.
    pub fn is_enabled(&self, scopes: Option<&[String]>, kind: &str) -> bool {
        let scoped = scopes
            .unwrap_or_default()
            .iter()
            .find_map(|scope| self.scopes.get(scope));
        scoped.unwrap_or(&self.process).allows(kind)
    }
}
