// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Expression languages and correlation property extraction.
//!
//! Each hydrated process gets its own [`ExpressionRuntimeRegistry`] holding
//! one runtime per language its definition declares. Runtimes are created by
//! an [`ExpressionLanguageProvider`]; [`BuiltinLanguages`] knows the JSON
//! pointer language used by most compiled definitions.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

use crate::definition::{Expression, ExpressionLanguage, PropertyAlias};
use crate::error::FaultError;

/// URI of the built-in JSON pointer (RFC 6901) language.
pub const JSON_POINTER_LANGUAGE: &str = "urn:orchestra:expression:json-pointer";

/// Expression failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// The language cannot be set up.
    #[error("expression language configuration: {0}")]
    Configuration(String),
    /// The expression could not be evaluated.
    #[error("expression evaluation: {0}")]
    Evaluation(String),
}

/// Evaluates expressions of one language.
pub trait ExpressionRuntime: Send + Sync {
    /// Evaluate `expression` against `context`. `Ok(None)` means nothing was selected.
    fn evaluate(&self, expression: &Expression, context: &Value) -> Result<Option<Value>, ExpressionError>;
}

/// Creates expression runtimes for declared languages.
pub trait ExpressionLanguageProvider: Send + Sync {
    /// Create a runtime for `language`.
    fn create_runtime(
        &self,
        language: &ExpressionLanguage,
    ) -> Result<Arc<dyn ExpressionRuntime>, ExpressionError>;
}

/// JSON pointer expressions. The empty pointer selects the whole context.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPointerRuntime;

impl ExpressionRuntime for JsonPointerRuntime {
    fn evaluate(&self, expression: &Expression, context: &Value) -> Result<Option<Value>, ExpressionError> {
        let pointer = expression.text.trim();
        if !pointer.is_empty() && !pointer.starts_with('/') {
            return Err(ExpressionError::Evaluation(format!(
                "'{}' is not a JSON pointer",
                expression.text
            )));
        }
        Ok(context
            .pointer(pointer)
            .filter(|value| !value.is_null())
            .cloned())
    }
}

/// Provider for the languages shipped with the engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinLanguages;

impl ExpressionLanguageProvider for BuiltinLanguages {
    fn create_runtime(
        &self,
        language: &ExpressionLanguage,
    ) -> Result<Arc<dyn ExpressionRuntime>, ExpressionError> {
        match language.uri.as_str() {
            JSON_POINTER_LANGUAGE => Ok(Arc::new(JsonPointerRuntime)),
            other => Err(ExpressionError::Configuration(format!(
                "unsupported expression language {}",
                other
            ))),
        }
    }
}

/// Per-process expression runtimes keyed by language URI.
#[derive(Clone, Default)]
pub struct ExpressionRuntimeRegistry {
    runtimes: HashMap<String, Arc<dyn ExpressionRuntime>>,
}

impl fmt::Debug for ExpressionRuntimeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionRuntimeRegistry")
            .field("languages", &self.runtimes.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExpressionRuntimeRegistry {
    /// Registry with only the JSON pointer language.
    pub fn with_json_pointer() -> Self {
        let mut registry = Self::default();
        registry
            .runtimes
            .insert(JSON_POINTER_LANGUAGE.to_string(), Arc::new(JsonPointerRuntime));
        registry
    }

    /// Create and register a runtime for `language`.
    pub fn register(
        &mut self,
        language: &ExpressionLanguage,
        provider: &dyn ExpressionLanguageProvider,
    ) -> Result<(), ExpressionError> {
        let runtime = provider.create_runtime(language)?;
        self.runtimes.insert(language.uri.clone(), runtime);
        Ok(())
    }

    /// Whether a runtime is registered for `uri`.
    pub fn contains(&self, uri: &str) -> bool {
        self.runtimes.contains_key(uri)
    }

    /// Evaluate with the runtime registered for the expression's language.
    pub fn evaluate(&self, expression: &Expression, context: &Value) -> Result<Option<Value>, ExpressionError> {
        let runtime = self.runtimes.get(&expression.language).ok_or_else(|| {
            ExpressionError::Evaluation(format!(
                "no runtime registered for language {}",
                expression.language
            ))
        })?;
        runtime.evaluate(expression, context)
    }
}

/// Extract the value of a correlation property from `message`.
///
/// The alias picks a message part (or the whole message) and optionally a
/// location inside it. Strings are returned as-is, other scalars in their
/// JSON text form, and objects or arrays as the concatenation of their
/// direct scalar children. An empty selection raises a selection fault
/// naming the alias and `target`.
pub fn extract_property(
    registry: &ExpressionRuntimeRegistry,
    message: &Value,
    alias: &PropertyAlias,
    target: &str,
) -> Result<String, FaultError> {
    let empty_selection = || {
        let explanation = format!(
            "Property alias {} returned an empty node set while evaluating {}",
            alias.description(),
            target
        );
        error!("{}", explanation);
        FaultError::selection_failure(explanation)
    };

    let root = match &alias.part {
        Some(part) => message.get(part).ok_or_else(empty_selection)?,
        None => message,
    };

    let selected = match &alias.location {
        Some(location) => registry.evaluate(location, root).map_err(|e| {
            error!(alias = %alias.description(), error = %e, "Property alias query failed");
            FaultError::selection_failure(format!(
                "Property alias {} could not be evaluated while evaluating {}: {}",
                alias.description(),
                target,
                e
            ))
        })?,
        None => Some(root.clone()),
    };

    match selected {
        None | Some(Value::Null) => Err(empty_selection()),
        Some(Value::String(text)) => Ok(text),
        Some(Value::Object(map)) => Ok(concat_scalars(map.values())),
        Some(Value::Array(items)) => Ok(concat_scalars(items.iter())),
        Some(scalar) => Ok(scalar.to_string()),
    }
}

fn concat_scalars<'a>(children: impl Iterator<Item = &'a Value>) -> String {
    children.fold(String::new(), |mut text, child| {
        match child {
            Value::String(s) => text.push_str(s),
            Value::Number(n) => text.push_str(&n.to_string()),
            Value::Bool(b) => text.push_str(if *b { "true" } else { "false" }),
            _ => {}
        }
        text
    })
}
