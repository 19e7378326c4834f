// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orchestra-engine.
//!
//! [`EngineError`] is the single error type returned by runtime operations.
//! Business faults raised while evaluating process data travel as
//! [`FaultError`] and are wrapped by [`EngineError::Fault`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::{ExchangeStatus, InvocationStyle};
use crate::ids::{InstanceId, ProcessId};

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Qualified name of the standard fault raised when a query selects nothing.
pub const SELECTION_FAILURE: &str =
    "{http://docs.oasis-open.org/wsbpel/2.0/process/executable}selectionFailure";

/// A business fault surfaced to the process or to the exchange client.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("fault {qualifier}: {explanation}")]
pub struct FaultError {
    /// Qualified fault name.
    pub qualifier: String,
    /// Human readable explanation.
    pub explanation: String,
}

impl FaultError {
    /// Create a fault with an arbitrary qualifier.
    pub fn new(qualifier: impl Into<String>, explanation: impl Into<String>) -> Self {
        Self {
            qualifier: qualifier.into(),
            explanation: explanation.into(),
        }
    }

    /// Create a [`SELECTION_FAILURE`] fault.
    pub fn selection_failure(explanation: impl Into<String>) -> Self {
        Self::new(SELECTION_FAILURE, explanation)
    }
}

/// Errors produced by the process runtime.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The deployment descriptor does not agree with the compiled definition.
    #[error("Error in deployment descriptor for process {process_id}; {message}")]
    Configuration {
        /// Process whose deployment is broken.
        process_id: ProcessId,
        /// What is wrong with it.
        message: String,
    },

    /// The compiled definition could not be read or decoded.
    #[error("Error reloading compiled process {process_id}; the file appears to be corrupted: {reason}")]
    CorruptDefinition {
        /// Process being hydrated.
        process_id: ProcessId,
        /// Underlying read or decode failure.
        reason: String,
    },

    /// An expression language declared by the definition failed to initialize.
    #[error("Error registering expression language {uri} for process {process_id}: {reason}")]
    ExpressionLanguage {
        /// Process being hydrated.
        process_id: ProcessId,
        /// Language URI.
        uri: String,
        /// Provider failure.
        reason: String,
    },

    /// A stored message exchange references something the definition lacks.
    #[error("Database consistency error: message exchange {exchange_id} {reference}")]
    DbConsistency {
        /// Offending exchange.
        exchange_id: String,
        /// The dangling reference.
        reference: String,
    },

    /// The store failed.
    #[error("Storage error during '{operation}': {details}")]
    Storage {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// The scheduler failed.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// The binding layer failed to activate or create an endpoint.
    #[error("Binding error: {0}")]
    Binding(String),

    /// A business fault.
    #[error(transparent)]
    Fault(#[from] FaultError),

    /// No my-role endpoint exposes the requested service.
    #[error("No such service: {0}")]
    NoSuchService(String),

    /// The service exists but does not offer the operation.
    #[error("No such operation '{operation}' on service '{service}'")]
    NoSuchOperation {
        /// Service name.
        service: String,
        /// Operation name.
        operation: String,
    },

    /// The named partner link is not part of the definition.
    #[error("Unknown partner link: {0}")]
    UnknownPartnerLink(String),

    /// The message exchange is not in the store.
    #[error("Message exchange '{0}' not found")]
    ExchangeNotFound(String),

    /// The process does not accept the requested invocation style.
    #[error("Invocation style {style} is not supported by process {process_id}")]
    UnsupportedInvocationStyle {
        /// Process being invoked.
        process_id: ProcessId,
        /// Requested style.
        style: InvocationStyle,
    },

    /// Exchange statuses only move forward.
    #[error("Message exchange '{exchange_id}' cannot move from {from} to {to}")]
    InvalidStatusTransition {
        /// Exchange being updated.
        exchange_id: String,
        /// Current status.
        from: ExchangeStatus,
        /// Requested status.
        to: ExchangeStatus,
    },

    /// Inline instance work was requested off the instance's worker.
    #[error("Work for instance {instance_id} must run on its instance worker")]
    NotOnWorker {
        /// Instance whose worker was expected.
        instance_id: InstanceId,
    },

    /// A queued unit of work panicked.
    #[error("Work for instance {instance_id} panicked")]
    WorkPanicked {
        /// Instance whose work panicked.
        instance_id: InstanceId,
    },

    /// The worker or task running a unit of work went away before reporting.
    #[error("Work was abandoned before completion")]
    WorkAbandoned,

    /// Work events are dispatched outside of any ambient transaction.
    #[error("Work events must be handled outside of a transaction")]
    UnexpectedTransaction,

    /// The operation needs an ambient transaction and there is none.
    #[error("Operation requires an active transaction")]
    TransactionRequired,

    /// A scheduled job payload is not a work event.
    #[error("Malformed work event: {0}")]
    MalformedJob(String),

    /// A receive channel token is not `<group>&<index>`.
    #[error("Malformed receive channel token '{0}'")]
    InvalidReceiveToken(String),

    /// No runtime is registered for the process.
    #[error("Process {0} is not registered with the engine")]
    ProcessNotFound(ProcessId),

    /// A hydrate lease was held but no hydrated state was published.
    #[error("Process {0} is not hydrated")]
    NotHydrated(ProcessId),

    /// The requested capability is not available.
    #[error("{0} is not supported")]
    Unsupported(String),

    /// The process interpreter failed.
    #[error("Interpreter error: {0}")]
    Interpreter(String),
}

impl EngineError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "CONFIGURATION_ERROR",
            Self::CorruptDefinition { .. } => "CORRUPT_DEFINITION",
            Self::ExpressionLanguage { .. } => "EXPRESSION_LANGUAGE_ERROR",
            Self::DbConsistency { .. } => "DB_CONSISTENCY_ERROR",
            Self::Storage { .. } => "STORAGE_ERROR",
            Self::Scheduler(_) => "SCHEDULER_ERROR",
            Self::Binding(_) => "BINDING_ERROR",
            Self::Fault(_) => "FAULT",
            Self::NoSuchService(_) => "NO_SUCH_SERVICE",
            Self::NoSuchOperation { .. } => "NO_SUCH_OPERATION",
            Self::UnknownPartnerLink(_) => "UNKNOWN_PARTNER_LINK",
            Self::ExchangeNotFound(_) => "EXCHANGE_NOT_FOUND",
            Self::UnsupportedInvocationStyle { .. } => "UNSUPPORTED_INVOCATION_STYLE",
            Self::InvalidStatusTransition { .. } => "INVALID_STATUS_TRANSITION",
            Self::NotOnWorker { .. } => "NOT_ON_WORKER",
            Self::WorkPanicked { .. } => "WORK_PANICKED",
            Self::WorkAbandoned => "WORK_ABANDONED",
            Self::UnexpectedTransaction => "UNEXPECTED_TRANSACTION",
            Self::TransactionRequired => "TRANSACTION_REQUIRED",
            Self::MalformedJob(_) => "MALFORMED_JOB",
            Self::InvalidReceiveToken(_) => "INVALID_RECEIVE_TOKEN",
            Self::ProcessNotFound(_) => "PROCESS_NOT_FOUND",
            Self::NotHydrated(_) => "NOT_HYDRATED",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Interpreter(_) => "INTERPRETER_ERROR",
        }
    }

    /// Whether this error carries a business fault.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault(_))
    }

    /// Build a storage error for the given operation.
    pub fn storage(operation: impl Into<String>, details: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            details: details.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let test_cases = vec![
            (
                EngineError::Configuration {
                    process_id: ProcessId::new("{urn:test}order"),
                    message: "reference to unknown partner link bogus".to_string(),
                },
                "CONFIGURATION_ERROR",
            ),
            (
                EngineError::CorruptDefinition {
                    process_id: ProcessId::new("{urn:test}order"),
                    reason: "eof".to_string(),
                },
                "CORRUPT_DEFINITION",
            ),
            (
                EngineError::DbConsistency {
                    exchange_id: "mex-1".to_string(),
                    reference: "referenced unknown pLinkModelId 7".to_string(),
                },
                "DB_CONSISTENCY_ERROR",
            ),
            (
                EngineError::storage("create_instance", "disk full"),
                "STORAGE_ERROR",
            ),
            (
                EngineError::Fault(FaultError::selection_failure("empty")),
                "FAULT",
            ),
            (EngineError::NotOnWorker { instance_id: 4 }, "NOT_ON_WORKER"),
            (EngineError::UnexpectedTransaction, "UNEXPECTED_TRANSACTION"),
            (
                EngineError::InvalidStatusTransition {
                    exchange_id: "mex-1".to_string(),
                    from: ExchangeStatus::Acknowledged,
                    to: ExchangeStatus::Active,
                },
                "INVALID_STATUS_TRANSITION",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(error.error_code(), expected_code, "for error: {}", error);
        }
    }

    #[test]
    fn test_configuration_error_names_process_and_link() {
        let err = EngineError::Configuration {
            process_id: ProcessId::new("{urn:test}order"),
            message: "reference to unknown partner link bogus".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("{urn:test}order"));
        assert!(text.contains("bogus"));
    }

    #[test]
    fn test_fault_is_fault() {
        let err: EngineError = FaultError::selection_failure("nothing selected").into();
        assert!(err.is_fault());
        assert!(err.to_string().contains("selectionFailure"));
        assert!(!EngineError::WorkAbandoned.is_fault());
    }
}
