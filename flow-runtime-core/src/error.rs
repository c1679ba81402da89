use thiserror::Error;

/// Engine-wide error taxonomy. Every fallible core path returns one of these
/// kinds; the interpreter's retry/incident policy dispatches on the variant.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// State-machine violation (e.g. completing an already-completed task).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Deploy-time definition validation failure.
    #[error("invalid definition: {0}")]
    Definition(String),

    #[error("expression syntax error in `{expression}`: {detail}")]
    ExpressionSyntax { expression: String, detail: String },

    #[error("expression runtime error in `{expression}`: {detail}")]
    ExpressionRuntime { expression: String, detail: String },

    /// A named BPMN error thrown by a service task or error end event.
    /// Routed outward to the nearest catching boundary / event sub-process.
    #[error("BPMN error `{code}`: {message}")]
    Bpmn { code: String, message: String },

    #[error("failed to create subscription: {0}")]
    SubscriptionCreateFailed(String),

    #[error("compensation handler `{activity_id}` failed: {detail}")]
    CompensationHandlerFailed { activity_id: String, detail: String },

    #[error("outbox publish failed: {0}")]
    OutboxPublishFailed(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    /// True for errors the interpreter may retry (transient store trouble).
    /// Logic errors, lookups and BPMN errors never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Store(_) | EngineError::SubscriptionCreateFailed(_)
        )
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
