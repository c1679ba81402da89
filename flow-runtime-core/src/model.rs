//! Runtime entities persisted by the engine. Executions and scopes hold
//! each other's ids, never references — both are rows keyed by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Process instance ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Active,
    Suspended,
    Completed,
    Cancelled,
    Terminated,
    Failed,
}

impl InstanceState {
    /// Terminal states admit no further work units.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed
                | InstanceState::Cancelled
                | InstanceState::Terminated
                | InstanceState::Failed
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub business_key: Option<String>,
    pub tenant_id: Option<String>,
    pub state: InstanceState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub root_scope_id: Uuid,
}

// ─── Execution (token) ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Ready,
    Running,
    Waiting,
    Failed,
    Completed,
}

/// One concurrent position in the graph. Parallel forks create children,
/// joins destroy them; a non-terminal execution always points at exactly
/// one element.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub element_id: String,
    pub scope_id: Uuid,
    pub state: ExecutionState,
}

impl Execution {
    pub fn new(
        process_instance_id: Uuid,
        parent_id: Option<Uuid>,
        element_id: impl Into<String>,
        scope_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_instance_id,
            parent_id,
            element_id: element_id.into(),
            scope_id,
            state: ExecutionState::Ready,
        }
    }
}

// ─── Variable scopes ──────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScopeKind {
    Process,
    SubProcess,
    EventSubProcess,
    Transaction,
    Task,
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariableScope {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub parent_id: Option<Uuid>,
    pub kind: ScopeKind,
    /// Element that opened the scope, when any.
    pub element_id: Option<String>,
    pub active: bool,
}

/// Type tag persisted alongside every variable value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarKind {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
    Null,
}

impl VarKind {
    /// Derive the tag from a JSON value. RFC-3339 strings tag as dates.
    pub fn of(value: &Value) -> VarKind {
        match value {
            Value::Null => VarKind::Null,
            Value::Bool(_) => VarKind::Boolean,
            Value::Number(_) => VarKind::Number,
            Value::String(s) => {
                if DateTime::parse_from_rfc3339(s).is_ok() {
                    VarKind::Date
                } else {
                    VarKind::String
                }
            }
            Value::Array(_) => VarKind::Array,
            Value::Object(_) => VarKind::Object,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Variable {
    pub scope_id: Uuid,
    pub name: String,
    pub value: Value,
    pub kind: VarKind,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

// ─── Event subscriptions ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Timer,
    Signal,
    Message,
    Conditional,
    Error,
    Compensation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerCycle {
    pub interval_ms: u64,
    /// Fires left after the next one; `None` = unbounded.
    pub remaining: Option<u32>,
}

/// Per-type subscription payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionConfig {
    None,
    Timer {
        due: DateTime<Utc>,
        cycle: Option<TimerCycle>,
    },
    Conditional {
        expression: String,
        last_value: bool,
    },
    Compensation {
        handler_activity_id: String,
        transaction_scope_id: Option<Uuid>,
    },
    /// Definition-level subscription for signal/message start events.
    StartEvent {
        definition_id: Uuid,
    },
    /// Definition-level timer start event.
    TimerStart {
        definition_id: Uuid,
        due: DateTime<Utc>,
        cycle: Option<TimerCycle>,
    },
}

/// Durable marker that an execution (or, for start events, a definition)
/// waits for an external stimulus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    /// `None` for definition-level start-event subscriptions.
    pub process_instance_id: Option<Uuid>,
    pub execution_id: Option<Uuid>,
    pub activity_id: String,
    pub event_type: EventType,
    pub event_name: Option<String>,
    pub config: SubscriptionConfig,
    pub create_time: DateTime<Utc>,
}

impl EventSubscription {
    /// Due time for timer subscriptions; `None` otherwise.
    pub fn due_time(&self) -> Option<DateTime<Utc>> {
        match &self.config {
            SubscriptionConfig::Timer { due, .. } => Some(*due),
            SubscriptionConfig::TimerStart { due, .. } => Some(*due),
            _ => None,
        }
    }
}

// ─── Transaction scopes ───────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Active,
    Compensating,
    Completed,
    Cancelled,
}

/// Transaction sub-process bookkeeping. Completion converts the row into an
/// event scope (fresh id, `Completed`, same subscription list) so later
/// compensation throws can still locate handlers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransactionScope {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub execution_id: Option<Uuid>,
    pub scope_id: Uuid,
    pub element_id: String,
    pub state: TransactionState,
    /// Compensation subscription ids in registration order; replay is LIFO.
    pub compensation_subscriptions: Vec<Uuid>,
    pub create_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

// ─── User tasks ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Created,
    Claimed,
    Completed,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub element_id: String,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub candidate_groups: Vec<String>,
    pub due_date: Option<DateTime<Utc>>,
    pub state: TaskState,
    pub create_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
}

// ─── Incidents ────────────────────────────────────────────────

/// Raised when a work unit exhausts its retry budget; waits for an explicit
/// admin resolution that re-enqueues the failed work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub process_instance_id: Uuid,
    pub execution_id: Uuid,
    pub element_id: String,
    pub error_message: String,
    pub retry_count: u32,
    pub create_time: DateTime<Utc>,
    pub resolve_time: Option<DateTime<Utc>>,
    pub resolution: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn var_kind_tags() {
        assert_eq!(VarKind::of(&json!("plain")), VarKind::String);
        assert_eq!(VarKind::of(&json!("2026-01-01T00:00:00Z")), VarKind::Date);
        assert_eq!(VarKind::of(&json!(1.5)), VarKind::Number);
        assert_eq!(VarKind::of(&json!({"a": 1})), VarKind::Object);
        assert_eq!(VarKind::of(&json!([1])), VarKind::Array);
        assert_eq!(VarKind::of(&Value::Null), VarKind::Null);
    }

    #[test]
    fn terminal_states() {
        assert!(InstanceState::Completed.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(!InstanceState::Active.is_terminal());
        assert!(!InstanceState::Suspended.is_terminal());
    }
}
