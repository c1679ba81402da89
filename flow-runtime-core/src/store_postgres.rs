//! PostgreSQL-backed `EngineStore`.
//!
//! All queries use runtime-checked `sqlx::query()` instead of the
//! compile-time macros because the tables are created by `migrate()` and
//! may not exist at build time. Enum columns are stored as their serde
//! string form; aggregate fields (definition graphs, subscription configs,
//! id lists) are JSONB.

use crate::definition::ProcessDefinition;
use crate::error::{EngineError, Result};
use crate::history::{HistoricActivity, HistoricProcessInstance, HistoricTask};
use crate::model::*;
use crate::outbox::{LifecycleEventType, OutboxEvent, OutboxStatus};
use crate::store::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Serialize a unit-variant enum to its serde string form for a TEXT column.
fn enum_str<T: Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value).map_err(store_err)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(EngineError::Internal(format!(
            "expected string-serializable enum, got {other}"
        ))),
    }
}

fn enum_from_str<T: DeserializeOwned>(s: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(s.to_string())).map_err(store_err)
}

fn store_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(e.to_string())
}

pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect from a database URL, typically
    /// `RuntimeConfig::from_env().database_url`.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPool::connect(database_url).await.map_err(store_err)?;
        Ok(Self::new(pool))
    }

    /// Create all engine tables and indexes. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        const DDL: &[&str] = &[
            r#"CREATE TABLE IF NOT EXISTS flow_definition (
                id UUID PRIMARY KEY,
                key TEXT NOT NULL,
                version INT NOT NULL,
                payload JSONB NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_flow_definition_key
                ON flow_definition (key, version DESC)"#,
            r#"CREATE TABLE IF NOT EXISTS process_instance (
                id UUID PRIMARY KEY,
                definition_id UUID NOT NULL,
                business_key TEXT,
                tenant_id TEXT,
                state TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ,
                root_scope_id UUID NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_process_instance_business_key
                ON process_instance (business_key)"#,
            r#"CREATE TABLE IF NOT EXISTS execution (
                id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                parent_id UUID,
                element_id TEXT NOT NULL,
                scope_id UUID NOT NULL,
                state TEXT NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_execution_instance
                ON execution (process_instance_id)"#,
            r#"CREATE TABLE IF NOT EXISTS variable_scope (
                id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                parent_id UUID,
                kind TEXT NOT NULL,
                element_id TEXT,
                active BOOLEAN NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_variable_scope_instance
                ON variable_scope (process_instance_id)"#,
            r#"CREATE TABLE IF NOT EXISTS variable (
                scope_id UUID NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                value JSONB NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (scope_id, name)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS event_subscription (
                id UUID PRIMARY KEY,
                process_instance_id UUID,
                execution_id UUID,
                activity_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_name TEXT,
                config JSONB NOT NULL,
                due_time TIMESTAMPTZ,
                create_time TIMESTAMPTZ NOT NULL
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_event_subscription_name
                ON event_subscription (event_type, event_name)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_event_subscription_due
                ON event_subscription (due_time)"#,
            r#"CREATE INDEX IF NOT EXISTS idx_event_subscription_instance
                ON event_subscription (process_instance_id)"#,
            r#"CREATE TABLE IF NOT EXISTS transaction_scope (
                id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                execution_id UUID,
                scope_id UUID NOT NULL,
                element_id TEXT NOT NULL,
                state TEXT NOT NULL,
                compensation_subscriptions JSONB NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                complete_time TIMESTAMPTZ
            )"#,
            r#"CREATE TABLE IF NOT EXISTS task (
                id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                execution_id UUID NOT NULL,
                element_id TEXT NOT NULL,
                name TEXT,
                assignee TEXT,
                candidate_groups JSONB NOT NULL,
                due_date TIMESTAMPTZ,
                state TEXT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                complete_time TIMESTAMPTZ
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_task_instance ON task (process_instance_id)"#,
            r#"CREATE TABLE IF NOT EXISTS outbox_event (
                id UUID PRIMARY KEY,
                event_type TEXT NOT NULL,
                event_code TEXT,
                status TEXT NOT NULL,
                process_instance_id UUID,
                execution_id UUID,
                activity_id TEXT,
                task_id UUID,
                payload JSONB NOT NULL,
                retry_count INT NOT NULL,
                max_retries INT NOT NULL,
                error_message TEXT,
                create_time TIMESTAMPTZ NOT NULL,
                update_time TIMESTAMPTZ NOT NULL,
                processed_time TIMESTAMPTZ
            )"#,
            r#"CREATE INDEX IF NOT EXISTS idx_outbox_status
                ON outbox_event (status, create_time)"#,
            r#"CREATE TABLE IF NOT EXISTS incident (
                id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                execution_id UUID NOT NULL,
                element_id TEXT NOT NULL,
                error_message TEXT NOT NULL,
                retry_count INT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                resolve_time TIMESTAMPTZ,
                resolution TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS history_process (
                process_instance_id UUID PRIMARY KEY,
                definition_id UUID,
                business_key TEXT,
                state TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ
            )"#,
            r#"CREATE TABLE IF NOT EXISTS history_activity (
                id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                execution_id UUID,
                element_id TEXT NOT NULL,
                start_time TIMESTAMPTZ NOT NULL,
                end_time TIMESTAMPTZ
            )"#,
            r#"CREATE TABLE IF NOT EXISTS history_task (
                task_id UUID PRIMARY KEY,
                process_instance_id UUID NOT NULL,
                element_id TEXT,
                name TEXT,
                assignee TEXT,
                state TEXT NOT NULL,
                create_time TIMESTAMPTZ NOT NULL,
                complete_time TIMESTAMPTZ
            )"#,
        ];
        for statement in DDL {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(store_err)?;
        }
        Ok(())
    }
}

// ─── Row hydration ────────────────────────────────────────────

fn instance_from_row(row: &PgRow) -> Result<ProcessInstance> {
    Ok(ProcessInstance {
        id: row.try_get("id").map_err(store_err)?,
        definition_id: row.try_get("definition_id").map_err(store_err)?,
        business_key: row.try_get("business_key").map_err(store_err)?,
        tenant_id: row.try_get("tenant_id").map_err(store_err)?,
        state: enum_from_str(row.try_get::<String, _>("state").map_err(store_err)?.as_str())?,
        start_time: row.try_get("start_time").map_err(store_err)?,
        end_time: row.try_get("end_time").map_err(store_err)?,
        root_scope_id: row.try_get("root_scope_id").map_err(store_err)?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<Execution> {
    Ok(Execution {
        id: row.try_get("id").map_err(store_err)?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        parent_id: row.try_get("parent_id").map_err(store_err)?,
        element_id: row.try_get("element_id").map_err(store_err)?,
        scope_id: row.try_get("scope_id").map_err(store_err)?,
        state: enum_from_str(row.try_get::<String, _>("state").map_err(store_err)?.as_str())?,
    })
}

fn scope_from_row(row: &PgRow) -> Result<VariableScope> {
    Ok(VariableScope {
        id: row.try_get("id").map_err(store_err)?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        parent_id: row.try_get("parent_id").map_err(store_err)?,
        kind: enum_from_str(row.try_get::<String, _>("kind").map_err(store_err)?.as_str())?,
        element_id: row.try_get("element_id").map_err(store_err)?,
        active: row.try_get("active").map_err(store_err)?,
    })
}

fn variable_from_row(row: &PgRow) -> Result<Variable> {
    Ok(Variable {
        scope_id: row.try_get("scope_id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        kind: enum_from_str(row.try_get::<String, _>("kind").map_err(store_err)?.as_str())?,
        value: row.try_get("value").map_err(store_err)?,
        create_time: row.try_get("create_time").map_err(store_err)?,
        update_time: row.try_get("update_time").map_err(store_err)?,
    })
}

fn subscription_from_row(row: &PgRow) -> Result<EventSubscription> {
    Ok(EventSubscription {
        id: row.try_get("id").map_err(store_err)?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        execution_id: row.try_get("execution_id").map_err(store_err)?,
        activity_id: row.try_get("activity_id").map_err(store_err)?,
        event_type: enum_from_str(
            row.try_get::<String, _>("event_type").map_err(store_err)?.as_str(),
        )?,
        event_name: row.try_get("event_name").map_err(store_err)?,
        config: serde_json::from_value(row.try_get("config").map_err(store_err)?)
            .map_err(store_err)?,
        create_time: row.try_get("create_time").map_err(store_err)?,
    })
}

fn tx_from_row(row: &PgRow) -> Result<TransactionScope> {
    Ok(TransactionScope {
        id: row.try_get("id").map_err(store_err)?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        execution_id: row.try_get("execution_id").map_err(store_err)?,
        scope_id: row.try_get("scope_id").map_err(store_err)?,
        element_id: row.try_get("element_id").map_err(store_err)?,
        state: enum_from_str(row.try_get::<String, _>("state").map_err(store_err)?.as_str())?,
        compensation_subscriptions: serde_json::from_value(
            row.try_get("compensation_subscriptions").map_err(store_err)?,
        )
        .map_err(store_err)?,
        create_time: row.try_get("create_time").map_err(store_err)?,
        complete_time: row.try_get("complete_time").map_err(store_err)?,
    })
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id").map_err(store_err)?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        execution_id: row.try_get("execution_id").map_err(store_err)?,
        element_id: row.try_get("element_id").map_err(store_err)?,
        name: row.try_get("name").map_err(store_err)?,
        assignee: row.try_get("assignee").map_err(store_err)?,
        candidate_groups: serde_json::from_value(
            row.try_get("candidate_groups").map_err(store_err)?,
        )
        .map_err(store_err)?,
        due_date: row.try_get("due_date").map_err(store_err)?,
        state: enum_from_str(row.try_get::<String, _>("state").map_err(store_err)?.as_str())?,
        create_time: row.try_get("create_time").map_err(store_err)?,
        complete_time: row.try_get("complete_time").map_err(store_err)?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.try_get("id").map_err(store_err)?,
        event_type: enum_from_str::<LifecycleEventType>(
            row.try_get::<String, _>("event_type").map_err(store_err)?.as_str(),
        )
        .unwrap_or(LifecycleEventType::Unknown),
        event_code: row.try_get("event_code").map_err(store_err)?,
        status: enum_from_str(row.try_get::<String, _>("status").map_err(store_err)?.as_str())?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        execution_id: row.try_get("execution_id").map_err(store_err)?,
        activity_id: row.try_get("activity_id").map_err(store_err)?,
        task_id: row.try_get("task_id").map_err(store_err)?,
        payload: row.try_get("payload").map_err(store_err)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(store_err)? as u32,
        max_retries: row.try_get::<i32, _>("max_retries").map_err(store_err)? as u32,
        error_message: row.try_get("error_message").map_err(store_err)?,
        create_time: row.try_get("create_time").map_err(store_err)?,
        update_time: row.try_get("update_time").map_err(store_err)?,
        processed_time: row.try_get("processed_time").map_err(store_err)?,
    })
}

fn incident_from_row(row: &PgRow) -> Result<Incident> {
    Ok(Incident {
        id: row.try_get("id").map_err(store_err)?,
        process_instance_id: row.try_get("process_instance_id").map_err(store_err)?,
        execution_id: row.try_get("execution_id").map_err(store_err)?,
        element_id: row.try_get("element_id").map_err(store_err)?,
        error_message: row.try_get("error_message").map_err(store_err)?,
        retry_count: row.try_get::<i32, _>("retry_count").map_err(store_err)? as u32,
        create_time: row.try_get("create_time").map_err(store_err)?,
        resolve_time: row.try_get("resolve_time").map_err(store_err)?,
        resolution: row.try_get("resolution").map_err(store_err)?,
    })
}

// ─── Repositories ─────────────────────────────────────────────

#[async_trait]
impl ProcessDefinitionRepo for PostgresEngineStore {
    async fn save(&self, definition: &ProcessDefinition) -> Result<()> {
        let payload = serde_json::to_value(definition).map_err(store_err)?;
        sqlx::query(
            "INSERT INTO flow_definition (id, key, version, payload)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload",
        )
        .bind(definition.id)
        .bind(&definition.key)
        .bind(definition.version)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessDefinition>> {
        let row = sqlx::query("SELECT payload FROM flow_definition WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| {
            serde_json::from_value(r.try_get("payload").map_err(store_err)?).map_err(store_err)
        })
        .transpose()
    }

    async fn find_latest_by_key(&self, key: &str) -> Result<Option<ProcessDefinition>> {
        let row = sqlx::query(
            "SELECT payload FROM flow_definition WHERE key = $1
             ORDER BY version DESC LIMIT 1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(|r| {
            serde_json::from_value(r.try_get("payload").map_err(store_err)?).map_err(store_err)
        })
        .transpose()
    }
}

#[async_trait]
impl ProcessInstanceRepo for PostgresEngineStore {
    async fn save(&self, instance: &ProcessInstance) -> Result<()> {
        sqlx::query(
            "INSERT INTO process_instance
             (id, definition_id, business_key, tenant_id, state, start_time, end_time, root_scope_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(instance.id)
        .bind(instance.definition_id)
        .bind(&instance.business_key)
        .bind(&instance.tenant_id)
        .bind(enum_str(&instance.state)?)
        .bind(instance.start_time)
        .bind(instance.end_time)
        .bind(instance.root_scope_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, instance: &ProcessInstance) -> Result<()> {
        let result = sqlx::query(
            "UPDATE process_instance SET state = $2, end_time = $3 WHERE id = $1",
        )
        .bind(instance.id)
        .bind(enum_str(&instance.state)?)
        .bind(instance.end_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("process instance", instance.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<ProcessInstance>> {
        let row = sqlx::query("SELECT * FROM process_instance WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| instance_from_row(&r)).transpose()
    }

    async fn find_by_business_key(&self, business_key: &str) -> Result<Vec<ProcessInstance>> {
        let rows = sqlx::query("SELECT * FROM process_instance WHERE business_key = $1")
            .bind(business_key)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(instance_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM process_instance WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionRepo for PostgresEngineStore {
    async fn save(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            "INSERT INTO execution (id, process_instance_id, parent_id, element_id, scope_id, state)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE
               SET element_id = EXCLUDED.element_id,
                   scope_id = EXCLUDED.scope_id,
                   state = EXCLUDED.state",
        )
        .bind(execution.id)
        .bind(execution.process_instance_id)
        .bind(execution.parent_id)
        .bind(&execution.element_id)
        .bind(execution.scope_id)
        .bind(enum_str(&execution.state)?)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, execution: &Execution) -> Result<()> {
        let result = sqlx::query(
            "UPDATE execution SET element_id = $2, scope_id = $3, state = $4 WHERE id = $1",
        )
        .bind(execution.id)
        .bind(&execution.element_id)
        .bind(execution.scope_id)
        .bind(enum_str(&execution.state)?)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("execution", execution.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Execution>> {
        let row = sqlx::query("SELECT * FROM execution WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| execution_from_row(&r)).transpose()
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<Execution>> {
        let rows =
            sqlx::query("SELECT * FROM execution WHERE process_instance_id = $1 ORDER BY id")
                .bind(pid)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn find_at_element(&self, pid: Uuid, element_id: &str) -> Result<Vec<Execution>> {
        let rows = sqlx::query(
            "SELECT * FROM execution
             WHERE process_instance_id = $1 AND element_id = $2 AND state <> 'COMPLETED'
             ORDER BY id",
        )
        .bind(pid)
        .bind(element_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM execution WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM execution WHERE process_instance_id = $1")
            .bind(pid)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl ScopeRepo for PostgresEngineStore {
    async fn save(&self, scope: &VariableScope) -> Result<()> {
        sqlx::query(
            "INSERT INTO variable_scope (id, process_instance_id, parent_id, kind, element_id, active)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET active = EXCLUDED.active",
        )
        .bind(scope.id)
        .bind(scope.process_instance_id)
        .bind(scope.parent_id)
        .bind(enum_str(&scope.kind)?)
        .bind(&scope.element_id)
        .bind(scope.active)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, scope: &VariableScope) -> Result<()> {
        let result = sqlx::query("UPDATE variable_scope SET active = $2 WHERE id = $1")
            .bind(scope.id)
            .bind(scope.active)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("scope", scope.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<VariableScope>> {
        let row = sqlx::query("SELECT * FROM variable_scope WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| scope_from_row(&r)).transpose()
    }

    async fn find_children(&self, parent_id: Uuid) -> Result<Vec<VariableScope>> {
        let rows = sqlx::query("SELECT * FROM variable_scope WHERE parent_id = $1 ORDER BY id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(scope_from_row).collect()
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<VariableScope>> {
        let rows =
            sqlx::query("SELECT * FROM variable_scope WHERE process_instance_id = $1 ORDER BY id")
                .bind(pid)
                .fetch_all(&self.pool)
                .await
                .map_err(store_err)?;
        rows.iter().map(scope_from_row).collect()
    }

    async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        sqlx::query(
            "DELETE FROM variable WHERE scope_id IN
             (SELECT id FROM variable_scope WHERE process_instance_id = $1)",
        )
        .bind(pid)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        sqlx::query("DELETE FROM variable_scope WHERE process_instance_id = $1")
            .bind(pid)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl VariableRepo for PostgresEngineStore {
    async fn upsert(&self, variable: &Variable) -> Result<()> {
        sqlx::query(
            "INSERT INTO variable (scope_id, name, kind, value, create_time, update_time)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (scope_id, name) DO UPDATE
               SET kind = EXCLUDED.kind,
                   value = EXCLUDED.value,
                   update_time = EXCLUDED.update_time",
        )
        .bind(variable.scope_id)
        .bind(&variable.name)
        .bind(enum_str(&variable.kind)?)
        .bind(&variable.value)
        .bind(variable.create_time)
        .bind(variable.update_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find(&self, scope_id: Uuid, name: &str) -> Result<Option<Variable>> {
        let row = sqlx::query("SELECT * FROM variable WHERE scope_id = $1 AND name = $2")
            .bind(scope_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| variable_from_row(&r)).transpose()
    }

    async fn find_by_scope(&self, scope_id: Uuid) -> Result<Vec<Variable>> {
        let rows = sqlx::query("SELECT * FROM variable WHERE scope_id = $1 ORDER BY name")
            .bind(scope_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(variable_from_row).collect()
    }

    async fn delete_by_scope(&self, scope_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM variable WHERE scope_id = $1")
            .bind(scope_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl EventSubscriptionRepo for PostgresEngineStore {
    async fn save(&self, sub: &EventSubscription) -> Result<()> {
        sqlx::query(
            "INSERT INTO event_subscription
             (id, process_instance_id, execution_id, activity_id, event_type, event_name,
              config, due_time, create_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(sub.id)
        .bind(sub.process_instance_id)
        .bind(sub.execution_id)
        .bind(&sub.activity_id)
        .bind(enum_str(&sub.event_type)?)
        .bind(&sub.event_name)
        .bind(serde_json::to_value(&sub.config).map_err(store_err)?)
        .bind(sub.due_time())
        .bind(sub.create_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, sub: &EventSubscription) -> Result<()> {
        let result = sqlx::query(
            "UPDATE event_subscription SET config = $2, due_time = $3 WHERE id = $1",
        )
        .bind(sub.id)
        .bind(serde_json::to_value(&sub.config).map_err(store_err)?)
        .bind(sub.due_time())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("event subscription", sub.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>> {
        let row = sqlx::query("SELECT * FROM event_subscription WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| subscription_from_row(&r)).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM event_subscription WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_execution(&self, execution_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM event_subscription WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn delete_by_instance(&self, pid: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM event_subscription WHERE process_instance_id = $1")
            .bind(pid)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<EventSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM event_subscription WHERE process_instance_id = $1
             ORDER BY create_time, id",
        )
        .bind(pid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn find_by_name_and_type(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM event_subscription
             WHERE process_instance_id IS NOT NULL AND event_type = $1 AND event_name = $2
             ORDER BY create_time, id",
        )
        .bind(enum_str(&event_type)?)
        .bind(event_name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn find_by_key(
        &self,
        pid: Uuid,
        activity_id: &str,
        event_type: EventType,
    ) -> Result<Option<EventSubscription>> {
        let row = sqlx::query(
            "SELECT * FROM event_subscription
             WHERE process_instance_id = $1 AND activity_id = $2 AND event_type = $3
             LIMIT 1",
        )
        .bind(pid)
        .bind(activity_id)
        .bind(enum_str(&event_type)?)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.map(|r| subscription_from_row(&r)).transpose()
    }

    async fn find_due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EventSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM event_subscription
             WHERE event_type = 'TIMER' AND due_time IS NOT NULL AND due_time <= $1
             ORDER BY due_time ASC LIMIT $2",
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn find_start_subscriptions(
        &self,
        event_type: EventType,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM event_subscription
             WHERE process_instance_id IS NULL AND event_type = $1 AND event_name = $2",
        )
        .bind(enum_str(&event_type)?)
        .bind(event_name)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(subscription_from_row).collect()
    }

    async fn find_by_definition(&self, definition_id: Uuid) -> Result<Vec<EventSubscription>> {
        let rows = sqlx::query(
            "SELECT * FROM event_subscription WHERE config->>'definition_id' = $1",
        )
        .bind(definition_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(subscription_from_row).collect()
    }
}

#[async_trait]
impl TransactionScopeRepo for PostgresEngineStore {
    async fn save(&self, tx: &TransactionScope) -> Result<()> {
        sqlx::query(
            "INSERT INTO transaction_scope
             (id, process_instance_id, execution_id, scope_id, element_id, state,
              compensation_subscriptions, create_time, complete_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(tx.id)
        .bind(tx.process_instance_id)
        .bind(tx.execution_id)
        .bind(tx.scope_id)
        .bind(&tx.element_id)
        .bind(enum_str(&tx.state)?)
        .bind(serde_json::to_value(&tx.compensation_subscriptions).map_err(store_err)?)
        .bind(tx.create_time)
        .bind(tx.complete_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, tx: &TransactionScope) -> Result<()> {
        let result = sqlx::query(
            "UPDATE transaction_scope
             SET state = $2, compensation_subscriptions = $3, complete_time = $4
             WHERE id = $1",
        )
        .bind(tx.id)
        .bind(enum_str(&tx.state)?)
        .bind(serde_json::to_value(&tx.compensation_subscriptions).map_err(store_err)?)
        .bind(tx.complete_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("transaction scope", tx.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<TransactionScope>> {
        let row = sqlx::query("SELECT * FROM transaction_scope WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| tx_from_row(&r)).transpose()
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<TransactionScope>> {
        let rows = sqlx::query(
            "SELECT * FROM transaction_scope WHERE process_instance_id = $1 ORDER BY id",
        )
        .bind(pid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(tx_from_row).collect()
    }

    async fn find_by_scope(&self, scope_id: Uuid) -> Result<Option<TransactionScope>> {
        let row = sqlx::query("SELECT * FROM transaction_scope WHERE scope_id = $1 LIMIT 1")
            .bind(scope_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| tx_from_row(&r)).transpose()
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM transaction_scope WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl TaskRepo for PostgresEngineStore {
    async fn save(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO task
             (id, process_instance_id, execution_id, element_id, name, assignee,
              candidate_groups, due_date, state, create_time, complete_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(task.id)
        .bind(task.process_instance_id)
        .bind(task.execution_id)
        .bind(&task.element_id)
        .bind(&task.name)
        .bind(&task.assignee)
        .bind(serde_json::to_value(&task.candidate_groups).map_err(store_err)?)
        .bind(task.due_date)
        .bind(enum_str(&task.state)?)
        .bind(task.create_time)
        .bind(task.complete_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            "UPDATE task SET assignee = $2, state = $3, complete_time = $4 WHERE id = $1",
        )
        .bind(task.id)
        .bind(&task.assignee)
        .bind(enum_str(&task.state)?)
        .bind(task.complete_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("task", task.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM task WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| task_from_row(&r)).transpose()
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM task WHERE process_instance_id = $1 ORDER BY id")
            .bind(pid)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(task_from_row).collect()
    }

    async fn find_by_execution(&self, execution_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM task WHERE execution_id = $1 ORDER BY id")
            .bind(execution_id)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(task_from_row).collect()
    }
}

#[async_trait]
impl OutboxRepo for PostgresEngineStore {
    async fn append(&self, event: &OutboxEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO outbox_event
             (id, event_type, event_code, status, process_instance_id, execution_id,
              activity_id, task_id, payload, retry_count, max_retries, error_message,
              create_time, update_time, processed_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(event.id)
        .bind(enum_str(&event.event_type)?)
        .bind(&event.event_code)
        .bind(enum_str(&event.status)?)
        .bind(event.process_instance_id)
        .bind(event.execution_id)
        .bind(&event.activity_id)
        .bind(event.task_id)
        .bind(&event.payload)
        .bind(event.retry_count as i32)
        .bind(event.max_retries as i32)
        .bind(&event.error_message)
        .bind(event.create_time)
        .bind(event.update_time)
        .bind(event.processed_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, event: &OutboxEvent) -> Result<()> {
        let result = sqlx::query(
            "UPDATE outbox_event
             SET status = $2, retry_count = $3, error_message = $4,
                 update_time = $5, processed_time = $6
             WHERE id = $1",
        )
        .bind(event.id)
        .bind(enum_str(&event.status)?)
        .bind(event.retry_count as i32)
        .bind(&event.error_message)
        .bind(event.update_time)
        .bind(event.processed_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("outbox event", event.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query("SELECT * FROM outbox_event WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| outbox_from_row(&r)).transpose()
    }

    async fn find_by_status(&self, status: OutboxStatus, limit: usize) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_event WHERE status = $1
             ORDER BY create_time ASC, id ASC LIMIT $2",
        )
        .bind(enum_str(&status)?)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn find_by_instance(&self, pid: Uuid) -> Result<Vec<OutboxEvent>> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_event WHERE process_instance_id = $1
             ORDER BY create_time ASC, id ASC",
        )
        .bind(pid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM outbox_event WHERE status = 'PROCESSED' AND processed_time < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(result.rows_affected() as usize)
    }
}

#[async_trait]
impl IncidentRepo for PostgresEngineStore {
    async fn save(&self, incident: &Incident) -> Result<()> {
        sqlx::query(
            "INSERT INTO incident
             (id, process_instance_id, execution_id, element_id, error_message,
              retry_count, create_time, resolve_time, resolution)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(incident.id)
        .bind(incident.process_instance_id)
        .bind(incident.execution_id)
        .bind(&incident.element_id)
        .bind(&incident.error_message)
        .bind(incident.retry_count as i32)
        .bind(incident.create_time)
        .bind(incident.resolve_time)
        .bind(&incident.resolution)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn update(&self, incident: &Incident) -> Result<()> {
        let result = sqlx::query(
            "UPDATE incident SET resolve_time = $2, resolution = $3 WHERE id = $1",
        )
        .bind(incident.id)
        .bind(incident.resolve_time)
        .bind(&incident.resolution)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        if result.rows_affected() == 0 {
            return Err(EngineError::not_found("incident", incident.id));
        }
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Incident>> {
        let row = sqlx::query("SELECT * FROM incident WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| incident_from_row(&r)).transpose()
    }

    async fn find_open_by_instance(&self, pid: Uuid) -> Result<Vec<Incident>> {
        let rows = sqlx::query(
            "SELECT * FROM incident
             WHERE process_instance_id = $1 AND resolve_time IS NULL ORDER BY id",
        )
        .bind(pid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(incident_from_row).collect()
    }
}

#[async_trait]
impl HistoryRepo for PostgresEngineStore {
    async fn save_process(&self, record: &HistoricProcessInstance) -> Result<()> {
        sqlx::query(
            "INSERT INTO history_process
             (process_instance_id, definition_id, business_key, state, start_time, end_time)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (process_instance_id) DO UPDATE
               SET state = EXCLUDED.state, end_time = EXCLUDED.end_time",
        )
        .bind(record.process_instance_id)
        .bind(record.definition_id)
        .bind(&record.business_key)
        .bind(&record.state)
        .bind(record.start_time)
        .bind(record.end_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn save_activity(&self, record: &HistoricActivity) -> Result<()> {
        sqlx::query(
            "INSERT INTO history_activity
             (id, process_instance_id, execution_id, element_id, start_time, end_time)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET end_time = EXCLUDED.end_time",
        )
        .bind(record.id)
        .bind(record.process_instance_id)
        .bind(record.execution_id)
        .bind(&record.element_id)
        .bind(record.start_time)
        .bind(record.end_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn save_task(&self, record: &HistoricTask) -> Result<()> {
        sqlx::query(
            "INSERT INTO history_task
             (task_id, process_instance_id, element_id, name, assignee, state,
              create_time, complete_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (task_id) DO UPDATE
               SET assignee = EXCLUDED.assignee,
                   state = EXCLUDED.state,
                   complete_time = EXCLUDED.complete_time",
        )
        .bind(record.task_id)
        .bind(record.process_instance_id)
        .bind(&record.element_id)
        .bind(&record.name)
        .bind(&record.assignee)
        .bind(&record.state)
        .bind(record.create_time)
        .bind(record.complete_time)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn find_process(&self, pid: Uuid) -> Result<Option<HistoricProcessInstance>> {
        let row = sqlx::query("SELECT * FROM history_process WHERE process_instance_id = $1")
            .bind(pid)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| {
            Ok(HistoricProcessInstance {
                process_instance_id: r.try_get("process_instance_id").map_err(store_err)?,
                definition_id: r.try_get("definition_id").map_err(store_err)?,
                business_key: r.try_get("business_key").map_err(store_err)?,
                state: r.try_get("state").map_err(store_err)?,
                start_time: r.try_get("start_time").map_err(store_err)?,
                end_time: r.try_get("end_time").map_err(store_err)?,
            })
        })
        .transpose()
    }

    async fn find_activities(&self, pid: Uuid) -> Result<Vec<HistoricActivity>> {
        let rows = sqlx::query(
            "SELECT * FROM history_activity WHERE process_instance_id = $1 ORDER BY start_time, id",
        )
        .bind(pid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|r| {
                Ok(HistoricActivity {
                    id: r.try_get("id").map_err(store_err)?,
                    process_instance_id: r.try_get("process_instance_id").map_err(store_err)?,
                    execution_id: r.try_get("execution_id").map_err(store_err)?,
                    element_id: r.try_get("element_id").map_err(store_err)?,
                    start_time: r.try_get("start_time").map_err(store_err)?,
                    end_time: r.try_get("end_time").map_err(store_err)?,
                })
            })
            .collect()
    }

    async fn find_tasks(&self, pid: Uuid) -> Result<Vec<HistoricTask>> {
        let rows = sqlx::query(
            "SELECT * FROM history_task WHERE process_instance_id = $1 ORDER BY create_time, task_id",
        )
        .bind(pid)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|r| {
                Ok(HistoricTask {
                    task_id: r.try_get("task_id").map_err(store_err)?,
                    process_instance_id: r.try_get("process_instance_id").map_err(store_err)?,
                    element_id: r.try_get("element_id").map_err(store_err)?,
                    name: r.try_get("name").map_err(store_err)?,
                    assignee: r.try_get("assignee").map_err(store_err)?,
                    state: r.try_get("state").map_err(store_err)?,
                    create_time: r.try_get("create_time").map_err(store_err)?,
                    complete_time: r.try_get("complete_time").map_err(store_err)?,
                })
            })
            .collect()
    }
}

impl EngineStore for PostgresEngineStore {
    fn definitions(&self) -> &dyn ProcessDefinitionRepo {
        self
    }
    fn instances(&self) -> &dyn ProcessInstanceRepo {
        self
    }
    fn executions(&self) -> &dyn ExecutionRepo {
        self
    }
    fn scopes(&self) -> &dyn ScopeRepo {
        self
    }
    fn variables(&self) -> &dyn VariableRepo {
        self
    }
    fn subscriptions(&self) -> &dyn EventSubscriptionRepo {
        self
    }
    fn transactions(&self) -> &dyn TransactionScopeRepo {
        self
    }
    fn tasks(&self) -> &dyn TaskRepo {
        self
    }
    fn outbox(&self) -> &dyn OutboxRepo {
        self
    }
    fn incidents(&self) -> &dyn IncidentRepo {
        self
    }
    fn history(&self) -> &dyn HistoryRepo {
        self
    }
}
