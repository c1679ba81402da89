//! Variable-scope tree: child-overrides-parent resolution, declaring-scope
//! writes, recursive destruction.
//!
//! Scopes and executions hold each other's ids only; the tree lives in the
//! store. Every variable write appends a lifecycle event in the same work
//! unit that performed it.

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::model::{ScopeKind, VarKind, Variable, VariableScope};
use crate::outbox::{LifecycleEventType, OutboxEvent};
use crate::store::EngineStore;
use serde_json::{Map, Value};
use std::sync::Arc;
use uuid::Uuid;

pub struct ScopeManager {
    store: Arc<dyn EngineStore>,
    clock: Arc<dyn Clock>,
}

/// Result of a variable write: where it landed and whether it was new.
#[derive(Debug, Clone, Copy)]
pub struct VariableWrite {
    pub scope_id: Uuid,
    pub created: bool,
}

impl ScopeManager {
    pub fn new(store: Arc<dyn EngineStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append a child scope to the tree.
    pub async fn create_scope(
        &self,
        process_instance_id: Uuid,
        parent_id: Option<Uuid>,
        kind: ScopeKind,
        element_id: Option<&str>,
    ) -> Result<Uuid> {
        if let Some(parent_id) = parent_id {
            let parent = self
                .store
                .scopes()
                .find_by_id(parent_id)
                .await?
                .ok_or_else(|| EngineError::not_found("scope", parent_id))?;
            if !parent.active {
                return Err(EngineError::conflict(format!(
                    "cannot attach scope under destroyed scope {parent_id}"
                )));
            }
            if parent.process_instance_id != process_instance_id {
                return Err(EngineError::conflict(
                    "scope parent belongs to a different process instance",
                ));
            }
        }
        let scope = VariableScope {
            id: Uuid::now_v7(),
            process_instance_id,
            parent_id,
            kind,
            element_id: element_id.map(str::to_string),
            active: true,
        };
        self.store.scopes().save(&scope).await?;
        Ok(scope.id)
    }

    /// Self→root scope chain, self first.
    pub async fn chain(&self, scope_id: Uuid) -> Result<Vec<VariableScope>> {
        let mut chain = Vec::new();
        let mut cursor = Some(scope_id);
        while let Some(id) = cursor {
            let scope = self
                .store
                .scopes()
                .find_by_id(id)
                .await?
                .ok_or_else(|| EngineError::not_found("scope", id))?;
            cursor = scope.parent_id;
            chain.push(scope);
        }
        Ok(chain)
    }

    /// Write `name`: lands on the scope that already declares it along the
    /// self→root path, or on `scope_id` if the name is new.
    pub async fn set_variable(
        &self,
        scope_id: Uuid,
        name: &str,
        value: Value,
    ) -> Result<VariableWrite> {
        let chain = self.chain(scope_id).await?;
        if !chain[0].active {
            return Err(EngineError::conflict(format!(
                "cannot write variable `{name}` into destroyed scope {scope_id}"
            )));
        }
        let pid = chain[0].process_instance_id;

        let mut target = scope_id;
        let mut existing = None;
        for scope in &chain {
            if let Some(var) = self.store.variables().find(scope.id, name).await? {
                target = scope.id;
                existing = Some(var);
                break;
            }
        }

        let now = self.clock.now();
        let created = existing.is_none();
        let variable = Variable {
            scope_id: target,
            name: name.to_string(),
            kind: VarKind::of(&value),
            value: value.clone(),
            create_time: existing.as_ref().map(|v| v.create_time).unwrap_or(now),
            update_time: now,
        };
        self.store.variables().upsert(&variable).await?;

        let event_type = if created {
            LifecycleEventType::VariableCreated
        } else {
            LifecycleEventType::VariableUpdated
        };
        self.store
            .outbox()
            .append(
                &OutboxEvent::new(event_type, now)
                    .instance(pid)
                    .payload(serde_json::json!({
                        "scope_id": target,
                        "name": name,
                        "value": value,
                    })),
            )
            .await?;

        Ok(VariableWrite {
            scope_id: target,
            created,
        })
    }

    /// Nearest declaration along self→root; absent is `None`.
    pub async fn get_variable(&self, scope_id: Uuid, name: &str) -> Result<Option<Value>> {
        for scope in self.chain(scope_id).await? {
            if let Some(var) = self.store.variables().find(scope.id, name).await? {
                return Ok(Some(var.value));
            }
        }
        Ok(None)
    }

    /// Merged view along self→root; descendants win.
    pub async fn get_variables(&self, scope_id: Uuid) -> Result<Map<String, Value>> {
        let chain = self.chain(scope_id).await?;
        let mut merged = Map::new();
        for scope in chain.iter().rev() {
            for var in self.store.variables().find_by_scope(scope.id).await? {
                merged.insert(var.name, var.value);
            }
        }
        Ok(merged)
    }

    /// Recursively destroy a scope: children first, variables deleted,
    /// `active` cleared. Idempotent — destroying an already-destroyed or
    /// missing scope is a no-op.
    pub async fn destroy_scope(&self, scope_id: Uuid) -> Result<()> {
        let scope = match self.store.scopes().find_by_id(scope_id).await? {
            Some(s) => s,
            None => return Ok(()),
        };
        for child in self.store.scopes().find_children(scope_id).await? {
            Box::pin(self.destroy_scope(child.id)).await?;
        }
        self.store.variables().delete_by_scope(scope_id).await?;
        if scope.active {
            let mut scope = scope;
            scope.active = false;
            self.store.scopes().update(&scope).await?;
        }
        Ok(())
    }

    /// Shallow copy of variables between scopes. `names = None` copies all
    /// variables local to `src` (not its ancestors').
    pub async fn copy_variables(
        &self,
        src: Uuid,
        dst: Uuid,
        names: Option<&[String]>,
    ) -> Result<()> {
        let now = self.clock.now();
        let dst_scope = self
            .store
            .scopes()
            .find_by_id(dst)
            .await?
            .ok_or_else(|| EngineError::not_found("scope", dst))?;
        let vars = self.store.variables().find_by_scope(src).await?;
        for var in vars {
            if let Some(names) = names {
                if !names.iter().any(|n| n == &var.name) {
                    continue;
                }
            }
            let copy = Variable {
                scope_id: dst_scope.id,
                name: var.name,
                value: var.value,
                kind: var.kind,
                create_time: now,
                update_time: now,
            };
            self.store.variables().upsert(&copy).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store_memory::MemoryStore;
    use serde_json::json;

    fn manager() -> (ScopeManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::at_epoch());
        (
            ScopeManager::new(store.clone() as Arc<dyn EngineStore>, clock),
            store,
        )
    }

    #[tokio::test]
    async fn child_shadows_parent() {
        let (mgr, _) = manager();
        let pid = Uuid::now_v7();
        let root = mgr
            .create_scope(pid, None, ScopeKind::Process, None)
            .await
            .unwrap();
        let child = mgr
            .create_scope(pid, Some(root), ScopeKind::SubProcess, Some("sub"))
            .await
            .unwrap();

        mgr.set_variable(root, "x", json!(1)).await.unwrap();
        // New name in the child shadows nothing — it declares locally.
        mgr.set_variable(child, "y", json!(2)).await.unwrap();
        assert_eq!(mgr.get_variable(child, "x").await.unwrap(), Some(json!(1)));
        assert_eq!(mgr.get_variable(root, "y").await.unwrap(), None);

        // Writing `x` from the child updates the declaring (root) scope.
        let write = mgr.set_variable(child, "x", json!(10)).await.unwrap();
        assert_eq!(write.scope_id, root);
        assert!(!write.created);
        assert_eq!(mgr.get_variable(root, "x").await.unwrap(), Some(json!(10)));
    }

    #[tokio::test]
    async fn merged_view_child_wins() {
        let (mgr, _) = manager();
        let pid = Uuid::now_v7();
        let root = mgr
            .create_scope(pid, None, ScopeKind::Process, None)
            .await
            .unwrap();
        let child = mgr
            .create_scope(pid, Some(root), ScopeKind::Task, None)
            .await
            .unwrap();
        mgr.set_variable(root, "a", json!("root")).await.unwrap();
        mgr.set_variable(root, "b", json!("root")).await.unwrap();
        // Declare `a` fresh in the child by writing a new name first…
        let grandchild = mgr
            .create_scope(pid, Some(child), ScopeKind::Local, None)
            .await
            .unwrap();
        let vars = mgr.get_variables(grandchild).await.unwrap();
        assert_eq!(vars.get("a"), Some(&json!("root")));
        assert_eq!(vars.get("b"), Some(&json!("root")));
        assert_eq!(vars.len(), 2);
    }

    #[tokio::test]
    async fn destroy_is_recursive_and_idempotent() {
        let (mgr, store) = manager();
        let pid = Uuid::now_v7();
        let root = mgr
            .create_scope(pid, None, ScopeKind::Process, None)
            .await
            .unwrap();
        let child = mgr
            .create_scope(pid, Some(root), ScopeKind::SubProcess, None)
            .await
            .unwrap();
        mgr.set_variable(child, "gone", json!(true)).await.unwrap();

        mgr.destroy_scope(root).await.unwrap();
        mgr.destroy_scope(root).await.unwrap();

        let root_scope = store.scopes().find_by_id(root).await.unwrap().unwrap();
        let child_scope = store.scopes().find_by_id(child).await.unwrap().unwrap();
        assert!(!root_scope.active);
        assert!(!child_scope.active);
        assert!(store
            .variables()
            .find(child, "gone")
            .await
            .unwrap()
            .is_none());

        // A destroyed scope rejects writes and new children.
        let err = mgr.set_variable(child, "x", json!(1)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
        let err = mgr
            .create_scope(pid, Some(root), ScopeKind::Local, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[tokio::test]
    async fn copy_variables_subset() {
        let (mgr, _) = manager();
        let pid = Uuid::now_v7();
        let src = mgr
            .create_scope(pid, None, ScopeKind::Process, None)
            .await
            .unwrap();
        let dst = mgr
            .create_scope(pid, Some(src), ScopeKind::EventSubProcess, None)
            .await
            .unwrap();
        mgr.set_variable(src, "keep", json!(1)).await.unwrap();
        mgr.set_variable(src, "skip", json!(2)).await.unwrap();

        mgr.copy_variables(src, dst, Some(&["keep".to_string()]))
            .await
            .unwrap();
        let local = mgr.get_variables(dst).await.unwrap();
        // Merged view still sees both; only `keep` is a local copy.
        assert_eq!(local.get("keep"), Some(&json!(1)));
        let write = mgr.set_variable(dst, "keep", json!(9)).await.unwrap();
        assert_eq!(write.scope_id, dst);
    }

    #[tokio::test]
    async fn variable_writes_append_outbox_rows() {
        let (mgr, store) = manager();
        let pid = Uuid::now_v7();
        let root = mgr
            .create_scope(pid, None, ScopeKind::Process, None)
            .await
            .unwrap();
        mgr.set_variable(root, "x", json!(1)).await.unwrap();
        mgr.set_variable(root, "x", json!(2)).await.unwrap();

        let events = store.outbox().find_by_instance(pid).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(
            kinds,
            vec![
                LifecycleEventType::VariableCreated,
                LifecycleEventType::VariableUpdated
            ]
        );
    }
}
