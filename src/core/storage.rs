//! Persistence adapter
//!
//! The session persists every mutation through [`DiagramStorage`]. Calls are
//! keyed by diagram id plus entity id and carry only the delta of the change.
//! [`MemoryStorage`] keeps everything in a `DashMap` and backs the CLI and the
//! tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::core::data_types::DatabaseType;
use crate::core::schema::{
    Dependency, DependencyPatch, Diagram, DiagramSummary, Relationship, RelationshipPatch, Table,
    TablePatch,
};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Diagram {id} doesn't exist")]
    DiagramNotFound { id: Uuid },

    #[error("{kind} {id} doesn't exist")]
    EntityNotFound { kind: &'static str, id: Uuid },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Failed (de)serializing diagram: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Partial update of diagram metadata
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiagramUpdate {
    pub name: Option<String>,
    pub database_type: Option<DatabaseType>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DiagramUpdate {
    pub fn touched(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at: Some(updated_at),
            ..Default::default()
        }
    }

    fn apply(&self, diagram: &mut Diagram) {
        if let Some(name) = &self.name {
            diagram.name = name.clone();
        }
        if let Some(database_type) = self.database_type {
            diagram.database_type = database_type;
        }
        if let Some(updated_at) = self.updated_at {
            diagram.updated_at = updated_at;
        }
    }
}

#[async_trait]
pub trait DiagramStorage: Send + Sync {
    async fn list_diagrams(&self) -> StorageResult<Vec<DiagramSummary>>;

    /// Diagram with all its tables, relationships and dependencies
    async fn get_diagram(&self, id: Uuid) -> StorageResult<Diagram>;

    async fn add_diagram(&self, diagram: &Diagram) -> StorageResult<()>;

    async fn update_diagram(&self, id: Uuid, update: &DiagramUpdate) -> StorageResult<()>;

    async fn delete_diagram(&self, id: Uuid) -> StorageResult<()>;

    async fn delete_diagram_tables(&self, diagram_id: Uuid) -> StorageResult<()>;

    async fn delete_diagram_relationships(&self, diagram_id: Uuid) -> StorageResult<()>;

    async fn delete_diagram_dependencies(&self, diagram_id: Uuid) -> StorageResult<()>;

    async fn get_table(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<Table>;

    async fn add_table(&self, diagram_id: Uuid, table: &Table) -> StorageResult<()>;

    /// Insert or fully replace a table
    async fn put_table(&self, diagram_id: Uuid, table: &Table) -> StorageResult<()>;

    async fn update_table(&self, diagram_id: Uuid, id: Uuid, patch: &TablePatch)
    -> StorageResult<()>;

    async fn delete_table(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<()>;

    async fn add_relationship(
        &self,
        diagram_id: Uuid,
        relationship: &Relationship,
    ) -> StorageResult<()>;

    async fn update_relationship(
        &self,
        diagram_id: Uuid,
        id: Uuid,
        patch: &RelationshipPatch,
    ) -> StorageResult<()>;

    async fn delete_relationship(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<()>;

    async fn add_dependency(&self, diagram_id: Uuid, dependency: &Dependency)
    -> StorageResult<()>;

    async fn update_dependency(
        &self,
        diagram_id: Uuid,
        id: Uuid,
        patch: &DependencyPatch,
    ) -> StorageResult<()>;

    async fn delete_dependency(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<()>;
}

/// In-process storage keyed by diagram id
#[derive(Debug, Default)]
pub struct MemoryStorage {
    diagrams: DashMap<Uuid, Diagram>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StorageError::Unavailable`]
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Load a diagram from its JSON form, replacing any diagram with the same id
    pub fn import_json(&self, json: &str) -> StorageResult<Uuid> {
        let diagram: Diagram = serde_json::from_str(json)?;
        let id = diagram.id;
        self.diagrams.insert(id, diagram);
        Ok(id)
    }

    pub fn export_json(&self, id: Uuid) -> StorageResult<String> {
        let diagram = self
            .diagrams
            .get(&id)
            .ok_or(StorageError::DiagramNotFound { id })?;
        Ok(serde_json::to_string_pretty(diagram.value())?)
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "writes are disabled".to_string(),
            });
        }
        Ok(())
    }

    /// Run `f` on a stored diagram after checking that writes are allowed
    fn write<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Diagram) -> StorageResult<T>,
    ) -> StorageResult<T> {
        self.check_writable()?;
        let mut diagram = self
            .diagrams
            .get_mut(&id)
            .ok_or(StorageError::DiagramNotFound { id })?;
        f(diagram.value_mut())
    }
}

fn not_found(kind: &'static str, id: Uuid) -> StorageError {
    StorageError::EntityNotFound { kind, id }
}

#[async_trait]
impl DiagramStorage for MemoryStorage {
    async fn list_diagrams(&self) -> StorageResult<Vec<DiagramSummary>> {
        let mut diagrams: Vec<DiagramSummary> = self
            .diagrams
            .iter()
            .map(|entry| DiagramSummary::from(entry.value()))
            .collect();
        diagrams.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(diagrams)
    }

    async fn get_diagram(&self, id: Uuid) -> StorageResult<Diagram> {
        self.diagrams
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(StorageError::DiagramNotFound { id })
    }

    async fn add_diagram(&self, diagram: &Diagram) -> StorageResult<()> {
        self.check_writable()?;
        self.diagrams.insert(diagram.id, diagram.clone());
        Ok(())
    }

    async fn update_diagram(&self, id: Uuid, update: &DiagramUpdate) -> StorageResult<()> {
        self.write(id, |diagram| {
            update.apply(diagram);
            Ok(())
        })
    }

    async fn delete_diagram(&self, id: Uuid) -> StorageResult<()> {
        self.check_writable()?;
        self.diagrams
            .remove(&id)
            .map(|_| ())
            .ok_or(StorageError::DiagramNotFound { id })
    }

    async fn delete_diagram_tables(&self, diagram_id: Uuid) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            diagram.tables.clear();
            Ok(())
        })
    }

    async fn delete_diagram_relationships(&self, diagram_id: Uuid) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            diagram.relationships.clear();
            Ok(())
        })
    }

    async fn delete_diagram_dependencies(&self, diagram_id: Uuid) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            diagram.dependencies.clear();
            Ok(())
        })
    }

    async fn get_table(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<Table> {
        let diagram = self
            .diagrams
            .get(&diagram_id)
            .ok_or(StorageError::DiagramNotFound { id: diagram_id })?;
        diagram
            .tables
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| not_found("Table", id))
    }

    async fn add_table(&self, diagram_id: Uuid, table: &Table) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            diagram.tables.push(table.clone());
            Ok(())
        })
    }

    async fn put_table(&self, diagram_id: Uuid, table: &Table) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            match diagram.tables.iter_mut().find(|t| t.id == table.id) {
                Some(existing) => *existing = table.clone(),
                None => diagram.tables.push(table.clone()),
            }
            Ok(())
        })
    }

    async fn update_table(
        &self,
        diagram_id: Uuid,
        id: Uuid,
        patch: &TablePatch,
    ) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            let table = diagram
                .tables
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or_else(|| not_found("Table", id))?;
            table.apply(patch);
            Ok(())
        })
    }

    async fn delete_table(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            let before = diagram.tables.len();
            diagram.tables.retain(|t| t.id != id);
            if diagram.tables.len() == before {
                return Err(not_found("Table", id));
            }
            Ok(())
        })
    }

    async fn add_relationship(
        &self,
        diagram_id: Uuid,
        relationship: &Relationship,
    ) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            diagram.relationships.push(relationship.clone());
            Ok(())
        })
    }

    async fn update_relationship(
        &self,
        diagram_id: Uuid,
        id: Uuid,
        patch: &RelationshipPatch,
    ) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            let relationship = diagram
                .relationships
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| not_found("Relationship", id))?;
            relationship.apply(patch);
            Ok(())
        })
    }

    async fn delete_relationship(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            let before = diagram.relationships.len();
            diagram.relationships.retain(|r| r.id != id);
            if diagram.relationships.len() == before {
                return Err(not_found("Relationship", id));
            }
            Ok(())
        })
    }

    async fn add_dependency(
        &self,
        diagram_id: Uuid,
        dependency: &Dependency,
    ) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            diagram.dependencies.push(dependency.clone());
            Ok(())
        })
    }

    async fn update_dependency(
        &self,
        diagram_id: Uuid,
        id: Uuid,
        patch: &DependencyPatch,
    ) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            let dependency = diagram
                .dependencies
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| not_found("Dependency", id))?;
            dependency.apply(patch);
            Ok(())
        })
    }

    async fn delete_dependency(&self, diagram_id: Uuid, id: Uuid) -> StorageResult<()> {
        self.write(diagram_id, |diagram| {
            let before = diagram.dependencies.len();
            diagram.dependencies.retain(|d| d.id != id);
            if diagram.dependencies.len() == before {
                return Err(not_found("Dependency", id));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_types::DataType;
    use crate::core::schema::Field;

    fn stored_diagram(storage: &MemoryStorage) -> Uuid {
        let diagram = Diagram::new("test", DatabaseType::PostgreSql);
        let id = diagram.id;
        storage.diagrams.insert(id, diagram);
        id
    }

    #[tokio::test]
    async fn test_table_crud() {
        let storage = MemoryStorage::new();
        let diagram_id = stored_diagram(&storage);
        let table = Table::new("users").add_field(Field::new("id", DataType::new("bigint", "bigint")));

        storage.add_table(diagram_id, &table).await.unwrap();
        storage
            .update_table(diagram_id, table.id, &TablePatch::position(10.0, 20.0))
            .await
            .unwrap();

        let stored = storage.get_table(diagram_id, table.id).await.unwrap();
        assert_eq!((stored.x, stored.y), (10.0, 20.0));
        assert_eq!(stored.fields, table.fields);

        storage.delete_table(diagram_id, table.id).await.unwrap();
        assert!(matches!(
            storage.get_table(diagram_id, table.id).await,
            Err(StorageError::EntityNotFound { kind: "Table", .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_diagram() {
        let storage = MemoryStorage::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            storage.get_diagram(id).await,
            Err(StorageError::DiagramNotFound { .. })
        ));
        assert!(storage.update_diagram(id, &DiagramUpdate::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_writes() {
        let storage = MemoryStorage::new();
        let diagram_id = stored_diagram(&storage);
        storage.set_fail_writes(true);

        let result = storage.add_table(diagram_id, &Table::new("t")).await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));

        // Reads still work
        assert!(storage.get_diagram(diagram_id).await.unwrap().tables.is_empty());
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let storage = MemoryStorage::new();
        let diagram_id = stored_diagram(&storage);
        storage.add_table(diagram_id, &Table::new("users")).await.unwrap();

        let json = storage.export_json(diagram_id).unwrap();
        let other = MemoryStorage::new();
        assert_eq!(other.import_json(&json).unwrap(), diagram_id);
        assert_eq!(
            other.get_diagram(diagram_id).await.unwrap(),
            storage.get_diagram(diagram_id).await.unwrap()
        );

        assert!(matches!(
            other.import_json("{"),
            Err(StorageError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_list_diagrams_newest_first() {
        let storage = MemoryStorage::new();
        let older = stored_diagram(&storage);
        let newer = stored_diagram(&storage);
        storage
            .update_diagram(newer, &DiagramUpdate::touched(Utc::now() + chrono::Duration::seconds(5)))
            .await
            .unwrap();

        let listed = storage.list_diagrams().await.unwrap();
        assert_eq!(listed[0].id, newer);
        assert_eq!(listed[1].id, older);
    }
}
