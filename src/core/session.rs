//! Diagram session: the live model store
//!
//! A [`DiagramSession`] owns one loaded diagram and is the only way to mutate
//! it. Every mutation:
//! 1. changes the in-memory entity lists
//! 2. bumps the diagram `updated_at`
//! 3. publishes a [`DiagramEvent`]
//! 4. records an undo command unless [`MutationOptions::record_history`] is off
//! 5. persists the delta, with independent writes issued concurrently
//!
//! Memory is updated before persistence. A storage failure is returned to
//! the caller but the in-memory change stays, so the two can diverge.
//!
//! All mutations take `&mut self`, so passes over one session never
//! interleave. Share a session behind `tokio::sync::Mutex`.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::Config;
use crate::core::data_types::DatabaseType;
use crate::core::dbml::{generate, parse};
use crate::core::events::{DiagramEvent, EventBus};
use crate::core::history::{Action, HistoryLog};
use crate::core::layout::{GridLayout, LayoutEngine};
use crate::core::reconciliation::{ReconciliationPlan, reconcile};
use crate::core::schema::{
    Dependency, DependencyPatch, Diagram, DiagramSummary, Endpoint, Field, FieldPatch, Index,
    IndexPatch, Relationship, RelationshipPatch, SchemaInfo, Table, TablePatch, schema_name_to_id,
};
use crate::core::storage::{DiagramStorage, DiagramUpdate, StorageError, StorageResult};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No diagram is loaded")]
    NoDiagramLoaded,

    #[error("Table {0} doesn't exist")]
    TableNotFound(Uuid),

    #[error("Field {field_id} doesn't exist in table {table_id}")]
    FieldNotFound { table_id: Uuid, field_id: Uuid },

    #[error("Index {index_id} doesn't exist in table {table_id}")]
    IndexNotFound { table_id: Uuid, index_id: Uuid },

    #[error("Relationship {0} doesn't exist")]
    RelationshipNotFound(Uuid),

    #[error("Dependency {0} doesn't exist")]
    DependencyNotFound(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Options accepted by every mutation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MutationOptions {
    pub record_history: bool,
}

impl MutationOptions {
    pub const RECORD: Self = Self {
        record_history: true,
    };

    pub const SKIP_HISTORY: Self = Self {
        record_history: false,
    };
}

impl Default for MutationOptions {
    fn default() -> Self {
        Self::RECORD
    }
}

/// How [`DiagramSession::update_tables_state`] treats the given tables
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TablesStateMode {
    /// Keep the current order, replace tables by id, drop tables not given
    #[default]
    Merge,
    /// The given list becomes the table list
    Override,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

pub struct DiagramSession {
    storage: Arc<dyn DiagramStorage>,
    diagram: Option<Diagram>,
    history: HistoryLog,
    events: EventBus,
    layout: Box<dyn LayoutEngine>,
    default_database_type: DatabaseType,
    schema_filter: Option<Vec<String>>,
}

impl DiagramSession {
    pub fn new(storage: Arc<dyn DiagramStorage>) -> Self {
        Self::with_config(storage, &Config::defaults())
    }

    pub fn with_config(storage: Arc<dyn DiagramStorage>, config: &Config) -> Self {
        Self {
            storage,
            diagram: None,
            history: HistoryLog::new(),
            events: EventBus::new(config.event_capacity),
            layout: Box::new(GridLayout::default()),
            default_database_type: config.database_type,
            schema_filter: None,
        }
    }

    pub fn with_layout(mut self, layout: impl LayoutEngine + 'static) -> Self {
        self.layout = Box::new(layout);
        self
    }

    // ========================================================================
    // Read access
    // ========================================================================

    pub fn diagram(&self) -> Option<&Diagram> {
        self.diagram.as_ref()
    }

    pub fn diagram_id(&self) -> Option<Uuid> {
        self.diagram.as_ref().map(|d| d.id)
    }

    pub fn database_type(&self) -> DatabaseType {
        self.diagram
            .as_ref()
            .map_or(self.default_database_type, |d| d.database_type)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.diagram.as_ref().map(|d| d.updated_at)
    }

    pub fn tables(&self) -> &[Table] {
        self.diagram.as_ref().map(|d| d.tables.as_slice()).unwrap_or_default()
    }

    pub fn relationships(&self) -> &[Relationship] {
        self.diagram.as_ref().map(|d| d.relationships.as_slice()).unwrap_or_default()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        self.diagram.as_ref().map(|d| d.dependencies.as_slice()).unwrap_or_default()
    }

    pub fn get_table(&self, id: Uuid) -> Option<&Table> {
        self.tables().iter().find(|t| t.id == id)
    }

    pub fn get_field(&self, table_id: Uuid, field_id: Uuid) -> Option<&Field> {
        self.get_table(table_id)?.field(field_id)
    }

    pub fn get_index(&self, table_id: Uuid, index_id: Uuid) -> Option<&Index> {
        self.get_table(table_id)?.index(index_id)
    }

    pub fn get_relationship(&self, id: Uuid) -> Option<&Relationship> {
        self.relationships().iter().find(|r| r.id == id)
    }

    pub fn get_dependency(&self, id: Uuid) -> Option<&Dependency> {
        self.dependencies().iter().find(|d| d.id == id)
    }

    /// Schema text for the current model
    pub fn schema_text(&self) -> String {
        generate(self.tables(), self.relationships())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagramEvent> {
        self.events.subscribe()
    }

    pub fn history(&self) -> &HistoryLog {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    // ========================================================================
    // Schemas
    // ========================================================================

    /// Schemas used by the tables, default schema first; empty for dialects without schemas
    pub fn schemas(&self) -> Vec<SchemaInfo> {
        let database_type = self.database_type();
        if !database_type.has_schemas() {
            return Vec::new();
        }
        let default = database_type.default_schema();

        let mut names: Vec<&str> = self
            .tables()
            .iter()
            .filter_map(|t| t.schema.as_deref())
            .collect();
        names.sort_unstable();
        names.dedup();
        names.sort_by(|a, b| match (Some(*a) == default, Some(*b) == default) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.cmp(b),
        });

        names
            .into_iter()
            .map(|name| SchemaInfo {
                id: schema_name_to_id(name),
                name: name.to_string(),
                table_count: self
                    .tables()
                    .iter()
                    .filter(|t| t.schema.as_deref() == Some(name))
                    .count(),
            })
            .collect()
    }

    /// Restrict the visible tables to the given schema ids; empty clears the filter
    pub fn filter_schemas(&mut self, schema_ids: Vec<String>) {
        self.schema_filter = (!schema_ids.is_empty()).then_some(schema_ids);
    }

    /// Active schema filter: the explicit one, else the default (or first) schema
    pub fn filtered_schemas(&self) -> Option<Vec<String>> {
        let schemas = self.schemas();
        if schemas.is_empty() {
            return None;
        }
        if let Some(filter) = &self.schema_filter {
            return Some(filter.clone());
        }

        let default = self.database_type().default_schema();
        schemas
            .iter()
            .find(|s| Some(s.name.as_str()) == default)
            .or_else(|| schemas.first())
            .map(|s| vec![s.id.clone()])
    }

    /// Tables shown under the current schema filter
    pub fn visible_tables(&self) -> Vec<&Table> {
        let filter = self.filtered_schemas();
        self.tables()
            .iter()
            .filter(|t| is_visible(t, filter.as_deref()))
            .collect()
    }

    // ========================================================================
    // Diagram
    // ========================================================================

    pub async fn list_diagrams(&self) -> SessionResult<Vec<DiagramSummary>> {
        Ok(self.storage.list_diagrams().await?)
    }

    /// Create, persist and load a new empty diagram
    pub async fn create_diagram(
        &mut self,
        name: impl Into<String>,
        database_type: Option<DatabaseType>,
    ) -> SessionResult<Diagram> {
        let diagram = Diagram::new(name, database_type.unwrap_or(self.default_database_type));
        self.storage.add_diagram(&diagram).await?;
        self.set_loaded(diagram.clone());
        Ok(diagram)
    }

    pub async fn load_diagram(&mut self, id: Uuid) -> SessionResult<&Diagram> {
        let diagram = self.storage.get_diagram(id).await?;
        self.set_loaded(diagram);
        self.loaded()
    }

    fn set_loaded(&mut self, diagram: Diagram) {
        info!(
            "Loaded diagram '{}' ({} tables, {} relationships)",
            diagram.name,
            diagram.tables.len(),
            diagram.relationships.len()
        );
        let diagram_id = diagram.id;
        self.diagram = Some(diagram);
        self.history.clear();
        self.schema_filter = None;
        self.events.emit(DiagramEvent::DiagramLoaded { diagram_id });
    }

    pub async fn update_diagram_name(
        &mut self,
        name: impl Into<String>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let name = name.into();
        let diagram = self.loaded_mut()?;
        let before = std::mem::replace(&mut diagram.name, name.clone());

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::DiagramRenamed { name: name.clone() });
        self.record(
            options,
            Action::UpdateDiagramName {
                before,
                after: name.clone(),
            },
            t0,
            t1,
        );

        let update = DiagramUpdate {
            name: Some(name),
            updated_at: Some(t1),
            ..Default::default()
        };
        Ok(self.storage.update_diagram(diagram_id, &update).await?)
    }

    pub async fn update_database_type(&mut self, database_type: DatabaseType) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        diagram.database_type = database_type;
        let diagram_id = diagram.id;

        let update = DiagramUpdate {
            database_type: Some(database_type),
            ..Default::default()
        };
        Ok(self.storage.update_diagram(diagram_id, &update).await?)
    }

    /// Remove every table, relationship and dependency; history is reset
    pub async fn clear_diagram_data(&mut self) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        diagram.tables.clear();
        diagram.relationships.clear();
        diagram.dependencies.clear();

        let (diagram_id, _, t1) = self.touch()?;
        self.history.clear();
        self.events.emit(DiagramEvent::DiagramCleared { diagram_id });
        info!("Cleared diagram {}", diagram_id);

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        persist(vec![
            storage.update_diagram(diagram_id, &touched),
            storage.delete_diagram_tables(diagram_id),
            storage.delete_diagram_relationships(diagram_id),
            storage.delete_diagram_dependencies(diagram_id),
        ])
        .await
    }

    /// Delete the loaded diagram from storage and unload it
    pub async fn delete_diagram(&mut self) -> SessionResult<()> {
        let diagram = self.diagram.take().ok_or(SessionError::NoDiagramLoaded)?;
        let diagram_id = diagram.id;
        self.history.clear();
        self.schema_filter = None;
        self.events.emit(DiagramEvent::DiagramDeleted { diagram_id });
        info!("Deleted diagram {}", diagram_id);

        let storage = Arc::clone(&self.storage);
        persist(vec![
            storage.delete_diagram_tables(diagram_id),
            storage.delete_diagram_relationships(diagram_id),
            storage.delete_diagram_dependencies(diagram_id),
        ])
        .await?;
        Ok(storage.delete_diagram(diagram_id).await?)
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Add a `table_<n>` with a single `id` primary key, then apply `attributes`
    pub async fn create_table(&mut self, attributes: TablePatch) -> SessionResult<Table> {
        let id_type = self.database_type().default_id_type();
        let mut table = Table::new(format!("table_{}", self.tables().len() + 1))
            .add_field(Field::new("id", id_type).primary_key());
        table.apply(&attributes);

        self.add_table(table.clone(), MutationOptions::default()).await?;
        Ok(table)
    }

    pub async fn add_table(&mut self, table: Table, options: MutationOptions) -> SessionResult<()> {
        self.add_tables(vec![table], options).await
    }

    pub async fn add_tables(
        &mut self,
        tables: Vec<Table>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let start = self.tables().len();
        self.insert_tables(appended(start, tables), options).await
    }

    async fn insert_tables(
        &mut self,
        entries: Vec<(usize, Table)>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        insert_positioned(&mut self.loaded_mut()?.tables, &entries);
        let tables = unpositioned(entries);

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::TablesAdded {
            table_ids: ids_of(&tables, |t| t.id),
        });
        self.record(
            options,
            Action::AddTables {
                tables: tables.clone(),
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(tables.iter().map(|t| storage.add_table(diagram_id, t)));
        persist(writes).await
    }

    pub async fn remove_table(&mut self, id: Uuid, options: MutationOptions) -> SessionResult<()> {
        self.remove_tables(&[id], options).await
    }

    /// Remove tables together with the relationships and dependencies touching them
    pub async fn remove_tables(&mut self, ids: &[Uuid], options: MutationOptions) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        let tables = take_positioned(&mut diagram.tables, |t| ids.contains(&t.id));
        if let (true, Some(first)) = (tables.is_empty(), ids.first()) {
            return Err(SessionError::TableNotFound(*first));
        }

        let removed = ids_of(&tables, |(_, t)| t.id);
        let (relationships, dependencies) = detach(diagram, &removed);

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::TablesRemoved {
            table_ids: removed.clone(),
        });
        debug!(
            "Removed {} tables, cascading {} relationships and {} dependencies",
            removed.len(),
            relationships.len(),
            dependencies.len()
        );
        self.record(
            options,
            Action::RemoveTables {
                tables,
                relationships: relationships.clone(),
                dependencies: dependencies.clone(),
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(relationships.iter().map(|(_, r)| storage.delete_relationship(diagram_id, r.id)));
        writes.extend(dependencies.iter().map(|(_, d)| storage.delete_dependency(diagram_id, d.id)));
        writes.extend(removed.iter().map(|id| storage.delete_table(diagram_id, *id)));
        persist(writes).await
    }

    pub async fn update_table(
        &mut self,
        id: Uuid,
        patch: TablePatch,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(id)?;
        let before = table.clone();
        table.apply(&patch);
        let after = table.clone();

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::TableUpdated { table_id: id });
        self.record(options, Action::UpdateTable { before, after }, t0, t1);

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        persist(vec![
            storage.update_diagram(diagram_id, &touched),
            storage.update_table(diagram_id, id, &patch),
        ])
        .await
    }

    /// Replace the whole table list at once
    ///
    /// Tables that disappear are deleted with their relationships and dependencies.
    pub async fn update_tables_state(
        &mut self,
        tables: Vec<Table>,
        mode: TablesStateMode,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        let before = diagram.tables.clone();
        let after: Vec<Table> = match mode {
            TablesStateMode::Override => tables,
            TablesStateMode::Merge => before
                .iter()
                .filter_map(|prev| tables.iter().find(|t| t.id == prev.id).cloned())
                .collect(),
        };

        let removed: Vec<Uuid> = before
            .iter()
            .filter(|prev| !after.iter().any(|t| t.id == prev.id))
            .map(|t| t.id)
            .collect();
        let (relationships, dependencies) = detach(diagram, &removed);
        diagram.tables = after.clone();

        let (diagram_id, t0, t1) = self.touch()?;
        if !removed.is_empty() {
            self.events.emit(DiagramEvent::TablesRemoved {
                table_ids: removed.clone(),
            });
        }
        self.record(
            options,
            Action::UpdateTablesState {
                before,
                after: after.clone(),
                relationships: relationships.clone(),
                dependencies: dependencies.clone(),
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(after.iter().map(|t| storage.put_table(diagram_id, t)));
        writes.extend(removed.iter().map(|id| storage.delete_table(diagram_id, *id)));
        writes.extend(relationships.iter().map(|(_, r)| storage.delete_relationship(diagram_id, r.id)));
        writes.extend(dependencies.iter().map(|(_, d)| storage.delete_dependency(diagram_id, d.id)));
        persist(writes).await
    }

    // ========================================================================
    // Fields
    // ========================================================================

    /// Append a nullable `field_<n>` to a table
    pub async fn create_field(&mut self, table_id: Uuid) -> SessionResult<Field> {
        let count = self
            .get_table(table_id)
            .ok_or(SessionError::TableNotFound(table_id))?
            .fields
            .len();
        let field = Field::new(
            format!("field_{}", count + 1),
            self.database_type().default_id_type(),
        )
        .nullable();

        self.add_field(table_id, field.clone(), MutationOptions::default())
            .await?;
        Ok(field)
    }

    pub async fn add_field(
        &mut self,
        table_id: Uuid,
        field: Field,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.insert_field(table_id, field, None, options).await
    }

    async fn insert_field(
        &mut self,
        table_id: Uuid,
        field: Field,
        position: Option<usize>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(table_id)?;
        let position = position.unwrap_or(table.fields.len()).min(table.fields.len());
        table.fields.insert(position, field.clone());
        let fields = table.fields.clone();

        self.events.emit(DiagramEvent::FieldAdded {
            table_id,
            field_id: field.id,
        });
        self.finish_field_change(table_id, fields, Action::AddField { table_id, field }, options)
            .await
    }

    pub async fn update_field(
        &mut self,
        table_id: Uuid,
        field_id: Uuid,
        patch: FieldPatch,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(table_id)?;
        let field = table
            .fields
            .iter_mut()
            .find(|f| f.id == field_id)
            .ok_or(SessionError::FieldNotFound { table_id, field_id })?;
        let before = field.clone();
        field.apply(&patch);
        let after = field.clone();
        let fields = table.fields.clone();

        self.events
            .emit(DiagramEvent::FieldUpdated { table_id, field_id });
        self.finish_field_change(
            table_id,
            fields,
            Action::UpdateField {
                table_id,
                before,
                after,
            },
            options,
        )
        .await
    }

    pub async fn remove_field(
        &mut self,
        table_id: Uuid,
        field_id: Uuid,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(table_id)?;
        let position = table
            .fields
            .iter()
            .position(|f| f.id == field_id)
            .ok_or(SessionError::FieldNotFound { table_id, field_id })?;
        let field = table.fields.remove(position);
        let fields = table.fields.clone();

        self.events
            .emit(DiagramEvent::FieldRemoved { table_id, field_id });
        self.finish_field_change(
            table_id,
            fields,
            Action::RemoveField {
                table_id,
                field,
                position,
            },
            options,
        )
        .await
    }

    async fn finish_field_change(
        &mut self,
        table_id: Uuid,
        fields: Vec<Field>,
        action: Action,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let (diagram_id, t0, t1) = self.touch()?;
        self.record(options, action, t0, t1);

        let patch = TablePatch {
            fields: Some(fields),
            ..Default::default()
        };
        self.persist_table_patch(diagram_id, table_id, patch, t1).await
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Append an empty `index_<n>` to a table
    pub async fn create_index(&mut self, table_id: Uuid) -> SessionResult<Index> {
        let count = self
            .get_table(table_id)
            .ok_or(SessionError::TableNotFound(table_id))?
            .indexes
            .len();
        let index = Index::new(format!("index_{}", count + 1), Vec::new());

        self.add_index(table_id, index.clone(), MutationOptions::default())
            .await?;
        Ok(index)
    }

    pub async fn add_index(
        &mut self,
        table_id: Uuid,
        index: Index,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.insert_index(table_id, index, None, options).await
    }

    async fn insert_index(
        &mut self,
        table_id: Uuid,
        index: Index,
        position: Option<usize>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(table_id)?;
        let position = position.unwrap_or(table.indexes.len()).min(table.indexes.len());
        table.indexes.insert(position, index.clone());
        let indexes = table.indexes.clone();

        self.finish_index_change(table_id, indexes, Action::AddIndex { table_id, index }, options)
            .await
    }

    pub async fn update_index(
        &mut self,
        table_id: Uuid,
        index_id: Uuid,
        patch: IndexPatch,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(table_id)?;
        let index = table
            .indexes
            .iter_mut()
            .find(|i| i.id == index_id)
            .ok_or(SessionError::IndexNotFound { table_id, index_id })?;
        let before = index.clone();
        index.apply(&patch);
        let after = index.clone();
        let indexes = table.indexes.clone();

        self.finish_index_change(
            table_id,
            indexes,
            Action::UpdateIndex {
                table_id,
                before,
                after,
            },
            options,
        )
        .await
    }

    pub async fn remove_index(
        &mut self,
        table_id: Uuid,
        index_id: Uuid,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let table = self.table_mut(table_id)?;
        let position = table
            .indexes
            .iter()
            .position(|i| i.id == index_id)
            .ok_or(SessionError::IndexNotFound { table_id, index_id })?;
        let index = table.indexes.remove(position);
        let indexes = table.indexes.clone();

        self.finish_index_change(
            table_id,
            indexes,
            Action::RemoveIndex {
                table_id,
                index,
                position,
            },
            options,
        )
        .await
    }

    async fn finish_index_change(
        &mut self,
        table_id: Uuid,
        indexes: Vec<Index>,
        action: Action,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::IndexesChanged { table_id });
        self.record(options, action, t0, t1);

        self.persist_table_patch(diagram_id, table_id, TablePatch::indexes(indexes), t1)
            .await
    }

    async fn persist_table_patch(
        &self,
        diagram_id: Uuid,
        table_id: Uuid,
        patch: TablePatch,
        updated_at: DateTime<Utc>,
    ) -> SessionResult<()> {
        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(updated_at);
        persist(vec![
            storage.update_diagram(diagram_id, &touched),
            storage.update_table(diagram_id, table_id, &patch),
        ])
        .await
    }

    // ========================================================================
    // Relationships
    // ========================================================================

    /// Link two fields with a `<source table>_<source field>_fk` one-to-one relationship
    pub async fn create_relationship(
        &mut self,
        source: (Uuid, Uuid),
        target: (Uuid, Uuid),
    ) -> SessionResult<Relationship> {
        let endpoint = |(table_id, field_id): (Uuid, Uuid)| -> SessionResult<(Endpoint, String)> {
            let table = self
                .get_table(table_id)
                .ok_or(SessionError::TableNotFound(table_id))?;
            let field = table
                .field(field_id)
                .ok_or(SessionError::FieldNotFound { table_id, field_id })?;
            Ok((
                Endpoint {
                    table_id,
                    field_id,
                    schema: table.schema.clone(),
                },
                format!("{}_{}", table.name, field.name),
            ))
        };

        let (source, prefix) = endpoint(source)?;
        let (target, _) = endpoint(target)?;
        let relationship = Relationship::new(format!("{prefix}_fk"), source, target);

        self.add_relationship(relationship.clone(), MutationOptions::default())
            .await?;
        Ok(relationship)
    }

    pub async fn add_relationship(
        &mut self,
        relationship: Relationship,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.add_relationships(vec![relationship], options).await
    }

    pub async fn add_relationships(
        &mut self,
        relationships: Vec<Relationship>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let start = self.relationships().len();
        self.insert_relationships(appended(start, relationships), options)
            .await
    }

    async fn insert_relationships(
        &mut self,
        entries: Vec<(usize, Relationship)>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        insert_positioned(&mut self.loaded_mut()?.relationships, &entries);
        let relationships = unpositioned(entries);

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::RelationshipsAdded {
            relationship_ids: ids_of(&relationships, |r| r.id),
        });
        self.record(
            options,
            Action::AddRelationships {
                relationships: relationships.clone(),
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(relationships.iter().map(|r| storage.add_relationship(diagram_id, r)));
        persist(writes).await
    }

    pub async fn remove_relationship(
        &mut self,
        id: Uuid,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.remove_relationships(&[id], options).await
    }

    pub async fn remove_relationships(
        &mut self,
        ids: &[Uuid],
        options: MutationOptions,
    ) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        let removed = take_positioned(&mut diagram.relationships, |r| ids.contains(&r.id));
        if let (true, Some(first)) = (removed.is_empty(), ids.first()) {
            return Err(SessionError::RelationshipNotFound(*first));
        }

        let (diagram_id, t0, t1) = self.touch()?;
        let removed_ids = ids_of(&removed, |(_, r)| r.id);
        self.events.emit(DiagramEvent::RelationshipsRemoved {
            relationship_ids: removed_ids.clone(),
        });
        self.record(
            options,
            Action::RemoveRelationships {
                relationships: removed,
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(removed_ids.iter().map(|id| storage.delete_relationship(diagram_id, *id)));
        persist(writes).await
    }

    pub async fn update_relationship(
        &mut self,
        id: Uuid,
        patch: RelationshipPatch,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let relationship = self
            .loaded_mut()?
            .relationships
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(SessionError::RelationshipNotFound(id))?;
        let before = relationship.clone();
        relationship.apply(&patch);
        let after = relationship.clone();

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::RelationshipUpdated {
            relationship_id: id,
        });
        self.record(options, Action::UpdateRelationship { before, after }, t0, t1);

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        persist(vec![
            storage.update_diagram(diagram_id, &touched),
            storage.update_relationship(diagram_id, id, &patch),
        ])
        .await
    }

    // ========================================================================
    // Dependencies
    // ========================================================================

    pub async fn create_dependency(
        &mut self,
        table_id: Uuid,
        dependent_table_id: Uuid,
    ) -> SessionResult<Dependency> {
        let table = self
            .get_table(table_id)
            .ok_or(SessionError::TableNotFound(table_id))?;
        let dependent = self
            .get_table(dependent_table_id)
            .ok_or(SessionError::TableNotFound(dependent_table_id))?;

        let mut dependency = Dependency::new(table_id, dependent_table_id);
        dependency.schema = table.schema.clone();
        dependency.dependent_schema = dependent.schema.clone();

        self.add_dependency(dependency.clone(), MutationOptions::default())
            .await?;
        Ok(dependency)
    }

    pub async fn add_dependency(
        &mut self,
        dependency: Dependency,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.add_dependencies(vec![dependency], options).await
    }

    pub async fn add_dependencies(
        &mut self,
        dependencies: Vec<Dependency>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let start = self.dependencies().len();
        self.insert_dependencies(appended(start, dependencies), options)
            .await
    }

    async fn insert_dependencies(
        &mut self,
        entries: Vec<(usize, Dependency)>,
        options: MutationOptions,
    ) -> SessionResult<()> {
        insert_positioned(&mut self.loaded_mut()?.dependencies, &entries);
        let dependencies = unpositioned(entries);

        let (diagram_id, t0, t1) = self.touch()?;
        self.events.emit(DiagramEvent::DependenciesAdded {
            dependency_ids: ids_of(&dependencies, |d| d.id),
        });
        self.record(
            options,
            Action::AddDependencies {
                dependencies: dependencies.clone(),
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(dependencies.iter().map(|d| storage.add_dependency(diagram_id, d)));
        persist(writes).await
    }

    pub async fn remove_dependency(
        &mut self,
        id: Uuid,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.remove_dependencies(&[id], options).await
    }

    pub async fn remove_dependencies(
        &mut self,
        ids: &[Uuid],
        options: MutationOptions,
    ) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        let removed = take_positioned(&mut diagram.dependencies, |d| ids.contains(&d.id));
        if let (true, Some(first)) = (removed.is_empty(), ids.first()) {
            return Err(SessionError::DependencyNotFound(*first));
        }

        let (diagram_id, t0, t1) = self.touch()?;
        let removed_ids = ids_of(&removed, |(_, d)| d.id);
        self.events.emit(DiagramEvent::DependenciesRemoved {
            dependency_ids: removed_ids.clone(),
        });
        self.record(
            options,
            Action::RemoveDependencies {
                dependencies: removed,
            },
            t0,
            t1,
        );

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        let mut writes = vec![storage.update_diagram(diagram_id, &touched)];
        writes.extend(removed_ids.iter().map(|id| storage.delete_dependency(diagram_id, *id)));
        persist(writes).await
    }

    pub async fn update_dependency(
        &mut self,
        id: Uuid,
        patch: DependencyPatch,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let dependency = self
            .loaded_mut()?
            .dependencies
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or(SessionError::DependencyNotFound(id))?;
        let before = dependency.clone();
        dependency.apply(&patch);
        let after = dependency.clone();

        let (diagram_id, t0, t1) = self.touch()?;
        self.events
            .emit(DiagramEvent::DependencyUpdated { dependency_id: id });
        self.record(options, Action::UpdateDependency { before, after }, t0, t1);

        let storage = Arc::clone(&self.storage);
        let touched = DiagramUpdate::touched(t1);
        persist(vec![
            storage.update_diagram(diagram_id, &touched),
            storage.update_dependency(diagram_id, id, &patch),
        ])
        .await
    }

    // ========================================================================
    // Schema text
    // ========================================================================

    /// Parse `text`, reconcile it with the model and apply the result as one undo step
    pub async fn apply_schema_text(&mut self, text: &str) -> SessionResult<ReconciliationPlan> {
        self.loaded()?;
        let parsed = parse(text, self.database_type());
        let plan = reconcile(parsed, self.tables(), self.relationships());
        self.apply_plan(&plan, MutationOptions::default()).await?;
        Ok(plan)
    }

    /// Apply a reconciliation plan
    ///
    /// With history on, every mutation of the plan lands in a single undo entry.
    /// Mutations keep being applied after a failure; the first error is returned.
    pub async fn apply_plan(
        &mut self,
        plan: &ReconciliationPlan,
        options: MutationOptions,
    ) -> SessionResult<()> {
        self.loaded()?;
        if plan.is_empty() {
            return Ok(());
        }

        if options.record_history {
            self.history.begin_group();
        }
        let result = self.apply_plan_steps(plan, options).await;
        if options.record_history {
            self.history.end_group();
        }
        result
    }

    async fn apply_plan_steps(
        &mut self,
        plan: &ReconciliationPlan,
        options: MutationOptions,
    ) -> SessionResult<()> {
        let mut first_error = None;

        if !plan.deleted_tables.is_empty() {
            keep_first(
                &mut first_error,
                self.remove_tables(&plan.deleted_tables, options).await,
            );
        }
        for (id, patch) in &plan.updated_tables {
            keep_first(
                &mut first_error,
                self.update_table(*id, patch.clone(), options).await,
            );
        }
        if !plan.created_tables.is_empty() {
            keep_first(
                &mut first_error,
                self.add_tables(plan.created_tables.clone(), options).await,
            );
            let created = ids_of(&plan.created_tables, |t| t.id);
            keep_first(&mut first_error, self.place_tables(&created, options).await);
        }

        if !plan.deleted_relationships.is_empty() {
            keep_first(
                &mut first_error,
                self.remove_relationships(&plan.deleted_relationships, options)
                    .await,
            );
        }
        for (id, patch) in &plan.updated_relationships {
            keep_first(
                &mut first_error,
                self.update_relationship(*id, patch.clone(), options).await,
            );
        }
        if !plan.created_relationships.is_empty() {
            keep_first(
                &mut first_error,
                self.add_relationships(plan.created_relationships.clone(), options)
                    .await,
            );
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Position new tables among the visible ones and focus each of them
    async fn place_tables(&mut self, ids: &[Uuid], options: MutationOptions) -> SessionResult<()> {
        let visible: Vec<Table> = self.visible_tables().into_iter().cloned().collect();
        let positions = self.layout.place(&visible, self.relationships(), ids);

        let mut first_error = None;
        for position in positions {
            keep_first(
                &mut first_error,
                self.update_table(
                    position.table_id,
                    TablePatch::position(position.x, position.y),
                    options,
                )
                .await,
            );
            self.events.emit(DiagramEvent::FocusTable {
                table_id: position.table_id,
            });
        }
        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Undo / redo
    // ========================================================================

    /// Undo the last recorded command; `Ok(false)` if there is nothing to undo
    pub async fn undo(&mut self) -> SessionResult<bool> {
        let Some(command) = self.history.pop_undo() else {
            return Ok(false);
        };
        debug!("Undo {}", command.action.tag());

        let replayed = self.replay(&command.action, Direction::Undo).await;
        let restored = self.restore_updated_at(command.undo_updated_at).await;
        self.history.push_redo(command);

        replayed?;
        restored?;
        Ok(true)
    }

    /// Redo the last undone command; `Ok(false)` if there is nothing to redo
    pub async fn redo(&mut self) -> SessionResult<bool> {
        let Some(command) = self.history.pop_redo() else {
            return Ok(false);
        };
        debug!("Redo {}", command.action.tag());

        let replayed = self.replay(&command.action, Direction::Redo).await;
        let restored = self.restore_updated_at(command.redo_updated_at).await;
        self.history.push_undo(command);

        replayed?;
        restored?;
        Ok(true)
    }

    async fn replay(&mut self, action: &Action, direction: Direction) -> SessionResult<()> {
        let mut steps = action.steps();
        if direction == Direction::Undo {
            steps.reverse();
        }

        let mut first_error = None;
        for step in steps {
            let result = match direction {
                Direction::Undo => self.undo_step(step).await,
                Direction::Redo => self.redo_step(step).await,
            };
            if let Err(e) = &result {
                warn!("Replaying {} failed: {}", step.tag(), e);
            }
            keep_first(&mut first_error, result);
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn undo_step(&mut self, action: &Action) -> SessionResult<()> {
        let quiet = MutationOptions::SKIP_HISTORY;
        match action {
            Action::UpdateDiagramName { before, .. } => {
                self.update_diagram_name(before.clone(), quiet).await
            }
            Action::AddTables { tables } => {
                self.remove_tables(&ids_of(tables, |t| t.id), quiet).await
            }
            Action::RemoveTables {
                tables,
                relationships,
                dependencies,
            } => {
                self.insert_tables(tables.clone(), quiet).await?;
                self.restore_links(relationships, dependencies).await
            }
            Action::UpdateTable { before, .. } => {
                self.update_table(before.id, TablePatch::replace_with(before), quiet)
                    .await
            }
            Action::UpdateTablesState {
                before,
                relationships,
                dependencies,
                ..
            } => {
                self.update_tables_state(before.clone(), TablesStateMode::Override, quiet)
                    .await?;
                self.restore_links(relationships, dependencies).await
            }
            Action::AddField { table_id, field } => {
                self.remove_field(*table_id, field.id, quiet).await
            }
            Action::RemoveField {
                table_id,
                field,
                position,
            } => {
                self.insert_field(*table_id, field.clone(), Some(*position), quiet)
                    .await
            }
            Action::UpdateField {
                table_id, before, ..
            } => {
                self.update_field(*table_id, before.id, FieldPatch::replace_with(before), quiet)
                    .await
            }
            Action::AddIndex { table_id, index } => {
                self.remove_index(*table_id, index.id, quiet).await
            }
            Action::RemoveIndex {
                table_id,
                index,
                position,
            } => {
                self.insert_index(*table_id, index.clone(), Some(*position), quiet)
                    .await
            }
            Action::UpdateIndex {
                table_id, before, ..
            } => {
                self.update_index(*table_id, before.id, IndexPatch::replace_with(before), quiet)
                    .await
            }
            Action::AddRelationships { relationships } => {
                self.remove_relationships(&ids_of(relationships, |r| r.id), quiet)
                    .await
            }
            Action::RemoveRelationships { relationships } => {
                self.insert_relationships(relationships.clone(), quiet).await
            }
            Action::UpdateRelationship { before, .. } => {
                self.update_relationship(before.id, RelationshipPatch::replace_with(before), quiet)
                    .await
            }
            Action::AddDependencies { dependencies } => {
                self.remove_dependencies(&ids_of(dependencies, |d| d.id), quiet)
                    .await
            }
            Action::RemoveDependencies { dependencies } => {
                self.insert_dependencies(dependencies.clone(), quiet).await
            }
            Action::UpdateDependency { before, .. } => {
                self.update_dependency(before.id, DependencyPatch::replace_with(before), quiet)
                    .await
            }
            Action::Batch { .. } => Ok(()),
        }
    }

    async fn redo_step(&mut self, action: &Action) -> SessionResult<()> {
        let quiet = MutationOptions::SKIP_HISTORY;
        match action {
            Action::UpdateDiagramName { after, .. } => {
                self.update_diagram_name(after.clone(), quiet).await
            }
            Action::AddTables { tables } => self.add_tables(tables.clone(), quiet).await,
            Action::RemoveTables { tables, .. } => {
                self.remove_tables(&ids_of(tables, |(_, t)| t.id), quiet).await
            }
            Action::UpdateTable { after, .. } => {
                self.update_table(after.id, TablePatch::replace_with(after), quiet)
                    .await
            }
            Action::UpdateTablesState { after, .. } => {
                self.update_tables_state(after.clone(), TablesStateMode::Override, quiet)
                    .await
            }
            Action::AddField { table_id, field } => {
                self.insert_field(*table_id, field.clone(), None, quiet).await
            }
            Action::RemoveField {
                table_id, field, ..
            } => self.remove_field(*table_id, field.id, quiet).await,
            Action::UpdateField {
                table_id, after, ..
            } => {
                self.update_field(*table_id, after.id, FieldPatch::replace_with(after), quiet)
                    .await
            }
            Action::AddIndex { table_id, index } => {
                self.insert_index(*table_id, index.clone(), None, quiet).await
            }
            Action::RemoveIndex {
                table_id, index, ..
            } => self.remove_index(*table_id, index.id, quiet).await,
            Action::UpdateIndex {
                table_id, after, ..
            } => {
                self.update_index(*table_id, after.id, IndexPatch::replace_with(after), quiet)
                    .await
            }
            Action::AddRelationships { relationships } => {
                self.add_relationships(relationships.clone(), quiet).await
            }
            Action::RemoveRelationships { relationships } => {
                self.remove_relationships(&ids_of(relationships, |(_, r)| r.id), quiet)
                    .await
            }
            Action::UpdateRelationship { after, .. } => {
                self.update_relationship(after.id, RelationshipPatch::replace_with(after), quiet)
                    .await
            }
            Action::AddDependencies { dependencies } => {
                self.add_dependencies(dependencies.clone(), quiet).await
            }
            Action::RemoveDependencies { dependencies } => {
                self.remove_dependencies(&ids_of(dependencies, |(_, d)| d.id), quiet)
                    .await
            }
            Action::UpdateDependency { after, .. } => {
                self.update_dependency(after.id, DependencyPatch::replace_with(after), quiet)
                    .await
            }
            Action::Batch { .. } => Ok(()),
        }
    }

    /// Re-add relationships and dependencies removed by a cascade
    async fn restore_links(
        &mut self,
        relationships: &[(usize, Relationship)],
        dependencies: &[(usize, Dependency)],
    ) -> SessionResult<()> {
        let quiet = MutationOptions::SKIP_HISTORY;
        if !relationships.is_empty() {
            self.insert_relationships(relationships.to_vec(), quiet)
                .await?;
        }
        if !dependencies.is_empty() {
            self.insert_dependencies(dependencies.to_vec(), quiet)
                .await?;
        }
        Ok(())
    }

    async fn restore_updated_at(&mut self, updated_at: DateTime<Utc>) -> SessionResult<()> {
        let diagram = self.loaded_mut()?;
        diagram.updated_at = updated_at;
        let diagram_id = diagram.id;
        Ok(self
            .storage
            .update_diagram(diagram_id, &DiagramUpdate::touched(updated_at))
            .await?)
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn loaded(&self) -> SessionResult<&Diagram> {
        self.diagram.as_ref().ok_or(SessionError::NoDiagramLoaded)
    }

    fn loaded_mut(&mut self) -> SessionResult<&mut Diagram> {
        self.diagram.as_mut().ok_or(SessionError::NoDiagramLoaded)
    }

    fn table_mut(&mut self, id: Uuid) -> SessionResult<&mut Table> {
        self.loaded_mut()?
            .tables
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(SessionError::TableNotFound(id))
    }

    /// Bump `updated_at`; returns the diagram id and the old and new timestamps
    fn touch(&mut self) -> SessionResult<(Uuid, DateTime<Utc>, DateTime<Utc>)> {
        let diagram = self.loaded_mut()?;
        let before = diagram.updated_at;
        diagram.updated_at = Utc::now();
        Ok((diagram.id, before, diagram.updated_at))
    }

    fn record(
        &mut self,
        options: MutationOptions,
        action: Action,
        before: DateTime<Utc>,
        after: DateTime<Utc>,
    ) {
        if options.record_history {
            self.history.record(action, before, after);
        }
    }
}

/// Await every write; report the first failure
async fn persist(writes: Vec<BoxFuture<'_, StorageResult<()>>>) -> SessionResult<()> {
    let mut first_error = None;
    for result in join_all(writes).await {
        if let Err(e) = result {
            warn!("Persisting diagram change failed: {}", e);
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn keep_first(slot: &mut Option<SessionError>, result: SessionResult<()>) {
    if let Err(e) = result {
        slot.get_or_insert(e);
    }
}

fn ids_of<T>(items: &[T], id: impl Fn(&T) -> Uuid) -> Vec<Uuid> {
    items.iter().map(id).collect()
}

/// Take the relationships and dependencies touching `table_ids` out of the diagram
fn detach(
    diagram: &mut Diagram,
    table_ids: &[Uuid],
) -> (Vec<(usize, Relationship)>, Vec<(usize, Dependency)>) {
    let relationships = take_positioned(&mut diagram.relationships, |r| r.touches_any(table_ids));
    let dependencies = take_positioned(&mut diagram.dependencies, |d| d.touches_any(table_ids));
    (relationships, dependencies)
}

/// Remove the matching items, each paired with its index before the removal
fn take_positioned<T>(items: &mut Vec<T>, matches: impl Fn(&T) -> bool) -> Vec<(usize, T)> {
    let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(items)
        .into_iter()
        .enumerate()
        .partition(|(_, item)| matches(item));
    *items = kept.into_iter().map(|(_, item)| item).collect();
    taken
}

/// Insert at the recorded indices; entries must be in ascending index order
fn insert_positioned<T: Clone>(items: &mut Vec<T>, entries: &[(usize, T)]) {
    for (position, item) in entries {
        items.insert((*position).min(items.len()), item.clone());
    }
}

fn appended<T>(start: usize, items: Vec<T>) -> Vec<(usize, T)> {
    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| (start + i, item))
        .collect()
}

fn unpositioned<T>(entries: Vec<(usize, T)>) -> Vec<T> {
    entries.into_iter().map(|(_, item)| item).collect()
}

fn is_visible(table: &Table, filter: Option<&[String]>) -> bool {
    match (filter, &table.schema) {
        (Some(ids), Some(schema)) => ids.contains(&schema_name_to_id(schema)),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_types::DataType;
    use crate::core::storage::MemoryStorage;

    async fn session() -> (DiagramSession, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        let mut session = DiagramSession::new(storage.clone());
        session
            .create_diagram("test", Some(DatabaseType::PostgreSql))
            .await
            .unwrap();
        (session, storage)
    }

    fn int() -> DataType {
        DataType::new("integer", "integer")
    }

    #[tokio::test]
    async fn test_mutation_without_diagram() {
        let mut session = DiagramSession::new(Arc::new(MemoryStorage::new()));
        let result = session
            .add_table(Table::new("t"), MutationOptions::default())
            .await;
        assert!(matches!(result, Err(SessionError::NoDiagramLoaded)));
    }

    #[tokio::test]
    async fn test_create_table_seeds_primary_key() {
        let (mut session, storage) = session().await;
        let table = session.create_table(TablePatch::default()).await.unwrap();

        assert_eq!(table.name, "table_1");
        assert_eq!(table.fields.len(), 1);
        assert!(table.fields[0].primary_key);
        assert_eq!(table.fields[0].data_type.name, "bigint");

        let diagram_id = session.diagram_id().unwrap();
        assert_eq!(storage.get_table(diagram_id, table.id).await.unwrap(), table);

        let second = session.create_table(TablePatch::default()).await.unwrap();
        assert_eq!(second.name, "table_2");
    }

    #[tokio::test]
    async fn test_remove_table_cascades() {
        let (mut session, storage) = session().await;
        let a = session.create_table(TablePatch::default()).await.unwrap();
        let b = session.create_table(TablePatch::default()).await.unwrap();
        session
            .create_relationship((a.id, a.fields[0].id), (b.id, b.fields[0].id))
            .await
            .unwrap();
        session.create_dependency(a.id, b.id).await.unwrap();

        session
            .remove_table(a.id, MutationOptions::default())
            .await
            .unwrap();

        assert!(session.relationships().is_empty());
        assert!(session.dependencies().is_empty());
        let stored = storage.get_diagram(session.diagram_id().unwrap()).await.unwrap();
        assert_eq!(stored.tables.len(), 1);
        assert!(stored.relationships.is_empty());

        assert!(session.undo().await.unwrap());
        assert_eq!(session.tables().len(), 2);
        assert_eq!(session.relationships().len(), 1);
        assert_eq!(session.dependencies().len(), 1);
    }

    #[tokio::test]
    async fn test_create_relationship_names() {
        let (mut session, _) = session().await;
        let users = session
            .create_table(TablePatch {
                name: Some("users".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let orders = session.create_table(TablePatch::default()).await.unwrap();

        let rel = session
            .create_relationship((users.id, users.fields[0].id), (orders.id, orders.fields[0].id))
            .await
            .unwrap();
        assert_eq!(rel.name, "users_id_fk");

        let missing = session
            .create_relationship((Uuid::new_v4(), Uuid::new_v4()), (orders.id, orders.fields[0].id))
            .await;
        assert!(matches!(missing, Err(SessionError::TableNotFound(_))));
    }

    #[tokio::test]
    async fn test_field_undo_restores_position() {
        let (mut session, _) = session().await;
        let table = session.create_table(TablePatch::default()).await.unwrap();
        let email = Field::new("email", int());
        let name = Field::new("name", int());
        session
            .add_field(table.id, email.clone(), MutationOptions::default())
            .await
            .unwrap();
        session
            .add_field(table.id, name.clone(), MutationOptions::default())
            .await
            .unwrap();

        session
            .remove_field(table.id, email.id, MutationOptions::default())
            .await
            .unwrap();
        assert_eq!(session.get_table(table.id).unwrap().fields.len(), 2);

        session.undo().await.unwrap();
        let names: Vec<&str> = session
            .get_table(table.id)
            .unwrap()
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "email", "name"]);
    }

    #[tokio::test]
    async fn test_update_field_undo_redo() {
        let (mut session, _) = session().await;
        let table = session.create_table(TablePatch::default()).await.unwrap();
        let field_id = table.fields[0].id;

        session
            .update_field(
                table.id,
                field_id,
                FieldPatch {
                    name: Some("key".to_string()),
                    ..Default::default()
                },
                MutationOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(session.get_field(table.id, field_id).unwrap().name, "key");

        session.undo().await.unwrap();
        assert_eq!(session.get_field(table.id, field_id).unwrap().name, "id");
        session.redo().await.unwrap();
        assert_eq!(session.get_field(table.id, field_id).unwrap().name, "key");
    }

    #[tokio::test]
    async fn test_index_operations() {
        let (mut session, _) = session().await;
        let table = session.create_table(TablePatch::default()).await.unwrap();
        let index = session.create_index(table.id).await.unwrap();
        assert_eq!(index.name, "index_1");

        session
            .update_index(
                table.id,
                index.id,
                IndexPatch {
                    unique: Some(true),
                    field_ids: Some(vec![table.fields[0].id]),
                    ..Default::default()
                },
                MutationOptions::default(),
            )
            .await
            .unwrap();
        assert!(session.get_index(table.id, index.id).unwrap().unique);

        session
            .remove_index(table.id, index.id, MutationOptions::default())
            .await
            .unwrap();
        assert!(session.get_index(table.id, index.id).is_none());

        session.undo().await.unwrap();
        assert!(session.get_index(table.id, index.id).unwrap().unique);
    }

    #[tokio::test]
    async fn test_skip_history() {
        let (mut session, _) = session().await;
        session
            .add_table(Table::new("quiet"), MutationOptions::SKIP_HISTORY)
            .await
            .unwrap();
        assert!(!session.can_undo());
        assert!(!session.undo().await.unwrap());
        assert!(!session.redo().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_diagram_name_is_undoable() {
        let (mut session, storage) = session().await;
        session
            .update_diagram_name("shop", MutationOptions::default())
            .await
            .unwrap();
        session.undo().await.unwrap();

        assert_eq!(session.diagram().unwrap().name, "test");
        let stored = storage.get_diagram(session.diagram_id().unwrap()).await.unwrap();
        assert_eq!(stored.name, "test");
    }

    #[tokio::test]
    async fn test_update_tables_state_removes_missing_tables() {
        let (mut session, _) = session().await;
        let a = session.create_table(TablePatch::default()).await.unwrap();
        let b = session.create_table(TablePatch::default()).await.unwrap();
        session
            .create_relationship((a.id, a.fields[0].id), (b.id, b.fields[0].id))
            .await
            .unwrap();

        let mut moved = a.clone();
        moved.x = 42.0;
        session
            .update_tables_state(vec![moved], TablesStateMode::Merge, MutationOptions::default())
            .await
            .unwrap();

        assert_eq!(session.tables().len(), 1);
        assert_eq!(session.tables()[0].x, 42.0);
        assert!(session.relationships().is_empty());

        session.undo().await.unwrap();
        assert_eq!(session.tables().len(), 2);
        assert_eq!(session.get_table(a.id).unwrap().x, 0.0);
        assert_eq!(session.relationships().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_diagram_resets_history() {
        let (mut session, storage) = session().await;
        session.create_table(TablePatch::default()).await.unwrap();
        session.clear_diagram_data().await.unwrap();

        assert!(session.tables().is_empty());
        assert!(!session.can_undo());
        let stored = storage.get_diagram(session.diagram_id().unwrap()).await.unwrap();
        assert!(stored.tables.is_empty());
    }

    #[tokio::test]
    async fn test_delete_diagram() {
        let (mut session, storage) = session().await;
        let id = session.diagram_id().unwrap();
        session.delete_diagram().await.unwrap();

        assert!(session.diagram().is_none());
        assert!(storage.get_diagram(id).await.is_err());
        assert!(session.list_diagrams().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schemas_default_first() {
        let (mut session, _) = session().await;
        for (name, schema) in [("a", "sales"), ("b", "public"), ("c", "sales"), ("d", "audit")] {
            session
                .add_table(Table::new(name).with_schema(schema), MutationOptions::default())
                .await
                .unwrap();
        }

        let names: Vec<String> = session.schemas().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["public", "audit", "sales"]);
        assert_eq!(session.schemas()[2].table_count, 2);

        assert_eq!(session.filtered_schemas(), Some(vec!["public".to_string()]));
        assert_eq!(session.visible_tables().len(), 1);

        session.filter_schemas(vec!["sales".to_string()]);
        assert_eq!(session.visible_tables().len(), 2);
    }

    #[tokio::test]
    async fn test_no_schemas_for_mysql() {
        let storage = Arc::new(MemoryStorage::new());
        let mut session = DiagramSession::new(storage);
        session
            .create_diagram("m", Some(DatabaseType::MySql))
            .await
            .unwrap();
        session
            .add_table(Table::new("a").with_schema("x"), MutationOptions::default())
            .await
            .unwrap();

        assert!(session.schemas().is_empty());
        assert!(session.filtered_schemas().is_none());
        assert_eq!(session.visible_tables().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_keeps_memory_change() {
        let (mut session, storage) = session().await;
        storage.set_fail_writes(true);

        let result = session
            .add_table(Table::new("t"), MutationOptions::default())
            .await;

        assert!(matches!(
            result,
            Err(SessionError::Storage(StorageError::Unavailable { .. }))
        ));
        assert_eq!(session.tables().len(), 1);
        assert!(session.can_undo());
    }

    #[tokio::test]
    async fn test_events_published() {
        let (mut session, _) = session().await;
        let mut rx = session.subscribe();
        let table = session.create_table(TablePatch::default()).await.unwrap();
        session
            .remove_field(table.id, table.fields[0].id, MutationOptions::default())
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            DiagramEvent::TablesAdded {
                table_ids: vec![table.id]
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            DiagramEvent::FieldRemoved {
                table_id: table.id,
                field_id: table.fields[0].id
            }
        );
    }

    #[tokio::test]
    async fn test_text_edit_is_single_undo_step() {
        let (mut session, _) = session().await;
        let text = "Table a {\n\tid integer [primary key]\n}\n\nTable b {\n\tid integer [primary key]\n\ta_id integer\n}\n\nRel b_a_id_fk: 1 a.id, N b.a_id";
        let mut rx = session.subscribe();

        let plan = session.apply_schema_text(text).await.unwrap();
        assert_eq!(plan.created_tables.len(), 2);
        assert_eq!(session.tables().len(), 2);
        assert_eq!(session.relationships().len(), 1);
        assert_eq!(session.history().undo_len(), 1);

        // New tables get distinct positions and a focus request
        let a = &session.tables()[0];
        let b = &session.tables()[1];
        assert_ne!((a.x, a.y), (b.x, b.y));
        let mut focused = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let DiagramEvent::FocusTable { table_id } = event {
                focused.push(table_id);
            }
        }
        assert_eq!(focused.len(), 2);

        session.undo().await.unwrap();
        assert!(session.tables().is_empty());
        assert!(session.relationships().is_empty());

        session.redo().await.unwrap();
        assert_eq!(session.tables().len(), 2);
        assert_eq!(session.relationships().len(), 1);
        assert_ne!(session.tables()[0].x, 0.0);
    }

    #[tokio::test]
    async fn test_load_diagram() {
        let storage = Arc::new(MemoryStorage::new());
        let mut first = DiagramSession::new(storage.clone());
        let diagram = first.create_diagram("shared", None).await.unwrap();
        first.create_table(TablePatch::default()).await.unwrap();

        let mut second = DiagramSession::new(storage);
        let loaded = second.load_diagram(diagram.id).await.unwrap();
        assert_eq!(loaded.tables.len(), 1);
        assert_eq!(loaded.database_type, DatabaseType::Generic);
    }
}
