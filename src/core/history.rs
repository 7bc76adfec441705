//! Undo/redo command log
//!
//! Two stacks of [`Command`]s. Recording a command clears the redo stack.
//! A group collects several actions into a single [`Action::Batch`] so one
//! text edit is undone in one step.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::core::schema::{Dependency, Field, Index, Relationship, Table};

/// A reversible mutation; each variant carries enough data to redo and undo it
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    UpdateDiagramName {
        before: String,
        after: String,
    },
    AddTables {
        tables: Vec<Table>,
    },
    /// Undo restores the tables together with what was cascaded away.
    /// Removed entities are paired with their index before the removal.
    RemoveTables {
        tables: Vec<(usize, Table)>,
        relationships: Vec<(usize, Relationship)>,
        dependencies: Vec<(usize, Dependency)>,
    },
    UpdateTable {
        before: Table,
        after: Table,
    },
    UpdateTablesState {
        before: Vec<Table>,
        after: Vec<Table>,
        relationships: Vec<(usize, Relationship)>,
        dependencies: Vec<(usize, Dependency)>,
    },
    AddField {
        table_id: Uuid,
        field: Field,
    },
    RemoveField {
        table_id: Uuid,
        field: Field,
        position: usize,
    },
    UpdateField {
        table_id: Uuid,
        before: Field,
        after: Field,
    },
    AddIndex {
        table_id: Uuid,
        index: Index,
    },
    RemoveIndex {
        table_id: Uuid,
        index: Index,
        position: usize,
    },
    UpdateIndex {
        table_id: Uuid,
        before: Index,
        after: Index,
    },
    AddRelationships {
        relationships: Vec<Relationship>,
    },
    RemoveRelationships {
        relationships: Vec<(usize, Relationship)>,
    },
    UpdateRelationship {
        before: Relationship,
        after: Relationship,
    },
    AddDependencies {
        dependencies: Vec<Dependency>,
    },
    RemoveDependencies {
        dependencies: Vec<(usize, Dependency)>,
    },
    UpdateDependency {
        before: Dependency,
        after: Dependency,
    },
    /// Applied in order on redo, in reverse order on undo
    Batch {
        actions: Vec<Action>,
    },
}

impl Action {
    pub fn tag(&self) -> &'static str {
        match self {
            Action::UpdateDiagramName { .. } => "updateDiagramName",
            Action::AddTables { .. } => "addTables",
            Action::RemoveTables { .. } => "removeTables",
            Action::UpdateTable { .. } => "updateTable",
            Action::UpdateTablesState { .. } => "updateTablesState",
            Action::AddField { .. } => "addField",
            Action::RemoveField { .. } => "removeField",
            Action::UpdateField { .. } => "updateField",
            Action::AddIndex { .. } => "addIndex",
            Action::RemoveIndex { .. } => "removeIndex",
            Action::UpdateIndex { .. } => "updateIndex",
            Action::AddRelationships { .. } => "addRelationships",
            Action::RemoveRelationships { .. } => "removeRelationships",
            Action::UpdateRelationship { .. } => "updateRelationship",
            Action::AddDependencies { .. } => "addDependencies",
            Action::RemoveDependencies { .. } => "removeDependencies",
            Action::UpdateDependency { .. } => "updateDependency",
            Action::Batch { .. } => "batch",
        }
    }

    /// Leaf actions, nested batches flattened
    pub fn steps(&self) -> Vec<&Action> {
        match self {
            Action::Batch { actions } => actions.iter().flat_map(Action::steps).collect(),
            other => vec![other],
        }
    }
}

/// One undoable entry: the action plus the diagram `updated_at` on each side of it
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    pub action: Action,
    /// Restored on undo
    pub undo_updated_at: DateTime<Utc>,
    /// Restored on redo
    pub redo_updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Group {
    actions: Vec<Action>,
    first_updated_at: Option<DateTime<Utc>>,
    last_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct HistoryLog {
    undo: Vec<Command>,
    redo: Vec<Command>,
    group: Option<Group>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new mutation and drop the redo branch
    pub fn record(&mut self, action: Action, before: DateTime<Utc>, after: DateTime<Utc>) {
        if let Some(group) = &mut self.group {
            group.actions.push(action);
            group.first_updated_at.get_or_insert(before);
            group.last_updated_at = Some(after);
            return;
        }

        tracing::trace!("Recording {}", action.tag());
        self.undo.push(Command {
            action,
            undo_updated_at: before,
            redo_updated_at: after,
        });
        self.redo.clear();
    }

    /// Start collecting recorded actions into one batch entry
    pub fn begin_group(&mut self) {
        if self.group.is_none() {
            self.group = Some(Group {
                actions: Vec::new(),
                first_updated_at: None,
                last_updated_at: None,
            });
        }
    }

    /// Close the open group; an empty group records nothing
    pub fn end_group(&mut self) {
        let Some(group) = self.group.take() else {
            return;
        };
        let (Some(before), Some(after)) = (group.first_updated_at, group.last_updated_at) else {
            return;
        };

        let action = match group.actions.len() {
            1 => group.actions.into_iter().next(),
            _ => Some(Action::Batch {
                actions: group.actions,
            }),
        };
        if let Some(action) = action {
            self.record(action, before, after);
        }
    }

    pub fn pop_undo(&mut self) -> Option<Command> {
        self.undo.pop()
    }

    pub fn pop_redo(&mut self) -> Option<Command> {
        self.redo.pop()
    }

    /// Move an undone command onto the redo stack
    pub fn push_redo(&mut self, command: Command) {
        self.redo.push(command);
    }

    /// Move a redone command back onto the undo stack, keeping the redo branch
    pub fn push_undo(&mut self, command: Command) {
        self.undo.push(command);
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.group = None;
    }
}
