//! Core domain: the schema model, the DBML compiler and the diagram session

pub mod config;
pub mod content_hash;
pub mod data_types;
pub mod dbml;
pub mod editor;
pub mod events;
pub mod history;
pub mod layout;
pub mod reconciliation;
mod schema;
pub mod session;
pub mod storage;

pub use config::Config;
pub use data_types::{DataType, DatabaseType};
pub use editor::SchemaEditor;
pub use events::{DiagramEvent, EventBus};
pub use history::{Action, Command, HistoryLog};
pub use layout::{GridLayout, LayoutConfig, LayoutEngine, TablePosition};
pub use reconciliation::{ReconciliationPlan, reconcile};
pub use schema::*;
pub use session::{DiagramSession, MutationOptions, SessionError, SessionResult, TablesStateMode};
pub use storage::{DiagramStorage, DiagramUpdate, MemoryStorage, StorageError, StorageResult};
