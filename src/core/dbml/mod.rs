//! DBML-like schema text support
//!
//! Provides:
//! - Generation of schema text from the diagram model
//! - Structural parsing of schema text into transient `Parsed*` records
//! - The language definition handed to the text editor widget
//!
//! Parsing is deliberately forgiving: a block or line that does not match its
//! pattern is skipped, so half-typed text never fails the whole document.

mod generator;
mod language;
mod parser;

pub use generator::*;
pub use language::*;
pub use parser::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::data_types::DataType;
use crate::core::schema::Cardinality;

/// Table block read from schema text
///
/// `existing_id` is filled in by the reconciler when a rename is detected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedTable {
    pub name: String,
    pub comment: Option<String>,
    pub fields: Vec<ParsedField>,
    pub indexes: Vec<ParsedIndex>,
    pub content_hash: i32,
    pub existing_id: Option<Uuid>,
}

impl ParsedTable {
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedField {
    pub name: String,
    pub data_type: DataType,
    pub primary_key: bool,
    pub unique: bool,
    pub nullable: bool,
    pub comment: Option<String>,
}

/// Index line; fields are referenced by name until reconciliation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedIndex {
    pub name: String,
    pub unique: bool,
    pub fields: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParsedRelationship {
    pub name: String,
    pub source_table: String,
    pub source_field: String,
    pub target_table: String,
    pub target_field: String,
    pub source_cardinality: Cardinality,
    pub target_cardinality: Cardinality,
    pub content_hash: i32,
    pub existing_id: Option<Uuid>,
}

/// Everything one parse pass found in the text
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedSchema {
    pub tables: Vec<ParsedTable>,
    pub relationships: Vec<ParsedRelationship>,
}
