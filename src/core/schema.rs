//! Diagram domain model
//!
//! Entities live in flat, id-keyed collections. Relationships and dependencies
//! refer to tables and fields by id only, so there is no ownership cycle between
//! a table and the relationships that point at it.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::data_types::{DataType, DatabaseType};

/// Generate a fresh opaque entity identifier
pub fn generate_id() -> Uuid {
    Uuid::new_v4()
}

/// Pick a random table color from the diagram palette
pub fn random_color() -> String {
    use rand::seq::SliceRandom;

    const PALETTE: &[&str] = &[
        "#8eb7ff", "#ff6363", "#ff6b8a", "#c05dcf", "#9b85ff", "#7175fa", "#42e0c0",
        "#4dee8a", "#ffe374", "#ffa93a", "#b067e9", "#ff9f74",
    ];

    PALETTE
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(PALETTE[0])
        .to_string()
}

/// A database table on the diagram
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    pub id: Uuid,
    pub name: String,
    pub schema: Option<String>,
    pub fields: Vec<Field>,
    pub indexes: Vec<Index>,
    pub color: String,
    /// Canvas position
    pub x: f64,
    pub y: f64,
    pub is_view: bool,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            schema: None,
            fields: Vec::new(),
            indexes: Vec::new(),
            color: random_color(),
            x: 0.0,
            y: 0.0,
            is_view: false,
            comment: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn add_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    pub fn add_index(mut self, index: Index) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn field(&self, id: Uuid) -> Option<&Field> {
        self.fields.iter().find(|f| f.id == id)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn index(&self, id: Uuid) -> Option<&Index> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// Apply a partial update, leaving unset attributes untouched
    pub fn apply(&mut self, patch: &TablePatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(schema) = &patch.schema {
            self.schema = schema.clone();
        }
        if let Some(fields) = &patch.fields {
            self.fields = fields.clone();
        }
        if let Some(indexes) = &patch.indexes {
            self.indexes = indexes.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        if let Some((x, y)) = patch.position {
            self.x = x;
            self.y = y;
        }
        if let Some(is_view) = patch.is_view {
            self.is_view = is_view;
        }
        if let Some(comment) = &patch.comment {
            self.comment = comment.clone();
        }
    }
}

/// Partial update of a [`Table`]
///
/// `None` means "keep the current value". Optional attributes use a nested
/// `Option` so they can be cleared explicitly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TablePatch {
    pub name: Option<String>,
    pub schema: Option<Option<String>>,
    pub fields: Option<Vec<Field>>,
    pub indexes: Option<Vec<Index>>,
    pub color: Option<String>,
    pub position: Option<(f64, f64)>,
    pub is_view: Option<bool>,
    pub comment: Option<Option<String>>,
}

impl TablePatch {
    pub fn position(x: f64, y: f64) -> Self {
        Self {
            position: Some((x, y)),
            ..Default::default()
        }
    }

    pub fn indexes(indexes: Vec<Index>) -> Self {
        Self {
            indexes: Some(indexes),
            ..Default::default()
        }
    }

    /// Patch that turns any table into a copy of `table`
    pub fn replace_with(table: &Table) -> Self {
        Self {
            name: Some(table.name.clone()),
            schema: Some(table.schema.clone()),
            fields: Some(table.fields.clone()),
            indexes: Some(table.indexes.clone()),
            color: Some(table.color.clone()),
            position: Some((table.x, table.y)),
            is_view: Some(table.is_view),
            comment: Some(table.comment.clone()),
        }
    }
}

/// A table column
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Field {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            data_type,
            nullable: false,
            unique: false,
            primary_key: false,
            comment: None,
            created_at: Utc::now(),
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self.nullable = false;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Partial update of a [`Field`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldPatch {
    pub name: Option<String>,
    pub data_type: Option<DataType>,
    pub nullable: Option<bool>,
    pub unique: Option<bool>,
    pub primary_key: Option<bool>,
    pub comment: Option<Option<String>>,
}

impl FieldPatch {
    pub fn replace_with(field: &Field) -> Self {
        Self {
            name: Some(field.name.clone()),
            data_type: Some(field.data_type.clone()),
            nullable: Some(field.nullable),
            unique: Some(field.unique),
            primary_key: Some(field.primary_key),
            comment: Some(field.comment.clone()),
        }
    }
}

impl Field {
    pub fn apply(&mut self, patch: &FieldPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(data_type) = &patch.data_type {
            self.data_type = data_type.clone();
        }
        if let Some(nullable) = patch.nullable {
            self.nullable = nullable;
        }
        if let Some(unique) = patch.unique {
            self.unique = unique;
        }
        if let Some(primary_key) = patch.primary_key {
            self.primary_key = primary_key;
        }
        if let Some(comment) = &patch.comment {
            self.comment = comment.clone();
        }
    }
}

/// A table index over an ordered set of the table's own fields
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub id: Uuid,
    pub name: String,
    pub unique: bool,
    pub field_ids: Vec<Uuid>,
    /// Implicit index backing the primary key; never written to schema text
    #[serde(default)]
    pub is_primary_key: bool,
    pub created_at: DateTime<Utc>,
}

impl Index {
    pub fn new(name: impl Into<String>, field_ids: Vec<Uuid>) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            unique: false,
            field_ids,
            is_primary_key: false,
            created_at: Utc::now(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Partial update of an [`Index`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IndexPatch {
    pub name: Option<String>,
    pub unique: Option<bool>,
    pub field_ids: Option<Vec<Uuid>>,
}

impl IndexPatch {
    pub fn replace_with(index: &Index) -> Self {
        Self {
            name: Some(index.name.clone()),
            unique: Some(index.unique),
            field_ids: Some(index.field_ids.clone()),
        }
    }
}

impl Index {
    pub fn apply(&mut self, patch: &IndexPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(unique) = patch.unique {
            self.unique = unique;
        }
        if let Some(field_ids) = &patch.field_ids {
            self.field_ids = field_ids.clone();
        }
    }
}

/// Multiplicity of one side of a relationship
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Display)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    #[display("1")]
    One,
    #[display("N")]
    Many,
}

impl Cardinality {
    /// Map a text cardinality token; anything but `1` means many
    pub fn from_token(token: &str) -> Self {
        if token == "1" {
            Cardinality::One
        } else {
            Cardinality::Many
        }
    }
}

/// One end of a relationship
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub table_id: Uuid,
    pub field_id: Uuid,
    pub schema: Option<String>,
}

impl Endpoint {
    pub fn new(table_id: Uuid, field_id: Uuid) -> Self {
        Self {
            table_id,
            field_id,
            schema: None,
        }
    }
}

/// Foreign-key style link between two table fields
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: Uuid,
    pub name: String,
    pub source: Endpoint,
    pub target: Endpoint,
    pub source_cardinality: Cardinality,
    pub target_cardinality: Cardinality,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(name: impl Into<String>, source: Endpoint, target: Endpoint) -> Self {
        Self {
            id: generate_id(),
            name: name.into(),
            source,
            target,
            source_cardinality: Cardinality::One,
            target_cardinality: Cardinality::One,
            created_at: Utc::now(),
        }
    }

    pub fn with_cardinality(mut self, source: Cardinality, target: Cardinality) -> Self {
        self.source_cardinality = source;
        self.target_cardinality = target;
        self
    }

    /// Whether either end points at one of `table_ids`
    pub fn touches_any(&self, table_ids: &[Uuid]) -> bool {
        table_ids.contains(&self.source.table_id) || table_ids.contains(&self.target.table_id)
    }
}

/// Partial update of a [`Relationship`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelationshipPatch {
    pub name: Option<String>,
    pub source: Option<Endpoint>,
    pub target: Option<Endpoint>,
    pub source_cardinality: Option<Cardinality>,
    pub target_cardinality: Option<Cardinality>,
}

impl RelationshipPatch {
    pub fn replace_with(relationship: &Relationship) -> Self {
        Self {
            name: Some(relationship.name.clone()),
            source: Some(relationship.source.clone()),
            target: Some(relationship.target.clone()),
            source_cardinality: Some(relationship.source_cardinality),
            target_cardinality: Some(relationship.target_cardinality),
        }
    }
}

impl Relationship {
    pub fn apply(&mut self, patch: &RelationshipPatch) {
        if let Some(name) = &patch.name {
            self.name = name.clone();
        }
        if let Some(source) = &patch.source {
            self.source = source.clone();
        }
        if let Some(target) = &patch.target {
            self.target = target.clone();
        }
        if let Some(cardinality) = patch.source_cardinality {
            self.source_cardinality = cardinality;
        }
        if let Some(cardinality) = patch.target_cardinality {
            self.target_cardinality = cardinality;
        }
    }
}

/// View-depends-on-table edge
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub id: Uuid,
    pub table_id: Uuid,
    pub dependent_table_id: Uuid,
    pub schema: Option<String>,
    pub dependent_schema: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Dependency {
    pub fn new(table_id: Uuid, dependent_table_id: Uuid) -> Self {
        Self {
            id: generate_id(),
            table_id,
            dependent_table_id,
            schema: None,
            dependent_schema: None,
            created_at: Utc::now(),
        }
    }

    pub fn touches_any(&self, table_ids: &[Uuid]) -> bool {
        table_ids.contains(&self.table_id) || table_ids.contains(&self.dependent_table_id)
    }
}

/// Partial update of a [`Dependency`]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DependencyPatch {
    pub table_id: Option<Uuid>,
    pub dependent_table_id: Option<Uuid>,
    pub schema: Option<Option<String>>,
    pub dependent_schema: Option<Option<String>>,
}

impl DependencyPatch {
    pub fn replace_with(dependency: &Dependency) -> Self {
        Self {
            table_id: Some(dependency.table_id),
            dependent_table_id: Some(dependency.dependent_table_id),
            schema: Some(dependency.schema.clone()),
            dependent_schema: Some(dependency.dependent_schema.clone()),
        }
    }
}

impl Dependency {
    pub fn apply(&mut self, patch: &DependencyPatch) {
        if let Some(table_id) = patch.table_id {
            self.table_id = table_id;
        }
        if let Some(dependent_table_id) = patch.dependent_table_id {
            self.dependent_table_id = dependent_table_id;
        }
        if let Some(schema) = &patch.schema {
            self.schema = schema.clone();
        }
        if let Some(schema) = &patch.dependent_schema {
            self.dependent_schema = schema.clone();
        }
    }
}

/// A whole diagram: metadata plus its entity collections
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Diagram {
    pub id: Uuid,
    pub name: String,
    pub database_type: DatabaseType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tables: Vec<Table>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl Diagram {
    pub fn new(name: impl Into<String>, database_type: DatabaseType) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            name: name.into(),
            database_type,
            created_at: now,
            updated_at: now,
            tables: Vec::new(),
            relationships: Vec::new(),
            dependencies: Vec::new(),
        }
    }
}

/// Lightweight diagram listing entry
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagramSummary {
    pub id: Uuid,
    pub name: String,
    pub database_type: DatabaseType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Diagram> for DiagramSummary {
    fn from(diagram: &Diagram) -> Self {
        Self {
            id: diagram.id,
            name: diagram.name.clone(),
            database_type: diagram.database_type,
            created_at: diagram.created_at,
            updated_at: diagram.updated_at,
        }
    }
}

/// A schema namespace present on the diagram
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub id: String,
    pub name: String,
    pub table_count: usize,
}

pub fn schema_name_to_id(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_patch_keeps_untouched_attributes() {
        let mut table = Table::new("users")
            .with_position(10.0, 20.0)
            .add_field(Field::new("id", DataType::new("integer", "integer")).primary_key());
        let color = table.color.clone();

        table.apply(&TablePatch {
            name: Some("people".to_string()),
            ..Default::default()
        });

        assert_eq!(table.name, "people");
        assert_eq!(table.color, color);
        assert_eq!((table.x, table.y), (10.0, 20.0));
        assert_eq!(table.fields.len(), 1);
    }

    #[test]
    fn test_table_patch_can_clear_comment() {
        let mut table = Table::new("users").with_comment("people");
        table.apply(&TablePatch {
            comment: Some(None),
            ..Default::default()
        });
        assert!(table.comment.is_none());
    }

    #[test]
    fn test_primary_key_builder_implies_unique_and_not_null() {
        let field = Field::new("id", DataType::new("bigint", "bigint"))
            .nullable()
            .primary_key();
        assert!(field.primary_key);
        assert!(field.unique);
        assert!(!field.nullable);
    }

    #[test]
    fn test_cardinality_tokens() {
        assert_eq!(Cardinality::from_token("1"), Cardinality::One);
        assert_eq!(Cardinality::from_token("N"), Cardinality::Many);
        assert_eq!(Cardinality::from_token("*"), Cardinality::Many);
        assert_eq!(Cardinality::One.to_string(), "1");
        assert_eq!(Cardinality::Many.to_string(), "N");
    }

    #[test]
    fn test_relationship_touches() {
        let a = generate_id();
        let b = generate_id();
        let rel = Relationship::new(
            "b_a_fk",
            Endpoint::new(a, generate_id()),
            Endpoint::new(b, generate_id()),
        );
        assert!(rel.touches_any(&[b]));
        assert!(!rel.touches_any(&[generate_id()]));
    }

    #[test]
    fn test_diagram_json_uses_camel_case() {
        let diagram = Diagram::new("shop", DatabaseType::PostgreSql);
        let json = serde_json::to_value(&diagram).unwrap();
        assert!(json.get("databaseType").is_some());
        assert!(json.get("updatedAt").is_some());
    }

    #[test]
    fn test_random_color_is_hex() {
        let color = random_color();
        assert!(color.starts_with('#'));
        assert_eq!(color.len(), 7);
    }
}
