//! Schema text generation
//!
//! Layout of the produced text:
//!
//! ```text
//! Table orders {
//!     Note: 'Customer orders'
//!     id integer [primary key]
//!     code varchar(32) [unique, note: 'external code']
//!     Indexes {
//!         (code) [unique, name: 'orders_code']
//!     }
//! }
//!
//! Rel orders_customer_fk: N orders.customer_id, 1 customers.id
//! ```
//!
//! Blocks are separated by a blank line and the text never ends with a newline.

use crate::core::schema::{Field, Index, Relationship, Table};

const INDENT: &str = "\t";

/// Serialize tables and relationships into schema text
///
/// Tables and relationships are written in model order, so the output is stable
/// for an unchanged model. Relationships whose endpoints no longer resolve are
/// left out.
pub fn generate(tables: &[Table], relationships: &[Relationship]) -> String {
    let mut blocks: Vec<String> = tables.iter().map(generate_table).collect();

    let rel_lines: Vec<String> = relationships
        .iter()
        .filter_map(|rel| {
            let line = generate_relationship(rel, tables);
            if line.is_none() {
                tracing::debug!("Skipping dangling relationship '{}' in schema text", rel.name);
            }
            line
        })
        .collect();

    if !rel_lines.is_empty() {
        blocks.push(rel_lines.join("\n"));
    }

    blocks.join("\n\n")
}

/// Render one `Table <name> { ... }` block
pub fn generate_table(table: &Table) -> String {
    let mut out = format!("Table {} {{\n", table.name);

    if let Some(comment) = &table.comment {
        out.push_str(&format!("{INDENT}Note: {}\n", quote(comment)));
    }

    for field in &table.fields {
        out.push_str(INDENT);
        out.push_str(&generate_field(field));
        out.push('\n');
    }

    let indexes: Vec<String> = table
        .indexes
        .iter()
        .filter(|index| !index.is_primary_key)
        .filter_map(|index| generate_index(index, table))
        .collect();

    if !indexes.is_empty() {
        out.push_str(&format!("{INDENT}Indexes {{\n"));
        for line in indexes {
            out.push_str(&format!("{INDENT}{INDENT}{line}\n"));
        }
        out.push_str(&format!("{INDENT}}}\n"));
    }

    out.push('}');
    out
}

/// `<name> <type>[ modifiers]`; tags in the order unique, primary key, null, note
fn generate_field(field: &Field) -> String {
    let mut tags = Vec::new();

    // Primary keys are unique anyway, the tag would be redundant
    if field.unique && !field.primary_key {
        tags.push("unique".to_string());
    }
    if field.primary_key {
        tags.push("primary key".to_string());
    }
    if field.nullable {
        tags.push("null".to_string());
    }
    if let Some(comment) = &field.comment {
        tags.push(format!("note: {}", quote(comment)));
    }

    let mut line = format!("{} {}", field.name, field.data_type.name);
    if !tags.is_empty() {
        line.push_str(&format!(" [{}]", tags.join(", ")));
    }
    line
}

/// Index line with field names in index order; `None` if no field resolves
fn generate_index(index: &Index, table: &Table) -> Option<String> {
    let names: Vec<&str> = index
        .field_ids
        .iter()
        .filter_map(|id| table.field(*id).map(|f| f.name.as_str()))
        .collect();

    if names.is_empty() {
        return None;
    }

    let mut tags = Vec::new();
    if index.unique {
        tags.push("unique".to_string());
    }
    tags.push(format!("name: {}", quote(&index.name)));

    Some(format!("({}) [{}]", names.join(", "), tags.join(", ")))
}

/// `Rel <name>: <card> <table>.<field>, <card> <table>.<field>`
pub fn generate_relationship(relationship: &Relationship, tables: &[Table]) -> Option<String> {
    let endpoint = |table_id, field_id| {
        let table = tables.iter().find(|t| t.id == table_id)?;
        let field = table.field(field_id)?;
        Some(format!("{}.{}", table.name, field.name))
    };

    let source = endpoint(relationship.source.table_id, relationship.source.field_id)?;
    let target = endpoint(relationship.target.table_id, relationship.target.field_id)?;

    Some(format!(
        "Rel {}: {} {}, {} {}",
        relationship.name,
        relationship.source_cardinality,
        source,
        relationship.target_cardinality,
        target
    ))
}

/// Single-quote a note or name; `\\`, `'` and line breaks are backslash-escaped
fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}
