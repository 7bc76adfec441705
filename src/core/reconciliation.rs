//! Reconciliation of parsed schema text against the live diagram
//!
//! [`reconcile`] is pure: it looks at a parse result and a snapshot of the live
//! tables and relationships and returns a [`ReconciliationPlan`] listing the
//! mutations that make the model converge on the text. The session applies the
//! plan.
//!
//! Identity resolution order for each parsed entity:
//! 1. an id tagged during rename rescue
//! 2. an exact name match
//! 3. otherwise it is new
//!
//! Rename rescue only runs when the parsed and live counts are equal. Any other
//! count means a bulk add or remove, where guessing renames is unreliable.

use tracing::debug;
use uuid::Uuid;

use crate::core::content_hash::{hash_relationship, hash_table};
use crate::core::dbml::{ParsedIndex, ParsedRelationship, ParsedSchema, ParsedTable};
use crate::core::schema::{
    Endpoint, Field, Index, Relationship, RelationshipPatch, Table, TablePatch,
};

/// Mutations needed to bring the model in line with parsed text
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconciliationPlan {
    /// Deleting a table cascades to its relationships and dependencies
    pub deleted_tables: Vec<Uuid>,
    pub updated_tables: Vec<(Uuid, TablePatch)>,
    /// New tables still need a position from the layout engine
    pub created_tables: Vec<Table>,
    pub deleted_relationships: Vec<Uuid>,
    pub updated_relationships: Vec<(Uuid, RelationshipPatch)>,
    pub created_relationships: Vec<Relationship>,
}

impl ReconciliationPlan {
    pub fn is_empty(&self) -> bool {
        self.mutation_count() == 0
    }

    pub fn mutation_count(&self) -> usize {
        self.deleted_tables.len()
            + self.updated_tables.len()
            + self.created_tables.len()
            + self.deleted_relationships.len()
            + self.updated_relationships.len()
            + self.created_relationships.len()
    }
}

/// Diff a parse result against the live model
pub fn reconcile(
    parsed: ParsedSchema,
    tables: &[Table],
    relationships: &[Relationship],
) -> ReconciliationPlan {
    let ParsedSchema {
        tables: mut parsed_tables,
        relationships: mut parsed_relationships,
    } = parsed;

    let mut plan = ReconciliationPlan::default();
    let final_tables = reconcile_tables(&mut parsed_tables, tables, &mut plan);
    reconcile_relationships(
        &mut parsed_relationships,
        tables,
        &final_tables,
        relationships,
        &mut plan,
    );

    debug!(
        "Reconciled {} parsed tables and {} parsed relationships into {} mutations",
        parsed_tables.len(),
        parsed_relationships.len(),
        plan.mutation_count()
    );
    plan
}

/// Table pass; returns the table set as it will look once the plan is applied
fn reconcile_tables(
    parsed: &mut [ParsedTable],
    live: &[Table],
    plan: &mut ReconciliationPlan,
) -> Vec<Table> {
    let counts_match = parsed.len() == live.len();

    for table in live {
        if parsed.iter().any(|p| p.name == table.name) {
            continue;
        }

        let rescued = if counts_match {
            let hash = hash_table(table);
            closest_by_name(
                &table.name,
                parsed
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| {
                        p.existing_id.is_none()
                            && p.content_hash == hash
                            && !live.iter().any(|t| t.name == p.name)
                    })
                    .map(|(idx, p)| (idx, p.name.as_str())),
            )
        } else {
            None
        };

        match rescued {
            Some(idx) => {
                debug!("Table '{}' renamed to '{}'", table.name, parsed[idx].name);
                parsed[idx].existing_id = Some(table.id);
            }
            None => {
                debug!("Table '{}' removed from text", table.name);
                plan.deleted_tables.push(table.id);
            }
        }
    }

    let mut projected: Vec<Table> = live
        .iter()
        .filter(|t| !plan.deleted_tables.contains(&t.id))
        .cloned()
        .collect();

    for parsed_table in parsed.iter() {
        let existing = match parsed_table.existing_id {
            Some(id) => live.iter().find(|t| t.id == id),
            None => live.iter().find(|t| t.name == parsed_table.name),
        };

        match existing {
            Some(current) => {
                let patch = table_patch(parsed_table, current);
                let mut updated = current.clone();
                updated.apply(&patch);
                if updated == *current {
                    continue;
                }

                if let Some(slot) = projected.iter_mut().find(|t| t.id == current.id) {
                    *slot = updated;
                }
                plan.updated_tables.push((current.id, patch));
            }
            None => {
                debug!("Table '{}' added in text", parsed_table.name);
                let table = new_table(parsed_table);
                projected.push(table.clone());
                plan.created_tables.push(table);
            }
        }
    }

    projected
}

/// Replace name, fields and comment; every other attribute is kept
fn table_patch(parsed: &ParsedTable, current: &Table) -> TablePatch {
    let fields = build_fields(parsed, Some(current));
    let indexes = if parsed.indexes.is_empty() {
        prune_indexes(&current.indexes, &fields)
    } else {
        build_indexes(&parsed.indexes, &current.indexes, &fields)
    };

    TablePatch {
        name: Some(parsed.name.clone()),
        fields: Some(fields),
        indexes: Some(indexes),
        comment: Some(parsed.comment.clone()),
        ..Default::default()
    }
}

fn new_table(parsed: &ParsedTable) -> Table {
    let mut table = Table::new(parsed.name.clone());
    table.fields = build_fields(parsed, None);
    table.indexes = build_indexes(&parsed.indexes, &[], &table.fields);
    table.comment = parsed.comment.clone();
    table
}

/// Parsed fields, reusing the id of a same-named field of `current`
fn build_fields(parsed: &ParsedTable, current: Option<&Table>) -> Vec<Field> {
    parsed
        .fields
        .iter()
        .map(|pf| {
            let mut field = Field::new(pf.name.clone(), pf.data_type.clone());
            if let Some(existing) = current.and_then(|t| t.field_by_name(&pf.name)) {
                field.id = existing.id;
                field.created_at = existing.created_at;
            }
            field.primary_key = pf.primary_key;
            field.unique = pf.unique || pf.primary_key;
            field.nullable = pf.nullable;
            field.comment = pf.comment.clone();
            field
        })
        .collect()
}

/// Resolve parsed indexes by field name
///
/// Primary-key indexes are kept. An index with any unresolvable field is
/// dropped. Same-named existing indexes keep their id.
fn build_indexes(parsed: &[ParsedIndex], current: &[Index], fields: &[Field]) -> Vec<Index> {
    let keys: Vec<Index> = current.iter().filter(|i| i.is_primary_key).cloned().collect();
    let mut indexes = prune_indexes(&keys, fields);

    for parsed_index in parsed {
        let field_ids: Option<Vec<Uuid>> = parsed_index
            .fields
            .iter()
            .map(|name| fields.iter().find(|f| &f.name == name).map(|f| f.id))
            .collect();

        let Some(field_ids) = field_ids else {
            debug!("Dropping index '{}': unknown field", parsed_index.name);
            continue;
        };

        let mut index = Index::new(parsed_index.name.clone(), field_ids);
        index.unique = parsed_index.unique;
        if let Some(existing) = current
            .iter()
            .find(|i| !i.is_primary_key && i.name == parsed_index.name)
        {
            index.id = existing.id;
            index.created_at = existing.created_at;
        }
        indexes.push(index);
    }

    indexes
}

/// Drop field ids that no longer exist, and indexes left without any
fn prune_indexes(indexes: &[Index], fields: &[Field]) -> Vec<Index> {
    indexes
        .iter()
        .filter_map(|index| {
            let field_ids: Vec<Uuid> = index
                .field_ids
                .iter()
                .copied()
                .filter(|id| fields.iter().any(|f| f.id == *id))
                .collect();
            if field_ids.is_empty() {
                return None;
            }
            Some(Index {
                field_ids,
                ..index.clone()
            })
        })
        .collect()
}

fn reconcile_relationships(
    parsed: &mut [ParsedRelationship],
    live_tables: &[Table],
    final_tables: &[Table],
    live: &[Relationship],
    plan: &mut ReconciliationPlan,
) {
    // Relationships of deleted tables go away with the table
    let surviving: Vec<&Relationship> = live
        .iter()
        .filter(|r| !r.touches_any(&plan.deleted_tables))
        .collect();
    let counts_match = parsed.len() == surviving.len();

    for relationship in &surviving {
        if parsed.iter().any(|p| p.name == relationship.name) {
            continue;
        }

        let rescued = if counts_match {
            hash_relationship(relationship, live_tables).and_then(|hash| {
                closest_by_name(
                    &relationship.name,
                    parsed
                        .iter()
                        .enumerate()
                        .filter(|(_, p)| {
                            p.existing_id.is_none()
                                && p.content_hash == hash
                                && !surviving.iter().any(|r| r.name == p.name)
                        })
                        .map(|(idx, p)| (idx, p.name.as_str())),
                )
            })
        } else {
            None
        };

        match rescued {
            Some(idx) => {
                debug!(
                    "Relationship '{}' renamed to '{}'",
                    relationship.name, parsed[idx].name
                );
                parsed[idx].existing_id = Some(relationship.id);
            }
            None => {
                debug!("Relationship '{}' removed from text", relationship.name);
                plan.deleted_relationships.push(relationship.id);
            }
        }
    }

    for parsed_rel in parsed.iter() {
        let Some((source, target)) = resolve_endpoints(parsed_rel, final_tables) else {
            debug!(
                "Skipping relationship '{}': endpoint does not resolve",
                parsed_rel.name
            );
            continue;
        };

        let existing = match parsed_rel.existing_id {
            Some(id) => surviving.iter().copied().find(|r| r.id == id),
            None => surviving.iter().copied().find(|r| r.name == parsed_rel.name),
        };

        match existing {
            Some(current) => {
                let patch = RelationshipPatch {
                    name: Some(parsed_rel.name.clone()),
                    source: Some(source),
                    target: Some(target),
                    source_cardinality: Some(parsed_rel.source_cardinality),
                    target_cardinality: Some(parsed_rel.target_cardinality),
                };
                let mut updated = current.clone();
                updated.apply(&patch);
                if updated != *current {
                    plan.updated_relationships.push((current.id, patch));
                }
            }
            None => {
                plan.created_relationships.push(
                    Relationship::new(parsed_rel.name.clone(), source, target).with_cardinality(
                        parsed_rel.source_cardinality,
                        parsed_rel.target_cardinality,
                    ),
                );
            }
        }
    }
}

/// Look up both ends of a parsed relationship by table and field name
fn resolve_endpoints(
    parsed: &ParsedRelationship,
    tables: &[Table],
) -> Option<(Endpoint, Endpoint)> {
    let endpoint = |table_name: &str, field_name: &str| {
        let table = tables.iter().find(|t| t.name == table_name)?;
        let field = table.field_by_name(field_name)?;
        Some(Endpoint {
            table_id: table.id,
            field_id: field.id,
            schema: table.schema.clone(),
        })
    };

    Some((
        endpoint(&parsed.source_table, &parsed.source_field)?,
        endpoint(&parsed.target_table, &parsed.target_field)?,
    ))
}

/// Candidate with the smallest edit distance to `name`; ties keep the first
fn closest_by_name<'a>(
    name: &str,
    candidates: impl IntoIterator<Item = (usize, &'a str)>,
) -> Option<usize> {
    let mut best: Option<(usize, usize)> = None;
    for (idx, candidate) in candidates {
        let distance = strsim::levenshtein(name, candidate);
        if best.is_none_or(|(_, min)| distance < min) {
            best = Some((idx, distance));
        }
    }
    best.map(|(idx, _)| idx)
}
