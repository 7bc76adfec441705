//! Content hashing for rename detection
//!
//! A 32-bit polynomial rolling hash (`h = h * 31 + c`, wrapping) over the
//! UTF-16 code units of the identity-relevant names of an entity. The hash is a
//! cheap pre-filter for rename candidates, not a unique key: collisions are
//! expected and are resolved by name edit distance in the reconciler.

use uuid::Uuid;

use crate::core::schema::{Relationship, Table};

/// Separator placed between the hashed parts
pub const PART_DELIMITER: &str = ":";

/// Rolling hash of a single string
pub fn string_hash(value: &str) -> i32 {
    roll(0, value)
}

/// Continue `hash` over the code units of `value`
fn roll(hash: i32, value: &str) -> i32 {
    value.encode_utf16().fold(hash, |hash, unit| {
        hash.wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit))
    })
}

/// Hash an ordered sequence of strings joined by [`PART_DELIMITER`]
pub fn hash_parts<I, S>(parts: I) -> i32
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts
        .into_iter()
        .enumerate()
        .fold(0, |hash, (i, part)| {
            let hash = if i == 0 { hash } else { roll(hash, PART_DELIMITER) };
            roll(hash, part.as_ref())
        })
}

/// Table hash: its field names, sorted so that field order does not matter
pub fn table_content_hash<'a, I>(field_names: I) -> i32
where
    I: IntoIterator<Item = &'a str>,
{
    let mut names: Vec<&str> = field_names.into_iter().collect();
    names.sort_unstable();
    hash_parts(names)
}

/// Relationship hash: both endpoints, in order
pub fn relationship_content_hash(
    source_table: &str,
    source_field: &str,
    target_table: &str,
    target_field: &str,
) -> i32 {
    hash_parts([source_table, source_field, target_table, target_field])
}

pub fn hash_table(table: &Table) -> i32 {
    table_content_hash(table.fields.iter().map(|f| f.name.as_str()))
}

/// Hash a live relationship by resolving its endpoint names
///
/// Returns `None` when an endpoint no longer resolves to a table and field.
pub fn hash_relationship(relationship: &Relationship, tables: &[Table]) -> Option<i32> {
    let names = |table_id: Uuid, field_id: Uuid| {
        let table = tables.iter().find(|t| t.id == table_id)?;
        let field = table.field(field_id)?;
        Some((table.name.as_str(), field.name.as_str()))
    };

    let (source_table, source_field) =
        names(relationship.source.table_id, relationship.source.field_id)?;
    let (target_table, target_field) =
        names(relationship.target.table_id, relationship.target.field_id)?;

    Some(relationship_content_hash(
        source_table,
        source_field,
        target_table,
        target_field,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::data_types::DataType;
    use crate::core::schema::{Endpoint, Field};

    #[test]
    fn test_string_hash_known_values() {
        assert_eq!(string_hash(""), 0);
        assert_eq!(string_hash("a"), 97);
        assert_eq!(string_hash("hello"), 99162322);
    }

    #[test]
    fn test_parts_hash_like_the_joined_string() {
        assert_eq!(hash_parts(["a", "b"]), string_hash("a:b"));
        assert_eq!(hash_parts(["users", "", "id"]), string_hash("users::id"));
        assert_eq!(hash_parts(["only"]), string_hash("only"));
        assert_eq!(hash_parts(Vec::<String>::new()), 0);
    }

    #[test]
    fn test_string_hash_wraps_to_i32() {
        assert_eq!(string_hash("polygenelubricants"), i32::MIN);
    }

    #[test]
    fn test_table_hash_ignores_field_order() {
        assert_eq!(
            table_content_hash(["id", "email", "name"]),
            table_content_hash(["name", "id", "email"])
        );
    }

    #[test]
    fn test_table_hash_changes_with_field_set() {
        assert_ne!(
            table_content_hash(["id", "email"]),
            table_content_hash(["id", "email", "name"])
        );
    }

    #[test]
    fn test_relationship_hash_is_order_sensitive() {
        assert_ne!(
            relationship_content_hash("a", "id", "b", "a_id"),
            relationship_content_hash("b", "a_id", "a", "id")
        );
    }

    #[test]
    fn test_hash_live_entities() {
        let int = DataType::new("integer", "integer");
        let a = Table::new("a").add_field(Field::new("id", int.clone()).primary_key());
        let b = Table::new("b")
            .add_field(Field::new("id", int.clone()).primary_key())
            .add_field(Field::new("a_id", int));

        assert_eq!(hash_table(&b), table_content_hash(["a_id", "id"]));

        let rel = Relationship::new(
            "b_a_id_fk",
            Endpoint::new(a.id, a.fields[0].id),
            Endpoint::new(b.id, b.fields[1].id),
        );
        let tables = vec![a, b];
        assert_eq!(
            hash_relationship(&rel, &tables),
            Some(relationship_content_hash("a", "id", "b", "a_id"))
        );
        assert_eq!(hash_relationship(&rel, &tables[..1]), None);
    }
}
