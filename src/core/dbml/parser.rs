//! Structural parser for schema text
//!
//! Works block by block:
//! 1. every `Table <name> { ... }` block, braces balanced and quoted text skipped
//! 2. field lines `<name> <type> [tags]` before an optional `Indexes {` sub-block;
//!    the type runs up to the tag list, so `double precision` and `decimal(10, 2)` work
//! 3. index lines `(f1, f2) [tags]` inside the sub-block
//! 4. single-line `Rel <name>: <c> <t>.<f>, <c> <t>.<f>` statements outside tables
//!
//! Quoted notes and names use backslash escapes (`\'`, `\\`, `\n`).
//! Nothing here resolves identities; that is the reconciler's job.

use lazy_static::lazy_static;
use regex::Regex;

use super::{ParsedField, ParsedIndex, ParsedRelationship, ParsedSchema, ParsedTable};
use crate::core::content_hash::{relationship_content_hash, table_content_hash};
use crate::core::data_types::{DatabaseType, resolve_type};
use crate::core::schema::Cardinality;

lazy_static! {
    static ref TABLE_HEAD_RE: Regex = Regex::new(r"\bTable\s+(\w+)\s*\{").unwrap();
    static ref FIELD_RE: Regex =
        Regex::new(r"(?m)^[ \t]*(\w+)[ \t]+(\w[^\[\r\n]*?)(?:[ \t]*\[(.*)\])?[ \t]*\r?$").unwrap();
    static ref TABLE_NOTE_RE: Regex = Regex::new(
        r#"(?mi)^[ \t]*note[ \t]*:[ \t]*(?:'((?:[^'\\\n]|\\.)*)'|"((?:[^"\\\n]|\\.)*)")"#
    )
    .unwrap();
    static ref INDEXES_HEAD_RE: Regex = Regex::new(r"\bIndexes\s*\{").unwrap();
    static ref INDEX_RE: Regex =
        Regex::new(r"(?m)^[ \t]*\(([^)]*)\)(?:[ \t]*\[(.*)\])?[ \t]*\r?$").unwrap();
    static ref REL_RE: Regex = Regex::new(
        r"\bRel[ \t]+(\w+)[ \t]*:[ \t]*([\w*]+)[ \t]+(\w+)\.(\w+)[ \t]*,[ \t]*([\w*]+)[ \t]+(\w+)\.(\w+)"
    )
    .unwrap();
    static ref NOTE_TAG_RE: Regex = Regex::new(
        r#"(?i)\bnote[ \t]*:[ \t]*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")"#
    )
    .unwrap();
    static ref NAME_TAG_RE: Regex = Regex::new(
        r#"(?i)\bname[ \t]*:[ \t]*(?:'((?:[^'\\]|\\.)*)'|"((?:[^"\\]|\\.)*)")"#
    )
    .unwrap();
}

/// Parse schema text into transient table and relationship records
///
/// Never fails: regions that do not match a pattern are ignored.
pub fn parse(text: &str, database_type: DatabaseType) -> ParsedSchema {
    let text = strip_comments(text);
    let blocks = table_blocks(&text);

    // Rel statements are only read outside table bodies
    let mut outside = String::with_capacity(text.len());
    let mut cursor = 0;
    for block in &blocks {
        outside.push_str(&text[cursor..block.start]);
        outside.push('\n');
        cursor = block.end;
    }
    outside.push_str(&text[cursor..]);

    let tables = blocks
        .iter()
        .map(|block| parse_table(block.name, block.body, database_type))
        .collect();

    let relationships = REL_RE
        .captures_iter(&outside)
        .map(|caps| {
            let source_table = caps[3].to_string();
            let source_field = caps[4].to_string();
            let target_table = caps[6].to_string();
            let target_field = caps[7].to_string();
            let content_hash = relationship_content_hash(
                &source_table,
                &source_field,
                &target_table,
                &target_field,
            );

            ParsedRelationship {
                name: caps[1].to_string(),
                source_cardinality: Cardinality::from_token(&caps[2]),
                target_cardinality: Cardinality::from_token(&caps[5]),
                source_table,
                source_field,
                target_table,
                target_field,
                content_hash,
                existing_id: None,
            }
        })
        .collect();

    ParsedSchema {
        tables,
        relationships,
    }
}

/// A complete `Table` block; `start..end` spans the whole block
struct TableBlock<'a> {
    name: &'a str,
    body: &'a str,
    start: usize,
    end: usize,
}

/// Complete table blocks in text order; a head whose braces never close is skipped
fn table_blocks(text: &str) -> Vec<TableBlock<'_>> {
    let mut blocks = Vec::new();
    let mut pos = 0;

    while let Some(caps) = TABLE_HEAD_RE.captures(&text[pos..]) {
        let (Some(head), Some(name)) = (caps.get(0), caps.get(1)) else {
            break;
        };
        let open = pos + head.end() - 1;

        match closing_brace(text, open) {
            Some(close) => {
                blocks.push(TableBlock {
                    name: name.as_str(),
                    body: &text[open + 1..close],
                    start: pos + head.start(),
                    end: close + 1,
                });
                pos = close + 1;
            }
            None => {
                tracing::debug!("Skipping unterminated table block '{}'", name.as_str());
                pos += head.end();
            }
        }
    }

    blocks
}

fn parse_table(name: &str, body: &str, database_type: DatabaseType) -> ParsedTable {
    // Fields only come before the Indexes sub-block
    let indexes_head = INDEXES_HEAD_RE
        .find_iter(body)
        .find(|m| !is_quoted(body, m.start()));
    let (fields_part, indexes_body) = match indexes_head {
        Some(head) => {
            let open = head.end() - 1;
            let close = closing_brace(body, open).unwrap_or(body.len());
            (&body[..head.start()], Some(&body[open + 1..close]))
        }
        None => (body, None),
    };

    let comment = TABLE_NOTE_RE.captures(fields_part).and_then(|caps| quoted(&caps));

    let fields: Vec<ParsedField> = FIELD_RE
        .captures_iter(fields_part)
        .map(|caps| {
            let tags = caps.get(3).map_or("", |m| m.as_str());
            parse_field(&caps[1], caps[2].trim(), tags, database_type)
        })
        .collect();

    let indexes = indexes_body.map(parse_indexes).unwrap_or_default();

    ParsedTable {
        name: name.to_string(),
        comment,
        content_hash: table_content_hash(fields.iter().map(|f| f.name.as_str())),
        fields,
        indexes,
        existing_id: None,
    }
}

fn parse_field(name: &str, type_name: &str, tags: &str, database_type: DatabaseType) -> ParsedField {
    let comment = NOTE_TAG_RE.captures(tags).and_then(|caps| quoted(&caps));
    let tags = NOTE_TAG_RE.replace_all(tags, "");

    let mut primary_key = false;
    let mut unique = false;
    let mut nullable = false;

    for tag in tags.split(',').map(|t| t.trim().to_lowercase()) {
        match tag.as_str() {
            "primary key" | "pk" => primary_key = true,
            "unique" => unique = true,
            "null" => nullable = true,
            "not null" => nullable = false,
            "" => {}
            other => tracing::debug!("Ignoring unknown field tag '{}' on '{}'", other, name),
        }
    }

    ParsedField {
        name: name.to_string(),
        data_type: resolve_type(database_type, type_name),
        primary_key,
        unique: unique || primary_key,
        nullable,
        comment,
    }
}

fn parse_indexes(body: &str) -> Vec<ParsedIndex> {
    INDEX_RE
        .captures_iter(body)
        .filter_map(|caps| {
            let fields: Vec<String> = caps[1]
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect();
            if fields.is_empty() {
                return None;
            }

            let tags = caps.get(2).map_or("", |m| m.as_str());
            let name = NAME_TAG_RE
                .captures(tags)
                .and_then(|c| quoted(&c))
                .unwrap_or_else(|| fields.join("_"));
            let rest = NAME_TAG_RE.replace_all(tags, "");
            let unique = rest
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("unique"));

            Some(ParsedIndex {
                name,
                unique,
                fields,
            })
        })
        .collect()
}

/// First quoted group (single or double quotes) of a tag capture, unescaped
fn quoted(caps: &regex::Captures<'_>) -> Option<String> {
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| unescape(m.as_str()))
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Tracks whether characters fed in order are inside a quoted string
///
/// Quotes never span lines; an unclosed quote ends at the line break.
#[derive(Default)]
struct QuoteScanner {
    quote: Option<char>,
    escaped: bool,
}

impl QuoteScanner {
    /// Feed one char; true if it is part of a quoted string, quotes included
    fn feed(&mut self, ch: char) -> bool {
        match self.quote {
            Some(_) if self.escaped => {
                self.escaped = false;
                true
            }
            Some(_) if ch == '\\' => {
                self.escaped = true;
                true
            }
            Some(q) if ch == q => {
                self.quote = None;
                true
            }
            Some(_) if ch == '\n' => {
                self.quote = None;
                false
            }
            Some(_) => true,
            None if ch == '\'' || ch == '"' => {
                self.quote = Some(ch);
                true
            }
            None => false,
        }
    }
}

/// Byte offset of the `}` closing the `{` at `open`
fn closing_brace(text: &str, open: usize) -> Option<usize> {
    let mut scanner = QuoteScanner::default();
    let mut depth = 0usize;

    for (idx, ch) in text[open..].char_indices() {
        if scanner.feed(ch) {
            continue;
        }
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn is_quoted(text: &str, pos: usize) -> bool {
    let mut scanner = QuoteScanner::default();
    text[..pos].chars().for_each(|ch| {
        scanner.feed(ch);
    });
    scanner.quote.is_some()
}

/// Drop `// ...` line comments that are not inside a quoted string
fn strip_comments(text: &str) -> String {
    text.lines()
        .map(|line| {
            let mut scanner = QuoteScanner::default();
            let mut slash = false;
            for (idx, ch) in line.char_indices() {
                let quoted = scanner.feed(ch);
                if !quoted && ch == '/' {
                    if slash {
                        return &line[..idx - 1];
                    }
                    slash = true;
                } else {
                    slash = false;
                }
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::content_hash::table_content_hash;
    use crate::core::data_types::DataType;

    #[test]
    fn test_parse_table_fields_and_tags() {
        let text = "Table users {\n\tid integer [primary key]\n\temail varchar(255) [unique, null]\n\tname text\n}";
        let parsed = parse(text, DatabaseType::Generic);

        assert_eq!(parsed.tables.len(), 1);
        let users = &parsed.tables[0];
        assert_eq!(users.name, "users");
        assert_eq!(users.fields.len(), 3);

        let id = &users.fields[0];
        assert!(id.primary_key);
        assert!(id.unique);
        assert!(!id.nullable);

        let email = &users.fields[1];
        assert!(!email.primary_key);
        assert!(email.unique);
        assert!(email.nullable);
        assert_eq!(email.data_type, DataType::new("varchar", "varchar(255)"));

        assert_eq!(users.content_hash, table_content_hash(["id", "email", "name"]));
    }

    #[test]
    fn test_parse_pk_shorthand_and_notes() {
        let text = r#"Table t {
            Note: 'all the things'
            id int [pk, note: "the key, unique"]
            label text [note: 'a, b']
        }"#;
        let parsed = parse(text, DatabaseType::Generic);
        let t = &parsed.tables[0];

        assert_eq!(t.comment.as_deref(), Some("all the things"));
        assert_eq!(t.fields.len(), 2);
        assert!(t.fields[0].primary_key);
        assert_eq!(t.fields[0].data_type, DataType::new("integer", "integer"));
        assert_eq!(t.fields[0].comment.as_deref(), Some("the key, unique"));
        assert!(!t.fields[1].unique);
        assert_eq!(t.fields[1].comment.as_deref(), Some("a, b"));
    }

    #[test]
    fn test_parse_indexes_block() {
        let text = "Table orders {\n\tid integer [primary key]\n\tcode text\n\tuser_id integer\n\tIndexes {\n\t\t(code) [unique, name: 'orders_code']\n\t\t(user_id, code)\n\t}\n}";
        let parsed = parse(text, DatabaseType::Generic);
        let orders = &parsed.tables[0];

        assert_eq!(orders.fields.len(), 3);
        assert_eq!(orders.indexes.len(), 2);
        assert_eq!(
            orders.indexes[0],
            ParsedIndex {
                name: "orders_code".to_string(),
                unique: true,
                fields: vec!["code".to_string()],
            }
        );
        assert_eq!(orders.indexes[1].name, "user_id_code");
        assert!(!orders.indexes[1].unique);
    }

    #[test]
    fn test_parse_relationships() {
        let text = "Rel b_a_id_fk: 1 a.id, N b.a_id\nRel other: N x.y, * z.w";
        let parsed = parse(text, DatabaseType::Generic);

        assert_eq!(parsed.relationships.len(), 2);
        let rel = &parsed.relationships[0];
        assert_eq!(rel.name, "b_a_id_fk");
        assert_eq!(rel.source_table, "a");
        assert_eq!(rel.source_field, "id");
        assert_eq!(rel.target_table, "b");
        assert_eq!(rel.target_field, "a_id");
        assert_eq!(rel.source_cardinality, Cardinality::One);
        assert_eq!(rel.target_cardinality, Cardinality::Many);
        assert_eq!(
            rel.content_hash,
            relationship_content_hash("a", "id", "b", "a_id")
        );
        assert_eq!(parsed.relationships[1].target_cardinality, Cardinality::Many);
    }

    #[test]
    fn test_malformed_blocks_are_skipped() {
        let text = "Table broken {\n\tid integer\n\nTable ok {\n\tid integer\n}\nRel half: 1 a.id,";
        let parsed = parse(text, DatabaseType::Generic);

        // The unterminated block is skipped, the complete one after it is kept
        assert_eq!(parsed.tables.len(), 1);
        assert_eq!(parsed.tables[0].name, "ok");
        assert!(parsed.relationships.is_empty());
    }

    #[test]
    fn test_multi_word_and_argument_types() {
        let text = "Table m {\n\tid integer [pk]\n\tscore double precision\n\tprice decimal(10, 2) [null]\n\tratio double precision [note: 'x']\n}";
        let parsed = parse(text, DatabaseType::PostgreSql);
        let m = &parsed.tables[0];

        assert_eq!(m.fields.len(), 4);
        assert_eq!(m.fields[1].data_type, DataType::new("double_precision", "double precision"));
        assert_eq!(m.fields[2].data_type.name, "decimal(10, 2)");
        assert!(m.fields[2].nullable);
        assert_eq!(m.fields[3].comment.as_deref(), Some("x"));
    }

    #[test]
    fn test_braces_and_escapes_inside_notes() {
        let text = r#"Table t {
            Note: 'json {a} it\'s'
            id integer [pk, note: 'multi\nline \\ [x]']
            label text [note: "say \"hi\" }"]
        }

        Table u {
            id integer
        }"#;
        let parsed = parse(text, DatabaseType::Generic);

        assert_eq!(parsed.tables.len(), 2);
        let t = &parsed.tables[0];
        assert_eq!(t.comment.as_deref(), Some("json {a} it's"));
        assert_eq!(t.fields.len(), 2);
        assert_eq!(t.fields[0].comment.as_deref(), Some("multi\nline \\ [x]"));
        assert!(t.fields[0].primary_key);
        assert_eq!(t.fields[1].comment.as_deref(), Some("say \"hi\" }"));
    }

    #[test]
    fn test_rel_inside_note_is_not_a_relationship() {
        let text = "Table a {\n\tNote: 'Rel x: 1 a.id, N b.id'\n\tid integer\n}";
        let parsed = parse(text, DatabaseType::Generic);
        assert!(parsed.relationships.is_empty());
        assert_eq!(parsed.tables[0].fields.len(), 1);
    }

    #[test]
    fn test_incomplete_field_line_is_ignored() {
        let text = "Table users {\n\tid integer [primary key]\n\temail\n}";
        let parsed = parse(text, DatabaseType::Generic);
        assert_eq!(parsed.tables[0].fields.len(), 1);
    }

    #[test]
    fn test_comments_are_stripped() {
        let text = "// Rel ghost: 1 a.id, N b.a_id\nTable a {\n\tid integer // key\n\turl text [note: 'http://x']\n}";
        let parsed = parse(text, DatabaseType::Generic);

        assert!(parsed.relationships.is_empty());
        let a = &parsed.tables[0];
        assert_eq!(a.fields.len(), 2);
        assert_eq!(a.fields[1].comment.as_deref(), Some("http://x"));
    }

    #[test]
    fn test_empty_text() {
        assert_eq!(parse("", DatabaseType::Generic), ParsedSchema::default());
    }
}
