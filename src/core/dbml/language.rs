//! Language definition for the schema text editor widget
//!
//! The widget only needs token rules and bracket/comment configuration; it
//! reports back the full text on every edit.

use serde::{Deserialize, Serialize};

use crate::core::data_types::{DatabaseType, TYPE_ALIASES};

/// Marker that starts a line comment
pub const LINE_COMMENT: &str = "//";

pub const BRACKETS: [(&str, &str); 3] = [("{", "}"), ("[", "]"), ("(", ")")];

const STRUCTURE_KEYWORDS: &[&str] = &["Table", "Rel", "Indexes", "Note"];

const TAG_KEYWORDS: &[&str] = &["primary key", "pk", "unique", "null", "not null", "note", "name"];

/// Token rule: a regular expression and the token class it produces
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRule {
    pub pattern: String,
    pub token: String,
}

impl TokenRule {
    fn new(pattern: &str, token: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            token: token.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BracketPair {
    pub open: String,
    pub close: String,
}

/// Highlighting and editing rules for schema text
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageDefinition {
    pub id: String,
    pub keywords: Vec<String>,
    pub line_comment: String,
    pub brackets: Vec<BracketPair>,
    pub rules: Vec<TokenRule>,
}

impl LanguageDefinition {
    /// Rules for a dialect: structure keywords, tags, aliases and the dialect's type names
    pub fn for_database(database_type: DatabaseType) -> Self {
        let mut keywords: Vec<String> = STRUCTURE_KEYWORDS
            .iter()
            .chain(TAG_KEYWORDS)
            .map(|k| k.to_string())
            .collect();
        keywords.extend(TYPE_ALIASES.iter().map(|(alias, _)| alias.to_string()));
        for def in database_type.data_types() {
            if !keywords.iter().any(|k| k == def.name) {
                keywords.push(def.name.to_string());
            }
        }

        Self {
            id: "dbml".to_string(),
            keywords,
            line_comment: LINE_COMMENT.to_string(),
            brackets: BRACKETS
                .iter()
                .map(|(open, close)| BracketPair {
                    open: open.to_string(),
                    close: close.to_string(),
                })
                .collect(),
            rules: vec![
                TokenRule::new(r"//.*", "comment"),
                TokenRule::new(r"\d+(\.\d+)?", "number"),
                TokenRule::new(r#""[^"]*""#, "string"),
                TokenRule::new(r"'[^']*'", "string"),
                TokenRule::new(r"#[a-zA-Z]\w*", "tag"),
                TokenRule::new(r"\w+", "identifier"),
            ],
        }
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.keywords.iter().any(|k| k == word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keywords_include_structure_aliases_and_types() {
        let lang = LanguageDefinition::for_database(DatabaseType::PostgreSql);
        assert!(lang.is_keyword("Table"));
        assert!(lang.is_keyword("Rel"));
        assert!(lang.is_keyword("primary key"));
        assert!(lang.is_keyword("int"));
        assert!(lang.is_keyword("jsonb"));
        assert!(!lang.is_keyword("users"));
    }

    #[test]
    fn test_no_duplicate_keywords() {
        let lang = LanguageDefinition::for_database(DatabaseType::MySql);
        let mut sorted = lang.keywords.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), lang.keywords.len());
    }

    #[test]
    fn test_serializes_for_widget() {
        let lang = LanguageDefinition::for_database(DatabaseType::Generic);
        let json = serde_json::to_value(&lang).unwrap();
        assert_eq!(json["lineComment"], "//");
        assert_eq!(json["brackets"][0]["open"], "{");
    }
}
