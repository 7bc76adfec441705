//! Per-dialect type tables
//!
//! The parser consults these tables to turn a type name written in schema text
//! into a canonical [`DataType`]. Unknown names are kept verbatim.

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Target SQL dialect of a diagram
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseType {
    #[default]
    #[display("generic")]
    Generic,
    #[display("postgresql")]
    PostgreSql,
    #[display("mysql")]
    MySql,
    #[display("mariadb")]
    MariaDb,
    #[display("sqlite")]
    Sqlite,
    #[display("sql_server")]
    SqlServer,
}

impl DatabaseType {
    pub const ALL: [DatabaseType; 6] = [
        DatabaseType::Generic,
        DatabaseType::PostgreSql,
        DatabaseType::MySql,
        DatabaseType::MariaDb,
        DatabaseType::Sqlite,
        DatabaseType::SqlServer,
    ];

    /// Whether tables of this dialect are grouped into named schemas
    pub fn has_schemas(&self) -> bool {
        matches!(self, DatabaseType::PostgreSql | DatabaseType::SqlServer)
    }

    /// Default schema name for dialects that have schemas
    pub fn default_schema(&self) -> Option<&'static str> {
        match self {
            DatabaseType::PostgreSql => Some("public"),
            DatabaseType::SqlServer => Some("dbo"),
            _ => None,
        }
    }

    /// Type given to seeded `id` fields
    pub fn default_id_type(&self) -> DataType {
        match self {
            DatabaseType::Sqlite => DataType::new("integer", "integer"),
            _ => DataType::new("bigint", "bigint"),
        }
    }

    /// Canonical types known for this dialect
    pub fn data_types(&self) -> &'static [TypeDef] {
        match self {
            DatabaseType::Generic => GENERIC_TYPES,
            DatabaseType::PostgreSql => POSTGRES_TYPES,
            DatabaseType::MySql | DatabaseType::MariaDb => MYSQL_TYPES,
            DatabaseType::Sqlite => SQLITE_TYPES,
            DatabaseType::SqlServer => SQL_SERVER_TYPES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown database type: {0}")]
pub struct UnknownDatabaseType(pub String);

impl FromStr for DatabaseType {
    type Err = UnknownDatabaseType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "generic" => Ok(DatabaseType::Generic),
            "postgresql" | "postgres" => Ok(DatabaseType::PostgreSql),
            "mysql" => Ok(DatabaseType::MySql),
            "mariadb" => Ok(DatabaseType::MariaDb),
            "sqlite" => Ok(DatabaseType::Sqlite),
            "sql_server" | "sqlserver" | "mssql" => Ok(DatabaseType::SqlServer),
            other => Err(UnknownDatabaseType(other.to_string())),
        }
    }
}

/// Semantic type descriptor of a field
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub struct DataType {
    pub id: String,
    pub name: String,
}

impl DataType {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Descriptor for a type name no dialect table knows about
    pub fn literal(name: &str) -> Self {
        Self::new(name.to_lowercase(), name)
    }
}

/// Static entry of a dialect type table
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypeDef {
    pub id: &'static str,
    pub name: &'static str,
}

impl From<&TypeDef> for DataType {
    fn from(def: &TypeDef) -> Self {
        DataType::new(def.id, def.name)
    }
}

const fn t(id: &'static str, name: &'static str) -> TypeDef {
    TypeDef { id, name }
}

/// Shorthand names accepted in schema text
pub const TYPE_ALIASES: &[(&str, &str)] = &[("string", "varchar(255)"), ("int", "integer")];

pub const GENERIC_TYPES: &[TypeDef] = &[
    t("bigint", "bigint"),
    t("binary", "binary"),
    t("blob", "blob"),
    t("boolean", "boolean"),
    t("char", "char"),
    t("date", "date"),
    t("datetime", "datetime"),
    t("decimal", "decimal"),
    t("double_precision", "double precision"),
    t("float", "float"),
    t("integer", "integer"),
    t("json", "json"),
    t("numeric", "numeric"),
    t("real", "real"),
    t("smallint", "smallint"),
    t("text", "text"),
    t("time", "time"),
    t("timestamp", "timestamp"),
    t("uuid", "uuid"),
    t("varchar", "varchar"),
];

pub const POSTGRES_TYPES: &[TypeDef] = &[
    t("bigint", "bigint"),
    t("bigserial", "bigserial"),
    t("boolean", "boolean"),
    t("bytea", "bytea"),
    t("char", "char"),
    t("date", "date"),
    t("double_precision", "double precision"),
    t("integer", "integer"),
    t("interval", "interval"),
    t("json", "json"),
    t("jsonb", "jsonb"),
    t("numeric", "numeric"),
    t("real", "real"),
    t("serial", "serial"),
    t("smallint", "smallint"),
    t("text", "text"),
    t("time", "time"),
    t("timestamp", "timestamp"),
    t("timestamptz", "timestamptz"),
    t("uuid", "uuid"),
    t("varchar", "varchar"),
];

pub const MYSQL_TYPES: &[TypeDef] = &[
    t("bigint", "bigint"),
    t("binary", "binary"),
    t("blob", "blob"),
    t("boolean", "boolean"),
    t("char", "char"),
    t("date", "date"),
    t("datetime", "datetime"),
    t("decimal", "decimal"),
    t("double", "double"),
    t("enum", "enum"),
    t("float", "float"),
    t("int", "int"),
    t("integer", "integer"),
    t("json", "json"),
    t("longtext", "longtext"),
    t("mediumint", "mediumint"),
    t("smallint", "smallint"),
    t("text", "text"),
    t("time", "time"),
    t("timestamp", "timestamp"),
    t("tinyint", "tinyint"),
    t("varchar", "varchar"),
];

pub const SQLITE_TYPES: &[TypeDef] = &[
    t("blob", "blob"),
    t("integer", "integer"),
    t("numeric", "numeric"),
    t("real", "real"),
    t("text", "text"),
];

pub const SQL_SERVER_TYPES: &[TypeDef] = &[
    t("bigint", "bigint"),
    t("bit", "bit"),
    t("char", "char"),
    t("date", "date"),
    t("datetime", "datetime"),
    t("datetime2", "datetime2"),
    t("decimal", "decimal"),
    t("float", "float"),
    t("int", "int"),
    t("money", "money"),
    t("nchar", "nchar"),
    t("nvarchar", "nvarchar"),
    t("smallint", "smallint"),
    t("text", "text"),
    t("time", "time"),
    t("tinyint", "tinyint"),
    t("uniqueidentifier", "uniqueidentifier"),
    t("varchar", "varchar"),
];

/// Resolve a type name written in schema text against a dialect
///
/// A name the dialect declares itself wins. Otherwise aliases are expanded
/// and matched again (case-insensitive). A known base name with arguments
/// (`varchar(64)`) keeps the written name under the canonical id; anything
/// else is kept literally.
pub fn resolve_type(database_type: DatabaseType, written: &str) -> DataType {
    let types = database_type.data_types();
    let written = written.trim();
    let lowered = written.to_lowercase();
    if let Some(def) = types.iter().find(|def| def.name == lowered) {
        return def.into();
    }

    let name = TYPE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map_or(written, |(_, target)| *target);
    let lowered = name.to_lowercase();

    if let Some(def) = types.iter().find(|def| def.name == lowered) {
        return def.into();
    }

    if let Some((base, _)) = lowered.split_once('(')
        && let Some(def) = types.iter().find(|def| def.name == base.trim_end())
    {
        return DataType::new(def.id, name);
    }

    DataType::literal(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_type_case_insensitive() {
        let ty = resolve_type(DatabaseType::PostgreSql, "JSONB");
        assert_eq!(ty, DataType::new("jsonb", "jsonb"));
    }

    #[test]
    fn test_resolve_alias() {
        assert_eq!(
            resolve_type(DatabaseType::Generic, "int"),
            DataType::new("integer", "integer")
        );
        assert_eq!(
            resolve_type(DatabaseType::Generic, "string"),
            DataType::new("varchar", "varchar(255)")
        );
    }

    #[test]
    fn test_resolve_parameterized_type() {
        let ty = resolve_type(DatabaseType::MySql, "varchar(64)");
        assert_eq!(ty.id, "varchar");
        assert_eq!(ty.name, "varchar(64)");
    }

    #[test]
    fn test_dialect_type_wins_over_alias() {
        assert_eq!(resolve_type(DatabaseType::MySql, "int"), DataType::new("int", "int"));
        assert_eq!(resolve_type(DatabaseType::SqlServer, "INT").name, "int");
    }

    #[test]
    fn test_resolve_multi_word_and_spaced_arguments() {
        assert_eq!(
            resolve_type(DatabaseType::Generic, " double precision "),
            DataType::new("double_precision", "double precision")
        );
        let ty = resolve_type(DatabaseType::Generic, "decimal(10, 2)");
        assert_eq!(ty, DataType::new("decimal", "decimal(10, 2)"));
    }

    #[test]
    fn test_every_declared_type_resolves_to_itself() {
        for db in DatabaseType::ALL {
            for def in db.data_types() {
                assert_eq!(resolve_type(db, def.name), DataType::from(def), "{db} {}", def.name);
            }
        }
    }

    #[test]
    fn test_unknown_type_kept_literally() {
        let ty = resolve_type(DatabaseType::Sqlite, "MyEnum");
        assert_eq!(ty.id, "myenum");
        assert_eq!(ty.name, "MyEnum");
    }

    #[test]
    fn test_database_type_from_str_and_display() {
        for db in DatabaseType::ALL {
            assert_eq!(db.to_string().parse::<DatabaseType>(), Ok(db));
        }
        assert_eq!("postgres".parse(), Ok(DatabaseType::PostgreSql));
        assert!("oracle".parse::<DatabaseType>().is_err());
    }

    #[test]
    fn test_default_id_type() {
        assert_eq!(DatabaseType::Sqlite.default_id_type().name, "integer");
        assert_eq!(DatabaseType::PostgreSql.default_id_type().name, "bigint");
    }
}
