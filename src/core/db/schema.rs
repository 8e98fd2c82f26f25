/// Schema Catalog Module
///
/// Table, column and index descriptions, either built by the caller or
/// introspected from a live database, and their rendering into
/// backend-specific DDL.
///
/// Column rendering goes through a single entry point,
/// [`BackendKind::render_column`]; every DDL statement in the crate is built
/// from it. The `*_sql` functions are pure and need no connection.
use crate::core::db::backend::BackendKind;
use crate::core::db::connection::ConnectionHandle;
use crate::core::db::query::{quote, Query, Row, TableNames, Value};
use crate::core::{DbError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use tracing::{debug, info};

/// Column types understood by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Char(u32),
    Varchar(u32),
    Text,
    Int,
    Decimal { precision: u8, scale: u8 },
    Float,
    Date,
    Datetime,
    Enum(Vec<String>),
    Set(Vec<String>),
    /// Auto-incrementing integer; always the table's primary key
    Serial,
    /// Stored as `'Y'`/`'N'`
    Bool,
    Uuid,
    Blob,
}

/// Column modifier bitset.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ColumnFlags(u8);

impl ColumnFlags {
    pub const NONE: ColumnFlags = ColumnFlags(0);
    /// Explicitly nullable
    pub const NULLS: ColumnFlags = ColumnFlags(1);
    pub const NOT_NULL: ColumnFlags = ColumnFlags(1 << 1);
    pub const UNSIGNED: ColumnFlags = ColumnFlags(1 << 2);
    /// 64-bit integers, long text and long blobs
    pub const BIG: ColumnFlags = ColumnFlags(1 << 3);

    pub fn contains(self, other: ColumnFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ColumnFlags {
    type Output = ColumnFlags;

    fn bitor(self, rhs: ColumnFlags) -> ColumnFlags {
        ColumnFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for ColumnFlags {
    fn bitor_assign(&mut self, rhs: ColumnFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ColumnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (ColumnFlags::NULLS, "NULLS"),
            (ColumnFlags::NOT_NULL, "NOT_NULL"),
            (ColumnFlags::UNSIGNED, "UNSIGNED"),
            (ColumnFlags::BIG, "BIG"),
        ]
        .iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| *name)
        .collect();
        write!(f, "ColumnFlags({})", names.join(" | "))
    }
}

/// Default value of a column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnDefault {
    /// A literal, quoted for the backend when rendered
    Value(Value),
    /// Raw SQL such as `CURRENT_TIMESTAMP`; introspected defaults land here
    Expr(String),
}

impl ColumnDefault {
    fn render(&self, kind: BackendKind) -> Result<String> {
        match self {
            ColumnDefault::Value(value) => quote(kind, value),
            ColumnDefault::Expr(expr) => Ok(expr.clone()),
        }
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    pub flags: ColumnFlags,
    pub default: Option<ColumnDefault>,
    pub comment: Option<String>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        ColumnSpec {
            name: name.into(),
            ty,
            flags: ColumnFlags::NONE,
            default: None,
            comment: None,
        }
    }

    pub fn flags(mut self, flags: ColumnFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn not_null(self) -> Self {
        self.flags(ColumnFlags::NOT_NULL)
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(ColumnDefault::Expr(expr.into()));
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Primary,
    Unique,
    Index,
}

/// An index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Logical name; the table prefix and suffix are applied when rendered
    pub name: String,
    pub kind: IndexKind,
    pub columns: Vec<String>,
}

impl IndexSpec {
    pub fn primary(columns: &[&str]) -> Self {
        IndexSpec::build("PRIMARY", IndexKind::Primary, columns)
    }

    pub fn unique(name: &str, columns: &[&str]) -> Self {
        IndexSpec::build(name, IndexKind::Unique, columns)
    }

    pub fn index(name: &str, columns: &[&str]) -> Self {
        IndexSpec::build(name, IndexKind::Index, columns)
    }

    fn build(name: &str, kind: IndexKind, columns: &[&str]) -> Self {
        IndexSpec {
            name: name.to_string(),
            kind,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// How [`SchemaCatalog::resolve`] obtains a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationMode {
    /// Introspect the live table; it must exist
    Existing,
    /// Create from the definition unless the table already exists
    CreateIfNeeded,
    /// Drop any existing table and create from the definition
    CreateAlways,
}

/// A table: ordered columns, indexes and a creation mode.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    /// Logical name, decorated with prefix/suffix/aliases when rendered
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub indexes: Vec<IndexSpec>,
    pub mode: CreationMode,
}

impl TableSpec {
    pub fn new(name: impl Into<String>, mode: CreationMode) -> Self {
        TableSpec {
            name: name.into(),
            columns: Vec::new(),
            indexes: Vec::new(),
            mode,
        }
    }

    /// Adds a column, replacing any column with the same name in place.
    pub fn column(mut self, column: ColumnSpec) -> Self {
        match self.columns.iter_mut().find(|c| c.name == column.name) {
            Some(existing) => *existing = column,
            None => self.columns.push(column),
        }
        self
    }

    pub fn index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_index(&self, name: &str) -> Option<&IndexSpec> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

impl BackendKind {
    /// Renders one column definition, e.g. `"active" CHAR(1) NOT NULL`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` for enums or sets without values and for
    /// defaults that cannot be quoted.
    pub fn render_column(&self, column: &ColumnSpec) -> Result<String> {
        let name = self.quote_identifier(&column.name);
        let mut sql = format!("{} {}", name, self.render_type(column)?);

        if column.ty != ColumnType::Serial {
            if column.flags.contains(ColumnFlags::NOT_NULL) {
                sql.push_str(" NOT NULL");
            } else if column.flags.contains(ColumnFlags::NULLS) {
                sql.push_str(" NULL");
            }
            if let Some(default) = &column.default {
                sql.push_str(" DEFAULT ");
                sql.push_str(&default.render(*self)?);
            }
        }

        // Enums are emulated with a CHECK constraint outside MySQL
        if let (ColumnType::Enum(values), false) = (&column.ty, *self == BackendKind::Mysql) {
            sql.push_str(&format!(" CHECK ({} IN ({}))", name, self.quote_list(values)));
        }

        if let (Some(comment), BackendKind::Mysql) = (&column.comment, self) {
            sql.push_str(" COMMENT ");
            sql.push_str(&self.quote_string(comment));
        }
        Ok(sql)
    }

    fn render_type(&self, column: &ColumnSpec) -> Result<String> {
        use BackendKind::{Mysql, Postgres, Sqlite};

        let big = column.flags.contains(ColumnFlags::BIG);
        let sql = match (&column.ty, self) {
            (ColumnType::Char(n), _) => format!("CHAR({})", n),
            (ColumnType::Varchar(n), _) => format!("VARCHAR({})", n),
            (ColumnType::Text, Mysql) if big => "LONGTEXT".to_string(),
            (ColumnType::Text, _) => "TEXT".to_string(),
            (ColumnType::Int, Sqlite) => "INTEGER".to_string(),
            (ColumnType::Int, _) if big => "BIGINT".to_string(),
            (ColumnType::Int, Mysql) => "INT".to_string(),
            (ColumnType::Int, Postgres) => "INTEGER".to_string(),
            (ColumnType::Decimal { precision, scale }, _) => {
                format!("DECIMAL({},{})", precision, scale)
            }
            (ColumnType::Float, Sqlite) => "REAL".to_string(),
            (ColumnType::Float, Mysql) => "DOUBLE".to_string(),
            (ColumnType::Float, Postgres) => "DOUBLE PRECISION".to_string(),
            (ColumnType::Date, _) => "DATE".to_string(),
            (ColumnType::Datetime, Postgres) => "TIMESTAMP".to_string(),
            (ColumnType::Datetime, _) => "DATETIME".to_string(),
            (ColumnType::Enum(values), _) | (ColumnType::Set(values), _) if values.is_empty() => {
                return Err(DbError::query(format!(
                    "column {} needs at least one allowed value",
                    column.name
                )))
            }
            (ColumnType::Enum(values), Mysql) => format!("ENUM({})", self.quote_list(values)),
            (ColumnType::Enum(values), _) => format!("VARCHAR({})", longest(values)),
            (ColumnType::Set(values), Mysql) => format!("SET({})", self.quote_list(values)),
            (ColumnType::Set(values), _) => format!("VARCHAR({})", joined_length(values)),
            (ColumnType::Serial, Sqlite) => "INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            (ColumnType::Serial, Mysql) if big => {
                "BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY".to_string()
            }
            (ColumnType::Serial, Mysql) => "INT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY".to_string(),
            (ColumnType::Serial, Postgres) if big => "BIGSERIAL PRIMARY KEY".to_string(),
            (ColumnType::Serial, Postgres) => "SERIAL PRIMARY KEY".to_string(),
            (ColumnType::Bool, Mysql) => "ENUM('Y','N')".to_string(),
            (ColumnType::Bool, _) => "CHAR(1)".to_string(),
            (ColumnType::Uuid, Postgres) => "UUID".to_string(),
            (ColumnType::Uuid, _) => "CHAR(36)".to_string(),
            (ColumnType::Blob, Postgres) => "BYTEA".to_string(),
            (ColumnType::Blob, Mysql) if big => "LONGBLOB".to_string(),
            (ColumnType::Blob, _) => "BLOB".to_string(),
        };

        let numeric = matches!(
            column.ty,
            ColumnType::Int | ColumnType::Decimal { .. } | ColumnType::Float
        );
        if *self == Mysql && numeric && column.flags.contains(ColumnFlags::UNSIGNED) {
            Ok(format!("{} UNSIGNED", sql))
        } else {
            Ok(sql)
        }
    }

    fn quote_list(&self, values: &[String]) -> String {
        values
            .iter()
            .map(|v| self.quote_string(v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn longest(values: &[String]) -> usize {
    values.iter().map(|v| v.chars().count()).max().unwrap_or(1)
}

fn joined_length(values: &[String]) -> usize {
    values.iter().map(|v| v.chars().count()).sum::<usize>() + values.len().saturating_sub(1)
}

fn index_name(kind: BackendKind, tables: &TableNames, index: &str) -> String {
    kind.quote_identifier(&format!("{}{}{}", tables.prefix, index, tables.suffix))
}

fn column_list(kind: BackendKind, columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| kind.quote_identifier(c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn comment_sql(kind: BackendKind, table: &str, column: &ColumnSpec) -> Option<String> {
    match (kind, &column.comment) {
        (BackendKind::Postgres, Some(comment)) => Some(format!(
            "COMMENT ON COLUMN {}.{} IS {}",
            table,
            kind.quote_identifier(&column.name),
            kind.quote_string(comment)
        )),
        _ => None,
    }
}

/// Statements creating `spec`: the table, then its secondary indexes, then
/// any column comments the backend keeps separately.
pub fn create_table_sql(kind: BackendKind, tables: &TableNames, spec: &TableSpec) -> Result<Vec<String>> {
    if spec.columns.is_empty() {
        return Err(DbError::query(format!("table {} has no columns", spec.name)));
    }
    let table = tables.qualified(kind, &spec.name);
    let has_serial = spec.columns.iter().any(|c| c.ty == ColumnType::Serial);

    let mut parts = Vec::with_capacity(spec.columns.len() + 1);
    for column in &spec.columns {
        parts.push(kind.render_column(column)?);
    }
    for index in spec.indexes.iter().filter(|i| i.kind == IndexKind::Primary) {
        if has_serial {
            return Err(DbError::query(format!(
                "table {} has a serial column and an explicit primary key",
                spec.name
            )));
        }
        parts.push(format!("PRIMARY KEY ({})", column_list(kind, &index.columns)));
    }

    let mut create = format!("CREATE TABLE {} ({})", table, parts.join(", "));
    if kind == BackendKind::Mysql {
        create.push_str(" ENGINE=InnoDB DEFAULT CHARSET=utf8mb4");
    }

    let mut statements = vec![create];
    for index in spec.indexes.iter().filter(|i| i.kind != IndexKind::Primary) {
        statements.push(create_index_sql(kind, tables, &spec.name, index)?);
    }
    statements.extend(spec.columns.iter().filter_map(|c| comment_sql(kind, &table, c)));
    Ok(statements)
}

pub fn drop_table_sql(kind: BackendKind, tables: &TableNames, name: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", tables.qualified(kind, name))
}

pub fn add_column_sql(
    kind: BackendKind,
    tables: &TableNames,
    table: &str,
    column: &ColumnSpec,
) -> Result<Vec<String>> {
    let table = tables.qualified(kind, table);
    let mut statements = vec![format!(
        "ALTER TABLE {} ADD COLUMN {}",
        table,
        kind.render_column(column)?
    )];
    statements.extend(comment_sql(kind, &table, column));
    Ok(statements)
}

pub fn drop_column_sql(kind: BackendKind, tables: &TableNames, table: &str, column: &str) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        tables.qualified(kind, table),
        kind.quote_identifier(column)
    )
}

/// # Errors
///
/// SQLite cannot add a primary key to an existing table.
pub fn create_index_sql(
    kind: BackendKind,
    tables: &TableNames,
    table: &str,
    index: &IndexSpec,
) -> Result<String> {
    if index.columns.is_empty() {
        return Err(DbError::query(format!("index {} has no columns", index.name)));
    }
    let table = tables.qualified(kind, table);
    let columns = column_list(kind, &index.columns);
    match index.kind {
        IndexKind::Primary if kind == BackendKind::Sqlite => Err(DbError::query(
            "sqlite cannot add a primary key to an existing table",
        )),
        IndexKind::Primary => Ok(format!("ALTER TABLE {} ADD PRIMARY KEY ({})", table, columns)),
        IndexKind::Unique => Ok(format!(
            "CREATE UNIQUE INDEX {} ON {} ({})",
            index_name(kind, tables, &index.name),
            table,
            columns
        )),
        IndexKind::Index => Ok(format!(
            "CREATE INDEX {} ON {} ({})",
            index_name(kind, tables, &index.name),
            table,
            columns
        )),
    }
}

pub fn drop_index_sql(kind: BackendKind, tables: &TableNames, table: &str, index: &str) -> String {
    let name = index_name(kind, tables, index);
    match kind {
        BackendKind::Mysql => format!("DROP INDEX {} ON {}", name, tables.qualified(kind, table)),
        BackendKind::Sqlite | BackendKind::Postgres => format!("DROP INDEX {}", name),
    }
}

static DECLARED_TYPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*([a-z][a-z ]*?)\s*(?:\((.*)\))?(\s+unsigned)?(\s+zerofill)?\s*$")
        .expect("declared type pattern is valid")
});

static QUOTED_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'((?:[^']|'')*)'").expect("quoted value pattern is valid"));

/// Maps a declared column type such as `varchar(64)`, `int(10) unsigned`,
/// `enum('Y','N')` or `character varying(255)` back to a [`ColumnType`].
///
/// Unknown types come back as `Text`.
pub fn parse_declared_type(declared: &str) -> (ColumnType, ColumnFlags) {
    let Some(caps) = DECLARED_TYPE.captures(declared) else {
        return (ColumnType::Text, ColumnFlags::NONE);
    };
    let base = caps
        .get(1)
        .map(|m| m.as_str().trim().to_ascii_uppercase())
        .unwrap_or_default();
    let args = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let mut flags = if caps.get(3).is_some() {
        ColumnFlags::UNSIGNED
    } else {
        ColumnFlags::NONE
    };
    let numbers: Vec<u32> = args
        .split(',')
        .filter_map(|n| n.trim().parse().ok())
        .collect();
    let size = |fallback: u32| numbers.first().copied().unwrap_or(fallback);
    let values = || -> Vec<String> {
        QUOTED_VALUE
            .captures_iter(args)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().replace("''", "'"))
            .collect()
    };

    let ty = match base.as_str() {
        "CHAR" | "CHARACTER" | "BPCHAR" => ColumnType::Char(size(1)),
        "VARCHAR" | "CHARACTER VARYING" => ColumnType::Varchar(size(255)),
        "INT" | "INTEGER" | "SMALLINT" | "TINYINT" | "MEDIUMINT" | "INT4" => ColumnType::Int,
        "BIGINT" | "INT8" => {
            flags |= ColumnFlags::BIG;
            ColumnType::Int
        }
        "DECIMAL" | "NUMERIC" => ColumnType::Decimal {
            precision: numbers.first().map_or(10, |p| u8::try_from(*p).unwrap_or(u8::MAX)),
            scale: numbers.get(1).map_or(0, |s| u8::try_from(*s).unwrap_or(u8::MAX)),
        },
        "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" => ColumnType::Float,
        "DATE" => ColumnType::Date,
        "DATETIME" | "TIMESTAMP" | "TIMESTAMP WITHOUT TIME ZONE" | "TIMESTAMP WITH TIME ZONE" => {
            ColumnType::Datetime
        }
        "ENUM" => {
            let values = values();
            if values == ["Y", "N"] {
                ColumnType::Bool
            } else {
                ColumnType::Enum(values)
            }
        }
        "SET" => ColumnType::Set(values()),
        "UUID" => ColumnType::Uuid,
        "BLOB" | "BYTEA" | "TINYBLOB" | "MEDIUMBLOB" => ColumnType::Blob,
        "LONGBLOB" => {
            flags |= ColumnFlags::BIG;
            ColumnType::Blob
        }
        "LONGTEXT" => {
            flags |= ColumnFlags::BIG;
            ColumnType::Text
        }
        _ => ColumnType::Text,
    };
    (ty, flags)
}

/// Reads a boolean-ish catalog value (`1`, `t`, `true`, `YES`, `Y`).
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Int(i)) => *i != 0,
        Some(Value::Text(t)) => matches!(t.to_ascii_lowercase().as_str(), "1" | "t" | "true" | "yes" | "y"),
        _ => false,
    }
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column)
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::Text(t) => t.clone(),
            other => other.to_string(),
        })
}

/// Schema operations against one live connection.
///
/// Table names passed in are logical; prefix, suffix and aliases of the
/// handle are applied.
pub struct SchemaCatalog<'a> {
    handle: &'a mut ConnectionHandle,
}

impl ConnectionHandle {
    pub fn catalog(&mut self) -> SchemaCatalog<'_> {
        SchemaCatalog { handle: self }
    }
}

impl SchemaCatalog<'_> {
    fn run_all(&mut self, statements: Vec<String>) -> Result<()> {
        for sql in statements {
            self.handle.execute_sql(&sql)?;
        }
        Ok(())
    }

    fn physical(&self, name: &str) -> String {
        self.handle.tables().decorate(name)
    }

    pub fn table_exists(&mut self, name: &str) -> Result<bool> {
        let template = match self.handle.kind() {
            BackendKind::Sqlite => "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            BackendKind::Mysql => {
                "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ?"
            }
            BackendKind::Postgres => {
                "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = ?"
            }
        };
        let query = Query::new(template).bind(self.physical(name));
        Ok(self.handle.query_one(query)?.is_some())
    }

    /// Introspects a live table.
    ///
    /// # Returns
    ///
    /// A spec in `Existing` mode. Defaults come back as raw SQL expressions.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` when the table does not exist.
    pub fn describe(&mut self, name: &str) -> Result<TableSpec> {
        if !self.table_exists(name)? {
            return Err(DbError::query(format!(
                "table {} does not exist",
                self.physical(name)
            )));
        }
        debug!("Introspecting table {}", self.physical(name));

        let mut spec = TableSpec::new(name, CreationMode::Existing);
        match self.handle.kind() {
            BackendKind::Sqlite => self.describe_sqlite(&mut spec)?,
            BackendKind::Mysql => self.describe_mysql(&mut spec)?,
            BackendKind::Postgres => self.describe_postgres(&mut spec)?,
        }
        Ok(spec)
    }

    fn describe_sqlite(&mut self, spec: &mut TableSpec) -> Result<()> {
        let table = self.handle.table_name(&spec.name);
        let rows = self
            .handle
            .query_sql(&format!("PRAGMA table_info({})", table))?
            .collect_rows()?;
        let pk_columns = rows.iter().filter(|r| truthy(r.get("pk"))).count();

        for row in &rows {
            let name = text(row, "name").unwrap_or_default();
            let declared = text(row, "type").unwrap_or_default();
            let (mut ty, mut flags) = parse_declared_type(&declared);
            // A lone INTEGER primary key is the rowid alias
            if pk_columns == 1 && truthy(row.get("pk")) && declared.eq_ignore_ascii_case("INTEGER") {
                ty = ColumnType::Serial;
            } else if truthy(row.get("notnull")) {
                flags |= ColumnFlags::NOT_NULL;
            }
            let mut column = ColumnSpec::new(name, ty).flags(flags);
            if column.ty != ColumnType::Serial {
                column.default = text(row, "dflt_value").map(ColumnDefault::Expr);
            }
            spec.columns.push(column);
        }

        if pk_columns > 1 {
            let mut keyed: Vec<(i64, String)> = rows
                .iter()
                .filter_map(|r| Some((r.get("pk")?.as_i64()?, text(r, "name")?)))
                .filter(|(pk, _)| *pk > 0)
                .collect();
            keyed.sort();
            spec.indexes.push(IndexSpec {
                name: "PRIMARY".to_string(),
                kind: IndexKind::Primary,
                columns: keyed.into_iter().map(|(_, c)| c).collect(),
            });
        }

        let indexes = self
            .handle
            .query_sql(&format!("PRAGMA index_list({})", table))?
            .collect_rows()?;
        for row in indexes {
            let origin = text(&row, "origin").unwrap_or_default();
            if origin == "pk" {
                continue;
            }
            let Some(physical) = text(&row, "name") else { continue };
            let columns = self
                .handle
                .query_sql(&format!(
                    "PRAGMA index_info({})",
                    BackendKind::Sqlite.quote_identifier(&physical)
                ))?
                .collect_rows()?
                .iter()
                .filter_map(|r| text(r, "name"))
                .collect();
            spec.indexes.push(IndexSpec {
                name: self.logical_index_name(&physical),
                kind: if truthy(row.get("unique")) {
                    IndexKind::Unique
                } else {
                    IndexKind::Index
                },
                columns,
            });
        }
        Ok(())
    }

    fn describe_mysql(&mut self, spec: &mut TableSpec) -> Result<()> {
        let physical = self.physical(&spec.name);
        let columns = self
            .handle
            .query(
                Query::new(
                    "SELECT COLUMN_NAME AS name, COLUMN_TYPE AS type, IS_NULLABLE AS nullable, \
                     COLUMN_DEFAULT AS dflt, COLUMN_COMMENT AS comment, EXTRA AS extra \
                     FROM information_schema.columns \
                     WHERE table_schema = DATABASE() AND table_name = ? ORDER BY ORDINAL_POSITION",
                )
                .bind(physical.clone()),
            )?
            .collect_rows()?;

        for row in &columns {
            let (mut ty, mut flags) = parse_declared_type(&text(row, "type").unwrap_or_default());
            let extra = text(row, "extra").unwrap_or_default().to_ascii_lowercase();
            if extra.contains("auto_increment") {
                if flags.contains(ColumnFlags::BIG) {
                    flags = ColumnFlags::BIG;
                } else {
                    flags = ColumnFlags::NONE;
                }
                ty = ColumnType::Serial;
            } else if !truthy(row.get("nullable")) {
                flags |= ColumnFlags::NOT_NULL;
            }
            let mut column = ColumnSpec::new(text(row, "name").unwrap_or_default(), ty).flags(flags);
            if column.ty != ColumnType::Serial {
                column.default = text(row, "dflt").map(ColumnDefault::Expr);
            }
            column.comment = text(row, "comment").filter(|c| !c.is_empty());
            spec.columns.push(column);
        }

        let rows = self
            .handle
            .query(
                Query::new(
                    "SELECT INDEX_NAME AS name, NON_UNIQUE AS non_unique, COLUMN_NAME AS column_name \
                     FROM information_schema.statistics \
                     WHERE table_schema = DATABASE() AND table_name = ? \
                     ORDER BY INDEX_NAME, SEQ_IN_INDEX",
                )
                .bind(physical),
            )?
            .collect_rows()?;
        let has_serial = spec.columns.iter().any(|c| c.ty == ColumnType::Serial);
        for row in rows {
            let name = text(&row, "name").unwrap_or_default();
            let kind = if name == "PRIMARY" {
                IndexKind::Primary
            } else if truthy(row.get("non_unique")) {
                IndexKind::Index
            } else {
                IndexKind::Unique
            };
            if kind == IndexKind::Primary && has_serial {
                continue;
            }
            let column = text(&row, "column_name").unwrap_or_default();
            self.push_index_column(spec, name, kind, column);
        }
        Ok(())
    }

    fn describe_postgres(&mut self, spec: &mut TableSpec) -> Result<()> {
        let regclass = self.handle.table_name(&spec.name);
        let columns = self
            .handle
            .query(
                Query::new(
                    "SELECT a.attname AS name, format_type(a.atttypid, a.atttypmod) AS type, \
                     a.attnotnull AS notnull, pg_get_expr(d.adbin, d.adrelid) AS dflt, \
                     col_description(a.attrelid, a.attnum) AS comment \
                     FROM pg_attribute a \
                     LEFT JOIN pg_attrdef d ON d.adrelid = a.attrelid AND d.adnum = a.attnum \
                     WHERE a.attrelid = ?::regclass AND a.attnum > 0 AND NOT a.attisdropped \
                     ORDER BY a.attnum",
                )
                .bind(regclass.clone()),
            )?
            .collect_rows()?;

        for row in &columns {
            let (mut ty, mut flags) = parse_declared_type(&text(row, "type").unwrap_or_default());
            let default = text(row, "dflt");
            let serial = default.as_deref().map_or(false, |d| d.starts_with("nextval("));
            if serial {
                flags = if flags.contains(ColumnFlags::BIG) {
                    ColumnFlags::BIG
                } else {
                    ColumnFlags::NONE
                };
                ty = ColumnType::Serial;
            } else if truthy(row.get("notnull")) {
                flags |= ColumnFlags::NOT_NULL;
            }
            let mut column = ColumnSpec::new(text(row, "name").unwrap_or_default(), ty).flags(flags);
            if !serial {
                column.default = default.map(ColumnDefault::Expr);
            }
            column.comment = text(row, "comment");
            spec.columns.push(column);
        }

        let rows = self
            .handle
            .query(
                Query::new(
                    "SELECT i.relname AS name, ix.indisunique AS is_unique, \
                     ix.indisprimary AS is_primary, a.attname AS column_name \
                     FROM pg_index ix \
                     JOIN pg_class i ON i.oid = ix.indexrelid \
                     JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = ANY(ix.indkey) \
                     WHERE ix.indrelid = ?::regclass \
                     ORDER BY i.relname, array_position(ix.indkey, a.attnum)",
                )
                .bind(regclass),
            )?
            .collect_rows()?;
        let has_serial = spec.columns.iter().any(|c| c.ty == ColumnType::Serial);
        for row in rows {
            let kind = if truthy(row.get("is_primary")) {
                IndexKind::Primary
            } else if truthy(row.get("is_unique")) {
                IndexKind::Unique
            } else {
                IndexKind::Index
            };
            if kind == IndexKind::Primary && has_serial {
                continue;
            }
            let name = match kind {
                IndexKind::Primary => "PRIMARY".to_string(),
                _ => text(&row, "name").unwrap_or_default(),
            };
            let column = text(&row, "column_name").unwrap_or_default();
            self.push_index_column(spec, name, kind, column);
        }
        Ok(())
    }

    fn logical_index_name(&self, physical: &str) -> String {
        let tables = self.handle.tables();
        let name = physical.strip_prefix(tables.prefix.as_str()).unwrap_or(physical);
        name.strip_suffix(tables.suffix.as_str()).unwrap_or(name).to_string()
    }

    /// Appends to the last index when rows arrive grouped by index name.
    fn push_index_column(&self, spec: &mut TableSpec, physical: String, kind: IndexKind, column: String) {
        let name = if kind == IndexKind::Primary {
            physical
        } else {
            self.logical_index_name(&physical)
        };
        match spec.indexes.last_mut() {
            Some(last) if last.name == name => last.columns.push(column),
            _ => spec.indexes.push(IndexSpec {
                name,
                kind,
                columns: vec![column],
            }),
        }
    }

    /// Resolves `spec` according to its creation mode.
    ///
    /// `Existing` introspects the live table, `CreateIfNeeded` creates the
    /// table only when absent and `CreateAlways` drops and recreates it.
    pub fn resolve(&mut self, spec: TableSpec) -> Result<TableSpec> {
        match spec.mode {
            CreationMode::Existing => self.describe(&spec.name),
            CreationMode::CreateIfNeeded => {
                if self.table_exists(&spec.name)? {
                    self.describe(&spec.name)
                } else {
                    self.create_table(&spec)?;
                    Ok(spec)
                }
            }
            CreationMode::CreateAlways => {
                self.drop_table(&spec.name)?;
                self.create_table(&spec)?;
                Ok(spec)
            }
        }
    }

    pub fn create_table(&mut self, spec: &TableSpec) -> Result<()> {
        let statements = create_table_sql(self.handle.kind(), self.handle.tables(), spec)?;
        info!("Creating table {}", self.physical(&spec.name));
        self.run_all(statements)
    }

    pub fn drop_table(&mut self, name: &str) -> Result<()> {
        let sql = drop_table_sql(self.handle.kind(), self.handle.tables(), name);
        self.handle.execute_sql(&sql).map(|_| ())
    }

    pub fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<()> {
        let statements = add_column_sql(self.handle.kind(), self.handle.tables(), table, column)?;
        self.run_all(statements)
    }

    pub fn drop_column(&mut self, table: &str, column: &str) -> Result<()> {
        let sql = drop_column_sql(self.handle.kind(), self.handle.tables(), table, column);
        self.handle.execute_sql(&sql).map(|_| ())
    }

    pub fn create_index(&mut self, table: &str, index: &IndexSpec) -> Result<()> {
        let sql = create_index_sql(self.handle.kind(), self.handle.tables(), table, index)?;
        self.handle.execute_sql(&sql).map(|_| ())
    }

    pub fn drop_index(&mut self, table: &str, index: &str) -> Result<()> {
        let sql = drop_index_sql(self.handle.kind(), self.handle.tables(), table, index);
        self.handle.execute_sql(&sql).map(|_| ())
    }
}
