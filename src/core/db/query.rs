/// Query Execution Module
///
/// This module turns SQL templates into backend SQL text and wraps the row
/// stream a driver returns in a forward-only cursor.
///
/// A template may contain two kinds of tokens:
/// - `?` is replaced, left to right, by the quoted form of the next bound value.
/// - `{name}` is replaced by the quoted physical table name for `name`, after
///   alias lookup and prefix/suffix decoration.
///
/// Only the template is scanned; text coming from bound values is never
/// interpreted as tokens.
use crate::core::db::backend::{BackendKind, RowStream};
use crate::core::db::connection::ConnectionHandle;
use crate::core::db::taxonomy::classify_error;
use crate::core::{DbError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\?|\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("token pattern is valid")
});

/// A value bound to a query or read back from a row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
    /// Composite values cannot be quoted; binding one is a query error.
    List(Vec<Value>),
    /// Composite values cannot be quoted; binding one is a query error.
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view of the value. Numeric text is parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            Value::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(t) => Some(t),
            _ => None,
        }
    }

    /// Boolean view; understands the `'Y'`/`'N'` storage convention.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            Value::Text(t) => match t.as_str() {
                "Y" | "y" | "1" | "t" | "true" => Some(true),
                "N" | "n" | "0" | "f" | "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Composite values are lists and maps
    pub fn is_composite(&self) -> bool {
        matches!(self, Value::List(_) | Value::Map(_))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => f.write_str(if *b { "Y" } else { "N" }),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(t) => f.write_str(t),
            Value::Blob(b) => write!(f, "<BLOB: {} bytes>", b.len()),
            Value::List(items) => write!(f, "[{} items]", items.len()),
            Value::Map(entries) => write!(f, "{{{} entries}}", entries.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Value::Int)
                .unwrap_or_else(|| Value::Float(n.as_f64().unwrap_or(f64::NAN))),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(entries) => Value::Map(
                entries.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
            ),
        }
    }
}

/// Quotes a value as a SQL literal for `kind`.
///
/// `NULL` for null, `'Y'`/`'N'` for booleans, and a backend-native string
/// literal for everything else, numbers included: `7` becomes `'7'`.
///
/// # Errors
///
/// Returns `DbError::Query` for lists and maps.
pub fn quote(kind: BackendKind, value: &Value) -> Result<String> {
    match value {
        Value::Null => Ok("NULL".to_string()),
        Value::Bool(true) => Ok("'Y'".to_string()),
        Value::Bool(false) => Ok("'N'".to_string()),
        Value::Int(i) => Ok(kind.quote_string(&i.to_string())),
        Value::Float(f) => Ok(kind.quote_string(&f.to_string())),
        Value::Text(t) => Ok(kind.quote_string(t)),
        Value::Blob(b) => Ok(kind.quote_blob(b)),
        Value::List(_) | Value::Map(_) => Err(DbError::query(format!(
            "cannot quote composite value {}",
            value
        ))),
    }
}

/// Table name decoration: aliases, then prefix and suffix.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableNames {
    pub prefix: String,
    pub suffix: String,
    pub aliases: HashMap<String, String>,
}

impl TableNames {
    /// Physical, unquoted name for a logical table name
    pub fn decorate(&self, name: &str) -> String {
        let base = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        format!("{}{}{}", self.prefix, base, self.suffix)
    }

    /// Physical name quoted for `kind`
    pub fn qualified(&self, kind: BackendKind, name: &str) -> String {
        kind.quote_identifier(&self.decorate(name))
    }
}

/// An SQL template plus its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    template: String,
    params: Vec<Value>,
}

impl Query {
    /// Creates a query with no bound values
    pub fn new(template: impl Into<String>) -> Self {
        Query {
            template: template.into(),
            params: Vec::new(),
        }
    }

    /// Creates a query with all of its values at once
    pub fn with_params(template: impl Into<String>, params: Vec<Value>) -> Self {
        Query {
            template: template.into(),
            params,
        }
    }

    /// Binds the next positional value.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Number of `?` placeholders in the template
    pub fn placeholder_count(&self) -> usize {
        TOKEN
            .find_iter(&self.template)
            .filter(|m| m.as_str() == "?")
            .count()
    }

    /// Renders backend SQL text.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` when the number of bound values differs from
    /// the number of placeholders, or when a value cannot be quoted.
    pub fn render(&self, kind: BackendKind, tables: &TableNames) -> Result<String> {
        let expected = self.placeholder_count();
        if expected != self.params.len() {
            return Err(DbError::query(format!(
                "query has {} placeholders but {} values were bound: {}",
                expected,
                self.params.len(),
                self.template
            )));
        }

        let mut sql = String::with_capacity(self.template.len() + 16 * self.params.len());
        let mut params = self.params.iter();
        let mut last = 0;
        for caps in TOKEN.captures_iter(&self.template) {
            let Some(token) = caps.get(0) else { continue };
            sql.push_str(&self.template[last..token.start()]);
            match caps.get(1) {
                Some(name) => sql.push_str(&tables.qualified(kind, name.as_str())),
                None => {
                    let value = params
                        .next()
                        .ok_or_else(|| DbError::query("ran out of bound values"))?;
                    sql.push_str(&quote(kind, value)?);
                }
            }
            last = token.end();
        }
        sql.push_str(&self.template[last..]);
        Ok(sql)
    }
}

impl From<&str> for Query {
    fn from(template: &str) -> Self {
        Query::new(template)
    }
}

impl From<String> for Query {
    fn from(template: String) -> Self {
        Query::new(template)
    }
}

/// One result row: field name to value.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Value of the named field
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == name)
            .and_then(|i| self.values.get(i))
    }

    /// Value at a column position
    pub fn get_index(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Converts the row into an owned field map
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.iter().cloned().zip(self.values).collect()
    }
}

/// Forward-only, non-restartable cursor over a result set.
///
/// Rows are pulled from the driver one at a time as they are fetched.
/// [`Cursor::fetch`] returns `None` once the rows are exhausted; that `None`
/// is the end-of-data sentinel and stays `None` for every later call.
///
/// Failures while stepping are categorized but do not go through the
/// reconnect policy; the statement has already started by then.
pub struct Cursor {
    kind: BackendKind,
    columns: Arc<[String]>,
    rows: Box<dyn RowStream>,
    started: bool,
    exhausted: bool,
}

impl Cursor {
    pub(crate) fn new(kind: BackendKind, rows: Box<dyn RowStream>) -> Self {
        Cursor {
            kind,
            columns: rows.columns().into(),
            rows,
            started: false,
            exhausted: false,
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Next row, or `None` at end of data.
    pub fn fetch(&mut self) -> Result<Option<Row>> {
        if self.exhausted {
            return Ok(None);
        }
        self.started = true;
        match self.rows.next_row() {
            Ok(Some(values)) => Ok(Some(Row {
                columns: Arc::clone(&self.columns),
                values,
            })),
            Ok(None) => {
                self.exhausted = true;
                Ok(None)
            }
            Err(e) => {
                self.exhausted = true;
                Err(classify_error(self.kind, e))
            }
        }
    }

    /// Rewinding is only possible before the first fetch, where it is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Query` once any row has been fetched.
    pub fn rewind(&mut self) -> Result<()> {
        if self.started {
            Err(DbError::query("cursor is forward-only and cannot be rewound"))
        } else {
            Ok(())
        }
    }

    /// Drains the remaining rows
    pub fn collect_rows(self) -> Result<Vec<Row>> {
        self.collect()
    }
}

impl Iterator for Cursor {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Result<Row>> {
        self.fetch().transpose()
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("kind", &self.kind)
            .field("columns", &self.columns)
            .field("started", &self.started)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl ConnectionHandle {
    /// Quotes a value for this handle's backend.
    pub fn quote(&self, value: &Value) -> Result<String> {
        quote(self.kind(), value)
    }

    /// Physical, quoted name for a logical table name
    pub fn table_name(&self, name: &str) -> String {
        self.tables().qualified(self.kind(), name)
    }

    /// Renders `query` into this backend's SQL text without running it.
    pub fn render(&self, query: &Query) -> Result<String> {
        query.render(self.kind(), self.tables())
    }

    /// Executes a statement that produces no rows
    ///
    /// # Returns
    ///
    /// The number of affected rows.
    ///
    /// # Errors
    ///
    /// Any of the four error categories; network faults may already have been
    /// recovered from by the connection layer.
    pub fn execute(&mut self, query: impl Into<Query>) -> Result<u64> {
        let sql = self.render(&query.into())?;
        self.execute_sql(&sql)
    }

    /// Runs a query and returns a cursor over its rows.
    pub fn query(&mut self, query: impl Into<Query>) -> Result<Cursor> {
        let sql = self.render(&query.into())?;
        self.query_sql(&sql)
    }

    /// Executes SQL text as is, without token substitution.
    pub fn execute_sql(&mut self, sql: &str) -> Result<u64> {
        self.run(sql, |driver, sql| driver.execute(sql))
    }

    /// Runs SQL text as is and returns a cursor over its rows.
    pub fn query_sql(&mut self, sql: &str) -> Result<Cursor> {
        let rows = self.run(sql, |driver, sql| driver.query(sql))?;
        Ok(Cursor::new(self.kind(), rows))
    }

    /// First row of a query, if any
    pub fn query_one(&mut self, query: impl Into<Query>) -> Result<Option<Row>> {
        self.query(query)?.fetch()
    }

    /// First column of the first row, if any
    pub fn query_value(&mut self, query: impl Into<Query>) -> Result<Option<Value>> {
        Ok(self
            .query_one(query)?
            .and_then(|row| row.values.into_iter().next()))
    }

    /// Id generated by the last insert on this connection
    pub fn last_insert_id(&mut self) -> Option<i64> {
        self.driver_mut().and_then(|d| d.last_insert_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::backend::{DriverRegistry, NativeError, NativeResult, RowSet};
    use crate::core::db::params::ConnectionContext;
    use crate::core::ErrorCategory;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn names() -> TableNames {
        let mut tables = TableNames {
            prefix: "dev_".to_string(),
            suffix: String::new(),
            aliases: HashMap::new(),
        };
        tables.aliases.insert("items".to_string(), "widgets".to_string());
        tables
    }

    #[test]
    fn test_quote_contract() {
        let kind = BackendKind::Sqlite;
        assert_eq!(quote(kind, &Value::Null).unwrap(), "NULL");
        assert_eq!(quote(kind, &Value::Bool(true)).unwrap(), "'Y'");
        assert_eq!(quote(kind, &Value::Bool(false)).unwrap(), "'N'");
        assert_eq!(quote(kind, &Value::Int(-7)).unwrap(), "'-7'");
        assert_eq!(quote(kind, &Value::Float(1.5)).unwrap(), "'1.5'");
        assert_eq!(quote(kind, &Value::from("it's")).unwrap(), "'it''s'");

        match quote(kind, &Value::List(vec![Value::Int(1)])) {
            Err(DbError::Query { .. }) => {}
            _ => panic!("Expected Query error"),
        }
        assert!(quote(kind, &Value::Map(BTreeMap::new())).is_err());
    }

    #[test]
    fn test_numbers_quote_as_string_literals() {
        assert_eq!(quote(BackendKind::Mysql, &Value::Int(42)).unwrap(), "'42'");
        assert_eq!(quote(BackendKind::Postgres, &Value::Float(0.25)).unwrap(), "'0.25'");
        assert_eq!(quote(BackendKind::Sqlite, &Value::Float(f64::NAN)).unwrap(), "'NaN'");
        assert_eq!(quote(BackendKind::Sqlite, &Value::Float(f64::INFINITY)).unwrap(), "'inf'");

        let sql = Query::new("SELECT * FROM {t} WHERE id = ? AND score > ?")
            .bind(3)
            .bind(-1.5)
            .render(BackendKind::Sqlite, &TableNames::default())
            .unwrap();
        assert_eq!(sql, "SELECT * FROM \"t\" WHERE id = '3' AND score > '-1.5'");
    }

    #[test]
    fn test_render_placeholders_in_order() {
        let query = Query::new("INSERT INTO {items} (name, active, size) VALUES (?, ?, ?)")
            .bind("bolt")
            .bind(true)
            .bind(Option::<i64>::None);

        let sql = query.render(BackendKind::Mysql, &names()).unwrap();
        assert_eq!(
            sql,
            "INSERT INTO `dev_widgets` (name, active, size) VALUES ('bolt', 'Y', NULL)"
        );
    }

    #[test]
    fn test_bound_text_is_not_rescanned() {
        let query = Query::new("SELECT * FROM {t} WHERE a = ? AND b = ?")
            .bind("what?")
            .bind("{t}");
        let sql = query.render(BackendKind::Sqlite, &TableNames::default()).unwrap();
        assert_eq!(sql, "SELECT * FROM \"t\" WHERE a = 'what?' AND b = '{t}'");
    }

    #[test]
    fn test_arity_mismatch_is_query_error() {
        let too_few = Query::new("SELECT ?, ?").bind(1);
        match too_few.render(BackendKind::Sqlite, &TableNames::default()) {
            Err(DbError::Query { message, .. }) => assert!(message.contains("2 placeholders")),
            _ => panic!("Expected Query error"),
        }

        let too_many = Query::new("SELECT ?").bind(1).bind(2);
        assert!(too_many.render(BackendKind::Sqlite, &TableNames::default()).is_err());
    }

    #[test]
    fn test_braces_that_are_not_identifiers_stay() {
        let query = Query::new("SELECT '{1}', '{ spaced }'");
        let sql = query.render(BackendKind::Sqlite, &TableNames::default()).unwrap();
        assert_eq!(sql, "SELECT '{1}', '{ spaced }'");
    }

    #[test]
    fn test_json_conversion() {
        let value = Value::from(serde_json::json!({"a": [1, 2]}));
        assert!(value.is_composite());
        assert_eq!(Value::from(serde_json::json!(3)), Value::Int(3));
        assert_eq!(Value::from(serde_json::json!("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_value_views() {
        assert_eq!(Value::from("Y").as_bool(), Some(true));
        assert_eq!(Value::from("N").as_bool(), Some(false));
        assert_eq!(Value::from("42").as_i64(), Some(42));
        assert_eq!(Value::Int(3).as_i64(), Some(3));
        assert!(Value::Null.is_null());
    }

    fn cursor(rows: Vec<Vec<Value>>) -> Cursor {
        let rows = RowSet {
            columns: vec!["id".to_string(), "name".to_string()],
            rows,
        };
        Cursor::new(BackendKind::Sqlite, rows.into_stream())
    }

    /// Hands out `limit` rows, then fails; counts the rows stepped so far.
    struct Numbered {
        columns: Vec<String>,
        stepped: Arc<AtomicUsize>,
        limit: usize,
    }

    impl RowStream for Numbered {
        fn columns(&self) -> &[String] {
            &self.columns
        }

        fn next_row(&mut self) -> NativeResult<Option<Vec<Value>>> {
            let n = self.stepped.fetch_add(1, Ordering::SeqCst);
            if n < self.limit {
                Ok(Some(vec![Value::Int(n as i64)]))
            } else {
                Err(NativeError::new("5", "database is locked"))
            }
        }
    }

    #[test]
    fn test_cursor_is_forward_only() {
        let mut cursor = cursor(vec![
            vec![Value::Int(1), Value::from("a")],
            vec![Value::Int(2), Value::from("b")],
        ]);

        // rewinding an untouched cursor is allowed
        assert!(cursor.rewind().is_ok());

        let first = cursor.fetch().unwrap().unwrap();
        assert_eq!(first.get("name"), Some(&Value::from("a")));
        assert!(cursor.rewind().is_err());

        let second = cursor.fetch().unwrap().unwrap();
        assert_eq!(second.into_map().get("id"), Some(&Value::Int(2)));
        assert!(cursor.fetch().unwrap().is_none());
        assert!(cursor.fetch().unwrap().is_none());
    }

    #[test]
    fn test_cursor_pulls_rows_one_at_a_time() {
        let stepped = Arc::new(AtomicUsize::new(0));
        let mut cursor = Cursor::new(
            BackendKind::Sqlite,
            Box::new(Numbered {
                columns: vec!["n".to_string()],
                stepped: Arc::clone(&stepped),
                limit: 2,
            }),
        );
        assert_eq!(stepped.load(Ordering::SeqCst), 0);

        let first = cursor.fetch().unwrap().unwrap();
        assert_eq!(first.get("n"), Some(&Value::Int(0)));
        assert_eq!(stepped.load(Ordering::SeqCst), 1);

        cursor.fetch().unwrap().unwrap();
        let err = cursor.fetch().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Rollback);
        // a failed cursor is finished
        assert!(cursor.fetch().unwrap().is_none());
        assert_eq!(stepped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_handle_cursor_streams_from_sqlite() {
        let mut handle = ConnectionHandle::open(
            "sqlite:///:memory:",
            ConnectionContext::Request,
            &DriverRegistry::with_defaults(),
        )
        .unwrap();

        let squares: Vec<i64> = handle
            .query("WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT x * x AS sq FROM n")
            .unwrap()
            .take(4)
            .map(|row| row.unwrap().get("sq").and_then(Value::as_i64).unwrap())
            .collect();
        assert_eq!(squares, vec![1, 4, 9, 16]);

        // the unfinished statement does not block the connection
        assert_eq!(handle.query_value("SELECT 'next'").unwrap(), Some(Value::from("next")));
    }
}
