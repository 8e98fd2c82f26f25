/// Schema Migration Module
///
/// Applies versioned, per-module schema updates. Each module owns one integer
/// version stored in a shared metadata table; `setup()` walks a module (and,
/// first, everything it depends on) from its stored version up to its latest
/// version, one transaction per step.
///
/// Each step re-reads the stored version inside its own transaction before
/// doing any work, locking the version row where the backend supports it. A
/// second setup process racing on the same module sees the version already
/// advanced, rolls back and moves on without calling the module again. The
/// version write itself only succeeds from the version that was read, so a
/// racer that slips past the read is rolled back and replayed.
use crate::core::db::backend::BackendKind;
use crate::core::db::cancel::Deadline;
use crate::core::db::connection::ConnectionHandle;
use crate::core::db::query::{Query, Value};
use crate::core::db::schema::{ColumnSpec, ColumnType, CreationMode, IndexSpec, TableSpec};
use crate::core::db::taxonomy::is_unique_violation;
use crate::core::db::transaction::Outcome;
use crate::core::{DbError, Result};
use chrono::{NaiveDateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub mod script;

pub use script::ScriptModule;

/// Default logical name of the metadata table
pub const DEFAULT_METADATA_TABLE: &str = "module_versions";
/// Default number of attempts for each step transaction
pub const DEFAULT_MAX_RETRIES: u32 = 5;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A named, independently versioned owner of schema objects.
pub trait SchemaModule {
    /// Module identifier, e.g. `com.example.widgets`
    fn id(&self) -> &str;

    /// Version the module's schema should end up at
    fn latest_version(&self) -> u32;

    /// Modules that must be fully migrated before this one
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Brings the schema from `version - 1` to `version`.
    ///
    /// Runs inside a transaction that may be replayed, so it must not have
    /// side effects outside the database. The returned text is stored as the
    /// version comment.
    fn update_schema(&self, handle: &mut ConnectionHandle, version: u32) -> Result<Option<String>>;
}

/// A stored module version row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleVersion {
    pub module: String,
    pub version: u32,
    pub updated: Option<NaiveDateTime>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    /// Another process got there first
    AlreadyApplied,
}

/// Progress of one version step, handed to the step observer.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub module: String,
    pub from: u32,
    pub to: u32,
    pub outcome: StepOutcome,
    pub comment: Option<String>,
    pub elapsed: Duration,
}

enum StepResult {
    Applied(Option<String>),
    Raced(u32),
}

type StepObserver = Box<dyn FnMut(&StepReport)>;

/// Registry of schema modules and the engine that migrates them.
pub struct MigrationRunner {
    modules: BTreeMap<String, Box<dyn SchemaModule>>,
    metadata_table: String,
    max_retries: u32,
    deadline: Deadline,
    observer: Option<StepObserver>,
}

impl Default for MigrationRunner {
    fn default() -> Self {
        MigrationRunner::new()
    }
}

impl MigrationRunner {
    pub fn new() -> Self {
        MigrationRunner {
            modules: BTreeMap::new(),
            metadata_table: DEFAULT_METADATA_TABLE.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            deadline: Deadline::none(),
            observer: None,
        }
    }

    /// Logical name of the metadata table; handle prefix and suffix apply.
    pub fn with_metadata_table(mut self, name: impl Into<String>) -> Self {
        self.metadata_table = name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Calls `observer` after every version step.
    pub fn on_step(mut self, observer: impl FnMut(&StepReport) + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Adds a module.
    ///
    /// # Errors
    ///
    /// Returns `DbError::Config` if a module with the same id is registered.
    pub fn register(&mut self, module: Box<dyn SchemaModule>) -> Result<()> {
        let id = module.id().to_string();
        if self.modules.contains_key(&id) {
            return Err(DbError::Config(format!("module {} is registered twice", id)));
        }
        self.modules.insert(id, module);
        Ok(())
    }

    /// Registered (id, latest version) pairs, sorted by id
    pub fn modules(&self) -> Vec<(&str, u32)> {
        self.modules
            .values()
            .map(|m| (m.id(), m.latest_version()))
            .collect()
    }

    /// Orders `roots` and everything they depend on so that every module
    /// comes after its dependencies.
    ///
    /// # Errors
    ///
    /// `DbError::UnknownModule` for ids that are not registered and
    /// `DbError::DependencyCycle` with the offending path.
    pub fn resolve_order(&self, roots: &[&str]) -> Result<Vec<String>> {
        let mut order = Vec::new();
        let mut done = HashSet::new();
        let mut path = Vec::new();
        for root in roots {
            self.visit(root, &mut path, &mut done, &mut order)?;
        }
        Ok(order)
    }

    fn visit(
        &self,
        id: &str,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
        order: &mut Vec<String>,
    ) -> Result<()> {
        if done.contains(id) {
            return Ok(());
        }
        if let Some(start) = path.iter().position(|p| p == id) {
            let mut cycle = path[start..].to_vec();
            cycle.push(id.to_string());
            return Err(DbError::DependencyCycle(cycle));
        }
        let module = self
            .modules
            .get(id)
            .ok_or_else(|| DbError::UnknownModule(id.to_string()))?;

        path.push(id.to_string());
        for dependency in module.dependencies() {
            self.visit(&dependency, path, done, order)?;
        }
        path.pop();

        done.insert(id.to_string());
        order.push(id.to_string());
        Ok(())
    }

    /// Migrates `id` to its latest version, dependencies first.
    ///
    /// # Returns
    ///
    /// The module's version after the run.
    ///
    /// # Errors
    ///
    /// A failing step aborts the whole run with `DbError::Migration` naming
    /// the module and the version pair; steps committed before it stay
    /// committed.
    pub fn setup(&mut self, handle: &mut ConnectionHandle, id: &str) -> Result<u32> {
        let order = self.resolve_order(&[id])?;
        let versions = self.run(handle, &order)?;
        Ok(versions.last().map_or(0, |(_, v)| *v))
    }

    /// Migrates the given modules and their dependencies.
    pub fn setup_modules(&mut self, handle: &mut ConnectionHandle, ids: &[&str]) -> Result<Vec<(String, u32)>> {
        let order = self.resolve_order(ids)?;
        self.run(handle, &order)
    }

    /// Migrates every registered module.
    pub fn setup_all(&mut self, handle: &mut ConnectionHandle) -> Result<Vec<(String, u32)>> {
        let ids: Vec<String> = self.modules.keys().cloned().collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.setup_modules(handle, &ids)
    }

    fn run(&mut self, handle: &mut ConnectionHandle, order: &[String]) -> Result<Vec<(String, u32)>> {
        let previous = handle.set_deadline(self.deadline.clone());
        let result = self.run_inner(handle, order);
        handle.set_deadline(previous);
        result
    }

    fn run_inner(&mut self, handle: &mut ConnectionHandle, order: &[String]) -> Result<Vec<(String, u32)>> {
        self.ensure_metadata_table(handle)?;
        let mut versions = Vec::with_capacity(order.len());
        for id in order {
            let version = self.migrate_module(handle, id)?;
            versions.push((id.clone(), version));
        }
        Ok(versions)
    }

    fn migrate_module(&mut self, handle: &mut ConnectionHandle, id: &str) -> Result<u32> {
        let module = self
            .modules
            .get(id)
            .ok_or_else(|| DbError::UnknownModule(id.to_string()))?;
        let latest = module.latest_version();
        let table = self.metadata_table.as_str();
        let mut current = read_version(handle, table, id)?;
        if current >= latest {
            debug!(module = id, version = current, "Module is up to date");
        }

        while current < latest {
            let target = current + 1;
            let started = Instant::now();
            let wrap = |source: DbError| DbError::Migration {
                module: id.to_string(),
                from: current,
                to: target,
                source: Box::new(source),
            };
            self.deadline.check("migration").map_err(wrap)?;

            let step = handle
                .perform_outcome(self.max_retries, |h| {
                    let stored = lock_version(h, table, id)?;
                    if stored >= target {
                        return Ok(Outcome::Rollback(StepResult::Raced(stored)));
                    }
                    let comment = module.update_schema(h, target)?;
                    write_version(h, table, id, stored, target, comment.as_deref())?;
                    Ok(Outcome::Commit(StepResult::Applied(comment)))
                })
                .map_err(wrap)?;

            let (outcome, comment, reached) = match step {
                StepResult::Applied(comment) => {
                    info!(module = id, from = current, to = target, "Schema step applied");
                    (StepOutcome::Applied, comment, target)
                }
                StepResult::Raced(stored) => {
                    info!(module = id, version = stored, "Schema step already applied by another process");
                    (StepOutcome::AlreadyApplied, None, stored)
                }
            };

            if let Some(observer) = self.observer.as_mut() {
                observer(&StepReport {
                    module: id.to_string(),
                    from: current,
                    to: target,
                    outcome,
                    comment,
                    elapsed: started.elapsed(),
                });
            }
            current = reached;
        }
        Ok(current)
    }

    fn metadata_spec(&self) -> TableSpec {
        TableSpec::new(self.metadata_table.clone(), CreationMode::CreateIfNeeded)
            .column(ColumnSpec::new("module", ColumnType::Varchar(128)).not_null())
            .column(ColumnSpec::new("version", ColumnType::Int).not_null())
            .column(ColumnSpec::new("updated", ColumnType::Datetime).not_null())
            .column(ColumnSpec::new("comment", ColumnType::Text))
            .index(IndexSpec::primary(&["module"]))
    }

    /// Creates the metadata table on first use.
    pub fn ensure_metadata_table(&self, handle: &mut ConnectionHandle) -> Result<()> {
        let spec = self.metadata_spec();
        let mut catalog = handle.catalog();
        if catalog.table_exists(&spec.name)? {
            return Ok(());
        }
        match catalog.create_table(&spec) {
            Ok(()) => Ok(()),
            // A concurrent setup may have created it in the meantime
            Err(err) if catalog.table_exists(&spec.name).unwrap_or(false) => {
                debug!("Metadata table appeared concurrently: {}", err);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Stored versions, sorted by module id.
    pub fn status(&self, handle: &mut ConnectionHandle) -> Result<Vec<ModuleVersion>> {
        if !handle.catalog().table_exists(&self.metadata_table)? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT module, version, updated, comment FROM {} ORDER BY module",
            handle.table_name(&self.metadata_table)
        );
        let rows = handle.query_sql(&sql)?;
        rows.map(|row| {
            let row = row?;
            let module = row
                .get("module")
                .and_then(Value::as_str)
                .ok_or_else(|| DbError::query("metadata row without a module id"))?
                .to_string();
            Ok(ModuleVersion {
                module,
                version: version_of(row.get("version"))?,
                updated: row
                    .get("updated")
                    .and_then(Value::as_str)
                    .and_then(|t| NaiveDateTime::parse_from_str(t, TIMESTAMP_FORMAT).ok()),
                comment: row.get("comment").and_then(Value::as_str).map(String::from),
            })
        })
        .collect()
    }

    /// Stored version of one module, 0 when it was never migrated.
    pub fn version(&self, handle: &mut ConnectionHandle, id: &str) -> Result<u32> {
        if !handle.catalog().table_exists(&self.metadata_table)? {
            return Ok(0);
        }
        read_version(handle, &self.metadata_table, id)
    }
}

fn version_of(value: Option<&Value>) -> Result<u32> {
    let version = match value {
        None | Some(Value::Null) => return Ok(0),
        Some(Value::Text(t)) => t.trim().parse::<i64>().ok(),
        Some(other) => other.as_i64(),
    };
    version
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| DbError::query(format!("stored module version is not a version number: {:?}", value)))
}

fn read_version(handle: &mut ConnectionHandle, table: &str, id: &str) -> Result<u32> {
    let query = Query::new(format!(
        "SELECT version FROM {} WHERE module = ?",
        handle.table_name(table)
    ))
    .bind(id);
    version_of(handle.query_value(query)?.as_ref())
}

/// Reads the stored version inside a step transaction, locking the row.
///
/// SQLite step transactions hold the database write lock from `BEGIN
/// IMMEDIATE` on, so no row lock is taken there.
fn lock_version(handle: &mut ConnectionHandle, table: &str, id: &str) -> Result<u32> {
    let lock = match handle.kind() {
        BackendKind::Sqlite => "",
        BackendKind::Mysql | BackendKind::Postgres => " FOR UPDATE",
    };
    let query = Query::new(format!(
        "SELECT version FROM {} WHERE module = ?{}",
        handle.table_name(table),
        lock
    ))
    .bind(id);
    version_of(handle.query_value(query)?.as_ref())
}

/// Moves the stored version of `id` from `from` to `to`.
///
/// The update only matches a row still at `from`. Finding it moved, or
/// losing the insert of a module's first row to another process, fails with
/// `DbError::Rollback` so the step is replayed against the stored version.
fn write_version(
    handle: &mut ConnectionHandle,
    table: &str,
    id: &str,
    from: u32,
    to: u32,
    comment: Option<&str>,
) -> Result<()> {
    let kind = handle.kind();
    let table = handle.table_name(table);
    let now = Utc::now().naive_utc().format(TIMESTAMP_FORMAT).to_string();
    let updated = handle.execute(
        Query::new(format!(
            "UPDATE {} SET version = ?, updated = ?, comment = ? WHERE module = ? AND version = ?",
            table
        ))
        .bind(to)
        .bind(now.clone())
        .bind(comment)
        .bind(id)
        .bind(from),
    )?;
    if updated > 0 {
        return Ok(());
    }
    if from > 0 {
        return Err(DbError::Rollback {
            message: format!("version of {} is no longer {}", id, from),
            code: None,
        });
    }

    let inserted = handle.execute(
        Query::new(format!(
            "INSERT INTO {} (module, version, updated, comment) VALUES (?, ?, ?, ?)",
            table
        ))
        .bind(id)
        .bind(to)
        .bind(now)
        .bind(comment),
    );
    match inserted {
        Ok(_) => Ok(()),
        Err(err) if err.native_code().map_or(false, |code| is_unique_violation(kind, code)) => {
            Err(DbError::Rollback {
                message: format!("{} was registered by another process: {}", id, err),
                code: err.native_code().map(String::from),
            })
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::db::backend::{DriverRegistry, NativeError, RowSet};
    use crate::core::db::params::ConnectionContext;
    use crate::testing::MockConnector;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Counting {
        id: &'static str,
        latest: u32,
        depends: Vec<String>,
        calls: Rc<RefCell<Vec<(String, u32)>>>,
        fail_at: Option<u32>,
    }

    impl SchemaModule for Counting {
        fn id(&self) -> &str {
            self.id
        }

        fn latest_version(&self) -> u32 {
            self.latest
        }

        fn dependencies(&self) -> Vec<String> {
            self.depends.clone()
        }

        fn update_schema(&self, _handle: &mut ConnectionHandle, version: u32) -> Result<Option<String>> {
            self.calls.borrow_mut().push((self.id.to_string(), version));
            if self.fail_at == Some(version) {
                return Err(DbError::query("step failed"));
            }
            Ok(Some(format!("step {}", version)))
        }
    }

    fn module(id: &'static str, latest: u32, depends: &[&str], calls: &Rc<RefCell<Vec<(String, u32)>>>) -> Box<Counting> {
        Box::new(Counting {
            id,
            latest,
            depends: depends.iter().map(|d| d.to_string()).collect(),
            calls: Rc::clone(calls),
            fail_at: None,
        })
    }

    fn sqlite() -> ConnectionHandle {
        ConnectionHandle::open("sqlite:///:memory:", ConnectionContext::Batch, &DriverRegistry::with_defaults()).unwrap()
    }

    #[test]
    fn test_dependencies_run_first() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("app", 1, &["core", "auth"], &calls)).unwrap();
        runner.register(module("auth", 1, &["core"], &calls)).unwrap();
        runner.register(module("core", 2, &[], &calls)).unwrap();

        assert_eq!(runner.resolve_order(&["app"]).unwrap(), vec!["core", "auth", "app"]);

        let mut handle = sqlite();
        assert_eq!(runner.setup(&mut handle, "app").unwrap(), 1);
        let seen: Vec<(String, u32)> = calls.borrow().clone();
        assert_eq!(
            seen,
            vec![
                ("core".to_string(), 1),
                ("core".to_string(), 2),
                ("auth".to_string(), 1),
                ("app".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_cycle_is_detected() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("a", 1, &["b"], &calls)).unwrap();
        runner.register(module("b", 1, &["c"], &calls)).unwrap();
        runner.register(module("c", 1, &["a"], &calls)).unwrap();

        match runner.resolve_order(&["a"]) {
            Err(DbError::DependencyCycle(path)) => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("Expected DependencyCycle error, got {:?}", other),
        }
        assert!(calls.borrow().is_empty());
    }

    #[test]
    fn test_unknown_dependency() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("a", 1, &["missing"], &calls)).unwrap();
        assert!(matches!(runner.resolve_order(&["a"]), Err(DbError::UnknownModule(id)) if id == "missing"));
        assert!(runner.register(module("a", 2, &[], &calls)).is_err());
    }

    #[test]
    fn test_setup_is_idempotent_and_records_status() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("core", 3, &[], &calls)).unwrap();
        let mut handle = sqlite();

        assert_eq!(runner.version(&mut handle, "core").unwrap(), 0);
        assert_eq!(runner.setup(&mut handle, "core").unwrap(), 3);
        assert_eq!(runner.setup(&mut handle, "core").unwrap(), 3);
        assert_eq!(calls.borrow().len(), 3);

        let status = runner.status(&mut handle).unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].module, "core");
        assert_eq!(status[0].version, 3);
        assert_eq!(status[0].comment.as_deref(), Some("step 3"));
        assert!(status[0].updated.is_some());
    }

    #[test]
    fn test_failed_step_keeps_earlier_steps() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut failing = module("core", 3, &[], &calls);
        failing.fail_at = Some(2);
        let mut runner = MigrationRunner::new();
        runner.register(failing).unwrap();
        let mut handle = sqlite();

        match runner.setup(&mut handle, "core") {
            Err(DbError::Migration { module, from, to, .. }) => {
                assert_eq!(module, "core");
                assert_eq!((from, to), (1, 2));
            }
            other => panic!("Expected Migration error, got {:?}", other),
        }
        assert_eq!(runner.version(&mut handle, "core").unwrap(), 1);
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn test_observer_sees_every_step() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reports);
        let mut runner = MigrationRunner::new()
            .with_metadata_table("schema_versions")
            .on_step(move |report| sink.borrow_mut().push((report.from, report.to, report.outcome)));
        runner.register(module("core", 2, &[], &calls)).unwrap();
        let mut handle = sqlite();

        runner.setup_all(&mut handle).unwrap();
        assert_eq!(
            *reports.borrow(),
            vec![(0, 1, StepOutcome::Applied), (1, 2, StepOutcome::Applied)]
        );
        assert!(handle.catalog().table_exists("schema_versions").unwrap());
    }

    #[test]
    fn test_racer_rolls_back_without_calling_module() {
        let mock = MockConnector::new(BackendKind::Sqlite);
        mock.respond("sqlite_master", versions(Value::Int(1)));
        // the first read sees 0, the read inside the step transaction sees
        // the version another process committed meanwhile
        mock.respond("SELECT version", versions(Value::Int(1)));
        mock.respond_times("SELECT version", 1, RowSet::default());

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("core", 1, &[], &calls)).unwrap();
        let mut handle = mock.batch_handle().unwrap();

        assert_eq!(runner.setup(&mut handle, "core").unwrap(), 1);
        assert!(calls.borrow().is_empty());
        assert_eq!(mock.commit_count(), 0);
        assert_eq!(mock.statements_matching("ROLLBACK"), 1);
        assert_eq!(mock.statements_matching("INSERT"), 0);
    }

    fn versions(value: Value) -> RowSet {
        RowSet {
            columns: vec!["version".to_string()],
            rows: vec![vec![value]],
        }
    }

    #[test]
    fn test_stale_version_write_replays_step() {
        let mock = MockConnector::new(BackendKind::Mysql);
        mock.respond("information_schema.tables", versions(Value::Int(1)));
        // another process moves the version to 2 between our locked read
        // and our write; the replay then reads 2
        mock.respond("SELECT version", versions(Value::Int(2)));
        mock.respond_times("SELECT version", 2, versions(Value::Int(1)));

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("core", 2, &[], &calls)).unwrap();
        let mut handle = mock.batch_handle().unwrap();

        assert_eq!(runner.setup(&mut handle, "core").unwrap(), 2);
        assert_eq!(*calls.borrow(), vec![("core".to_string(), 2)]);
        assert_eq!(mock.statements_matching("FOR UPDATE"), 2);
        assert_eq!(mock.statements_matching("WHERE module = 'core' AND version = '1'"), 1);
        assert_eq!(mock.statements_matching("START TRANSACTION"), 2);
        assert_eq!(mock.statements_matching("INSERT"), 0);
        assert_eq!(mock.commit_count(), 0);
        assert_eq!(handle.transaction_depth(), 0);
    }

    #[test]
    fn test_duplicate_first_registration_replays_step() {
        let mock = MockConnector::new(BackendKind::Mysql);
        mock.respond("information_schema.tables", versions(Value::Int(1)));
        mock.respond("SELECT version", versions(Value::Int(1)));
        mock.respond_times("SELECT version", 2, RowSet::default());
        mock.fail_statement(
            "INSERT INTO",
            1,
            NativeError::new("1062", "Duplicate entry 'core' for key 'PRIMARY'"),
        );

        let calls = Rc::new(RefCell::new(Vec::new()));
        let reports = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&reports);
        let mut runner = MigrationRunner::new().on_step(move |report| sink.borrow_mut().push(report.outcome));
        runner.register(module("core", 1, &[], &calls)).unwrap();
        let mut handle = mock.batch_handle().unwrap();

        assert_eq!(runner.setup(&mut handle, "core").unwrap(), 1);
        assert_eq!(calls.borrow().len(), 1);
        assert_eq!(*reports.borrow(), vec![StepOutcome::AlreadyApplied]);
        assert_eq!(mock.statements_matching("INSERT INTO"), 1);
        assert_eq!(mock.statements_matching("START TRANSACTION"), 2);
        assert_eq!(mock.commit_count(), 0);
    }

    #[test]
    fn test_version_write_commits_when_row_matches() {
        let mock = MockConnector::new(BackendKind::Postgres);
        mock.respond("information_schema.tables", versions(Value::Int(1)));
        mock.respond("SELECT version", versions(Value::Int(3)));
        mock.affect("UPDATE", 1, 1);

        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new();
        runner.register(module("core", 4, &[], &calls)).unwrap();
        let mut handle = mock.batch_handle().unwrap();

        assert_eq!(runner.setup(&mut handle, "core").unwrap(), 4);
        assert_eq!(mock.statements_matching("AND version = '3'"), 1);
        assert_eq!(mock.statements_matching("INSERT"), 0);
        assert_eq!(mock.commit_count(), 1);
    }

    #[test]
    fn test_expired_deadline_aborts() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut runner = MigrationRunner::new().with_deadline(Deadline::after(Duration::ZERO));
        runner.register(module("core", 1, &[], &calls)).unwrap();
        let mut handle = sqlite();

        assert!(runner.setup(&mut handle, "core").is_err());
        assert!(calls.borrow().is_empty());
    }
}
