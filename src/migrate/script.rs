/// SQL Script Modules
///
/// A [`SchemaModule`] whose steps are numbered SQL files in one directory:
///
/// ```text
/// widgets/
///   1.sql
///   2_add_active_flag.sql
/// ```
///
/// Step N runs the `;`-separated statements of the file numbered N. Text after
/// the first underscore becomes the version comment ("add active flag").
/// `{name}` tokens are replaced by the decorated table name; nothing else in
/// the file is interpreted.
use crate::core::db::connection::ConnectionHandle;
use crate::core::{DbError, Result};
use crate::migrate::SchemaModule;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

static TABLE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("table token pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
struct ScriptStep {
    statements: Vec<String>,
    description: Option<String>,
}

/// Schema module backed by SQL files.
#[derive(Debug, Clone)]
pub struct ScriptModule {
    id: String,
    dependencies: Vec<String>,
    steps: BTreeMap<u32, ScriptStep>,
}

impl ScriptModule {
    /// A module with no steps yet
    pub fn new(id: impl Into<String>) -> Self {
        ScriptModule {
            id: id.into(),
            dependencies: Vec::new(),
            steps: BTreeMap::new(),
        }
    }

    pub fn depends_on(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Adds step `version` from SQL text.
    pub fn step(mut self, version: u32, sql: &str, description: Option<&str>) -> Self {
        self.steps.insert(
            version,
            ScriptStep {
                statements: split_statements(sql),
                description: description.map(String::from),
            },
        );
        self
    }

    /// Loads every `N.sql` / `N_description.sql` file in `dir`.
    ///
    /// # Errors
    ///
    /// `DbError::Config` when the directory cannot be read, two files claim
    /// the same version, or the versions are not exactly `1..=N`.
    pub fn load(id: impl Into<String>, dir: &Path) -> Result<Self> {
        let mut module = ScriptModule::new(id);
        let entries = fs::read_dir(dir).map_err(|e| {
            DbError::Config(format!("cannot read migration directory {}: {}", dir.display(), e))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let (number, description) = match stem.split_once('_') {
                Some((number, rest)) => (number, Some(rest.replace('_', " "))),
                None => (stem, None),
            };
            let Ok(version) = number.parse::<u32>() else {
                debug!("Skipping {}: not a numbered migration", path.display());
                continue;
            };
            if module.steps.contains_key(&version) {
                return Err(DbError::Config(format!(
                    "module {} has two files for version {}",
                    module.id, version
                )));
            }
            let sql = fs::read_to_string(&path)?;
            module = module.step(version, &sql, description.as_deref());
        }

        for (expected, version) in (1..).zip(module.steps.keys()) {
            if *version != expected {
                return Err(DbError::Config(format!(
                    "module {} is missing migration {} in {}",
                    module.id,
                    expected,
                    dir.display()
                )));
            }
        }
        Ok(module)
    }
}

impl SchemaModule for ScriptModule {
    fn id(&self) -> &str {
        &self.id
    }

    fn latest_version(&self) -> u32 {
        self.steps.keys().next_back().copied().unwrap_or(0)
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    fn update_schema(&self, handle: &mut ConnectionHandle, version: u32) -> Result<Option<String>> {
        let step = self.steps.get(&version).ok_or_else(|| {
            DbError::query(format!("module {} has no migration {}", self.id, version))
        })?;
        for statement in &step.statements {
            let sql = TABLE_TOKEN.replace_all(statement, |caps: &regex::Captures| {
                handle.table_name(&caps[1])
            });
            handle.execute_sql(&sql)?;
        }
        Ok(step.description.clone())
    }
}

/// Splits SQL text on `;`, ignoring semicolons inside quotes and `--` comments.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            Some(q) => {
                current.push(ch);
                if ch == q {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' | '`' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                '-' if chars.peek() == Some(&'-') => {
                    // skip to end of line
                    for c in chars.by_ref() {
                        if c == '\n' {
                            current.push('\n');
                            break;
                        }
                    }
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(ch),
            },
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
}
