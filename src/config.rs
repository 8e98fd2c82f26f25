use crate::core::{DbError, Result};
use crate::migrate::{MigrationRunner, ScriptModule, DEFAULT_MAX_RETRIES, DEFAULT_METADATA_TABLE};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level setup configuration parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Connection and migration engine settings.
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URI; `--uri` takes precedence
    pub uri: Option<String>,
    /// Attempts per step transaction
    pub max_retries: Option<u32>,
    pub metadata_table: Option<String>,
}

/// One script module.
#[derive(Debug, Deserialize)]
pub struct ModuleConfig {
    pub id: String,
    /// Directory of numbered `.sql` files, relative to the config file
    pub path: PathBuf,
    #[serde(default)]
    pub depends: Vec<String>,
}

impl Config {
    /// Builds a runner with every configured module loaded from disk.
    pub fn build_runner(&self) -> Result<MigrationRunner> {
        let mut runner = MigrationRunner::new()
            .with_max_retries(self.database.max_retries.unwrap_or(DEFAULT_MAX_RETRIES))
            .with_metadata_table(
                self.database
                    .metadata_table
                    .clone()
                    .unwrap_or_else(|| DEFAULT_METADATA_TABLE.to_string()),
            );
        for module in &self.modules {
            let script = ScriptModule::load(module.id.clone(), &module.path)?
                .depends_on(module.depends.clone());
            runner.register(Box::new(script))?;
        }
        Ok(runner)
    }
}

/// `<config dir>/dblayer/setup.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dblayer").join("setup.toml"))
}

/// Loads configuration from a TOML file at the given path.
///
/// Module paths are resolved against the directory holding the file.
///
/// # Arguments
///
/// * `path` - The file path to the TOML configuration file.
///
/// # Example
///
/// ```no_run
/// let config = dblayer::config::load_config("setup.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| DbError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let mut config: Config = toml::from_str(&content)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for module in &mut config.modules {
        if module.path.is_relative() {
            module.path = base.join(&module.path);
        }
    }
    Ok(config)
}
