use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::ident::TableId;

const ENV_DDL_DIRECTORY: &str = "SQL_SCHEDULER_DDL_DIRECTORY";
const ENV_INSERT_DIRECTORY: &str = "SQL_SCHEDULER_INSERT_DIRECTORY";
const ENV_DSN: &str = "SQL_SCHEDULER_DSN";
const ENV_STAGE: &str = "SQL_SCHEDULER_STAGE";
const ENV_DEV_SCHEMA: &str = "SQL_SCHEDULER_DEV_SCHEMA";
const ENV_CONCURRENCY: &str = "SQL_SCHEDULER_CONCURRENCY";
const ENV_LOG_FORMAT: &str = "SQL_SCHEDULER_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Prod,
    Dev,
}

impl std::str::FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "prod" => Ok(Stage::Prod),
            "dev" => Ok(Stage::Dev),
            other => Err(Error::Config(format!(
                "invalid stage {:?}: expected prod or dev",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Immutable run configuration. Layering: optional TOML file, then
/// `SQL_SCHEDULER_*` environment variables, then CLI flags (applied by the
/// binary before `validate`).
#[derive(Debug, Clone)]
pub struct Config {
    pub ddl_directory: PathBuf,
    pub insert_directory: PathBuf,
    pub dsn: String,
    pub stage: Stage,
    pub dev_schema: Option<String>,
    pub targets: Vec<TableId>,
    /// Include transitive upstream tasks of the targets in the run.
    pub dependencies: bool,
    /// Build and validate the DAG, then exit without executing.
    pub check: bool,
    /// Recreate incremental tables instead of topping them up.
    pub refill: bool,
    /// Positional arguments bound into incremental scripts.
    pub params: Vec<String>,
    /// Connection pool size; defaults to the execution-set size.
    pub concurrency: Option<usize>,
    pub log_format: LogFormat,
}

/// On-disk shape of the optional TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    ddl_directory: Option<PathBuf>,
    insert_directory: Option<PathBuf>,
    dsn: Option<String>,
    stage: Option<Stage>,
    dev_schema: Option<String>,
    targets: Option<Vec<String>>,
    dependencies: Option<bool>,
    refill: Option<bool>,
    concurrency: Option<usize>,
    log_format: Option<LogFormat>,
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p).map_err(|e| {
                    Error::Config(format!("cannot read config file {}: {}", p.display(), e))
                })?;
                toml::from_str::<ConfigFile>(&contents).map_err(|e| {
                    Error::Config(format!("invalid config file {}: {}", p.display(), e))
                })?
            }
            None => ConfigFile::default(),
        };

        let mut config = Config {
            ddl_directory: file.ddl_directory.unwrap_or_default(),
            insert_directory: file.insert_directory.unwrap_or_default(),
            dsn: file.dsn.unwrap_or_default(),
            stage: file.stage.unwrap_or_default(),
            dev_schema: file.dev_schema,
            targets: parse_targets(file.targets.unwrap_or_default())?,
            dependencies: file.dependencies.unwrap_or(false),
            check: false,
            refill: file.refill.unwrap_or(false),
            params: Vec::new(),
            concurrency: file.concurrency,
            log_format: file.log_format.unwrap_or_default(),
        };

        if let Ok(dir) = std::env::var(ENV_DDL_DIRECTORY) {
            config.ddl_directory = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var(ENV_INSERT_DIRECTORY) {
            config.insert_directory = PathBuf::from(dir);
        }
        if let Ok(dsn) = std::env::var(ENV_DSN) {
            config.dsn = dsn;
        }
        if let Ok(stage) = std::env::var(ENV_STAGE) {
            config.stage = stage.parse()?;
        }
        if let Ok(schema) = std::env::var(ENV_DEV_SCHEMA) {
            config.dev_schema = Some(schema);
        }
        if let Ok(concurrency) = std::env::var(ENV_CONCURRENCY) {
            let parsed: usize = concurrency.parse().map_err(|_| {
                Error::Config(format!("{} must be a number, got {:?}", ENV_CONCURRENCY, concurrency))
            })?;
            config.concurrency = Some(parsed);
        }
        if let Ok(format) = std::env::var(ENV_LOG_FORMAT) {
            config.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Text,
            };
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ddl_directory.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "no DDL directory provided; set {} or pass --ddl-directory",
                ENV_DDL_DIRECTORY
            )));
        }
        if !self.ddl_directory.is_dir() {
            return Err(Error::Config(format!(
                "DDL directory {} does not exist",
                self.ddl_directory.display()
            )));
        }
        if self.insert_directory.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "no INSERT directory provided; set {} or pass --insert-directory",
                ENV_INSERT_DIRECTORY
            )));
        }
        if !self.insert_directory.is_dir() {
            return Err(Error::Config(format!(
                "INSERT directory {} does not exist",
                self.insert_directory.display()
            )));
        }
        if !self.check && self.dsn.is_empty() {
            return Err(Error::Config(format!(
                "no DSN provided; set {}",
                ENV_DSN
            )));
        }
        if self.stage == Stage::Dev
            && self.dev_schema.as_deref().unwrap_or("").is_empty()
        {
            return Err(Error::Config(format!(
                "stage is dev but no dev schema was provided; set {} or pass --dev-schema",
                ENV_DEV_SCHEMA
            )));
        }
        if self.concurrency == Some(0) {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        Ok(())
    }
}

pub fn parse_targets(raw: Vec<String>) -> Result<Vec<TableId>> {
    raw.iter().map(|t| t.parse()).collect()
}
