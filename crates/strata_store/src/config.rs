use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use strata_core::{StrataError, StrataResult};

const DEFAULT_CONFIG_NAME: &str = "strata.json";
const DEFAULT_DB_FILE: &str = "strata.sqlite";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            suffix: String::new(),
        }
    }
}

fn default_prefix() -> String {
    "audit_".to_string()
}

/// Where the capture engine takes the acting user's id from when no accessor is injected.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ActorSource {
    #[default]
    None,
    Fixed {
        actor_id: String,
    },
    Environment {
        variable: String,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditConfig {
    #[serde(default)]
    pub audited_types: Vec<String>,
    #[serde(default)]
    pub ignored_types: Vec<String>,
    #[serde(default)]
    pub actor: ActorSource,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Fall back to the host's live state for records that were never audited.
    #[serde(default = "default_true")]
    pub live_fallback: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            live_fallback: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrataConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub tables: TableConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub reader: ReaderConfig,
}

impl StrataConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            tables: TableConfig::default(),
            audit: AuditConfig::default(),
            reader: ReaderConfig::default(),
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> StrataResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| StrataError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| StrataError::storage(format!("read config: {err}")))?;
            let config: StrataConfig = serde_json::from_str(&raw)
                .map_err(|err| StrataError::validation(err.to_string()))?;
            config.validate()?;
            return Ok(config);
        }
        let default = StrataConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| StrataError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| StrataError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn validate(&self) -> StrataResult<()> {
        let valid = |part: &str| {
            part.chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        };
        if !valid(&self.tables.prefix) || !valid(&self.tables.suffix) {
            return Err(StrataError::validation(
                "table prefix and suffix may only contain ASCII letters, digits and '_'",
            ));
        }
        if let Some(shared) = self
            .audit
            .audited_types
            .iter()
            .find(|name| self.audit.ignored_types.contains(name))
        {
            log::warn!("type {shared} is both audited and ignored; the allow-list wins");
        }
        Ok(())
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> StrataResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| DEFAULT_DB_FILE.to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(StrataError::validation("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self) -> Option<&str> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => None,
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Some(url.as_str()),
        }
    }
}
