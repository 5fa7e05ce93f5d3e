use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection};

use strata_core::{ActorAccessor, LiveRecordLoader, SchemaRegistry, StrataResult};

use crate::capture::AuditLog;
use crate::config::{ActorSource, DatabaseConfig, StrataConfig};
use crate::db::TableNames;
use crate::migration;
use crate::policy::AuditPolicy;
use crate::reader::{ObjectManager, ReadContext, Reader, Revision, RevisionView};

/// A connected audit store: the capture side and reader sessions share its pool,
/// table names and type registry.
#[derive(Clone)]
pub struct AuditStore {
    conn: DatabaseConnection,
    backend: DatabaseBackend,
    tables: TableNames,
    registry: Arc<SchemaRegistry>,
    policy: AuditPolicy,
    actor_source: ActorSource,
    actor: Option<Arc<dyn ActorAccessor + Send + Sync>>,
    live: Option<Arc<dyn LiveRecordLoader + Send + Sync>>,
    live_fallback: bool,
}

impl AuditStore {
    pub async fn connect(
        config: &StrataConfig,
        base_dir: &Path,
        registry: SchemaRegistry,
    ) -> StrataResult<Self> {
        config.validate()?;
        let url = build_connection_url(config, base_dir)?;
        let mut options = ConnectOptions::new(url);
        options.sqlx_logging(false);
        if let Some(pool) = &config.pool {
            if let Some(max) = pool.max_connections {
                options.max_connections(max);
            }
            if let Some(min) = pool.min_connections {
                options.min_connections(min);
            }
            if let Some(timeout_ms) = pool.connect_timeout_ms {
                options.connect_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.acquire_timeout_ms {
                options.acquire_timeout(Duration::from_millis(timeout_ms));
            }
            if let Some(timeout_ms) = pool.idle_timeout_ms {
                options.idle_timeout(Duration::from_millis(timeout_ms));
            }
        }
        let conn = Database::connect(options).await?;
        let backend = conn.get_database_backend();
        let tables = TableNames::new(&config.tables.prefix, &config.tables.suffix);
        migration::install(&conn, &tables).await?;
        log::info!(
            "audit store ready on {} with {} types",
            config.backend_name(),
            registry.types().count()
        );
        Ok(Self {
            conn,
            backend,
            tables,
            registry: Arc::new(registry),
            policy: AuditPolicy::from_config(&config.audit),
            actor_source: config.audit.actor.clone(),
            actor: None,
            live: None,
            live_fallback: config.reader.live_fallback,
        })
    }

    pub async fn connect_sqlite(path: &Path, registry: SchemaRegistry) -> StrataResult<Self> {
        let config = StrataConfig::default_sqlite(path.to_string_lossy());
        Self::connect(
            &config,
            path.parent().unwrap_or_else(|| Path::new(".")),
            registry,
        )
        .await
    }

    /// Source of current state for records that were never audited.
    pub fn with_live_loader(mut self, loader: Arc<dyn LiveRecordLoader + Send + Sync>) -> Self {
        self.live = Some(loader);
        self
    }

    /// Takes precedence over the configured actor source.
    pub fn with_actor_accessor(mut self, accessor: Arc<dyn ActorAccessor + Send + Sync>) -> Self {
        self.actor = Some(accessor);
        self
    }

    pub fn audit_log(&self) -> AuditLog {
        AuditLog::new(
            self.conn.clone(),
            self.tables.clone(),
            self.registry.clone(),
            self.policy.clone(),
            self.actor.clone(),
            self.actor_source.clone(),
        )
    }

    /// A fresh reader session with its own identity map.
    pub fn object_manager(&self) -> Rc<ObjectManager> {
        Rc::new(ObjectManager::new(Rc::new(ReadContext {
            conn: self.conn.clone(),
            tables: self.tables.clone(),
            registry: self.registry.clone(),
            live: self.live.clone(),
            live_fallback: self.live_fallback,
        })))
    }

    pub fn reader(&self) -> Reader<Revision> {
        self.reader_with()
    }

    pub fn reader_with<V: RevisionView>(&self) -> Reader<V> {
        Reader::new(self.object_manager())
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn backend(&self) -> DatabaseBackend {
        self.backend
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }
}

fn build_connection_url(config: &StrataConfig, base_dir: &Path) -> StrataResult<String> {
    match &config.database {
        DatabaseConfig::Sqlite { .. } => {
            let path = config.sqlite_path(base_dir)?;
            Ok(format!("sqlite://{}?mode=rwc", path.display()))
        }
        DatabaseConfig::Postgres { url } => Ok(url.clone()),
        DatabaseConfig::Mysql { url } => Ok(url.clone()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::build_connection_url;
    use crate::config::StrataConfig;

    #[test]
    fn sqlite_urls_resolve_against_the_base_dir() {
        let config = StrataConfig::default_sqlite("audit.sqlite");
        let url = build_connection_url(&config, Path::new("/var/data")).expect("url");
        assert_eq!(url, "sqlite:///var/data/audit.sqlite?mode=rwc");
    }
}
