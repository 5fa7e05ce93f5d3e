use std::path::{Path, PathBuf};

use strata_core::{SchemaRegistry, StrataResult};

use crate::{AuditStore, StrataConfig};

const DEFAULT_DB_NAME: &str = "strata.sqlite";

pub fn load_or_init_config(base: &Path) -> StrataResult<StrataConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    StrataConfig::load_or_init(base, &default_sqlite)
}

pub async fn open_store(base: &Path, registry: SchemaRegistry) -> StrataResult<AuditStore> {
    let config = load_or_init_config(base)?;
    AuditStore::connect(&config, base, registry).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}
