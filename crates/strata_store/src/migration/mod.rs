use sea_orm::DatabaseConnection;
use sea_orm_migration::prelude::*;

use strata_core::StrataResult;

use crate::db::TableNames;

mod m20250101_000001_audit_schema;

pub use m20250101_000001_audit_schema::Migration as AuditSchema;

/// Creates any missing audit tables and indexes. Safe to run on every start.
pub async fn install(conn: &DatabaseConnection, tables: &TableNames) -> StrataResult<()> {
    let manager = SchemaManager::new(conn);
    AuditSchema {
        tables: tables.clone(),
    }
    .up(&manager)
    .await?;
    log::debug!("audit schema installed");
    Ok(())
}
