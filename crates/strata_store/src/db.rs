use sea_orm::sea_query;
use sea_orm::sea_query::{
    Alias, InsertStatement, MysqlQueryBuilder, PostgresQueryBuilder, QueryStatementWriter,
    SqliteQueryBuilder,
};
use sea_orm::{ConnectionTrait, DatabaseBackend, QueryResult, Statement};
use sea_orm_migration::prelude::Iden;

use strata_core::{StrataError, StrataResult};

#[derive(Iden, Clone, Copy)]
pub enum AuditEntity {
    Id,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditProperty {
    Id,
    EntityId,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditPropertyType {
    Id,
    PropertyId,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditEntityRecord {
    Id,
    EntityId,
    LoggedEntityId,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditUpdateType {
    Id,
    EntityRecordId,
    Name,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditVersionGroup {
    Id,
    Timestamp,
    ActorId,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditVersion {
    Id,
    UpdateTypeId,
    VersionGroupId,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditContentRecord {
    Id,
    VersionId,
    PropertyTypeId,
    Timestamp,
}

#[derive(Iden, Clone, Copy)]
pub enum AuditContent {
    Id,
    ContentRecordId,
    TextContent,
    BlobContent,
}

/// Physical names of the nine audit tables after prefix/suffix decoration.
#[derive(Clone, Debug)]
pub struct TableNames {
    pub entity: Alias,
    pub property: Alias,
    pub property_type: Alias,
    pub entity_record: Alias,
    pub update_type: Alias,
    pub version_group: Alias,
    pub version: Alias,
    pub content_record: Alias,
    pub content: Alias,
    prefix: String,
    suffix: String,
}

impl TableNames {
    pub fn new(prefix: &str, suffix: &str) -> Self {
        let name = |base: &str| Alias::new(format!("{prefix}{base}{suffix}"));
        Self {
            entity: name("entity"),
            property: name("property"),
            property_type: name("property_type"),
            entity_record: name("entity_record"),
            update_type: name("update_type"),
            version_group: name("version_group"),
            version: name("version"),
            content_record: name("content_record"),
            content: name("content"),
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        }
    }

    /// Index names follow the table decoration so two prefixes can share one database.
    pub fn index(&self, base: &str) -> String {
        format!("idx_{}{base}{}", self.prefix, self.suffix)
    }
}

pub fn col_name(column: impl sea_query::Iden) -> String {
    column.to_string()
}

pub fn build_stmt<S: QueryStatementWriter>(
    backend: DatabaseBackend,
    stmt: &S,
) -> (String, sea_orm::sea_query::Values) {
    match backend {
        DatabaseBackend::Sqlite => stmt.build(SqliteQueryBuilder),
        DatabaseBackend::Postgres => stmt.build(PostgresQueryBuilder),
        DatabaseBackend::MySql => stmt.build(MysqlQueryBuilder),
        #[allow(unreachable_patterns)]
        _ => stmt.build(SqliteQueryBuilder),
    }
}

pub async fn exec<C, S>(conn: &C, stmt: &S) -> StrataResult<()>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    conn.execute(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(())
}

pub async fn query_all<C, S>(conn: &C, stmt: &S) -> StrataResult<Vec<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let rows = conn
        .query_all(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(rows)
}

pub async fn query_one<C, S>(conn: &C, stmt: &S) -> StrataResult<Option<QueryResult>>
where
    C: ConnectionTrait,
    S: QueryStatementWriter,
{
    let backend = conn.get_database_backend();
    let (sql, values) = build_stmt(backend, stmt);
    let row = conn
        .query_one(Statement::from_sql_and_values(backend, sql, values))
        .await?;
    Ok(row)
}

/// Inserts one row and returns its generated integer key.
pub async fn insert_returning_id<C, I>(conn: &C, insert: &mut InsertStatement, id_col: I) -> StrataResult<i64>
where
    C: ConnectionTrait,
    I: sea_query::Iden + Copy + 'static,
{
    let backend = conn.get_database_backend();
    if backend == DatabaseBackend::MySql {
        let (sql, values) = build_stmt(backend, &*insert);
        let result = conn
            .execute(Statement::from_sql_and_values(backend, sql, values))
            .await?;
        return i64::try_from(result.last_insert_id())
            .map_err(|_| StrataError::storage("generated id out of range"));
    }
    insert.returning_col(id_col);
    let row = query_one(conn, &*insert)
        .await?
        .ok_or_else(|| StrataError::storage("insert returned no row"))?;
    read_i64(&row, id_col)
}

pub fn read_i64(row: &QueryResult, column: impl sea_query::Iden) -> StrataResult<i64> {
    Ok(row.try_get("", &col_name(column))?)
}

pub fn read_string(row: &QueryResult, column: impl sea_query::Iden) -> StrataResult<String> {
    Ok(row.try_get("", &col_name(column))?)
}

pub fn read_opt_string(
    row: &QueryResult,
    column: impl sea_query::Iden,
) -> StrataResult<Option<String>> {
    Ok(row.try_get("", &col_name(column))?)
}

pub fn read_opt_bytes(
    row: &QueryResult,
    column: impl sea_query::Iden,
) -> StrataResult<Option<Vec<u8>>> {
    Ok(row.try_get("", &col_name(column))?)
}
