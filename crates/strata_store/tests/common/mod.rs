#![allow(dead_code)]

use std::path::Path;

use sea_orm::{ConnectionTrait, Statement};
use strata_store::{
    AuditStore, ChangeSet, EntitySchema, FieldChange, FieldKind, HostRecord, HostValue,
    RelatedRef, RelationDef, SchemaRegistry, StrataResult, Value, VersionGroupId,
};

/// Blog-shaped registry covering every relation kind and one polymorphic family.
pub fn registry() -> SchemaRegistry {
    SchemaRegistry::new([
        EntitySchema::new("User", "id")
            .field("id", FieldKind::Integer)
            .field("name", FieldKind::Text)
            .field("avatar", FieldKind::Blob)
            .relation(RelationDef::one_to_one_inverse("profile", "Profile", "user")),
        EntitySchema::new("Profile", "id")
            .field("bio", FieldKind::Text)
            .relation(RelationDef::one_to_one("user", "User").inversed_by("profile")),
        EntitySchema::new("Post", "id")
            .field("id", FieldKind::Integer)
            .field("title", FieldKind::Text)
            .field("status", FieldKind::Text)
            .field("rating", FieldKind::Float)
            .field("draft", FieldKind::Boolean)
            .field("published_at", FieldKind::DateTime)
            .relation(RelationDef::many_to_one("author", "User"))
            .relation(RelationDef::many_to_one("featured", "Content"))
            .relation(RelationDef::many_to_many("tags", "Tag"))
            .relation(RelationDef::one_to_many("comments", "Comment", "post")),
        EntitySchema::new("Tag", "id")
            .field("label", FieldKind::Text)
            .relation(RelationDef::many_to_many_inverse("posts", "Post", "tags")),
        EntitySchema::new("Comment", "id")
            .field("body", FieldKind::Text)
            .relation(RelationDef::many_to_one("post", "Post")),
        EntitySchema::new("Content", "id")
            .field("title", FieldKind::Text)
            .discriminated("kind", "content"),
        EntitySchema::new("Article", "id")
            .extends("Content")
            .field("body", FieldKind::Text)
            .discriminated("kind", "article"),
        EntitySchema::new("Video", "id")
            .extends("Content")
            .field("seconds", FieldKind::Integer)
            .discriminated("kind", "video"),
    ])
    .expect("registry")
}

pub async fn open(dir: &Path) -> StrataResult<AuditStore> {
    AuditStore::connect_sqlite(&dir.join("audit.sqlite"), registry()).await
}

pub fn text(value: &str) -> HostValue {
    HostValue::Value(Value::Str(value.to_string()))
}

pub fn reference(type_name: &str, id: i64) -> HostValue {
    HostValue::Ref(RelatedRef::new(type_name, id))
}

pub fn refs(type_name: &str, ids: &[i64]) -> HostValue {
    HostValue::Refs(ids.iter().map(|id| RelatedRef::new(type_name, *id)).collect())
}

pub fn changes<const N: usize>(fields: [(&str, HostValue); N]) -> ChangeSet {
    fields
        .into_iter()
        .map(|(field, value)| (field.to_string(), FieldChange::set(value)))
        .collect()
}

pub fn record(type_name: &str, id: i64) -> HostRecord {
    HostRecord::new(id as u64, type_name, id)
}

/// Commits one insert and returns its version group.
pub async fn insert(
    store: &AuditStore,
    record: &HostRecord,
    changes: ChangeSet,
) -> StrataResult<VersionGroupId> {
    let mut commit = store.audit_log().begin_commit();
    assert!(commit.record_insert(record, &changes).await?);
    Ok(commit.commit().await?.expect("version group"))
}

pub async fn update(
    store: &AuditStore,
    record: &HostRecord,
    changes: ChangeSet,
) -> StrataResult<VersionGroupId> {
    let mut commit = store.audit_log().begin_commit();
    assert!(commit.record_update(record, &changes).await?);
    Ok(commit.commit().await?.expect("version group"))
}

pub async fn remove(store: &AuditStore, record: &HostRecord) -> StrataResult<VersionGroupId> {
    let mut commit = store.audit_log().begin_commit();
    commit.precompute_deletions(std::slice::from_ref(record));
    assert!(commit.record_removal(record).await?);
    Ok(commit.commit().await?.expect("version group"))
}

pub async fn count_rows(store: &AuditStore, base: &str) -> StrataResult<i64> {
    let sql = format!("SELECT COUNT(*) AS n FROM audit_{base}");
    let row = store
        .connection()
        .query_one(Statement::from_string(store.backend(), sql))
        .await?
        .expect("count row");
    Ok(row.try_get("", "n")?)
}
