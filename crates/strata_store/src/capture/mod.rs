//! Capture engine: turns one commit's change-sets into audit rows under one version group.
//!
//! Everything recorded during a commit is buffered in a [`CommitLog`] and written
//! exactly once, inside a single transaction, by [`CommitLog::commit`].

mod subscriber;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use sea_orm::sea_query::{Alias, Expr, Iden, Order, Query};
use sea_orm::{ConnectionTrait, DatabaseConnection, TransactionTrait};

use strata_core::{
    ActorAccessor, ChangeSet, CollectionState, HostRecord, HostValue, ObjectHandle, PropertyKind,
    RecordId, RelatedRef, SchemaRegistry, StoredContent, StrataError, StrataResult, UpdateKind,
    Value, VersionGroupId,
};

use crate::config::ActorSource;
use crate::db::*;
use crate::policy::AuditPolicy;

pub use subscriber::AuditSubscriber;

/// Entry point of the capture engine, shared by every commit of one store.
#[derive(Clone)]
pub struct AuditLog {
    conn: DatabaseConnection,
    tables: TableNames,
    registry: Arc<SchemaRegistry>,
    policy: AuditPolicy,
    actor: Option<Arc<dyn ActorAccessor + Send + Sync>>,
    actor_source: ActorSource,
}

impl AuditLog {
    pub(crate) fn new(
        conn: DatabaseConnection,
        tables: TableNames,
        registry: Arc<SchemaRegistry>,
        policy: AuditPolicy,
        actor: Option<Arc<dyn ActorAccessor + Send + Sync>>,
        actor_source: ActorSource,
    ) -> Self {
        Self {
            conn,
            tables,
            registry,
            policy,
            actor,
            actor_source,
        }
    }

    pub fn is_audited(&self, type_name: &str) -> bool {
        self.policy.is_audited(type_name) && self.registry.contains(type_name)
    }

    /// Opens the version group of one host commit.
    pub fn begin_commit(&self) -> CommitLog {
        let actor_id = self.resolve_actor();
        CommitLog {
            conn: self.conn.clone(),
            tables: self.tables.clone(),
            registry: self.registry.clone(),
            policy: self.policy.clone(),
            timestamp: Utc::now().timestamp_millis(),
            actor_id,
            rows: RowCache::default(),
            pending: PendingRows::default(),
            deleted: HashMap::new(),
        }
    }

    fn resolve_actor(&self) -> Option<String> {
        if let Some(accessor) = &self.actor {
            return match accessor.current_actor() {
                Ok(actor) => actor,
                Err(err) => {
                    warn!("could not resolve audit actor: {err}");
                    None
                }
            };
        }
        match &self.actor_source {
            ActorSource::None => None,
            ActorSource::Fixed { actor_id } => Some(actor_id.clone()),
            ActorSource::Environment { variable } => match std::env::var(variable) {
                Ok(actor) if !actor.is_empty() => Some(actor),
                _ => {
                    warn!("audit actor variable {variable} is not set");
                    None
                }
            },
        }
    }
}

/// A row either already in the database or buffered for this commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum RowRef {
    Stored(i64),
    Pending(usize),
}

#[derive(Default)]
struct RowCache {
    entities: HashMap<String, RowRef>,
    properties: HashMap<(RowRef, String), RowRef>,
    property_types: HashMap<(RowRef, PropertyKind), RowRef>,
    records: HashMap<(RowRef, RecordId), RowRef>,
    update_types: HashMap<(RowRef, UpdateKind), RowRef>,
}

#[derive(Default)]
struct PendingRows {
    entities: Vec<String>,
    properties: Vec<(RowRef, String)>,
    property_types: Vec<(RowRef, PropertyKind)>,
    records: Vec<(RowRef, RecordId)>,
    update_types: Vec<(RowRef, UpdateKind)>,
    versions: Vec<RowRef>,
    contents: Vec<PendingContent>,
}

struct PendingContent {
    version: usize,
    property_type: RowRef,
    payload: StoredContent,
}

/// Buffered audit rows of one host commit.
pub struct CommitLog {
    conn: DatabaseConnection,
    tables: TableNames,
    registry: Arc<SchemaRegistry>,
    policy: AuditPolicy,
    timestamp: i64,
    actor_id: Option<String>,
    rows: RowCache,
    pending: PendingRows,
    deleted: HashMap<ObjectHandle, (String, RecordId)>,
}

impl CommitLog {
    pub fn actor_id(&self) -> Option<&str> {
        self.actor_id.as_deref()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn version_count(&self) -> usize {
        self.pending.versions.len()
    }

    pub fn content_count(&self) -> usize {
        self.pending.contents.len()
    }

    /// Remembers the identifiers of records about to be deleted, before the host
    /// forgets them. Returns how many records were newly captured.
    pub fn precompute_deletions(&mut self, records: &[HostRecord]) -> usize {
        let mut captured = 0;
        for record in records {
            let Some(id) = record.id.clone() else {
                debug!("deletion of unsaved {} ignored", record.type_name);
                continue;
            };
            if self.deleted.contains_key(&record.handle) {
                continue;
            }
            self.deleted
                .insert(record.handle, (record.type_name.clone(), id));
            captured += 1;
        }
        captured
    }

    pub async fn record_insert(
        &mut self,
        record: &HostRecord,
        changes: &ChangeSet,
    ) -> StrataResult<bool> {
        self.record_change(UpdateKind::Insert, record, changes).await
    }

    pub async fn record_update(
        &mut self,
        record: &HostRecord,
        changes: &ChangeSet,
    ) -> StrataResult<bool> {
        self.record_change(UpdateKind::Update, record, changes).await
    }

    pub async fn record_removal(&mut self, record: &HostRecord) -> StrataResult<bool> {
        if !self.is_audited(&record.type_name) {
            return Ok(false);
        }
        let id = match (&record.id, self.deleted.get(&record.handle)) {
            (_, Some((_, id))) => id.clone(),
            (Some(id), None) => id.clone(),
            (None, None) => {
                warn!(
                    "removal of {} has no identifier; call precompute_deletions first",
                    record.type_name
                );
                return Ok(false);
            }
        };
        self.push_version(&record.type_name, &id, UpdateKind::Delete)
            .await?;
        Ok(true)
    }

    fn is_audited(&self, type_name: &str) -> bool {
        self.policy.is_audited(type_name) && self.registry.contains(type_name)
    }

    async fn record_change(
        &mut self,
        kind: UpdateKind,
        record: &HostRecord,
        changes: &ChangeSet,
    ) -> StrataResult<bool> {
        let type_name = record.type_name.as_str();
        if !self.is_audited(type_name) {
            return Ok(false);
        }
        let Some(id) = record.id.clone() else {
            warn!("{} {type_name} has no identifier; not audited", kind);
            return Ok(false);
        };
        let mut snapshot: Vec<(String, StoredContent)> = Vec::new();
        for (field, change) in changes {
            match self.encode_change(type_name, field, &change.new) {
                Ok(Some(payload)) => snapshot.push((field.clone(), payload)),
                Ok(None) => {}
                Err(err) if err.is_skippable() => {
                    warn!("skipping {type_name}.{field} in audit log: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        if kind == UpdateKind::Insert
            && let Some(discriminator) = &self.registry.get(type_name)?.discriminator
        {
            snapshot.push((
                discriminator.field.clone(),
                StoredContent::Text(Some(discriminator.value.clone())),
            ));
        }

        for relation in self.registry.effective_relations(type_name)? {
            if !relation.kind.is_to_many() || changes.contains_key(&relation.name) {
                continue;
            }
            let Some(state) = record.collections.get(&relation.name) else {
                continue;
            };
            if state.dirty || kind == UpdateKind::Insert {
                snapshot.push((relation.name.clone(), collection_snapshot(state)?));
            }
        }

        let marks = (self.pending.versions.len(), self.pending.contents.len());
        if let Err(err) = self.push_snapshot(type_name, &id, kind, snapshot).await {
            self.pending.versions.truncate(marks.0);
            self.pending.contents.truncate(marks.1);
            return Err(err);
        }
        Ok(true)
    }

    async fn push_snapshot(
        &mut self,
        type_name: &str,
        id: &RecordId,
        kind: UpdateKind,
        snapshot: Vec<(String, StoredContent)>,
    ) -> StrataResult<()> {
        let version = self.push_version(type_name, id, kind).await?;
        let entity = self.entity_row(type_name).await?;
        for (field, payload) in snapshot {
            self.push_content(entity, &field, version, payload).await?;
        }
        Ok(())
    }

    /// Stored payload for one changed field, `None` when the field is not logged.
    fn encode_change(
        &self,
        type_name: &str,
        field: &str,
        new: &HostValue,
    ) -> StrataResult<Option<StoredContent>> {
        if self.registry.discriminator_field(type_name) == Some(field) {
            return Ok(None);
        }
        if let Some(def) = self.registry.field(type_name, field) {
            let value = match new {
                HostValue::Null => Value::Null,
                HostValue::Value(value) => value.clone(),
                HostValue::Ref(_) | HostValue::Refs(_) => {
                    return Err(StrataError::conversion(format!(
                        "{field}: scalar field received a reference"
                    )));
                }
            };
            return def.kind.encode(field, &value).map(Some);
        }
        let Some(relation) = self.registry.relation(type_name, field) else {
            return Err(StrataError::conversion(format!("{field}: unknown field")));
        };
        if relation.kind.is_to_many() {
            return match new {
                HostValue::Refs(members) => Ok(Some(ids_snapshot(members)?)),
                HostValue::Null => Ok(Some(ids_snapshot(&[])?)),
                _ => Err(StrataError::conversion(format!(
                    "{field}: collection field received a single value"
                ))),
            };
        }
        if !relation.owning {
            return Ok(None);
        }
        match new {
            HostValue::Null | HostValue::Value(Value::Null) => Ok(Some(StoredContent::Text(None))),
            HostValue::Ref(RelatedRef { id: Some(id), .. }) => {
                Ok(Some(StoredContent::Text(Some(id.to_string()))))
            }
            HostValue::Ref(RelatedRef { id: None, .. }) => Err(StrataError::conversion(format!(
                "{field}: related record has no identifier"
            ))),
            HostValue::Value(Value::Str(id)) => Ok(Some(StoredContent::Text(Some(id.clone())))),
            HostValue::Value(Value::I64(id)) => Ok(Some(StoredContent::Text(Some(id.to_string())))),
            other => Err(StrataError::conversion(format!(
                "{field}: cannot store {other:?} as a reference"
            ))),
        }
    }

    async fn push_version(
        &mut self,
        type_name: &str,
        id: &RecordId,
        kind: UpdateKind,
    ) -> StrataResult<usize> {
        let entity = self.entity_row(type_name).await?;
        let record = self.record_row(entity, id).await?;
        let update_type = self.update_type_row(record, kind).await?;
        self.pending.versions.push(update_type);
        Ok(self.pending.versions.len() - 1)
    }

    async fn push_content(
        &mut self,
        entity: RowRef,
        field: &str,
        version: usize,
        payload: StoredContent,
    ) -> StrataResult<()> {
        let property = self.property_row(entity, field).await?;
        let property_type = self.property_type_row(property, payload.kind()).await?;
        self.pending.contents.push(PendingContent {
            version,
            property_type,
            payload,
        });
        Ok(())
    }

    async fn entity_row(&mut self, name: &str) -> StrataResult<RowRef> {
        if let Some(row) = self.rows.entities.get(name) {
            return Ok(*row);
        }
        let select = Query::select()
            .column(AuditEntity::Id)
            .from(self.tables.entity.clone())
            .and_where(Expr::col(AuditEntity::Name).eq(name))
            .order_by(AuditEntity::Id, Order::Asc)
            .limit(1)
            .to_owned();
        let row = match query_one(&self.conn, &select).await? {
            Some(row) => {
                let id = read_i64(&row, AuditEntity::Id)?;
                debug!("reusing entity row {id} for {name}");
                RowRef::Stored(id)
            }
            None => {
                self.pending.entities.push(name.to_string());
                RowRef::Pending(self.pending.entities.len() - 1)
            }
        };
        self.rows.entities.insert(name.to_string(), row);
        Ok(row)
    }

    async fn property_row(&mut self, entity: RowRef, name: &str) -> StrataResult<RowRef> {
        let key = (entity, name.to_string());
        if let Some(row) = self.rows.properties.get(&key) {
            return Ok(*row);
        }
        let table = self.tables.property.clone();
        let row = match self
            .find_child(&table, AuditProperty::Id, AuditProperty::EntityId, entity, AuditProperty::Name, name)
            .await?
        {
            Some(row) => row,
            None => {
                self.pending.properties.push(key.clone());
                RowRef::Pending(self.pending.properties.len() - 1)
            }
        };
        self.rows.properties.insert(key, row);
        Ok(row)
    }

    async fn property_type_row(
        &mut self,
        property: RowRef,
        kind: PropertyKind,
    ) -> StrataResult<RowRef> {
        if let Some(row) = self.rows.property_types.get(&(property, kind)) {
            return Ok(*row);
        }
        let table = self.tables.property_type.clone();
        let row = match self
            .find_child(
                &table,
                AuditPropertyType::Id,
                AuditPropertyType::PropertyId,
                property,
                AuditPropertyType::Name,
                kind.as_str(),
            )
            .await?
        {
            Some(row) => row,
            None => {
                self.pending.property_types.push((property, kind));
                RowRef::Pending(self.pending.property_types.len() - 1)
            }
        };
        self.rows.property_types.insert((property, kind), row);
        Ok(row)
    }

    async fn record_row(&mut self, entity: RowRef, id: &RecordId) -> StrataResult<RowRef> {
        let key = (entity, id.clone());
        if let Some(row) = self.rows.records.get(&key) {
            return Ok(*row);
        }
        let table = self.tables.entity_record.clone();
        let row = match self
            .find_child(
                &table,
                AuditEntityRecord::Id,
                AuditEntityRecord::EntityId,
                entity,
                AuditEntityRecord::LoggedEntityId,
                id.as_str(),
            )
            .await?
        {
            Some(row) => row,
            None => {
                self.pending.records.push(key.clone());
                RowRef::Pending(self.pending.records.len() - 1)
            }
        };
        self.rows.records.insert(key, row);
        Ok(row)
    }

    async fn update_type_row(&mut self, record: RowRef, kind: UpdateKind) -> StrataResult<RowRef> {
        if let Some(row) = self.rows.update_types.get(&(record, kind)) {
            return Ok(*row);
        }
        let table = self.tables.update_type.clone();
        let row = match self
            .find_child(
                &table,
                AuditUpdateType::Id,
                AuditUpdateType::EntityRecordId,
                record,
                AuditUpdateType::Name,
                kind.as_str(),
            )
            .await?
        {
            Some(row) => row,
            None => {
                self.pending.update_types.push((record, kind));
                RowRef::Pending(self.pending.update_types.len() - 1)
            }
        };
        self.rows.update_types.insert((record, kind), row);
        Ok(row)
    }

    /// Natural-key lookup of a child row; children of a pending parent cannot exist yet.
    async fn find_child<I, P, K>(
        &self,
        table: &Alias,
        id_col: I,
        parent_col: P,
        parent: RowRef,
        key_col: K,
        key: &str,
    ) -> StrataResult<Option<RowRef>>
    where
        I: Iden + Copy + 'static,
        P: Iden + Copy + 'static,
        K: Iden + Copy + 'static,
    {
        let RowRef::Stored(parent_id) = parent else {
            return Ok(None);
        };
        let select = Query::select()
            .column(id_col)
            .from(table.clone())
            .and_where(Expr::col(parent_col).eq(parent_id))
            .and_where(Expr::col(key_col).eq(key))
            .order_by(id_col, Order::Asc)
            .limit(1)
            .to_owned();
        match query_one(&self.conn, &select).await? {
            Some(row) => {
                let id = read_i64(&row, id_col)?;
                debug!("reusing {} row {id} for {key}", table.to_string());
                Ok(Some(RowRef::Stored(id)))
            }
            None => Ok(None),
        }
    }

    /// Persists the buffered rows in one transaction. Nothing is written when no
    /// version was recorded.
    pub async fn commit(self) -> StrataResult<Option<VersionGroupId>> {
        if self.pending.versions.is_empty() {
            info!("no audited changes in commit; version group skipped");
            return Ok(None);
        }
        let txn = self.conn.begin().await?;
        let group = self.write_rows(&txn).await?;
        txn.commit().await?;
        info!(
            "audit version group {group} persisted with {} versions and {} content records",
            self.pending.versions.len(),
            self.pending.contents.len()
        );
        Ok(Some(group))
    }

    /// Persists through a host-owned connection or transaction so the audit write
    /// shares the host's atomicity.
    pub async fn commit_in<C: ConnectionTrait>(
        self,
        conn: &C,
    ) -> StrataResult<Option<VersionGroupId>> {
        if self.pending.versions.is_empty() {
            info!("no audited changes in commit; version group skipped");
            return Ok(None);
        }
        let group = self.write_rows(conn).await?;
        info!("audit version group {group} written through host connection");
        Ok(Some(group))
    }

    async fn write_rows<C: ConnectionTrait>(&self, conn: &C) -> StrataResult<VersionGroupId> {
        let t = &self.tables;
        let pending = &self.pending;

        let group_id = insert_returning_id(
            conn,
            Query::insert()
                .into_table(t.version_group.clone())
                .columns([AuditVersionGroup::Timestamp, AuditVersionGroup::ActorId])
                .values_panic([self.timestamp.into(), self.actor_id.clone().into()]),
            AuditVersionGroup::Id,
        )
        .await?;

        let mut entity_ids = Vec::with_capacity(pending.entities.len());
        for name in &pending.entities {
            let id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.entity.clone())
                    .columns([AuditEntity::Name])
                    .values_panic([name.as_str().into()]),
                AuditEntity::Id,
            )
            .await?;
            entity_ids.push(id);
        }

        let mut property_ids = Vec::with_capacity(pending.properties.len());
        for (entity, name) in &pending.properties {
            let id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.property.clone())
                    .columns([AuditProperty::EntityId, AuditProperty::Name])
                    .values_panic([resolve(*entity, &entity_ids)?.into(), name.as_str().into()]),
                AuditProperty::Id,
            )
            .await?;
            property_ids.push(id);
        }

        let mut property_type_ids = Vec::with_capacity(pending.property_types.len());
        for (property, kind) in &pending.property_types {
            let id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.property_type.clone())
                    .columns([AuditPropertyType::PropertyId, AuditPropertyType::Name])
                    .values_panic([
                        resolve(*property, &property_ids)?.into(),
                        kind.as_str().into(),
                    ]),
                AuditPropertyType::Id,
            )
            .await?;
            property_type_ids.push(id);
        }

        let mut record_ids = Vec::with_capacity(pending.records.len());
        for (entity, logged_id) in &pending.records {
            let id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.entity_record.clone())
                    .columns([AuditEntityRecord::EntityId, AuditEntityRecord::LoggedEntityId])
                    .values_panic([
                        resolve(*entity, &entity_ids)?.into(),
                        logged_id.as_str().into(),
                    ]),
                AuditEntityRecord::Id,
            )
            .await?;
            record_ids.push(id);
        }

        let mut update_type_ids = Vec::with_capacity(pending.update_types.len());
        for (record, kind) in &pending.update_types {
            let id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.update_type.clone())
                    .columns([AuditUpdateType::EntityRecordId, AuditUpdateType::Name])
                    .values_panic([resolve(*record, &record_ids)?.into(), kind.as_str().into()]),
                AuditUpdateType::Id,
            )
            .await?;
            update_type_ids.push(id);
        }

        let mut version_ids = Vec::with_capacity(pending.versions.len());
        for update_type in &pending.versions {
            let id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.version.clone())
                    .columns([AuditVersion::UpdateTypeId, AuditVersion::VersionGroupId])
                    .values_panic([
                        resolve(*update_type, &update_type_ids)?.into(),
                        group_id.into(),
                    ]),
                AuditVersion::Id,
            )
            .await?;
            version_ids.push(id);
        }

        for content in &pending.contents {
            let version_id = version_ids
                .get(content.version)
                .copied()
                .ok_or_else(|| StrataError::storage("content refers to unknown version"))?;
            let record_id = insert_returning_id(
                conn,
                Query::insert()
                    .into_table(t.content_record.clone())
                    .columns([
                        AuditContentRecord::VersionId,
                        AuditContentRecord::PropertyTypeId,
                        AuditContentRecord::Timestamp,
                    ])
                    .values_panic([
                        version_id.into(),
                        resolve(content.property_type, &property_type_ids)?.into(),
                        self.timestamp.into(),
                    ]),
                AuditContentRecord::Id,
            )
            .await?;
            let (text, blob) = match &content.payload {
                StoredContent::Text(text) => (text.clone(), None),
                StoredContent::Blob(blob) => (None, blob.clone()),
            };
            let insert = Query::insert()
                .into_table(t.content.clone())
                .columns([
                    AuditContent::ContentRecordId,
                    AuditContent::TextContent,
                    AuditContent::BlobContent,
                ])
                .values_panic([record_id.into(), text.into(), blob.into()])
                .to_owned();
            exec(conn, &insert).await?;
        }

        Ok(VersionGroupId(group_id))
    }
}

fn resolve(row: RowRef, inserted: &[i64]) -> StrataResult<i64> {
    match row {
        RowRef::Stored(id) => Ok(id),
        RowRef::Pending(index) => inserted
            .get(index)
            .copied()
            .ok_or_else(|| StrataError::storage("pending audit row was never written")),
    }
}

fn collection_snapshot(state: &CollectionState) -> StrataResult<StoredContent> {
    ids_snapshot(&state.members)
}

/// Ordered id list of a to-many relation; members without an id are left out.
fn ids_snapshot(members: &[RelatedRef]) -> StrataResult<StoredContent> {
    let ids: Vec<&str> = members
        .iter()
        .filter_map(|member| match &member.id {
            Some(id) => Some(id.as_str()),
            None => {
                debug!("unsaved {} left out of collection snapshot", member.type_name);
                None
            }
        })
        .collect();
    Ok(StoredContent::Text(Some(serde_json::to_string(&ids)?)))
}

#[cfg(test)]
mod tests {
    use strata_core::{RelatedRef, StoredContent};

    use super::ids_snapshot;

    #[test]
    fn snapshots_skip_unsaved_members() {
        let snapshot = ids_snapshot(&[
            RelatedRef::new("Tag", 10i64),
            RelatedRef::unsaved("Tag"),
            RelatedRef::new("Tag", 20i64),
        ])
        .expect("snapshot");
        assert_eq!(snapshot, StoredContent::Text(Some("[\"10\",\"20\"]".to_string())));
    }
}
