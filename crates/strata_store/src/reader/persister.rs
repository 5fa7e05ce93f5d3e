use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use async_recursion::async_recursion;
use log::debug;
use sea_orm::QueryResult;
use sea_orm::sea_query::{Alias, Expr, Order, SelectStatement};

use strata_core::{
    FieldData, RecordId, RelationDef, StrataError, StrataResult, UpdateKind, Value,
    VersionGroupId,
};

use super::collection::LazyCollection;
use super::manager::{MaterializeHints, ObjectManager};
use super::object::{Object, ObjectRef};
use super::queries::*;
use super::{ReadContext, record_id_of};
use crate::db::*;

/// Field name to expected value; every entry must match.
pub type Criteria = BTreeMap<String, Value>;

/// Field data of one record at a snapshot plus the concrete type it belongs to.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordData {
    pub type_name: String,
    pub fields: FieldData,
}

/// Loads records of one type as they were at one version group.
pub struct EntityPersister {
    ctx: Rc<ReadContext>,
    type_name: String,
    family: Vec<String>,
    as_of: VersionGroupId,
    floors: RefCell<HashMap<RecordId, i64>>,
}

impl EntityPersister {
    pub(crate) fn new(
        ctx: Rc<ReadContext>,
        type_name: &str,
        as_of: VersionGroupId,
    ) -> StrataResult<Self> {
        let family = ctx.registry.family(type_name)?;
        Ok(Self {
            ctx,
            type_name: type_name.to_string(),
            family,
            as_of,
            floors: RefCell::new(HashMap::new()),
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn as_of(&self) -> VersionGroupId {
        self.as_of
    }

    /// Resolves `criteria` to one record and loads it. Criteria on the identifier
    /// alone are a direct lookup; anything else is matched against historical values.
    pub async fn load(
        &self,
        manager: &ObjectManager,
        criteria: &Criteria,
        existing: Option<ObjectRef>,
        hints: MaterializeHints,
    ) -> StrataResult<Option<ObjectRef>> {
        let identifier = &self.ctx.registry.get(&self.type_name)?.identifier;
        let id = match criteria.get(identifier) {
            Some(value) if criteria.len() == 1 => record_id_of(value)
                .ok_or_else(|| StrataError::missing_identifier(&self.type_name, identifier))?,
            _ => match self.ids_by_criteria(criteria).await?.into_iter().next() {
                Some(id) => id,
                None => return Ok(None),
            },
        };
        self.load_identified(manager, &id, existing, hints).await
    }

    pub async fn load_by_id(
        &self,
        manager: &ObjectManager,
        id: &RecordId,
        existing: Option<ObjectRef>,
    ) -> StrataResult<Option<ObjectRef>> {
        self.load_identified(manager, id, existing, MaterializeHints::default())
            .await
    }

    #[async_recursion(?Send)]
    async fn load_identified(
        &self,
        manager: &ObjectManager,
        id: &RecordId,
        existing: Option<ObjectRef>,
        mut hints: MaterializeHints,
    ) -> StrataResult<Option<ObjectRef>> {
        let root = self.ctx.registry.root_of(&self.type_name)?;
        if existing.is_none()
            && !hints.refresh
            && let Some(object) = manager.try_get_by_id(id, root, self.as_of)
            && object.is_initialized()
        {
            return Ok(Some(object));
        }

        let data = match self.latest_event(id).await? {
            Some((UpdateKind::Delete, _)) => {
                debug!("{} {id} is deleted at {}", self.type_name, self.as_of);
                return Ok(None);
            }
            Some((_, logged_type)) => self.load_data(id, &logged_type).await?,
            None if self.entity_record_exists(id).await? => {
                debug!("{} {id} has no history at or before {}", self.type_name, self.as_of);
                return Ok(None);
            }
            None => match self.load_live(id).await? {
                Some(data) => data,
                None => return Ok(None),
            },
        };

        if existing.is_some() {
            hints.refresh_target = existing;
        }
        let object = manager
            .materialize(&data.type_name, id, &data.fields, self.as_of, hints)
            .await?;
        Ok(Some(object))
    }

    /// Latest stored value of one field at this snapshot: `None` when it was never
    /// recorded, `Some(Value::Null)` for a recorded null.
    pub async fn get_property_value(
        &self,
        id: &RecordId,
        field: &str,
    ) -> StrataResult<Option<Value>> {
        let t = &self.ctx.tables;
        let floor = self.history_floor(id).await?;
        let mut select = self.content_select(Some(id), Some(field), true);
        select
            .and_where(Expr::col((t.version.clone(), AuditVersion::Id)).gt(floor))
            .order_by((t.version.clone(), AuditVersion::Id), Order::Desc)
            .order_by((t.content_record.clone(), AuditContentRecord::Id), Order::Desc)
            .limit(1);
        match query_one(&self.ctx.conn, &select).await? {
            Some(row) => Ok(Some(stored_value(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn latest_update_kind(&self, id: &RecordId) -> StrataResult<Option<UpdateKind>> {
        Ok(self.latest_event(id).await?.map(|(kind, _)| kind))
    }

    pub async fn is_deleted(&self, id: &RecordId) -> StrataResult<bool> {
        Ok(self.latest_update_kind(id).await? == Some(UpdateKind::Delete))
    }

    /// Whether the record was ever audited, at any time.
    pub async fn entity_record_exists(&self, id: &RecordId) -> StrataResult<bool> {
        let t = &self.ctx.tables;
        let mut select = history_select(t, &self.family, Some(id));
        select
            .column((t.entity_record.clone(), AuditEntityRecord::Id))
            .limit(1);
        Ok(query_one(&self.ctx.conn, &select).await?.is_some())
    }

    /// Discriminator, scalar fields and owning to-one ids of one record at this snapshot.
    pub async fn load_data_by_identifier(&self, id: &RecordId) -> StrataResult<Option<RecordData>> {
        match self.latest_event(id).await? {
            Some((UpdateKind::Delete, _)) | None => Ok(None),
            Some((_, logged_type)) => Ok(Some(self.load_data(id, &logged_type).await?)),
        }
    }

    /// Ids whose latest value of every criterion field equals the criterion value.
    pub async fn ids_by_criteria(&self, criteria: &Criteria) -> StrataResult<Vec<RecordId>> {
        let identifier = self.ctx.registry.get(&self.type_name)?.identifier.clone();
        let mut matched: Option<Vec<RecordId>> = None;
        for (field, value) in criteria {
            let ids: Vec<RecordId> = if *field == identifier {
                record_id_of(value).into_iter().collect()
            } else {
                let expected = match self.criterion_payload(field, value) {
                    Ok(expected) => expected,
                    Err(err) if err.is_skippable() => {
                        debug!("criterion {field} cannot match {}: {err}", self.type_name);
                        return Ok(Vec::new());
                    }
                    Err(err) => return Err(err),
                };
                self.latest_values(field)
                    .await?
                    .into_iter()
                    .filter(|(_, stored)| *stored == expected)
                    .map(|(id, _)| id)
                    .collect()
            };
            matched = Some(match matched {
                None => ids,
                Some(previous) => previous.into_iter().filter(|id| ids.contains(id)).collect(),
            });
        }
        Ok(matched.unwrap_or_default())
    }

    /// Ids whose latest id snapshot of `field` contains `member`.
    pub async fn ids_by_membership(
        &self,
        field: &str,
        member: &RecordId,
    ) -> StrataResult<Vec<RecordId>> {
        let mut out = Vec::new();
        for (id, stored) in self.latest_values(field).await? {
            if let Value::Str(json) = stored
                && parse_ids(&json)?.contains(member)
            {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Loads the target of a to-one relation whose source is `source`.
    pub async fn load_one_to_one(
        &self,
        manager: &ObjectManager,
        relation: &RelationDef,
        source: &Object,
        identifier: Option<&RecordId>,
    ) -> StrataResult<Option<ObjectRef>> {
        if relation.owning {
            return match identifier {
                Some(id) => self.load_by_id(manager, id, None).await,
                None => Ok(None),
            };
        }
        let mapped_by = mapped_by(relation)?;
        let criteria = Criteria::from([(mapped_by.to_string(), Value::Str(source.id().to_string()))]);
        for id in self.ids_by_criteria(&criteria).await? {
            if let Some(object) = self.load_by_id(manager, &id, None).await? {
                return Ok(Some(object));
            }
        }
        Ok(None)
    }

    pub async fn load_one_to_many(
        &self,
        manager: &ObjectManager,
        relation: &RelationDef,
        collection: &LazyCollection,
    ) -> StrataResult<()> {
        let target = manager.entity_persister(&relation.target, self.as_of)?;
        let criteria = Criteria::from([(
            mapped_by(relation)?.to_string(),
            Value::Str(collection.owner_id().to_string()),
        )]);
        let ids = target.ids_by_criteria(&criteria).await?;
        target.attach_all(manager, ids, collection).await
    }

    pub async fn load_many_to_many(
        &self,
        manager: &ObjectManager,
        relation: &RelationDef,
        collection: &LazyCollection,
    ) -> StrataResult<()> {
        let target = manager.entity_persister(&relation.target, self.as_of)?;
        let owner_id = collection.owner_id();
        let ids = if relation.owning {
            match self.get_property_value(owner_id, &relation.name).await? {
                Some(Value::Str(json)) => parse_ids(&json)?,
                Some(Value::Null) => Vec::new(),
                Some(other) => {
                    return Err(StrataError::decode(format!(
                        "{}.{} holds {other:?} instead of an id list",
                        self.type_name, relation.name
                    )));
                }
                None if self.property_ever_recorded(owner_id, &relation.name).await? => Vec::new(),
                None => self.live_relation_ids(owner_id, &relation.name).await?,
            }
        } else {
            target
                .ids_by_membership(mapped_by(relation)?, owner_id)
                .await?
        };
        target.attach_all(manager, ids, collection).await
    }

    // Deleted or missing targets are dropped.
    async fn attach_all(
        &self,
        manager: &ObjectManager,
        ids: Vec<RecordId>,
        collection: &LazyCollection,
    ) -> StrataResult<()> {
        for id in ids {
            if let Some(object) = self.load_by_id(manager, &id, None).await? {
                collection.push_loaded(object);
            }
        }
        Ok(())
    }

    async fn latest_event(&self, id: &RecordId) -> StrataResult<Option<(UpdateKind, String)>> {
        let t = &self.ctx.tables;
        let mut select = history_select(t, &self.family, Some(id));
        at_or_before(&mut select, t, self.as_of);
        select
            .expr_as(
                Expr::col((t.update_type.clone(), AuditUpdateType::Name)),
                Alias::new(UPDATE_NAME),
            )
            .expr_as(
                Expr::col((t.entity.clone(), AuditEntity::Name)),
                Alias::new(ENTITY_NAME),
            )
            .order_by((t.version.clone(), AuditVersion::Id), Order::Desc)
            .limit(1);
        let Some(row) = query_one(&self.ctx.conn, &select).await? else {
            return Ok(None);
        };
        let kind: String = row.try_get("", UPDATE_NAME)?;
        let logged_type: String = row.try_get("", ENTITY_NAME)?;
        Ok(Some((kind.parse()?, logged_type)))
    }

    /// Version id of the latest deletion at or before this snapshot; history of a
    /// re-inserted record starts after it.
    async fn history_floor(&self, id: &RecordId) -> StrataResult<i64> {
        let cached = self.floors.borrow().get(id).copied();
        if let Some(floor) = cached {
            return Ok(floor);
        }
        let t = &self.ctx.tables;
        let mut select = history_select(t, &self.family, Some(id));
        at_or_before(&mut select, t, self.as_of);
        select
            .expr_as(
                Expr::col((t.version.clone(), AuditVersion::Id)),
                Alias::new(VERSION_ID),
            )
            .and_where(
                Expr::col((t.update_type.clone(), AuditUpdateType::Name))
                    .eq(UpdateKind::Delete.as_str()),
            )
            .order_by((t.version.clone(), AuditVersion::Id), Order::Desc)
            .limit(1);
        let floor = match query_one(&self.ctx.conn, &select).await? {
            Some(row) => row.try_get::<i64>("", VERSION_ID)?,
            None => 0,
        };
        self.floors.borrow_mut().insert(id.clone(), floor);
        Ok(floor)
    }

    fn content_select(
        &self,
        id: Option<&RecordId>,
        field: Option<&str>,
        bounded: bool,
    ) -> SelectStatement {
        let t = &self.ctx.tables;
        let mut select = history_select(t, &self.family, id);
        join_content(&mut select, t);
        if bounded {
            at_or_before(&mut select, t, self.as_of);
        }
        select
            .expr_as(
                Expr::col((t.property.clone(), AuditProperty::Name)),
                Alias::new(PROPERTY_NAME),
            )
            .expr_as(
                Expr::col((t.entity_record.clone(), AuditEntityRecord::LoggedEntityId)),
                Alias::new(LOGGED_ID),
            )
            .expr_as(
                Expr::col((t.content_record.clone(), AuditContentRecord::Id)),
                Alias::new(CONTENT_RECORD_ID),
            )
            .column((t.content.clone(), AuditContent::TextContent))
            .column((t.content.clone(), AuditContent::BlobContent));
        if let Some(field) = field {
            select.and_where(Expr::col((t.property.clone(), AuditProperty::Name)).eq(field));
        }
        select
    }

    async fn load_data(&self, id: &RecordId, logged_type: &str) -> StrataResult<RecordData> {
        let t = &self.ctx.tables;
        let floor = self.history_floor(id).await?;
        let mut select = self.content_select(Some(id), None, true);
        select
            .and_where(Expr::col((t.version.clone(), AuditVersion::Id)).gt(floor))
            .order_by((t.version.clone(), AuditVersion::Id), Order::Desc)
            .order_by((t.content_record.clone(), AuditContentRecord::Id), Order::Desc);
        let mut fields = FieldData::new();
        for row in query_all(&self.ctx.conn, &select).await? {
            let name: String = row.try_get("", PROPERTY_NAME)?;
            if !fields.contains_key(&name) {
                fields.insert(name, stored_value(&row)?);
            }
        }
        debug!(
            "loaded {} fields of {} {id} at {}",
            fields.len(),
            self.type_name,
            self.as_of
        );
        let type_name = self.concrete_type(&fields, logged_type)?;
        Ok(RecordData { type_name, fields })
    }

    async fn load_live(&self, id: &RecordId) -> StrataResult<Option<RecordData>> {
        if !self.ctx.live_fallback {
            return Ok(None);
        }
        let Some(loader) = &self.ctx.live else {
            return Ok(None);
        };
        let Some(fields) = loader.load_current(&self.type_name, id).await? else {
            return Ok(None);
        };
        debug!("{} {id} was never audited; using live state", self.type_name);
        let type_name = self.concrete_type(&fields, &self.type_name)?;
        Ok(Some(RecordData { type_name, fields }))
    }

    async fn live_relation_ids(&self, id: &RecordId, field: &str) -> StrataResult<Vec<RecordId>> {
        if !self.ctx.live_fallback {
            return Ok(Vec::new());
        }
        let Some(loader) = &self.ctx.live else {
            return Ok(Vec::new());
        };
        Ok(loader
            .load_relation_ids(&self.type_name, id, field)
            .await?
            .unwrap_or_default())
    }

    async fn property_ever_recorded(&self, id: &RecordId, field: &str) -> StrataResult<bool> {
        let mut select = self.content_select(Some(id), Some(field), false);
        select.limit(1);
        Ok(query_one(&self.ctx.conn, &select).await?.is_some())
    }

    /// Latest stored value of `field` per record, in first-audited order. Values
    /// logged before a record's latest deletion do not count.
    async fn latest_values(&self, field: &str) -> StrataResult<Vec<(RecordId, Value)>> {
        let t = &self.ctx.tables;
        let floors = self.deletion_floors().await?;
        let mut select = self.content_select(None, Some(field), true);
        select
            .expr_as(
                Expr::col((t.version.clone(), AuditVersion::Id)),
                Alias::new(VERSION_ID),
            )
            .order_by((t.entity_record.clone(), AuditEntityRecord::Id), Order::Asc)
            .order_by((t.version.clone(), AuditVersion::Id), Order::Desc)
            .order_by((t.content_record.clone(), AuditContentRecord::Id), Order::Desc);
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in query_all(&self.ctx.conn, &select).await? {
            let id = RecordId::new(row.try_get::<String>("", LOGGED_ID)?);
            if !seen.insert(id.clone()) {
                continue;
            }
            let version: i64 = row.try_get("", VERSION_ID)?;
            if version > floors.get(&id).copied().unwrap_or(0) {
                out.push((id, stored_value(&row)?));
            }
        }
        Ok(out)
    }

    /// History floor of every record of the family deleted at or before this snapshot.
    async fn deletion_floors(&self) -> StrataResult<HashMap<RecordId, i64>> {
        let t = &self.ctx.tables;
        let mut select = history_select(t, &self.family, None);
        at_or_before(&mut select, t, self.as_of);
        select
            .expr_as(
                Expr::col((t.entity_record.clone(), AuditEntityRecord::LoggedEntityId)),
                Alias::new(LOGGED_ID),
            )
            .expr_as(
                Expr::col((t.version.clone(), AuditVersion::Id)),
                Alias::new(VERSION_ID),
            )
            .and_where(
                Expr::col((t.update_type.clone(), AuditUpdateType::Name))
                    .eq(UpdateKind::Delete.as_str()),
            )
            .order_by((t.version.clone(), AuditVersion::Id), Order::Desc);
        let mut floors = HashMap::new();
        for row in query_all(&self.ctx.conn, &select).await? {
            let id = RecordId::new(row.try_get::<String>("", LOGGED_ID)?);
            let version: i64 = row.try_get("", VERSION_ID)?;
            floors.entry(id).or_insert(version);
        }
        for (id, floor) in &floors {
            self.floors.borrow_mut().entry(id.clone()).or_insert(*floor);
        }
        Ok(floors)
    }

    /// Criterion value in the form it is stored in.
    fn criterion_payload(&self, field: &str, value: &Value) -> StrataResult<Value> {
        let registry = &self.ctx.registry;
        if let Some(def) = registry.field(&self.type_name, field) {
            return Ok(def.kind.encode(field, value)?.into_value());
        }
        if registry.relation(&self.type_name, field).is_some() {
            return match (value, record_id_of(value)) {
                (Value::Null, _) => Ok(Value::Null),
                (_, Some(id)) => Ok(Value::Str(id.to_string())),
                (other, None) => Err(StrataError::conversion(format!(
                    "{field}: {other:?} is not a reference"
                ))),
            };
        }
        Err(StrataError::conversion(format!(
            "{} has no field {field}",
            self.type_name
        )))
    }

    fn concrete_type(&self, fields: &FieldData, logged_type: &str) -> StrataResult<String> {
        let registry = &self.ctx.registry;
        if let Some(field) = registry.discriminator_field(&self.type_name)
            && let Some(Value::Str(value)) = fields.get(field)
        {
            return Ok(registry
                .resolve_discriminator(&self.type_name, value)?
                .to_string());
        }
        if self.family.iter().any(|name| name == logged_type) {
            return Ok(logged_type.to_string());
        }
        Ok(self.type_name.clone())
    }
}

fn mapped_by(relation: &RelationDef) -> StrataResult<&str> {
    relation.mapped_by.as_deref().ok_or_else(|| {
        StrataError::validation(format!(
            "inverse {:?} relation {} has no mapped_by",
            relation.kind, relation.name
        ))
    })
}

fn stored_value(row: &QueryResult) -> StrataResult<Value> {
    if let Some(text) = read_opt_string(row, AuditContent::TextContent)? {
        return Ok(Value::Str(text));
    }
    if let Some(bytes) = read_opt_bytes(row, AuditContent::BlobContent)? {
        return Ok(Value::Blob(bytes));
    }
    Ok(Value::Null)
}

fn parse_ids(json: &str) -> StrataResult<Vec<RecordId>> {
    let ids: Vec<String> = serde_json::from_str(json)
        .map_err(|err| StrataError::decode(format!("invalid id list {json}: {err}")))?;
    Ok(ids.into_iter().map(RecordId::new).collect())
}

#[cfg(test)]
mod tests {
    use strata_core::RecordId;

    use super::parse_ids;

    #[test]
    fn parses_id_snapshots() {
        let ids = parse_ids("[\"10\",\"20\"]").expect("ids");
        assert_eq!(ids, vec![RecordId::from(10i64), RecordId::from(20i64)]);
        assert!(parse_ids("not json").is_err());
    }
}
