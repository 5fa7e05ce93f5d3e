use std::cell::OnceCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use strata_core::{RecordId, StrataResult, Value, VersionGroup, VersionGroupId};

use super::manager::{MaterializeHints, ObjectManager};
use super::object::{ObjectRef, Slot};
use super::persister::{Criteria, EntityPersister};
use super::queries::{self, RevisionFilter};

/// One record as of one version group.
pub struct Revision {
    manager: Rc<ObjectManager>,
    type_name: String,
    id: RecordId,
    group: VersionGroup,
    entity: OnceCell<Option<ObjectRef>>,
    changed: OnceCell<BTreeSet<String>>,
}

impl Revision {
    pub(crate) fn new(
        manager: Rc<ObjectManager>,
        type_name: &str,
        id: RecordId,
        group: VersionGroup,
    ) -> Self {
        Self {
            manager,
            type_name: type_name.to_string(),
            id,
            group,
            entity: OnceCell::new(),
            changed: OnceCell::new(),
        }
    }

    pub fn manager(&self) -> &Rc<ObjectManager> {
        &self.manager
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn version_group(&self) -> &VersionGroup {
        &self.group
    }

    pub fn version_group_id(&self) -> VersionGroupId {
        self.group.id
    }

    pub fn actor_id(&self) -> Option<&str> {
        self.group.actor_id.as_deref()
    }

    /// Commit time in epoch milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.group.timestamp
    }

    pub fn committed_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.group.timestamp)
    }

    pub fn persister(&self) -> StrataResult<Rc<EntityPersister>> {
        self.manager.entity_persister(&self.type_name, self.group.id)
    }

    /// The record as of this version group; `None` when it did not exist then.
    pub async fn entity(&self) -> StrataResult<Option<ObjectRef>> {
        if let Some(entity) = self.entity.get() {
            return Ok(entity.clone());
        }
        let identifier = self.manager.registry().get(&self.type_name)?.identifier.clone();
        let criteria = Criteria::from([(identifier, Value::Str(self.id.to_string()))]);
        let loaded = self
            .persister()?
            .load(&self.manager, &criteria, None, MaterializeHints::default())
            .await?;
        Ok(self.entity.get_or_init(|| loaded).clone())
    }

    /// Scalar value of `field` at this version group, from the loaded entity when
    /// there is one and from a single-field read otherwise.
    pub async fn entity_property(&self, field: &str) -> StrataResult<Option<Value>> {
        if let Some(entity) = self.entity().await?
            && let Some(Slot::Scalar(value)) = entity.peek(field)
        {
            return Ok(Some(value));
        }
        let raw = self.persister()?.get_property_value(&self.id, field).await?;
        match (raw, self.manager.registry().field(&self.type_name, field)) {
            (Some(raw), Some(def)) => Ok(Some(def.kind.decode(field, raw)?)),
            (raw, _) => Ok(raw),
        }
    }

    /// Fields of this record written in exactly this version group.
    pub async fn changed_properties(&self) -> StrataResult<BTreeSet<String>> {
        if let Some(changed) = self.changed.get() {
            return Ok(changed.clone());
        }
        let changed = self.changed_properties_of(&self.type_name, &self.id).await?;
        Ok(self.changed.get_or_init(|| changed).clone())
    }

    /// Fields of another record written in this version group.
    pub async fn changed_properties_of(
        &self,
        type_name: &str,
        id: &RecordId,
    ) -> StrataResult<BTreeSet<String>> {
        let family = self.manager.registry().family(type_name)?;
        queries::changed_properties(self.manager.context(), &family, id, self.group.id).await
    }

    pub async fn is_property_changed(&self, field: &str) -> StrataResult<bool> {
        Ok(self.changed_properties().await?.contains(field))
    }

    /// 1-based position of this version group in the record's history.
    pub async fn entity_revision_number(&self) -> StrataResult<u64> {
        let family = self.manager.registry().family(&self.type_name)?;
        let before = queries::count_version_groups(
            self.manager.context(),
            &family,
            &self.id,
            RevisionFilter::Before(self.group.id),
        )
        .await?;
        Ok(before + 1)
    }
}

/// What the reader hands out for each version group; hosts wrap `Revision` to add
/// their own accessors.
pub trait RevisionView: Sized {
    fn from_revision(revision: Revision) -> Self;

    fn revision(&self) -> &Revision;
}

impl RevisionView for Revision {
    fn from_revision(revision: Revision) -> Self {
        revision
    }

    fn revision(&self) -> &Revision {
        self
    }
}
