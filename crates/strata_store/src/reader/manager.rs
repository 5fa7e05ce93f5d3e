use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::rc::Rc;

use log::debug;
use strata_core::{
    FieldData, RecordId, RelationDef, RelationKind, SchemaRegistry, StrataError, StrataResult,
    Value, VersionGroupId,
};

use super::collection::LazyCollection;
use super::object::{Object, ObjectRef, Slot};
use super::persister::{Criteria, EntityPersister};
use super::{ReadContext, record_id_of};

/// How `ObjectManager::materialize` treats an object it builds.
#[derive(Clone, Debug, Default)]
pub struct MaterializeHints {
    /// Rebuild the identity-mapped instance even when it is already initialized.
    pub refresh: bool,
    /// Fill this instance in place instead of the identity-mapped one.
    pub refresh_target: Option<ObjectRef>,
    /// Set scalar fields only.
    pub partial: bool,
    /// Keep relation slots that are already populated.
    pub fetched: bool,
}

type IdentityKey = (String, RecordId, VersionGroupId);

/// A request-scoped reader session: the identity map and the persisters of every
/// snapshot touched through it.
///
/// Objects hold no back-pointer to their session, so every lazy access takes the
/// manager explicitly. Dropping the manager detaches all relation slots.
pub struct ObjectManager {
    ctx: Rc<ReadContext>,
    identity: RefCell<HashMap<IdentityKey, ObjectRef>>,
    persisters: RefCell<HashMap<(String, VersionGroupId), Rc<EntityPersister>>>,
}

impl ObjectManager {
    pub(crate) fn new(ctx: Rc<ReadContext>) -> Self {
        Self {
            ctx,
            identity: RefCell::new(HashMap::new()),
            persisters: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn context(&self) -> &Rc<ReadContext> {
        &self.ctx
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.ctx.registry
    }

    pub fn entity_persister(
        &self,
        type_name: &str,
        as_of: VersionGroupId,
    ) -> StrataResult<Rc<EntityPersister>> {
        let key = (type_name.to_string(), as_of);
        let cached = self.persisters.borrow().get(&key).cloned();
        if let Some(persister) = cached {
            return Ok(persister);
        }
        let persister = Rc::new(EntityPersister::new(self.ctx.clone(), type_name, as_of)?);
        self.persisters.borrow_mut().insert(key, persister.clone());
        Ok(persister)
    }

    /// Identity-map lookup; `root_type` is the root of the record's type family.
    pub fn try_get_by_id(
        &self,
        id: &RecordId,
        root_type: &str,
        as_of: VersionGroupId,
    ) -> Option<ObjectRef> {
        self.identity
            .borrow()
            .get(&(root_type.to_string(), id.clone(), as_of))
            .cloned()
    }

    pub fn identity_map_len(&self) -> usize {
        self.identity.borrow().len()
    }

    pub async fn find(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
        as_of: VersionGroupId,
    ) -> StrataResult<Option<ObjectRef>> {
        let id = id.into();
        self.entity_persister(type_name, as_of)?
            .load_by_id(self, &id, None)
            .await
    }

    pub async fn find_by(
        &self,
        type_name: &str,
        criteria: &Criteria,
        as_of: VersionGroupId,
    ) -> StrataResult<Option<ObjectRef>> {
        self.entity_persister(type_name, as_of)?
            .load(self, criteria, None, MaterializeHints::default())
            .await
    }

    /// Uninitialized placeholder for a record, registered in the identity map.
    pub fn get_proxy(
        &self,
        type_name: &str,
        identifier: &FieldData,
        as_of: VersionGroupId,
    ) -> StrataResult<ObjectRef> {
        let field = &self.registry().get(type_name)?.identifier;
        let id = identifier
            .get(field)
            .and_then(record_id_of)
            .ok_or_else(|| StrataError::missing_identifier(type_name, field))?;
        self.proxy_for(type_name, id, as_of)
    }

    pub(crate) fn proxy_for(
        &self,
        type_name: &str,
        id: RecordId,
        as_of: VersionGroupId,
    ) -> StrataResult<ObjectRef> {
        let key = (self.registry().root_of(type_name)?.to_string(), id, as_of);
        let mapped = self.identity.borrow().get(&key).cloned();
        if let Some(object) = mapped {
            return Ok(object);
        }
        let proxy = Object::new(type_name, key.1.clone(), as_of);
        self.identity.borrow_mut().insert(key, proxy.clone());
        Ok(proxy)
    }

    /// Loads a proxy's data into it. Initialized objects are left alone.
    pub async fn initialize_proxy(&self, object: &Object) -> StrataResult<()> {
        if object.is_initialized() {
            return Ok(());
        }
        let type_name = object.type_name();
        let root = self.registry().root_of(&type_name)?;
        let mapped = self
            .try_get_by_id(object.id(), root, object.as_of())
            .filter(|mapped| ptr::eq(Rc::as_ptr(mapped), object))
            .ok_or_else(|| {
                StrataError::validation(format!(
                    "{type_name} {} is not part of this session",
                    object.id()
                ))
            })?;
        let loaded = self
            .entity_persister(&type_name, object.as_of())?
            .load_by_id(self, object.id(), Some(mapped))
            .await?;
        match loaded {
            Some(_) => Ok(()),
            None => Err(StrataError::not_found(format!(
                "{type_name} {} has no data at {}",
                object.id(),
                object.as_of()
            ))),
        }
    }

    pub async fn load_collection(&self, collection: &LazyCollection) -> StrataResult<()> {
        let owner_type = collection.owner_type();
        let relation = self
            .registry()
            .relation(owner_type, collection.field())
            .ok_or_else(|| {
                StrataError::validation(format!(
                    "{owner_type} has no relation {}",
                    collection.field()
                ))
            })?;
        let persister = self.entity_persister(owner_type, collection.as_of())?;
        match relation.kind {
            RelationKind::OneToMany => {
                persister
                    .load_one_to_many(self, relation, collection)
                    .await
            }
            RelationKind::ManyToMany => {
                persister
                    .load_many_to_many(self, relation, collection)
                    .await
            }
            kind => Err(StrataError::validation(format!(
                "{owner_type}.{} is {kind:?}, not a collection",
                collection.field()
            ))),
        }
    }

    /// Builds (or fills) the object for `id` at `as_of` from stored field data.
    ///
    /// The object is registered and marked initialized before its relations resolve,
    /// so cycles end at it. If a relation fails to load, the object goes back to an
    /// empty proxy and, when this call created it, leaves the identity map.
    pub async fn materialize(
        &self,
        type_name: &str,
        id: &RecordId,
        data: &FieldData,
        as_of: VersionGroupId,
        hints: MaterializeHints,
    ) -> StrataResult<ObjectRef> {
        let key = (self.registry().root_of(type_name)?.to_string(), id.clone(), as_of);
        let mapped = self.identity.borrow().get(&key).cloned();
        let (object, created) = match (hints.refresh_target.clone(), mapped) {
            (Some(target), _) => (target, false),
            (None, Some(existing)) if existing.is_initialized() && !hints.refresh => {
                return Ok(existing);
            }
            (None, Some(existing)) => (existing, false),
            (None, None) => (Object::new(type_name, id.clone(), as_of), true),
        };
        let scalars = self.decode_scalars(type_name, id, data)?;
        self.identity.borrow_mut().insert(key.clone(), object.clone());
        for (field, value) in scalars {
            object.set_slot(&field, Slot::Scalar(value));
        }
        object.mark_initialized(type_name);
        debug!("materialized {type_name} {id} at {as_of}");

        if hints.partial {
            return Ok(object);
        }
        if let Err(err) = self
            .fill_relations(&object, type_name, data, as_of, hints.fetched)
            .await
        {
            object.reset();
            if created {
                self.forget(&key, &object);
            }
            debug!("rolled back {type_name} {id} at {as_of}: {err}");
            return Err(err);
        }
        Ok(object)
    }

    fn decode_scalars(
        &self,
        type_name: &str,
        id: &RecordId,
        data: &FieldData,
    ) -> StrataResult<Vec<(String, Value)>> {
        let registry = self.registry();
        let schema = registry.get(type_name)?;
        let fields = registry.effective_fields(type_name)?;
        let mut out = Vec::with_capacity(fields.len() + 2);
        for def in &fields {
            let mut raw = data.get(&def.name).cloned().unwrap_or(Value::Null);
            if def.name == schema.identifier && raw.is_null() {
                raw = Value::Str(id.to_string());
            }
            out.push((def.name.clone(), def.kind.decode(&def.name, raw)?));
        }
        if !fields.iter().any(|def| def.name == schema.identifier) {
            out.push((schema.identifier.clone(), Value::Str(id.to_string())));
        }
        if let Some(field) = registry.discriminator_field(type_name)
            && !fields.iter().any(|def| def.name == field)
        {
            let value = match (&schema.discriminator, data.get(field)) {
                (Some(discriminator), _) => Value::Str(discriminator.value.clone()),
                (None, Some(stored)) => stored.clone(),
                (None, None) => Value::Null,
            };
            out.push((field.to_string(), value));
        }
        Ok(out)
    }

    async fn fill_relations(
        &self,
        object: &ObjectRef,
        type_name: &str,
        data: &FieldData,
        as_of: VersionGroupId,
        fetched: bool,
    ) -> StrataResult<()> {
        for relation in self.registry().effective_relations(type_name)? {
            if fetched && object.peek(&relation.name).is_some() {
                continue;
            }
            if relation.kind.is_to_many() {
                let collection = Rc::new(LazyCollection::new(
                    object,
                    &relation.name,
                    &relation.target,
                ));
                object.set_slot(&relation.name, Slot::Many(collection.clone()));
                if relation.is_eager() {
                    collection.initialize(self).await?;
                }
            } else if !relation.owning {
                let target = self
                    .entity_persister(&relation.target, as_of)?
                    .load_one_to_one(self, relation, object, None)
                    .await?;
                object.set_slot(
                    &relation.name,
                    Slot::Inverse(target.as_ref().map(Rc::downgrade)),
                );
            } else {
                let target = self.resolve_owning(relation, data, as_of).await?;
                if let Some(target) = &target
                    && let Some(back) = &relation.inversed_by
                    && target.is_initialized()
                    && self
                        .registry()
                        .relation(&target.type_name(), back)
                        .is_some_and(|inverse| inverse.kind.is_to_one())
                {
                    target.set_slot(back, Slot::Inverse(Some(Rc::downgrade(object))));
                }
                object.set_slot(&relation.name, Slot::One(target));
            }
        }
        Ok(())
    }

    fn forget(&self, key: &IdentityKey, object: &ObjectRef) {
        let mut identity = self.identity.borrow_mut();
        if identity
            .get(key)
            .is_some_and(|mapped| Rc::ptr_eq(mapped, object))
        {
            identity.remove(key);
        }
    }

    // Deleted targets read as null; polymorphic targets load eagerly so their
    // concrete type is known.
    async fn resolve_owning(
        &self,
        relation: &RelationDef,
        data: &FieldData,
        as_of: VersionGroupId,
    ) -> StrataResult<Option<ObjectRef>> {
        let Some(target_id) = data.get(&relation.name).and_then(record_id_of) else {
            return Ok(None);
        };
        let persister = self.entity_persister(&relation.target, as_of)?;
        if persister.is_deleted(&target_id).await? {
            return Ok(None);
        }
        if relation.is_eager() || self.registry().has_subtypes(&relation.target) {
            return persister.load_by_id(self, &target_id, None).await;
        }
        Ok(Some(self.proxy_for(&relation.target, target_id, as_of)?))
    }

    /// Ends the session's current state: detaches and forgets every object.
    pub fn clear(&self) {
        let objects: Vec<ObjectRef> = self.identity.borrow_mut().drain().map(|(_, o)| o).collect();
        for object in objects {
            object.detach();
        }
        self.persisters.borrow_mut().clear();
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        self.clear();
    }
}
