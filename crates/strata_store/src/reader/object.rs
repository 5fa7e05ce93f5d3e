use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};

use strata_core::{RecordId, StrataError, StrataResult, Value, VersionGroupId};

use super::collection::LazyCollection;
use super::manager::ObjectManager;

pub type ObjectRef = Rc<Object>;

/// One field of a materialized object.
#[derive(Clone)]
pub enum Slot {
    Scalar(Value),
    /// Owning to-one side; may hold an uninitialized proxy.
    One(Option<ObjectRef>),
    /// Inverse to-one side, a back-reference that never keeps its target alive.
    Inverse(Option<Weak<Object>>),
    Many(Rc<LazyCollection>),
}

/// A record as it existed at `as_of`. Proxies are objects with `initialized == false`.
pub struct Object {
    type_name: RefCell<String>,
    id: RecordId,
    as_of: VersionGroupId,
    initialized: Cell<bool>,
    slots: RefCell<BTreeMap<String, Slot>>,
}

impl Object {
    pub(crate) fn new(type_name: &str, id: RecordId, as_of: VersionGroupId) -> ObjectRef {
        Rc::new(Self {
            type_name: RefCell::new(type_name.to_string()),
            id,
            as_of,
            initialized: Cell::new(false),
            slots: RefCell::new(BTreeMap::new()),
        })
    }

    pub fn type_name(&self) -> String {
        self.type_name.borrow().clone()
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn as_of(&self) -> VersionGroupId {
        self.as_of
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.get()
    }

    pub(crate) fn mark_initialized(&self, type_name: &str) {
        *self.type_name.borrow_mut() = type_name.to_string();
        self.initialized.set(true);
    }

    /// Back to an empty proxy.
    pub(crate) fn reset(&self) {
        self.detach();
        self.initialized.set(false);
    }

    pub(crate) fn set_slot(&self, field: &str, slot: Slot) {
        self.slots.borrow_mut().insert(field.to_string(), slot);
    }

    /// Current slot content without triggering any load.
    pub fn peek(&self, field: &str) -> Option<Slot> {
        self.slots.borrow().get(field).cloned()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.slots.borrow().keys().cloned().collect()
    }

    pub async fn value(&self, manager: &ObjectManager, field: &str) -> StrataResult<Value> {
        manager.initialize_proxy(self).await?;
        match self.peek(field) {
            Some(Slot::Scalar(value)) => Ok(value),
            Some(_) => Err(StrataError::validation(format!(
                "{}.{field} is a relation",
                self.type_name()
            ))),
            None => Err(StrataError::validation(format!(
                "{} has no field {field}",
                self.type_name()
            ))),
        }
    }

    /// Resolves a to-one relation, initializing its proxy. A target with no data at
    /// this snapshot reads as `None`.
    pub async fn related(
        &self,
        manager: &ObjectManager,
        field: &str,
    ) -> StrataResult<Option<ObjectRef>> {
        manager.initialize_proxy(self).await?;
        match self.peek(field) {
            Some(Slot::One(Some(target))) => match manager.initialize_proxy(&target).await {
                Ok(()) => Ok(Some(target)),
                Err(err) if err.is_not_found() => {
                    self.set_slot(field, Slot::One(None));
                    Ok(None)
                }
                Err(err) => Err(err),
            },
            Some(Slot::One(None)) | Some(Slot::Inverse(None)) => Ok(None),
            Some(Slot::Inverse(Some(target))) => Ok(target.upgrade()),
            Some(Slot::Scalar(_)) | Some(Slot::Many(_)) => Err(StrataError::validation(format!(
                "{}.{field} is not a to-one relation",
                self.type_name()
            ))),
            None => self.missing_relation(manager, field).map(|()| None),
        }
    }

    pub async fn collection(
        &self,
        manager: &ObjectManager,
        field: &str,
    ) -> StrataResult<Option<Rc<LazyCollection>>> {
        manager.initialize_proxy(self).await?;
        match self.peek(field) {
            Some(Slot::Many(collection)) => Ok(Some(collection)),
            Some(_) => Err(StrataError::validation(format!(
                "{}.{field} is not a collection",
                self.type_name()
            ))),
            None => self.missing_relation(manager, field).map(|()| None),
        }
    }

    // Relations are absent after a partial materialization.
    fn missing_relation(&self, manager: &ObjectManager, field: &str) -> StrataResult<()> {
        if manager.registry().relation(&self.type_name(), field).is_some() {
            Ok(())
        } else {
            Err(StrataError::validation(format!(
                "{} has no relation {field}",
                self.type_name()
            )))
        }
    }

    /// Drops every relation slot so reference cycles can be freed.
    pub(crate) fn detach(&self) {
        let slots = std::mem::take(&mut *self.slots.borrow_mut());
        for slot in slots.into_values() {
            if let Slot::Many(collection) = slot {
                collection.detach();
            }
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("type_name", &self.type_name())
            .field("id", &self.id)
            .field("as_of", &self.as_of)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
