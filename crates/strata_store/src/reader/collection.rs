use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use async_recursion::async_recursion;
use log::debug;
use strata_core::{RecordId, StrataError, StrataResult, VersionGroupId};

use super::manager::ObjectManager;
use super::object::{Object, ObjectRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Uninitialized,
    Loading,
    Initialized,
}

/// A to-many relation of one owner at one snapshot, loaded on first access.
///
/// Only `Uninitialized` moves to `Loading`; a failed load falls back to
/// `Uninitialized` and `Initialized` is final.
pub struct LazyCollection {
    owner: Weak<Object>,
    owner_type: String,
    owner_id: RecordId,
    field: String,
    target_type: String,
    as_of: VersionGroupId,
    state: Cell<LoadState>,
    dirty: Cell<bool>,
    items: RefCell<Vec<ObjectRef>>,
    snapshot: RefCell<Vec<ObjectRef>>,
}

impl LazyCollection {
    pub(crate) fn new(owner: &ObjectRef, field: &str, target_type: &str) -> Self {
        Self {
            owner: Rc::downgrade(owner),
            owner_type: owner.type_name(),
            owner_id: owner.id().clone(),
            field: field.to_string(),
            target_type: target_type.to_string(),
            as_of: owner.as_of(),
            state: Cell::new(LoadState::Uninitialized),
            dirty: Cell::new(false),
            items: RefCell::new(Vec::new()),
            snapshot: RefCell::new(Vec::new()),
        }
    }

    pub fn owner(&self) -> Option<ObjectRef> {
        self.owner.upgrade()
    }

    pub fn owner_type(&self) -> &str {
        &self.owner_type
    }

    pub fn owner_id(&self) -> &RecordId {
        &self.owner_id
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn target_type(&self) -> &str {
        &self.target_type
    }

    pub fn as_of(&self) -> VersionGroupId {
        self.as_of
    }

    pub fn state(&self) -> LoadState {
        self.state.get()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.get() == LoadState::Initialized
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Loads the members once. Access while loading (a cycle reaching back into this
    /// collection) returns immediately and sees the members loaded so far.
    #[async_recursion(?Send)]
    pub async fn initialize(&self, manager: &ObjectManager) -> StrataResult<()> {
        if self.state.get() != LoadState::Uninitialized {
            return Ok(());
        }
        self.state.set(LoadState::Loading);
        match manager.load_collection(self).await {
            Ok(()) => {
                self.state.set(LoadState::Initialized);
                self.snapshot.replace(self.items.borrow().clone());
                debug!(
                    "loaded {}.{} of {} with {} members",
                    self.owner_type,
                    self.field,
                    self.owner_id,
                    self.items.borrow().len()
                );
                Ok(())
            }
            Err(err) => {
                self.items.borrow_mut().clear();
                self.state.set(LoadState::Uninitialized);
                Err(err)
            }
        }
    }

    pub(crate) fn push_loaded(&self, object: ObjectRef) {
        let mut items = self.items.borrow_mut();
        if !items.iter().any(|item| Rc::ptr_eq(item, &object)) {
            items.push(object);
        }
    }

    pub async fn items(&self, manager: &ObjectManager) -> StrataResult<Vec<ObjectRef>> {
        self.initialize(manager).await?;
        Ok(self.items.borrow().clone())
    }

    pub async fn ids(&self, manager: &ObjectManager) -> StrataResult<Vec<RecordId>> {
        Ok(self
            .items(manager)
            .await?
            .iter()
            .map(|item| item.id().clone())
            .collect())
    }

    pub async fn len(&self, manager: &ObjectManager) -> StrataResult<usize> {
        self.initialize(manager).await?;
        Ok(self.items.borrow().len())
    }

    pub async fn is_empty(&self, manager: &ObjectManager) -> StrataResult<bool> {
        Ok(self.len(manager).await? == 0)
    }

    pub async fn contains(&self, manager: &ObjectManager, object: &ObjectRef) -> StrataResult<bool> {
        self.initialize(manager).await?;
        Ok(self
            .items
            .borrow()
            .iter()
            .any(|item| Rc::ptr_eq(item, object)))
    }

    pub async fn get(&self, manager: &ObjectManager, index: usize) -> StrataResult<Option<ObjectRef>> {
        self.initialize(manager).await?;
        Ok(self.items.borrow().get(index).cloned())
    }

    pub async fn add(&self, manager: &ObjectManager, object: ObjectRef) -> StrataResult<()> {
        self.initialize(manager).await?;
        self.items.borrow_mut().push(object);
        self.dirty.set(true);
        Ok(())
    }

    pub async fn remove(&self, manager: &ObjectManager, object: &ObjectRef) -> StrataResult<bool> {
        self.initialize(manager).await?;
        let mut items = self.items.borrow_mut();
        let Some(position) = items.iter().position(|item| Rc::ptr_eq(item, object)) else {
            return Ok(false);
        };
        items.remove(position);
        self.dirty.set(true);
        Ok(true)
    }

    pub async fn set(
        &self,
        manager: &ObjectManager,
        index: usize,
        object: ObjectRef,
    ) -> StrataResult<()> {
        self.initialize(manager).await?;
        let mut items = self.items.borrow_mut();
        let Some(slot) = items.get_mut(index) else {
            return Err(StrataError::validation(format!(
                "index {index} out of range for {}.{}",
                self.owner_type, self.field
            )));
        };
        *slot = object;
        self.dirty.set(true);
        Ok(())
    }

    /// Clearing an unloaded collection does nothing and does not load it.
    pub fn clear(&self) {
        if self.state.get() == LoadState::Uninitialized {
            return;
        }
        self.items.borrow_mut().clear();
        self.dirty.set(true);
    }

    pub fn take_snapshot(&self) {
        self.snapshot.replace(self.items.borrow().clone());
        self.dirty.set(false);
    }

    pub fn snapshot(&self) -> Vec<ObjectRef> {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn detach(&self) {
        self.items.borrow_mut().clear();
        self.snapshot.borrow_mut().clear();
    }
}
