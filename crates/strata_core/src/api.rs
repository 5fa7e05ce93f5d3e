use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ObjectHandle, RecordId, StrataResult, Value};

/// Reference to a related host record as seen in a change-set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelatedRef {
    pub type_name: String,
    pub id: Option<RecordId>,
}

impl RelatedRef {
    pub fn new(type_name: &str, id: impl Into<RecordId>) -> Self {
        Self {
            type_name: type_name.to_string(),
            id: Some(id.into()),
        }
    }

    /// A related record the host has not assigned an id yet.
    pub fn unsaved(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            id: None,
        }
    }
}

/// Value of one field on the host side of a change-set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum HostValue {
    Null,
    Value(Value),
    Ref(RelatedRef),
    Refs(Vec<RelatedRef>),
}

impl HostValue {
    pub fn is_null(&self) -> bool {
        matches!(self, HostValue::Null | HostValue::Value(Value::Null))
    }
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        HostValue::Value(value)
    }
}

impl From<RelatedRef> for HostValue {
    fn from(value: RelatedRef) -> Self {
        HostValue::Ref(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: HostValue,
    pub new: HostValue,
}

impl FieldChange {
    pub fn new(old: impl Into<HostValue>, new: impl Into<HostValue>) -> Self {
        Self {
            old: old.into(),
            new: new.into(),
        }
    }

    pub fn set(new: impl Into<HostValue>) -> Self {
        Self {
            old: HostValue::Null,
            new: new.into(),
        }
    }
}

/// Field name to (old, new) for one mutated record.
pub type ChangeSet = BTreeMap<String, FieldChange>;

/// Current field values keyed by field name, as returned by a live loader.
pub type FieldData = BTreeMap<String, Value>;

/// Host-side state of one to-many relation at flush time.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionState {
    pub members: Vec<RelatedRef>,
    pub dirty: bool,
}

/// Host record view handed to the capture engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    pub handle: ObjectHandle,
    pub type_name: String,
    pub id: Option<RecordId>,
    #[serde(default)]
    pub collections: BTreeMap<String, CollectionState>,
}

impl HostRecord {
    pub fn new(handle: u64, type_name: &str, id: impl Into<RecordId>) -> Self {
        Self {
            handle: ObjectHandle(handle),
            type_name: type_name.to_string(),
            id: Some(id.into()),
            collections: BTreeMap::new(),
        }
    }

    pub fn with_collection(mut self, field: &str, members: Vec<RelatedRef>, dirty: bool) -> Self {
        self.collections
            .insert(field.to_string(), CollectionState { members, dirty });
        self
    }
}

/// Reads the host's current state of records that were never audited.
#[async_trait]
pub trait LiveRecordLoader {
    async fn load_current(&self, type_name: &str, id: &RecordId)
    -> StrataResult<Option<FieldData>>;

    async fn load_relation_ids(
        &self,
        type_name: &str,
        id: &RecordId,
        field: &str,
    ) -> StrataResult<Option<Vec<RecordId>>>;
}

pub trait ActorAccessor {
    fn current_actor(&self) -> StrataResult<Option<String>>;
}

/// The slice of a host unit of work the lifecycle adapter needs.
pub trait UnitOfWork {
    fn scheduled_deletions(&self) -> Vec<HostRecord>;
}

#[cfg(test)]
mod tests {
    use super::{FieldChange, HostRecord, HostValue, RelatedRef};
    use crate::{RecordId, Value};

    #[test]
    fn field_changes_wrap_values() {
        let change = FieldChange::new(Value::from("Alice"), Value::from("Bob"));
        assert_eq!(change.new, HostValue::Value(Value::Str("Bob".to_string())));
        assert!(FieldChange::set(Value::Null).new.is_null());
    }

    #[test]
    fn host_records_carry_collection_state() {
        let record = HostRecord::new(1, "Post", 7i64).with_collection(
            "tags",
            vec![RelatedRef::new("Tag", 10i64), RelatedRef::unsaved("Tag")],
            true,
        );
        assert_eq!(record.id, Some(RecordId::from("7")));
        let tags = &record.collections["tags"];
        assert!(tags.dirty);
        assert_eq!(tags.members[1].id, None);
    }
}
