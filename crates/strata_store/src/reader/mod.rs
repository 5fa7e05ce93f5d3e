//! Point-in-time reconstruction of audited record graphs.

mod collection;
mod facade;
mod manager;
mod object;
mod persister;
mod queries;
mod revision;

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use strata_core::{LiveRecordLoader, RecordId, SchemaRegistry, Value};

use crate::db::TableNames;

pub use collection::{LazyCollection, LoadState};
pub use facade::Reader;
pub use manager::{MaterializeHints, ObjectManager};
pub use object::{Object, ObjectRef, Slot};
pub use persister::{Criteria, EntityPersister, RecordData};
pub use queries::{RevisionPage, SortOrder};
pub use revision::{Revision, RevisionView};

/// What every reader session needs from the store.
pub(crate) struct ReadContext {
    pub conn: DatabaseConnection,
    pub tables: TableNames,
    pub registry: Arc<SchemaRegistry>,
    pub live: Option<Arc<dyn LiveRecordLoader + Send + Sync>>,
    pub live_fallback: bool,
}

/// Identifier text of a stored or live reference value.
pub(crate) fn record_id_of(value: &Value) -> Option<RecordId> {
    match value {
        Value::Str(text) if !text.is_empty() => Some(RecordId::new(text.clone())),
        Value::I64(number) => Some(RecordId::from(*number)),
        _ => None,
    }
}
