//! Temporal audit store: captures record mutations as append-only version history
//! and rebuilds record graphs as they were at any version group.

pub mod capture;
pub mod config;
pub mod datastore;
pub mod db;
pub mod migration;
pub mod policy;
pub mod reader;
pub mod store;

pub use strata_core::*;

pub use capture::{AuditLog, AuditSubscriber, CommitLog};
pub use config::{
    ActorSource, AuditConfig, DatabaseConfig, PoolConfig, ReaderConfig, StrataConfig, TableConfig,
};
pub use datastore::{default_sqlite_path, load_or_init_config, open_store};
pub use policy::AuditPolicy;
pub use reader::{
    Criteria, EntityPersister, LazyCollection, LoadState, MaterializeHints, Object, ObjectManager,
    ObjectRef, Reader, RecordData, Revision, RevisionPage, RevisionView, Slot, SortOrder,
};
pub use store::AuditStore;
