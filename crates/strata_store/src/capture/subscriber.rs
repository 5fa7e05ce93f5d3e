use strata_core::{ChangeSet, HostRecord, StrataResult, UnitOfWork, VersionGroupId};

use super::{AuditLog, CommitLog};

/// Wires a host unit of work to the capture engine, one open commit at a time.
pub struct AuditSubscriber {
    log: AuditLog,
    open: Option<CommitLog>,
}

impl AuditSubscriber {
    pub fn new(log: AuditLog) -> Self {
        Self { log, open: None }
    }

    pub fn has_open_commit(&self) -> bool {
        self.open.is_some()
    }

    fn current(&mut self) -> &mut CommitLog {
        self.open.get_or_insert_with(|| self.log.begin_commit())
    }

    /// Opens the commit and snapshots identifiers of scheduled deletions.
    pub fn on_flush(&mut self, unit_of_work: &dyn UnitOfWork) -> usize {
        let deletions = unit_of_work.scheduled_deletions();
        self.current().precompute_deletions(&deletions)
    }

    pub async fn post_persist(
        &mut self,
        record: &HostRecord,
        changes: &ChangeSet,
    ) -> StrataResult<bool> {
        self.current().record_insert(record, changes).await
    }

    pub async fn post_update(
        &mut self,
        record: &HostRecord,
        changes: &ChangeSet,
    ) -> StrataResult<bool> {
        self.current().record_update(record, changes).await
    }

    pub async fn post_remove(&mut self, record: &HostRecord) -> StrataResult<bool> {
        self.current().record_removal(record).await
    }

    /// Persists the open commit, if any.
    pub async fn post_flush(&mut self) -> StrataResult<Option<VersionGroupId>> {
        match self.open.take() {
            Some(commit) => commit.commit().await,
            None => Ok(None),
        }
    }
}
