use std::marker::PhantomData;
use std::rc::Rc;

use strata_core::{RecordId, StrataResult, VersionGroupId};

use super::manager::ObjectManager;
use super::queries::{self, RevisionFilter, RevisionPage};
use super::revision::{Revision, RevisionView};

/// Revision history queries for single records, ordered by version group id.
///
/// Every view handed out shares this reader's session, so the same record at the
/// same version group is the same object across views.
pub struct Reader<V: RevisionView = Revision> {
    manager: Rc<ObjectManager>,
    view: PhantomData<V>,
}

impl<V: RevisionView> Reader<V> {
    pub(crate) fn new(manager: Rc<ObjectManager>) -> Self {
        Self {
            manager,
            view: PhantomData,
        }
    }

    pub fn manager(&self) -> &Rc<ObjectManager> {
        &self.manager
    }

    pub async fn find_all_revisions(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
        page: RevisionPage,
    ) -> StrataResult<Vec<V>> {
        self.revisions(type_name, id.into(), RevisionFilter::All, page)
            .await
    }

    /// Revisions strictly after `group`.
    pub async fn find_revisions_after(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
        group: VersionGroupId,
        page: RevisionPage,
    ) -> StrataResult<Vec<V>> {
        self.revisions(type_name, id.into(), RevisionFilter::After(group), page)
            .await
    }

    /// Revisions strictly before `group`.
    pub async fn find_revisions_before(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
        group: VersionGroupId,
        page: RevisionPage,
    ) -> StrataResult<Vec<V>> {
        self.revisions(type_name, id.into(), RevisionFilter::Before(group), page)
            .await
    }

    /// Revisions that wrote `property`, optionally only those writing `value`.
    ///
    /// Only text-stored properties match: scalars, to-one ids and collection
    /// snapshots. Changes to blob fields are never returned.
    pub async fn find_revisions_by_changed_property(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
        property: &str,
        value: Option<&str>,
        page: RevisionPage,
    ) -> StrataResult<Vec<V>> {
        let filter = RevisionFilter::ChangedProperty {
            name: property,
            value,
        };
        self.revisions(type_name, id.into(), filter, page).await
    }

    pub async fn get_current_revision(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
    ) -> StrataResult<Option<V>> {
        Ok(self
            .find_all_revisions(type_name, id, RevisionPage::limit(1))
            .await?
            .into_iter()
            .next())
    }

    pub async fn get_revision(
        &self,
        type_name: &str,
        id: impl Into<RecordId>,
        group: VersionGroupId,
    ) -> StrataResult<Option<V>> {
        self.manager.registry().get(type_name)?;
        let Some(group) = queries::version_group(self.manager.context(), group).await? else {
            return Ok(None);
        };
        Ok(Some(V::from_revision(Revision::new(
            self.manager.clone(),
            type_name,
            id.into(),
            group,
        ))))
    }

    async fn revisions(
        &self,
        type_name: &str,
        id: RecordId,
        filter: RevisionFilter<'_>,
        page: RevisionPage,
    ) -> StrataResult<Vec<V>> {
        let family = self.manager.registry().family(type_name)?;
        let groups =
            queries::version_groups(self.manager.context(), &family, &id, filter, page).await?;
        Ok(groups
            .into_iter()
            .map(|group| {
                V::from_revision(Revision::new(
                    self.manager.clone(),
                    type_name,
                    id.clone(),
                    group,
                ))
            })
            .collect())
    }
}
