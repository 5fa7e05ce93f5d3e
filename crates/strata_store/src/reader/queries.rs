use std::collections::BTreeSet;

use sea_orm::sea_query::{Alias, Expr, Func, Order, Query, SelectStatement};
use serde::{Deserialize, Serialize};

use strata_core::{PropertyKind, RecordId, StrataResult, VersionGroup, VersionGroupId};

use super::ReadContext;
use crate::db::*;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn order(self) -> Order {
        match self {
            SortOrder::Asc => Order::Asc,
            SortOrder::Desc => Order::Desc,
        }
    }
}

/// Paging of revision queries. An offset only applies together with a limit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionPage {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    #[serde(default)]
    pub order: SortOrder,
}

impl RevisionPage {
    pub fn limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn ascending(mut self) -> Self {
        self.order = SortOrder::Asc;
        self
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum RevisionFilter<'a> {
    All,
    After(VersionGroupId),
    Before(VersionGroupId),
    ChangedProperty {
        name: &'a str,
        value: Option<&'a str>,
    },
}

pub(crate) const VERSION_ID: &str = "version_id";
pub(crate) const CONTENT_RECORD_ID: &str = "content_record_id";
pub(crate) const UPDATE_NAME: &str = "update_name";
pub(crate) const ENTITY_NAME: &str = "entity_name";
pub(crate) const PROPERTY_NAME: &str = "property_name";
pub(crate) const LOGGED_ID: &str = "logged_id";
const GROUP_COUNT: &str = "group_count";

/// Versions of records logged under any of `family`, optionally of one record:
/// version, update type, entity record and entity joined.
pub(crate) fn history_select(
    t: &TableNames,
    family: &[String],
    id: Option<&RecordId>,
) -> SelectStatement {
    let mut select = Query::select();
    select
        .from(t.version.clone())
        .inner_join(
            t.update_type.clone(),
            Expr::col((t.version.clone(), AuditVersion::UpdateTypeId))
                .equals((t.update_type.clone(), AuditUpdateType::Id)),
        )
        .inner_join(
            t.entity_record.clone(),
            Expr::col((t.update_type.clone(), AuditUpdateType::EntityRecordId))
                .equals((t.entity_record.clone(), AuditEntityRecord::Id)),
        )
        .inner_join(
            t.entity.clone(),
            Expr::col((t.entity_record.clone(), AuditEntityRecord::EntityId))
                .equals((t.entity.clone(), AuditEntity::Id)),
        )
        .and_where(Expr::col((t.entity.clone(), AuditEntity::Name)).is_in(family.iter().cloned()));
    if let Some(id) = id {
        select.and_where(
            Expr::col((t.entity_record.clone(), AuditEntityRecord::LoggedEntityId)).eq(id.as_str()),
        );
    }
    select
}

/// Extends a history select with the content records of each version.
pub(crate) fn join_content(select: &mut SelectStatement, t: &TableNames) {
    select
        .inner_join(
            t.content_record.clone(),
            Expr::col((t.content_record.clone(), AuditContentRecord::VersionId))
                .equals((t.version.clone(), AuditVersion::Id)),
        )
        .inner_join(
            t.property_type.clone(),
            Expr::col((t.content_record.clone(), AuditContentRecord::PropertyTypeId))
                .equals((t.property_type.clone(), AuditPropertyType::Id)),
        )
        .inner_join(
            t.property.clone(),
            Expr::col((t.property_type.clone(), AuditPropertyType::PropertyId))
                .equals((t.property.clone(), AuditProperty::Id)),
        )
        .inner_join(
            t.content.clone(),
            Expr::col((t.content.clone(), AuditContent::ContentRecordId))
                .equals((t.content_record.clone(), AuditContentRecord::Id)),
        );
}

pub(crate) fn at_or_before(select: &mut SelectStatement, t: &TableNames, as_of: VersionGroupId) {
    select.and_where(
        Expr::col((t.version.clone(), AuditVersion::VersionGroupId)).lte(as_of.as_i64()),
    );
}

pub(crate) async fn version_groups(
    ctx: &ReadContext,
    family: &[String],
    id: &RecordId,
    filter: RevisionFilter<'_>,
    page: RevisionPage,
) -> StrataResult<Vec<VersionGroup>> {
    let t = &ctx.tables;
    let mut select = history_select(t, family, Some(id));
    select
        .distinct()
        .column((t.version_group.clone(), AuditVersionGroup::Id))
        .column((t.version_group.clone(), AuditVersionGroup::Timestamp))
        .column((t.version_group.clone(), AuditVersionGroup::ActorId))
        .inner_join(
            t.version_group.clone(),
            Expr::col((t.version.clone(), AuditVersion::VersionGroupId))
                .equals((t.version_group.clone(), AuditVersionGroup::Id)),
        );
    let group_id = || Expr::col((t.version_group.clone(), AuditVersionGroup::Id));
    match filter {
        RevisionFilter::All => {}
        RevisionFilter::After(group) => {
            select.and_where(group_id().gt(group.as_i64()));
        }
        RevisionFilter::Before(group) => {
            select.and_where(group_id().lt(group.as_i64()));
        }
        RevisionFilter::ChangedProperty { name, value } => {
            join_content(&mut select, t);
            select
                .and_where(Expr::col((t.property.clone(), AuditProperty::Name)).eq(name))
                .and_where(
                    Expr::col((t.property_type.clone(), AuditPropertyType::Name))
                        .eq(PropertyKind::Text.as_str()),
                );
            if let Some(value) = value {
                select.and_where(Expr::col((t.content.clone(), AuditContent::TextContent)).eq(value));
            }
        }
    }
    select.order_by((t.version_group.clone(), AuditVersionGroup::Id), page.order.order());
    if let Some(limit) = page.limit {
        select.limit(limit);
        if let Some(offset) = page.offset {
            select.offset(offset);
        }
    }
    query_all(&ctx.conn, &select)
        .await?
        .iter()
        .map(|row| -> StrataResult<VersionGroup> {
            Ok(VersionGroup {
                id: VersionGroupId(read_i64(row, AuditVersionGroup::Id)?),
                timestamp: read_i64(row, AuditVersionGroup::Timestamp)?,
                actor_id: read_opt_string(row, AuditVersionGroup::ActorId)?,
            })
        })
        .collect()
}

pub(crate) async fn version_group(
    ctx: &ReadContext,
    group: VersionGroupId,
) -> StrataResult<Option<VersionGroup>> {
    let select = Query::select()
        .columns([
            AuditVersionGroup::Id,
            AuditVersionGroup::Timestamp,
            AuditVersionGroup::ActorId,
        ])
        .from(ctx.tables.version_group.clone())
        .and_where(Expr::col(AuditVersionGroup::Id).eq(group.as_i64()))
        .to_owned();
    let Some(row) = query_one(&ctx.conn, &select).await? else {
        return Ok(None);
    };
    Ok(Some(VersionGroup {
        id: VersionGroupId(read_i64(&row, AuditVersionGroup::Id)?),
        timestamp: read_i64(&row, AuditVersionGroup::Timestamp)?,
        actor_id: read_opt_string(&row, AuditVersionGroup::ActorId)?,
    }))
}

/// Number of distinct version groups of one record strictly before or after `group`.
pub(crate) async fn count_version_groups(
    ctx: &ReadContext,
    family: &[String],
    id: &RecordId,
    filter: RevisionFilter<'_>,
) -> StrataResult<u64> {
    let t = &ctx.tables;
    let mut select = history_select(t, family, Some(id));
    let group_id = || Expr::col((t.version.clone(), AuditVersion::VersionGroupId));
    select.expr_as(Func::count_distinct(group_id()), Alias::new(GROUP_COUNT));
    match filter {
        RevisionFilter::After(group) => {
            select.and_where(group_id().gt(group.as_i64()));
        }
        RevisionFilter::Before(group) => {
            select.and_where(group_id().lt(group.as_i64()));
        }
        RevisionFilter::All | RevisionFilter::ChangedProperty { .. } => {}
    }
    let count = match query_one(&ctx.conn, &select).await? {
        Some(row) => row.try_get::<i64>("", GROUP_COUNT)?,
        None => 0,
    };
    Ok(u64::try_from(count).unwrap_or_default())
}

/// Names of the properties of one record written in exactly `group`.
pub(crate) async fn changed_properties(
    ctx: &ReadContext,
    family: &[String],
    id: &RecordId,
    group: VersionGroupId,
) -> StrataResult<BTreeSet<String>> {
    let t = &ctx.tables;
    let mut select = history_select(t, family, Some(id));
    join_content(&mut select, t);
    select
        .distinct()
        .expr_as(
            Expr::col((t.property.clone(), AuditProperty::Name)),
            Alias::new(PROPERTY_NAME),
        )
        .and_where(
            Expr::col((t.version.clone(), AuditVersion::VersionGroupId)).eq(group.as_i64()),
        );
    query_all(&ctx.conn, &select)
        .await?
        .iter()
        .map(|row| -> StrataResult<String> { Ok(row.try_get("", PROPERTY_NAME)?) })
        .collect()
}

#[cfg(test)]
mod tests {
    use sea_orm::DatabaseBackend;

    use super::{RevisionPage, SortOrder, history_select, join_content};
    use crate::db::{TableNames, build_stmt};
    use strata_core::RecordId;

    #[test]
    fn pages_default_to_descending() {
        let page = RevisionPage::default();
        assert_eq!(page.order, SortOrder::Desc);
        assert_eq!(page.limit, None);
        let page = RevisionPage::limit(5).offset(10).ascending();
        assert_eq!(page.offset, Some(10));
        assert_eq!(page.order, SortOrder::Asc);
    }

    #[test]
    fn history_select_joins_the_record_chain() {
        let tables = TableNames::new("audit_", "");
        let family = vec!["Post".to_string()];
        let mut select = history_select(&tables, &family, Some(&RecordId::from(1i64)));
        join_content(&mut select, &tables);
        let (sql, _) = build_stmt(DatabaseBackend::Sqlite, &select);
        for table in [
            "audit_update_type",
            "audit_entity_record",
            "audit_entity",
            "audit_content_record",
            "audit_property_type",
            "audit_property",
            "audit_content",
        ] {
            assert!(sql.contains(&format!("JOIN \"{table}\"")), "{sql}");
        }
        assert!(sql.contains("\"logged_entity_id\" = ?"), "{sql}");
    }
}
