use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::DatabaseBackend;

use crate::db::*;

/// The nine audit tables under one prefix/suffix decoration.
///
/// Table names are only known at runtime, so this migration is installed directly
/// through a [`SchemaManager`] instead of a migrator's tracking table.
pub struct Migration {
    pub tables: TableNames,
}

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250101_000001_audit_schema"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        let t = &self.tables;

        manager
            .create_table(
                Table::create()
                    .table(t.entity.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditEntity::Id))
                    .col(ColumnDef::new(AuditEntity::Name).string_len(255).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.property.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditProperty::Id))
                    .col(ColumnDef::new(AuditProperty::EntityId).big_integer().not_null())
                    .col(ColumnDef::new(AuditProperty::Name).string_len(255).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.property_type.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditPropertyType::Id))
                    .col(
                        ColumnDef::new(AuditPropertyType::PropertyId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AuditPropertyType::Name).string_len(16).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.entity_record.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditEntityRecord::Id))
                    .col(
                        ColumnDef::new(AuditEntityRecord::EntityId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuditEntityRecord::LoggedEntityId)
                            .string_len(255)
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.update_type.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditUpdateType::Id))
                    .col(
                        ColumnDef::new(AuditUpdateType::EntityRecordId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AuditUpdateType::Name).string_len(16).not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.version_group.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditVersionGroup::Id))
                    .col(
                        ColumnDef::new(AuditVersionGroup::Timestamp)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AuditVersionGroup::ActorId).string_len(255).null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.version.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditVersion::Id))
                    .col(ColumnDef::new(AuditVersion::UpdateTypeId).big_integer().not_null())
                    .col(
                        ColumnDef::new(AuditVersion::VersionGroupId)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.content_record.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditContentRecord::Id))
                    .col(
                        ColumnDef::new(AuditContentRecord::VersionId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuditContentRecord::PropertyTypeId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AuditContentRecord::Timestamp)
                            .big_integer()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(t.content.clone())
                    .if_not_exists()
                    .col(id_col(backend, AuditContent::Id))
                    .col(
                        ColumnDef::new(AuditContent::ContentRecordId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AuditContent::TextContent).text().null())
                    .col(ColumnDef::new(AuditContent::BlobContent).blob().null())
                    .to_owned(),
            )
            .await?;

        create_indexes(manager, t).await?;
        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let t = &self.tables;
        for table in [
            &t.content,
            &t.content_record,
            &t.version,
            &t.version_group,
            &t.update_type,
            &t.entity_record,
            &t.property_type,
            &t.property,
            &t.entity,
        ] {
            manager
                .drop_table(Table::drop().table(table.clone()).if_exists().to_owned())
                .await?;
        }
        Ok(())
    }
}

async fn create_indexes(manager: &SchemaManager<'_>, t: &TableNames) -> Result<(), DbErr> {
    ensure_index(manager, &t.entity, t.index("entity_name"), |index| {
        index.col(AuditEntity::Name);
    })
    .await?;
    ensure_index(manager, &t.property, t.index("property_entity_name"), |index| {
        index.col(AuditProperty::EntityId).col(AuditProperty::Name);
    })
    .await?;
    ensure_index(manager, &t.property_type, t.index("property_type_property"), |index| {
        index
            .col(AuditPropertyType::PropertyId)
            .col(AuditPropertyType::Name);
    })
    .await?;
    ensure_index(manager, &t.entity_record, t.index("entity_record_logged"), |index| {
        index
            .col(AuditEntityRecord::EntityId)
            .col(AuditEntityRecord::LoggedEntityId);
    })
    .await?;
    ensure_index(manager, &t.update_type, t.index("update_type_record"), |index| {
        index
            .col(AuditUpdateType::EntityRecordId)
            .col(AuditUpdateType::Name);
    })
    .await?;
    ensure_index(manager, &t.version, t.index("version_group"), |index| {
        index.col(AuditVersion::VersionGroupId);
    })
    .await?;
    ensure_index(manager, &t.version, t.index("version_update_type"), |index| {
        index.col(AuditVersion::UpdateTypeId);
    })
    .await?;
    ensure_index(manager, &t.content_record, t.index("content_record_version"), |index| {
        index.col(AuditContentRecord::VersionId);
    })
    .await?;
    ensure_index(
        manager,
        &t.content_record,
        t.index("content_record_property_type"),
        |index| {
            index.col(AuditContentRecord::PropertyTypeId);
        },
    )
    .await?;
    ensure_index(manager, &t.content, t.index("content_record"), |index| {
        index.col(AuditContent::ContentRecordId);
    })
    .await?;
    Ok(())
}

async fn ensure_index(
    manager: &SchemaManager<'_>,
    table: &Alias,
    name: String,
    columns: impl FnOnce(&mut IndexCreateStatement),
) -> Result<(), DbErr> {
    if manager.has_index(table.to_string(), &name).await? {
        return Ok(());
    }
    let mut index = Index::create();
    index.name(&name).table(table.clone());
    columns(&mut index);
    manager.create_index(index).await
}

fn id_col(backend: DatabaseBackend, col: impl Iden + 'static) -> ColumnDef {
    let mut col_def = ColumnDef::new(col);
    match backend {
        DatabaseBackend::Sqlite => {
            col_def.integer();
        }
        _ => {
            col_def.big_integer();
        }
    }
    col_def
        .not_null()
        .auto_increment()
        .primary_key()
        .to_owned()
}
