use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // device_mapper tracks which (topic, device_id) pairs have been seen
        // and which dynamically-created table each one was routed to.
        manager
            .create_table(
                Table::create()
                    .table(DeviceMapper::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(DeviceMapper::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(DeviceMapper::Topic).string().not_null())
                    .col(ColumnDef::new(DeviceMapper::DeviceId).string().not_null())
                    .col(ColumnDef::new(DeviceMapper::TableName).string().not_null())
                    .col(ColumnDef::new(DeviceMapper::PatternName).string())
                    .col(ColumnDef::new(DeviceMapper::DeviceName).string())
                    .col(
                        ColumnDef::new(DeviceMapper::FirstSeen)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DeviceMapper::LastSeen)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(DeviceMapper::MessageCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("uq_device_mapper_topic_device")
                    .table(DeviceMapper::Table)
                    .col(DeviceMapper::Topic)
                    .col(DeviceMapper::DeviceId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_device_mapper_table_name")
                    .table(DeviceMapper::Table)
                    .col(DeviceMapper::TableName)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(DeviceMapper::Table).to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
enum DeviceMapper {
    Table,
    Id,
    Topic,
    DeviceId,
    TableName,
    PatternName,
    DeviceName,
    FirstSeen,
    LastSeen,
    MessageCount,
}
