use sea_orm_migration::prelude::*;

#[derive(DeriveIden)]
pub(super) enum Conversations {
    Table,
    Id,
    DedupKey,
    IsGroup,
    LastMessage,
    LastMessageTime,
    LastMessageSender,
    CreatedAt,
    UpdatedAt,
    IsActive,
}

pub struct Migration;

impl MigrationName for Migration {
    fn name(&self) -> &str {
        "m20250301_000001_create_conversations_table"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Conversations::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Conversations::Id)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    // SQLite lets any number of NULLs share a UNIQUE column, so
                    // only active pairwise conversations compete for a key.
                    .col(ColumnDef::new(Conversations::DedupKey).string().unique_key())
                    .col(
                        ColumnDef::new(Conversations::IsGroup)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Conversations::LastMessage).string())
                    .col(ColumnDef::new(Conversations::LastMessageTime).big_integer())
                    .col(ColumnDef::new(Conversations::LastMessageSender).string())
                    .col(
                        ColumnDef::new(Conversations::CreatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Conversations::UpdatedAt)
                            .big_integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Conversations::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_conversations_last_message_time")
                    .table(Conversations::Table)
                    .col(Conversations::LastMessageTime)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(Conversations::Table).to_owned())
            .await
    }
}
