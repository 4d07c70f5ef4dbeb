use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(Team::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Team::Id).uuid().not_null().primary_key())
                    .col(
                        ColumnDef::new(Team::Name)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Team::Description).text().null())
                    .col(
                        ColumnDef::new(Team::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Team::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Team::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(TeamToken::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(TeamToken::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(TeamToken::TeamId).uuid().not_null())
                    .col(
                        ColumnDef::new(TeamToken::Secret)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(TeamToken::Name).string().not_null())
                    .col(ColumnDef::new(TeamToken::Description).text().null())
                    .col(
                        ColumnDef::new(TeamToken::ExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TeamToken::LastUsedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(TeamToken::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(TeamToken::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_team_tokens_team_id")
                            .from(TeamToken::Table, TeamToken::TeamId)
                            .to(Team::Table, Team::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(PortAssignment::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(PortAssignment::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(PortAssignment::TeamId).uuid().not_null())
                    .col(
                        ColumnDef::new(PortAssignment::TokenId)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(PortAssignment::Port).integer().not_null())
                    .col(
                        ColumnDef::new(PortAssignment::Protocol)
                            .string_len(16)
                            .not_null()
                            .default("tcp"),
                    )
                    .col(
                        ColumnDef::new(PortAssignment::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_port_assignments_team_id")
                            .from(PortAssignment::Table, PortAssignment::TeamId)
                            .to(Team::Table, Team::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_port_assignments_token_id")
                            .from(PortAssignment::Table, PortAssignment::TokenId)
                            .to(TeamToken::Table, TeamToken::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // One listener per (port, protocol) across the whole broker
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_port_assignments_port_protocol")
                    .table(PortAssignment::Table)
                    .col(PortAssignment::Port)
                    .col(PortAssignment::Protocol)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ConnectionSession::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConnectionSession::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ConnectionSession::TeamId).uuid().not_null())
                    .col(
                        ColumnDef::new(ConnectionSession::TokenId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::PortAssignmentId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::ClientIp)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::ServerPort)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::Protocol)
                            .string_len(16)
                            .not_null()
                            .default("tcp"),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::LastSeenAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionSession::Status)
                            .string_len(16)
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connection_sessions_token_id")
                            .from(ConnectionSession::Table, ConnectionSession::TokenId)
                            .to(TeamToken::Table, TeamToken::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connection_sessions_port_assignment_id")
                            .from(ConnectionSession::Table, ConnectionSession::PortAssignmentId)
                            .to(PortAssignment::Table, PortAssignment::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // The restore query filters on status; keep it indexed
        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_connection_sessions_status")
                    .table(ConnectionSession::Table)
                    .col(ConnectionSession::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(ConnectionRecord::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ConnectionRecord::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::SessionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::ClientIp)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::ClientPort)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::ServerPort)
                            .integer()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::Protocol)
                            .string_len(16)
                            .not_null()
                            .default("tcp"),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::StartedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::EndedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::BytesIn)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::BytesOut)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ConnectionRecord::Status)
                            .string_len(16)
                            .not_null()
                            .check(
                                Expr::col(ConnectionRecord::Status)
                                    .is_in(["active", "closed", "error", "timeout"]),
                            ),
                    )
                    .col(ColumnDef::new(ConnectionRecord::ErrorMessage).text().null())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_connection_records_session_id")
                            .from(ConnectionRecord::Table, ConnectionRecord::SessionId)
                            .to(ConnectionSession::Table, ConnectionSession::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_connection_records_session_id")
                    .table(ConnectionRecord::Table)
                    .col(ConnectionRecord::SessionId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(ConnectionRecord::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ConnectionSession::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(PortAssignment::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(TeamToken::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Team::Table).to_owned())
            .await?;
        Ok(())
    }
}

#[derive(DeriveIden)]
enum Team {
    #[sea_orm(iden = "teams")]
    Table,
    Id,
    Name,
    Description,
    IsActive,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum TeamToken {
    #[sea_orm(iden = "team_tokens")]
    Table,
    Id,
    TeamId,
    Secret,
    Name,
    Description,
    ExpiresAt,
    LastUsedAt,
    IsActive,
    CreatedAt,
}

#[derive(DeriveIden)]
enum PortAssignment {
    #[sea_orm(iden = "port_assignments")]
    Table,
    Id,
    TeamId,
    TokenId,
    Port,
    Protocol,
    CreatedAt,
}

#[derive(DeriveIden)]
enum ConnectionSession {
    #[sea_orm(iden = "connection_sessions")]
    Table,
    Id,
    TeamId,
    TokenId,
    PortAssignmentId,
    ClientIp,
    ServerPort,
    Protocol,
    StartedAt,
    LastSeenAt,
    Status,
}

#[derive(DeriveIden)]
enum ConnectionRecord {
    #[sea_orm(iden = "connection_records")]
    Table,
    Id,
    SessionId,
    ClientIp,
    ClientPort,
    ServerPort,
    Protocol,
    StartedAt,
    EndedAt,
    BytesIn,
    BytesOut,
    Status,
    ErrorMessage,
}
