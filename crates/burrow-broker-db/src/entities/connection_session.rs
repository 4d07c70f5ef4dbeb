//! ConnectionSession entity: one run of a tunnel on a (token, port)
//!
//! Sessions with status `active` participate in listener restoration after
//! a broker restart; the startup sweep flips sessions that went quiet.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Session liveness
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum SessionStatus {
    /// Session is live; its listener is (re)opened on broker startup
    #[sea_orm(string_value = "active")]
    Active,

    /// Session ended cleanly or was swept as stale
    #[sea_orm(string_value = "inactive")]
    Inactive,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "connection_sessions")]
pub struct Model {
    /// Session UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning team
    pub team_id: Uuid,

    /// Token the agent authenticated with
    pub token_id: Uuid,

    /// Port assignment backing the public listener
    pub port_assignment_id: Uuid,

    /// IP the agent connected from
    pub client_ip: String,

    /// Public port the tunnel listens on
    pub server_port: i32,

    /// Protocol; always "tcp" today
    pub protocol: String,

    /// When the session started
    pub started_at: ChronoDateTimeUtc,

    /// Last activity; monotonically non-decreasing for a session
    pub last_seen_at: ChronoDateTimeUtc,

    /// active | inactive
    pub status: SessionStatus,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Session belongs to a token
    #[sea_orm(
        belongs_to = "super::team_token::Entity",
        from = "Column::TokenId",
        to = "super::team_token::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Token,

    /// Session belongs to a port assignment
    #[sea_orm(
        belongs_to = "super::port_assignment::Entity",
        from = "Column::PortAssignmentId",
        to = "super::port_assignment::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    PortAssignment,

    /// Session owns connection records
    #[sea_orm(has_many = "super::connection_record::Entity")]
    Records,
}

impl Related<super::team_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Token.def()
    }
}

impl Related<super::port_assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortAssignment.def()
    }
}

impl Related<super::connection_record::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Records.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
