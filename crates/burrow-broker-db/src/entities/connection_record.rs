//! ConnectionRecord entity: one external connection through a tunnel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Final (or current) state of an external connection.
///
/// The schema carries a CHECK constraint restricting the column to these
/// four strings; using the enum everywhere means an out-of-range value is
/// caught at compile time rather than by the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum RecordStatus {
    /// Connection is currently bridged (or awaiting pairing)
    #[sea_orm(string_value = "active")]
    Active,

    /// Connection completed normally
    #[sea_orm(string_value = "closed")]
    Closed,

    /// Connection failed with an error
    #[sea_orm(string_value = "error")]
    Error,

    /// Pairing timed out before the agent opened a data channel
    #[sea_orm(string_value = "timeout")]
    Timeout,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "connection_records")]
pub struct Model {
    /// Record UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Session this connection belongs to
    pub session_id: Uuid,

    /// External client address
    pub client_ip: String,
    pub client_port: i32,

    /// Public port the client connected to
    pub server_port: i32,

    /// Protocol; always "tcp" today
    pub protocol: String,

    /// When the external socket was accepted
    pub started_at: ChronoDateTimeUtc,

    /// When the record reached a terminal status
    pub ended_at: Option<ChronoDateTimeUtc>,

    /// Bytes copied external -> agent
    pub bytes_in: i64,

    /// Bytes copied agent -> external
    pub bytes_out: i64,

    /// active | closed | error | timeout
    pub status: RecordStatus,

    /// Error detail, or a descriptive note for non-error closes
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Record belongs to a session
    #[sea_orm(
        belongs_to = "super::connection_session::Entity",
        from = "Column::SessionId",
        to = "super::connection_session::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Session,
}

impl Related<super::connection_session::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Session.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
