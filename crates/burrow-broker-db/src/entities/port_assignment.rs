//! PortAssignment entity: the public TCP port pre-allocated to a token
//!
//! Minted together with the token by the admin tooling and kept for the
//! token's lifetime, so the public port number survives broker restarts.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "port_assignments")]
pub struct Model {
    /// Port assignment UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Team this assignment belongs to
    pub team_id: Uuid,

    /// Token that owns the port (one assignment per token)
    #[sea_orm(unique)]
    pub token_id: Uuid,

    /// Public port in [10000, 20000]
    pub port: i32,

    /// Protocol; always "tcp" today. (port, protocol) is unique.
    pub protocol: String,

    /// When the assignment was created
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Assignment belongs to a team
    #[sea_orm(
        belongs_to = "super::team::Entity",
        from = "Column::TeamId",
        to = "super::team::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Team,

    /// Assignment belongs to a token
    #[sea_orm(
        belongs_to = "super::team_token::Entity",
        from = "Column::TokenId",
        to = "super::team_token::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Token,
}

impl Related<super::team::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Team.def()
    }
}

impl Related<super::team_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Token.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
