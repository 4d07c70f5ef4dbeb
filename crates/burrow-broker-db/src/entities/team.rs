//! Team entity: the owning principal for tokens and port assignments
//!
//! Teams are created out of band (admin tooling); the broker core only
//! reads them to decide whether a token's owner is still usable.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "teams")]
pub struct Model {
    /// Team UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Team name (unique, human-readable)
    #[sea_orm(unique)]
    pub name: String,

    /// Free-form description
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// Whether the team may authenticate tunnels
    pub is_active: bool,

    /// When the team was created
    pub created_at: ChronoDateTimeUtc,

    /// When the team was last updated
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Team owns tokens
    #[sea_orm(has_many = "super::team_token::Entity")]
    Tokens,

    /// Team owns port assignments
    #[sea_orm(has_many = "super::port_assignment::Entity")]
    PortAssignments,
}

impl Related<super::team_token::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Tokens.def()
    }
}

impl Related<super::port_assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortAssignments.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
