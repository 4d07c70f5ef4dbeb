//! TeamToken entity: the credential an agent presents on the control channel

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "team_tokens")]
pub struct Model {
    /// Token UUID (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Team this token belongs to
    pub team_id: Uuid,

    /// The secret string the agent sends as its first control line
    #[sea_orm(unique)]
    pub secret: String,

    /// Operator-assigned name for this token
    pub name: String,

    /// Description of what this token is used for
    #[sea_orm(column_type = "Text", nullable)]
    pub description: Option<String>,

    /// When the token expires (NULL = never expires)
    pub expires_at: Option<ChronoDateTimeUtc>,

    /// When the token was last used to authenticate
    pub last_used_at: Option<ChronoDateTimeUtc>,

    /// Whether the token is active
    pub is_active: bool,

    /// When the token was created
    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    /// Token belongs to a team
    #[sea_orm(
        belongs_to = "super::team::Entity",
        from = "Column::TeamId",
        to = "super::team::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    Team,

    /// Token owns exactly one port assignment
    #[sea_orm(has_one = "super::port_assignment::Entity")]
    PortAssignment,
}

impl Related<super::team::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Team.def()
    }
}

impl Related<super::port_assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::PortAssignment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
