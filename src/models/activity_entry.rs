//! Activity entry entity model (append-only).

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "service_activity_entries")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub connection_id: Option<String>,
    pub channel: String,
    pub action: String,
    pub object_type: String,
    pub object_id: String,
    pub actor: String,
    pub actor_type: String,
    /// ok | error
    pub status: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
