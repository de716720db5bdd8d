//! Grant snapshot entity model

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "service_grant_snapshots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub connection_id: String,
    pub version: i32,
    #[sea_orm(column_type = "JsonBinary")]
    pub requested_grants: JsonValue,
    #[sea_orm(column_type = "JsonBinary")]
    pub granted_grants: JsonValue,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,
    pub captured_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
