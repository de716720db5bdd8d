//! Lifecycle outbox entity model

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "service_lifecycle_outbox")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub event_id: String,
    pub event_name: String,
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub connection_id: Option<String>,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: JsonValue,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,
    /// pending | processing | delivered | failed | dead
    pub status: String,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTimeWithTimeZone>,
    pub last_error: Option<String>,
    pub occurred_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
