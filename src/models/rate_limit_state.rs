//! Rate-limit state entity model

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "service_rate_limit_state")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub provider_id: String,
    pub scope_type: String,
    pub scope_id: String,
    pub bucket_key: String,
    pub limit: i32,
    pub remaining: i32,
    pub reset_at: Option<DateTimeWithTimeZone>,
    /// Seconds the provider asked callers to wait
    pub retry_after: i64,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
