//! Subscription entity model
//!
//! Provider-side change subscriptions (push channels) owned by a connection.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "service_subscriptions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub connection_id: String,
    pub provider_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub channel_id: String,
    pub remote_subscription_id: Option<String>,
    pub callback_url: String,
    /// active | cancelled | expired
    pub status: String,
    pub expires_at: Option<DateTimeWithTimeZone>,
    pub last_notified_at: Option<DateTimeWithTimeZone>,
    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: JsonValue,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
