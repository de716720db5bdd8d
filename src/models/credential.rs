//! Credential entity model
//!
//! Versioned, envelope-encrypted token material for a connection. At most one
//! row per connection is `active`.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "service_credentials")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,
    pub connection_id: String,
    pub version: i32,
    pub encrypted_payload: Vec<u8>,
    pub token_type: String,
    /// JSON array of scopes requested at authorization time
    #[sea_orm(column_type = "JsonBinary")]
    pub requested_scopes: JsonValue,
    /// JSON array of scopes granted by the provider
    #[sea_orm(column_type = "JsonBinary")]
    pub granted_scopes: JsonValue,
    pub expires_at: Option<DateTimeWithTimeZone>,
    pub refreshable: bool,
    /// active | revoked
    pub status: String,
    pub encryption_key_id: String,
    pub encryption_version: i32,
    pub revoked_at: Option<DateTimeWithTimeZone>,
    pub created_at: DateTimeWithTimeZone,
    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
