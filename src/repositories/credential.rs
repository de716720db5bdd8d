//! Credential repository
//!
//! Token material is sealed with the [`SecretProvider`] before it reaches the
//! table; the AAD binds each ciphertext to its `(connection_id, version)`.
//! Rotation revokes the active version and inserts the next one, so at most
//! one active row exists per connection.

use std::sync::Arc;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use zeroize::Zeroizing;

use crate::crypto::{SecretProvider, credential_aad};
use crate::error::{ServiceError, ServiceResult};
use crate::models::credential::{self, Column, Entity as Credential};
use crate::models::status::CredentialStatus;
use crate::models::{from_db_time, json_strings, new_id, now, to_db_time};
use crate::providers::CredentialPayload;

/// The sealed part of a credential.
#[derive(Serialize, Deserialize)]
struct SealedTokens {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

/// Repository for credential database operations
#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pub db: Arc<DatabaseConnection>,
}

impl CredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn active_for(&self, connection_id: &str) -> ServiceResult<Option<credential::Model>> {
        Ok(Credential::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Status.eq(CredentialStatus::Active.as_str()))
            .order_by_desc(Column::Version)
            .one(&*self.db)
            .await?)
    }

    /// Revoke the active version and store `payload` as the next version.
    pub async fn rotate<C: ConnectionTrait>(
        db: &C,
        secrets: &dyn SecretProvider,
        connection_id: &str,
        payload: &CredentialPayload,
    ) -> ServiceResult<credential::Model> {
        let latest = Credential::find()
            .filter(Column::ConnectionId.eq(connection_id))
            .order_by_desc(Column::Version)
            .one(db)
            .await?;
        let version = latest.map(|row| row.version + 1).unwrap_or(1);

        Self::revoke_all(db, connection_id).await?;

        let tokens = SealedTokens {
            access_token: payload.access_token.clone(),
            refresh_token: payload.refresh_token.clone(),
        };
        let plaintext = Zeroizing::new(
            serde_json::to_vec(&tokens).map_err(|e| ServiceError::internal(e.to_string()))?,
        );
        let sealed = secrets
            .seal(&plaintext, &credential_aad(connection_id, version))
            .map_err(|e| ServiceError::internal(format!("credential encryption failed: {}", e)))?;

        let now = now();
        let active = credential::ActiveModel {
            id: Set(new_id("cred")),
            connection_id: Set(connection_id.to_string()),
            version: Set(version),
            encrypted_payload: Set(sealed),
            token_type: Set(payload.token_type.clone()),
            requested_scopes: Set(json!(payload.requested_grants)),
            granted_scopes: Set(json!(payload.granted_grants)),
            expires_at: Set(payload.expires_at.map(to_db_time)),
            refreshable: Set(payload.refreshable()),
            status: Set(CredentialStatus::Active.as_str().to_string()),
            encryption_key_id: Set(secrets.key_id().to_string()),
            encryption_version: Set(i32::from(secrets.version())),
            revoked_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };
        Ok(active.insert(db).await?)
    }

    /// Mark every active version of the connection revoked. Returns the number revoked.
    pub async fn revoke_all<C: ConnectionTrait>(db: &C, connection_id: &str) -> ServiceResult<u64> {
        let now = now();
        let result = Credential::update_many()
            .col_expr(Column::Status, Expr::value(CredentialStatus::Revoked.as_str()))
            .col_expr(Column::RevokedAt, Expr::value(Some(now)))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::ConnectionId.eq(connection_id))
            .filter(Column::Status.eq(CredentialStatus::Active.as_str()))
            .exec(db)
            .await?;
        Ok(result.rows_affected)
    }

    /// Decrypt a stored credential back into its payload.
    pub fn open(
        secrets: &dyn SecretProvider,
        model: &credential::Model,
    ) -> ServiceResult<CredentialPayload> {
        let plaintext = Zeroizing::new(
            secrets
                .open(
                    &model.encrypted_payload,
                    &credential_aad(&model.connection_id, model.version),
                )
                .map_err(|e| {
                    tracing::error!(
                        connection_id = %model.connection_id,
                        version = model.version,
                        "Credential decryption failed"
                    );
                    ServiceError::internal(format!("credential decryption failed: {}", e))
                })?,
        );
        let tokens: SealedTokens = serde_json::from_slice(&plaintext)
            .map_err(|e| ServiceError::internal(format!("corrupt credential payload: {}", e)))?;

        Ok(CredentialPayload {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            token_type: model.token_type.clone(),
            requested_grants: json_strings(&model.requested_scopes),
            granted_grants: json_strings(&model.granted_scopes),
            expires_at: model.expires_at.map(from_db_time),
        })
    }
}
