//! Notification dispatch ledger over `service_notification_dispatches`.

use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Set};

use crate::error::ServiceResult;
use crate::lifecycle::notifications::{DispatchLedger, DispatchRecord};
use crate::models::notification_dispatch::{self, Column, Entity as NotificationDispatch};
use crate::models::{new_id, now};

const SENT: &str = "sent";

#[derive(Debug, Clone)]
pub struct NotificationDispatchRepository {
    pub db: Arc<DatabaseConnection>,
}

impl NotificationDispatchRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_event(
        &self,
        event_id: &str,
    ) -> ServiceResult<Vec<notification_dispatch::Model>> {
        Ok(NotificationDispatch::find()
            .filter(Column::EventId.eq(event_id))
            .all(&*self.db)
            .await?)
    }
}

#[async_trait]
impl DispatchLedger for NotificationDispatchRepository {
    async fn seen(&self, key: &str) -> ServiceResult<bool> {
        let sent = NotificationDispatch::find()
            .filter(Column::IdempotencyKey.eq(key))
            .filter(Column::Status.eq(SENT))
            .count(&*self.db)
            .await?;
        Ok(sent > 0)
    }

    async fn record(&self, record: &DispatchRecord) -> ServiceResult<()> {
        let row = notification_dispatch::ActiveModel {
            id: Set(new_id("ntf")),
            idempotency_key: Set(record.idempotency_key.clone()),
            event_id: Set(record.event_id.clone()),
            projector: Set(record.projector.clone()),
            definition_code: Set(record.definition_code.clone()),
            recipient_key: Set(record.recipient_key.clone()),
            status: Set(record.status.clone()),
            error: Set(record.error.clone()),
            metadata: Set(record.metadata.clone()),
            created_at: Set(now()),
        };

        // The WHERE keeps a `sent` row from being overwritten by a later failure.
        NotificationDispatch::insert(row)
            .on_conflict(
                OnConflict::column(Column::IdempotencyKey)
                    .update_columns([Column::Status, Column::Error, Column::Metadata])
                    .action_and_where(Column::Status.ne(SENT))
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }
}
