use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::models::item::Item;
use crate::models::task::{ModerationTask, TaskStatus, TaskUpdate};
use crate::services::store::{ItemRepository, StoreError, TaskStore};

/// Postgres-backed item and task repository.
///
/// Every write is a single guarded `UPDATE ... WHERE status = 'pending'`, so
/// concurrent streams and redelivered events cannot touch terminal rows.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn task_from_row(row: &PgRow) -> Result<ModerationTask, StoreError> {
    let status_str: String = row.try_get("status")?;
    let status = TaskStatus::from_str(&status_str)
        .map_err(|_| StoreError::InvalidRow(format!("unknown task status '{}'", status_str)))?;

    Ok(ModerationTask {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        status,
        is_violation: row.try_get("is_violation")?,
        probability: row.try_get("probability")?,
        error_message: row.try_get("error_message")?,
        retry_count: row.try_get("retry_count")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}

#[async_trait]
impl ItemRepository for PgStore {
    /// Get an item with its seller's verification flag
    async fn get_item(&self, item_id: i64) -> Result<Option<Item>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT i.id, i.name, i.description, i.category, i.images_qty,
                   COALESCE(s.is_verified_seller, FALSE) AS is_verified_seller
            FROM items i
            LEFT JOIN sellers s ON s.id = i.seller_id
            WHERE i.id = $1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        Ok(Some(Item {
            id: r.try_get("id")?,
            name: r.try_get("name")?,
            description: r.try_get("description")?,
            category: r.try_get("category")?,
            images_qty: r.try_get("images_qty")?,
            is_verified_seller: r.try_get("is_verified_seller")?,
        }))
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn get_latest_pending(
        &self,
        item_id: i64,
    ) -> Result<Option<ModerationTask>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, item_id, status, is_violation, probability, error_message,
                   retry_count, created_at, processed_at
            FROM moderation_results
            WHERE item_id = $1 AND status = 'pending'
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<ModerationTask>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, item_id, status, is_violation, probability, error_message,
                   retry_count, created_at, processed_at
            FROM moderation_results
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    async fn increment_retry_count(&self, task_id: i64) -> Result<Option<i32>, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE moderation_results
            SET retry_count = retry_count + 1,
                processed_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING retry_count
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(r.try_get("retry_count")?),
            None => None,
        })
    }

    async fn update_task(&self, task_id: i64, update: &TaskUpdate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE moderation_results
            SET status = $1,
                is_violation = $2,
                probability = $3,
                error_message = $4,
                retry_count = GREATEST(retry_count, COALESCE($5, retry_count)),
                processed_at = NOW()
            WHERE id = $6 AND status = 'pending'
            "#,
        )
        .bind(update.status.to_string())
        .bind(update.is_violation)
        .bind(update.probability)
        .bind(update.error_message.as_deref())
        .bind(update.retry_count)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
