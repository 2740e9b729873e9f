//! Photo state ledger: per-photo lifecycle rows plus an append-only upload audit trail.
//!
//! The ledger is an explicit store object. Binaries construct it once at startup
//! and hand it to the worker and the diagnostics routes by reference.

use chrono::{DateTime, Duration, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use std::str::FromStr;

use crate::models::ticket_photo::{
    AuditStatus, NewAuditLog, PhotoStatus, TicketPhoto, UploadAuditLog,
};

#[derive(Debug, Clone)]
pub struct PhotoLedger {
    pool: SqlitePool,
}

impl PhotoLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and create the ledger tables.
    pub async fn open(database_url: &str) -> Result<Self, LedgerError> {
        let pool = super::init_pool(database_url).await?;
        let ledger = Self::new(pool);
        ledger.init().await?;
        Ok(ledger)
    }

    /// Ephemeral ledger, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, LedgerError> {
        let pool = super::init_memory_pool().await?;
        let ledger = Self::new(pool);
        ledger.init().await?;
        Ok(ledger)
    }

    /// Create both tables. Safe to call repeatedly.
    pub async fn init(&self) -> Result<(), LedgerError> {
        super::run_migrations(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn health_check(&self) -> Result<(), LedgerError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Insert a pending row for a freshly captured photo at an explicit slot.
    pub async fn insert_photo(
        &self,
        ticket_id: &str,
        queue_order: u32,
        local_uri: &str,
    ) -> Result<TicketPhoto, LedgerError> {
        let photo = TicketPhoto::pending(ticket_id, queue_order, local_uri, Utc::now());

        let mut tx = self.pool.begin().await?;
        insert_row(&photo).execute(&mut *tx).await?;
        bump_counter(ticket_id, queue_order + 1).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(photo)
    }

    /// Allocate consecutive slots after every order the ticket has ever used and
    /// insert a pending row per uri, all in one transaction.
    pub async fn insert_batch(
        &self,
        ticket_id: &str,
        local_uris: &[String],
    ) -> Result<Vec<TicketPhoto>, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(NEXT_ORDER_SQL)
            .bind(ticket_id)
            .fetch_one(&mut *tx)
            .await?;
        let start = order_from(row.try_get("next_order")?)?;

        let now = Utc::now();
        let mut photos = Vec::with_capacity(local_uris.len());
        for (offset, uri) in local_uris.iter().enumerate() {
            let photo = TicketPhoto::pending(ticket_id, start + offset as u32, uri, now);
            insert_row(&photo).execute(&mut *tx).await?;
            photos.push(photo);
        }

        let end = start + local_uris.len() as u32;
        bump_counter(ticket_id, end).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(photos)
    }

    /// Undo [`insert_batch`](Self::insert_batch): delete the rows and hand the
    /// slots back when no later batch has been allocated since.
    pub async fn release_batch(
        &self,
        ticket_id: &str,
        photos: &[TicketPhoto],
    ) -> Result<(), LedgerError> {
        let (Some(first), Some(last)) = (photos.first(), photos.last()) else {
            return Ok(());
        };

        let mut tx = self.pool.begin().await?;
        for photo in photos {
            sqlx::query("DELETE FROM ticket_photos WHERE id = ?1")
                .bind(&photo.id)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            "UPDATE ticket_photo_counters SET next_order = ?2 WHERE ticket_id = ?1 AND next_order = ?3",
        )
        .bind(ticket_id)
        .bind(i64::from(first.queue_order))
        .bind(i64::from(last.queue_order) + 1)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::debug!(ticket_id, rows = photos.len(), "Released unqueued ledger rows");
        Ok(())
    }

    /// Move a pending photo to `uploaded` or `failed`. Re-applying the current
    /// status is a no-op; any other transition is refused.
    pub async fn update_status(
        &self,
        id: &str,
        status: PhotoStatus,
    ) -> Result<TicketPhoto, LedgerError> {
        let current = self
            .get_photo(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;

        if current.status == status {
            return Ok(current);
        }
        if !current.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE ticket_photos
            SET status = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'pending'
            "#,
        )
        .bind(status.to_string())
        .bind(now.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        // Lost a race with another writer that already moved the row forward.
        if result.rows_affected() == 0 {
            return Err(LedgerError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: status,
            });
        }

        Ok(TicketPhoto {
            status,
            updated_at: now,
            ..current
        })
    }

    /// Remove a row. Returns whether a row existed.
    pub async fn delete_photo(&self, id: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM ticket_photos WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_photo(&self, id: &str) -> Result<Option<TicketPhoto>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, ticket_id, queue_order, local_uri, status, created_at, updated_at
            FROM ticket_photos
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(photo_from_row).transpose()
    }

    /// Look up the row for a given upload slot of a ticket.
    pub async fn find_photo(
        &self,
        ticket_id: &str,
        queue_order: u32,
    ) -> Result<Option<TicketPhoto>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT id, ticket_id, queue_order, local_uri, status, created_at, updated_at
            FROM ticket_photos
            WHERE ticket_id = ?1 AND queue_order = ?2
            "#,
        )
        .bind(ticket_id)
        .bind(i64::from(queue_order))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(photo_from_row).transpose()
    }

    /// Pending rows for a ticket in upload order.
    pub async fn get_pending_photos(&self, ticket_id: &str) -> Result<Vec<TicketPhoto>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, ticket_id, queue_order, local_uri, status, created_at, updated_at
            FROM ticket_photos
            WHERE ticket_id = ?1 AND status = 'pending'
            ORDER BY queue_order ASC
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(photo_from_row).collect()
    }

    /// First `queue_order` slot the ticket has never used, including slots of
    /// rows already uploaded and deleted.
    pub async fn next_queue_order(&self, ticket_id: &str) -> Result<u32, LedgerError> {
        let row = sqlx::query(NEXT_ORDER_SQL)
            .bind(ticket_id)
            .fetch_one(&self.pool)
            .await?;
        order_from(row.try_get("next_order")?)
    }

    pub async fn insert_audit_log(&self, entry: &NewAuditLog) -> Result<UploadAuditLog, LedgerError> {
        let result = sqlx::query(
            r#"
            INSERT INTO upload_audit_log (ticket_id, photo_id, queue_order, status, error_message, timestamp)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&entry.ticket_id)
        .bind(&entry.photo_id)
        .bind(i64::from(entry.queue_order))
        .bind(entry.status.to_string())
        .bind(entry.error_message.as_deref())
        .bind(entry.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(UploadAuditLog {
            id: result.last_insert_rowid(),
            ticket_id: entry.ticket_id.clone(),
            photo_id: entry.photo_id.clone(),
            queue_order: entry.queue_order,
            status: entry.status,
            error_message: entry.error_message.clone(),
            timestamp: entry.timestamp,
        })
    }

    pub async fn get_audit_log_by_ticket(
        &self,
        ticket_id: &str,
    ) -> Result<Vec<UploadAuditLog>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT id, ticket_id, photo_id, queue_order, status, error_message, timestamp
            FROM upload_audit_log
            WHERE ticket_id = ?1
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(ticket_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }

    /// Delete audit rows older than `max_age_days`. Returns the number removed.
    pub async fn clean_old_audit_logs(&self, max_age_days: u32) -> Result<u64, LedgerError> {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let result = sqlx::query("DELETE FROM upload_audit_log WHERE timestamp < ?1")
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::info!(removed, max_age_days, "Pruned old upload audit entries");
        }
        Ok(removed)
    }
}

const NEXT_ORDER_SQL: &str = r#"
    SELECT MAX(
        COALESCE((SELECT next_order FROM ticket_photo_counters WHERE ticket_id = ?1), 0),
        COALESCE((SELECT MAX(queue_order) + 1 FROM ticket_photos WHERE ticket_id = ?1), 0)
    ) AS next_order
"#;

fn insert_row(photo: &TicketPhoto) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        r#"
        INSERT INTO ticket_photos (id, ticket_id, queue_order, local_uri, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&photo.id)
    .bind(&photo.ticket_id)
    .bind(i64::from(photo.queue_order))
    .bind(&photo.local_uri)
    .bind(photo.status.to_string())
    .bind(photo.created_at.timestamp_millis())
    .bind(photo.updated_at.timestamp_millis())
}

/// The counter only moves forward.
fn bump_counter(ticket_id: &str, next_order: u32) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        r#"
        INSERT INTO ticket_photo_counters (ticket_id, next_order)
        VALUES (?1, ?2)
        ON CONFLICT (ticket_id) DO UPDATE SET next_order = MAX(next_order, excluded.next_order)
        "#,
    )
    .bind(ticket_id)
    .bind(i64::from(next_order))
}

fn order_from(value: i64) -> Result<u32, LedgerError> {
    u32::try_from(value).map_err(|_| LedgerError::CorruptRow(format!("queue_order {value}")))
}

fn photo_from_row(row: &SqliteRow) -> Result<TicketPhoto, LedgerError> {
    let status: String = row.try_get("status")?;
    let queue_order: i64 = row.try_get("queue_order")?;

    Ok(TicketPhoto {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        queue_order: u32::try_from(queue_order)
            .map_err(|_| LedgerError::CorruptRow(format!("queue_order {queue_order}")))?,
        local_uri: row.try_get("local_uri")?,
        status: PhotoStatus::from_str(&status)
            .map_err(|_| LedgerError::CorruptRow(format!("photo status {status}")))?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> Result<UploadAuditLog, LedgerError> {
    let status: String = row.try_get("status")?;
    let queue_order: i64 = row.try_get("queue_order")?;

    Ok(UploadAuditLog {
        id: row.try_get("id")?,
        ticket_id: row.try_get("ticket_id")?,
        photo_id: row.try_get("photo_id")?,
        queue_order: u32::try_from(queue_order)
            .map_err(|_| LedgerError::CorruptRow(format!("queue_order {queue_order}")))?,
        status: AuditStatus::from_str(&status)
            .map_err(|_| LedgerError::CorruptRow(format!("audit status {status}")))?,
        error_message: row.try_get("error_message")?,
        timestamp: millis_to_datetime(row.try_get("timestamp")?)?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| LedgerError::CorruptRow(format!("timestamp {millis}")))
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Photo {0} not found in ledger")]
    NotFound(String),

    #[error("Photo {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: PhotoStatus,
        to: PhotoStatus,
    },

    #[error("Corrupt ledger row: {0}")]
    CorruptRow(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    async fn ledger() -> PhotoLedger {
        PhotoLedger::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let ledger = ledger().await;
        ledger.init().await.unwrap();
        ledger.init().await.unwrap();
        ledger.insert_photo("T-1", 0, "/tmp/a.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn insert_never_repeats_an_id() {
        let ledger = ledger().await;
        let mut ids = HashSet::new();
        for order in 0..100 {
            let photo = ledger.insert_photo("T-1", order, "/tmp/a.jpg").await.unwrap();
            assert_eq!(photo.status, PhotoStatus::Pending);
            assert!(ids.insert(photo.id), "duplicate id at order {order}");
        }
    }

    #[tokio::test]
    async fn pending_photos_come_back_in_queue_order() {
        let ledger = ledger().await;
        for order in [5, 1, 3, 0, 4, 2] {
            ledger
                .insert_photo("T-1", order, &format!("/tmp/{order}.jpg"))
                .await
                .unwrap();
        }
        ledger.insert_photo("T-2", 0, "/tmp/other.jpg").await.unwrap();
        let uploaded = ledger.find_photo("T-1", 3).await.unwrap().unwrap();
        ledger
            .update_status(&uploaded.id, PhotoStatus::Uploaded)
            .await
            .unwrap();

        let pending = ledger.get_pending_photos("T-1").await.unwrap();
        let orders: Vec<u32> = pending.iter().map(|p| p.queue_order).collect();
        assert_eq!(orders, vec![0, 1, 2, 4, 5]);
        assert!(orders.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn duplicate_order_within_ticket_is_rejected() {
        let ledger = ledger().await;
        ledger.insert_photo("T-1", 0, "/tmp/a.jpg").await.unwrap();
        assert!(ledger.insert_photo("T-1", 0, "/tmp/b.jpg").await.is_err());
        ledger.insert_photo("T-2", 0, "/tmp/c.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn status_never_moves_backwards() {
        let ledger = ledger().await;
        let photo = ledger.insert_photo("T-1", 0, "/tmp/a.jpg").await.unwrap();

        let updated = ledger
            .update_status(&photo.id, PhotoStatus::Uploaded)
            .await
            .unwrap();
        assert_eq!(updated.status, PhotoStatus::Uploaded);

        // Same status again is accepted.
        ledger
            .update_status(&photo.id, PhotoStatus::Uploaded)
            .await
            .unwrap();

        let err = ledger
            .update_status(&photo.id, PhotoStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let err = ledger
            .update_status(&photo.id, PhotoStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let stored = ledger.get_photo(&photo.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PhotoStatus::Uploaded);
    }

    #[tokio::test]
    async fn update_of_unknown_photo_is_not_found() {
        let ledger = ledger().await;
        let err = ledger
            .update_status("missing", PhotoStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let ledger = ledger().await;
        let photo = ledger.insert_photo("T-1", 0, "/tmp/a.jpg").await.unwrap();
        assert!(ledger.delete_photo(&photo.id).await.unwrap());
        assert!(!ledger.delete_photo(&photo.id).await.unwrap());
        assert!(ledger.get_photo(&photo.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn next_queue_order_follows_highest_slot() {
        let ledger = ledger().await;
        assert_eq!(ledger.next_queue_order("T-1").await.unwrap(), 0);
        ledger.insert_photo("T-1", 0, "/tmp/a.jpg").await.unwrap();
        ledger.insert_photo("T-1", 7, "/tmp/b.jpg").await.unwrap();
        assert_eq!(ledger.next_queue_order("T-1").await.unwrap(), 8);
        assert_eq!(ledger.next_queue_order("T-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_slots_are_never_reused_after_delete() {
        let ledger = ledger().await;
        let uris: Vec<String> = (0..3).map(|i| format!("/tmp/{i}.jpg")).collect();

        let first = ledger.insert_batch("T-1", &uris).await.unwrap();
        assert_eq!(first.iter().map(|p| p.queue_order).collect::<Vec<_>>(), vec![0, 1, 2]);
        for photo in &first {
            ledger.delete_photo(&photo.id).await.unwrap();
        }

        let second = ledger.insert_batch("T-1", &uris).await.unwrap();
        assert_eq!(second.iter().map(|p| p.queue_order).collect::<Vec<_>>(), vec![3, 4, 5]);
        assert_eq!(ledger.next_queue_order("T-1").await.unwrap(), 6);
        assert_eq!(ledger.next_queue_order("T-2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn released_batch_leaves_no_trace() {
        let ledger = ledger().await;
        let uris = vec!["/tmp/a.jpg".to_string(), "/tmp/b.jpg".to_string()];
        ledger.insert_batch("T-1", &uris).await.unwrap();

        let batch = ledger.insert_batch("T-1", &uris).await.unwrap();
        ledger.release_batch("T-1", &batch).await.unwrap();

        assert_eq!(ledger.get_pending_photos("T-1").await.unwrap().len(), 2);
        assert_eq!(ledger.next_queue_order("T-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_keeps_slots_claimed_by_a_later_batch() {
        let ledger = ledger().await;
        let uris = vec!["/tmp/a.jpg".to_string()];
        let early = ledger.insert_batch("T-1", &uris).await.unwrap();
        ledger.insert_batch("T-1", &uris).await.unwrap();

        ledger.release_batch("T-1", &early).await.unwrap();
        assert_eq!(ledger.next_queue_order("T-1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn audit_log_is_per_ticket_and_pruned_by_age() {
        let ledger = ledger().await;
        let photo = ledger.insert_photo("T-1", 0, "/tmp/a.jpg").await.unwrap();

        let mut stale = NewAuditLog::for_photo(&photo, AuditStatus::Retrying, Some("timeout".into()));
        stale.timestamp = Utc::now() - Duration::days(45);
        let fresh = NewAuditLog::for_photo(&photo, AuditStatus::Uploaded, None);

        let first = ledger.insert_audit_log(&stale).await.unwrap();
        let second = ledger.insert_audit_log(&fresh).await.unwrap();
        assert_ne!(first.id, second.id);

        let other = ledger.insert_photo("T-2", 0, "/tmp/b.jpg").await.unwrap();
        ledger
            .insert_audit_log(&NewAuditLog::for_photo(&other, AuditStatus::Failed, None))
            .await
            .unwrap();

        let log = ledger.get_audit_log_by_ticket("T-1").await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].status, AuditStatus::Retrying);
        assert_eq!(log[0].error_message.as_deref(), Some("timeout"));
        assert_eq!(log[1].status, AuditStatus::Uploaded);

        assert_eq!(ledger.clean_old_audit_logs(30).await.unwrap(), 1);
        let log = ledger.get_audit_log_by_ticket("T-1").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, AuditStatus::Uploaded);
    }
}
