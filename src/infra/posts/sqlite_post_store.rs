// SQLite storage for a post's resolved audience and its moderation history.
//
// One store implements both ports because the rows share a lifecycle: saving
// a post replaces its audience rows and opens a fresh moderation record in
// the same database.

use crate::core::announce::{
    AnnounceError, ConditionStore, ModerationLog, StoredAudience, StoredCondition,
};
use crate::core::audience::resolver::{AudienceCondition, ResolvedAudience};
use crate::core::moderation::status::{ModerationRecord, ModerationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

pub struct SqlitePostStore {
    pool: Pool<Sqlite>,
}

impl SqlitePostStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), AnnounceError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS post_conditions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                condition TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS post_recipients (
                post_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                PRIMARY KEY (post_id, username)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS post_relevance (
                post_id INTEGER NOT NULL,
                username TEXT NOT NULL,
                condition_id INTEGER NOT NULL,
                PRIMARY KEY (post_id, username, condition_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS moderation_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                moderator TEXT,
                privilege_id INTEGER,
                description TEXT NOT NULL DEFAULT '',
                created TEXT NOT NULL,
                decided_by TEXT,
                decided_at TEXT,
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        }
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<ModerationRecord, AnnounceError> {
        let status: String = row.get("status");
        let status = status
            .parse::<ModerationStatus>()
            .map_err(|_| AnnounceError::StorageError(format!("bad status value: {status}")))?;
        Ok(ModerationRecord {
            id: row.get("id"),
            post_id: row.get("post_id"),
            status,
            moderator: row.get("moderator"),
            privilege_id: row.get("privilege_id"),
            description: row.get("description"),
            created: row.get::<DateTime<Utc>, _>("created"),
            decided_by: row.get("decided_by"),
            decided_at: row.get::<Option<DateTime<Utc>>, _>("decided_at"),
            active: row.get::<i64, _>("active") != 0,
        })
    }
}

#[async_trait]
impl ConditionStore for SqlitePostStore {
    async fn replace_audience(
        &self,
        post_id: i64,
        resolved: &ResolvedAudience,
    ) -> Result<(), AnnounceError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AnnounceError::StorageError(e.to_string()))?;

        for table in ["post_relevance", "post_recipients", "post_conditions"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE post_id = ?"))
                .bind(post_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        }

        // Condition list order is significant: relevance entries refer to
        // conditions by index, translated to row ids here.
        let mut condition_ids = Vec::with_capacity(resolved.conditions.len());
        for condition in &resolved.conditions {
            let payload = serde_json::to_string(condition)
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
            let result = sqlx::query("INSERT INTO post_conditions (post_id, condition) VALUES (?, ?)")
                .bind(post_id)
                .bind(payload)
                .execute(&mut *tx)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
            condition_ids.push(result.last_insert_rowid());
        }

        for username in &resolved.recipients {
            sqlx::query("INSERT INTO post_recipients (post_id, username) VALUES (?, ?)")
                .bind(post_id)
                .bind(username)
                .execute(&mut *tx)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        }

        for (username, indexes) in &resolved.relevance {
            for index in indexes {
                let condition_id = condition_ids.get(*index).ok_or_else(|| {
                    AnnounceError::StorageError(format!(
                        "relevance index {index} out of range for post {post_id}"
                    ))
                })?;
                sqlx::query(
                    "INSERT INTO post_relevance (post_id, username, condition_id) VALUES (?, ?, ?)",
                )
                .bind(post_id)
                .bind(username)
                .bind(condition_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| AnnounceError::StorageError(e.to_string()))
    }

    async fn load_audience(&self, post_id: i64) -> Result<Option<StoredAudience>, AnnounceError> {
        let condition_rows =
            sqlx::query("SELECT id, condition FROM post_conditions WHERE post_id = ? ORDER BY id")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;

        let recipient_rows = sqlx::query("SELECT username FROM post_recipients WHERE post_id = ?")
            .bind(post_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AnnounceError::StorageError(e.to_string()))?;

        if condition_rows.is_empty() && recipient_rows.is_empty() {
            return Ok(None);
        }

        let mut conditions = Vec::with_capacity(condition_rows.len());
        for row in &condition_rows {
            let payload: String = row.get("condition");
            let condition: AudienceCondition = serde_json::from_str(&payload)
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
            conditions.push(StoredCondition {
                id: row.get("id"),
                condition,
            });
        }

        let relevance_rows =
            sqlx::query("SELECT username, condition_id FROM post_relevance WHERE post_id = ?")
                .bind(post_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        let mut relevance: HashMap<String, Vec<i64>> = HashMap::new();
        for row in &relevance_rows {
            relevance
                .entry(row.get("username"))
                .or_default()
                .push(row.get("condition_id"));
        }

        Ok(Some(StoredAudience {
            recipients: recipient_rows.iter().map(|r| r.get(0)).collect(),
            conditions,
            relevance,
        }))
    }
}

#[async_trait]
impl ModerationLog for SqlitePostStore {
    async fn insert_record(
        &self,
        post_id: i64,
        status: ModerationStatus,
        moderator: Option<&str>,
        privilege_id: Option<i64>,
        description: &str,
    ) -> Result<i64, AnnounceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO moderation_records
                (post_id, status, moderator, privilege_id, description, created, active)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(post_id)
        .bind(status.as_str())
        .bind(moderator)
        .bind(privilege_id)
        .bind(description)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        Ok(result.last_insert_rowid())
    }

    async fn deactivate_records(&self, post_id: i64) -> Result<(), AnnounceError> {
        sqlx::query("UPDATE moderation_records SET active = 0 WHERE post_id = ?")
            .bind(post_id)
            .execute(&self.pool)
            .await
            .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        Ok(())
    }

    async fn get_record(&self, record_id: i64) -> Result<Option<ModerationRecord>, AnnounceError> {
        let row = sqlx::query("SELECT * FROM moderation_records WHERE id = ?")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn active_record(&self, post_id: i64) -> Result<Option<ModerationRecord>, AnnounceError> {
        let row = sqlx::query(
            "SELECT * FROM moderation_records WHERE post_id = ? AND active = 1 ORDER BY id DESC LIMIT 1",
        )
        .bind(post_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn set_status(
        &self,
        record_id: i64,
        status: ModerationStatus,
        decided_by: &str,
    ) -> Result<(), AnnounceError> {
        sqlx::query(
            "UPDATE moderation_records SET status = ?, decided_by = ?, decided_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(decided_by)
        .bind(Utc::now())
        .bind(record_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AnnounceError::StorageError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audience::resolver::ConditionPart;
    use crate::core::audience::tags::TagKind;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::collections::HashSet;

    async fn store() -> SqlitePostStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqlitePostStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    fn resolved(recipients: &[&str]) -> ResolvedAudience {
        let mut audience = ResolvedAudience::default();
        audience.recipients = recipients.iter().map(|u| u.to_string()).collect();
        audience.conditions = vec![
            AudienceCondition {
                kind: TagKind::Union,
                tag_uid: "t-1".to_string(),
                parts: vec![ConditionPart {
                    provider: "course".to_string(),
                    audience_type: "course".to_string(),
                    code: "H810".to_string(),
                    name: "H810".to_string(),
                    roles: vec![],
                }],
            },
            AudienceCondition {
                kind: TagKind::Union,
                tag_uid: "t-1".to_string(),
                parts: vec![ConditionPart {
                    provider: "group".to_string(),
                    audience_type: "group".to_string(),
                    code: "g7".to_string(),
                    name: "g7".to_string(),
                    roles: vec![],
                }],
            },
        ];
        for (i, username) in recipients.iter().enumerate() {
            audience
                .relevance
                .insert(username.to_string(), vec![i % audience.conditions.len()]);
        }
        audience
    }

    #[tokio::test]
    async fn audience_round_trip_maps_indexes_to_row_ids() {
        let store = store().await;
        store.replace_audience(9, &resolved(&["u1", "u2"])).await.unwrap();

        let loaded = store.load_audience(9).await.unwrap().unwrap();
        assert_eq!(
            loaded.recipients,
            HashSet::from(["u1".to_string(), "u2".to_string()])
        );
        assert_eq!(loaded.conditions.len(), 2);
        assert_eq!(loaded.conditions[0].condition.parts[0].code, "H810");

        // Every relevance entry refers to a stored condition row id.
        let ids: HashSet<i64> = loaded.conditions.iter().map(|c| c.id).collect();
        for condition_ids in loaded.relevance.values() {
            assert!(condition_ids.iter().all(|id| ids.contains(id)));
        }
    }

    #[tokio::test]
    async fn replace_discards_the_previous_rows() {
        let store = store().await;
        store.replace_audience(9, &resolved(&["u1", "u2"])).await.unwrap();
        store.replace_audience(9, &resolved(&["u3"])).await.unwrap();

        let loaded = store.load_audience(9).await.unwrap().unwrap();
        assert_eq!(loaded.recipients, HashSet::from(["u3".to_string()]));
        assert_eq!(loaded.conditions.len(), 2);
        assert_eq!(loaded.relevance.len(), 1);
    }

    #[tokio::test]
    async fn posts_are_isolated_from_each_other() {
        let store = store().await;
        store.replace_audience(1, &resolved(&["u1"])).await.unwrap();
        store.replace_audience(2, &resolved(&["u2"])).await.unwrap();

        let first = store.load_audience(1).await.unwrap().unwrap();
        assert_eq!(first.recipients, HashSet::from(["u1".to_string()]));
        assert!(store.load_audience(3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rows_persist_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("announce.db").display()
        );

        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        let store = SqlitePostStore::new(pool.clone());
        store.migrate().await.unwrap();
        store.replace_audience(4, &resolved(&["u1"])).await.unwrap();
        pool.close().await;

        let pool = SqlitePoolOptions::new().connect(&url).await.unwrap();
        let store = SqlitePostStore::new(pool);
        let loaded = store.load_audience(4).await.unwrap().unwrap();
        assert!(loaded.recipients.contains("u1"));
    }

    #[tokio::test]
    async fn moderation_records_follow_the_active_flag() {
        let store = store().await;
        let first = store
            .insert_record(5, ModerationStatus::Pending, Some("modp"), Some(11), "first")
            .await
            .unwrap();
        store.deactivate_records(5).await.unwrap();
        let second = store
            .insert_record(5, ModerationStatus::Pending, Some("modp"), Some(11), "second")
            .await
            .unwrap();

        let active = store.active_record(5).await.unwrap().unwrap();
        assert_eq!(active.id, second);
        assert!(active.active);

        let old = store.get_record(first).await.unwrap().unwrap();
        assert!(!old.active);
        assert_eq!(old.description, "first");
    }

    #[tokio::test]
    async fn decisions_stamp_the_record() {
        let store = store().await;
        let id = store
            .insert_record(5, ModerationStatus::Pending, Some("modp"), None, "")
            .await
            .unwrap();
        store
            .set_status(id, ModerationStatus::Approved, "modp")
            .await
            .unwrap();

        let record = store.get_record(id).await.unwrap().unwrap();
        assert_eq!(record.status, ModerationStatus::Approved);
        assert_eq!(record.decided_by.as_deref(), Some("modp"));
        assert!(record.decided_at.is_some());
    }
}
