// SQLite-backed privilege rule table and CC expansion table.
//
// Rules are administrator-maintained configuration. The stores return rows
// unfiltered; PrivilegeQuery and the resolvers own ordering and matching.

use crate::core::moderation::{
    CcExpansion, CcExpansionStore, CheckType, ModerationError, PrivilegeRule, PrivilegeStore,
};
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};

pub struct SqlitePrivilegeStore {
    pool: Pool<Sqlite>,
}

impl SqlitePrivilegeStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), ModerationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS privilege_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                audience_type TEXT NOT NULL,
                code_pattern TEXT NOT NULL,
                role TEXT,
                condition TEXT,
                check_type TEXT,
                check_value TEXT NOT NULL DEFAULT '',
                check_order INTEGER NOT NULL DEFAULT 0,
                mod_required INTEGER NOT NULL DEFAULT 0,
                mod_priority INTEGER NOT NULL DEFAULT 0,
                mod_threshold INTEGER NOT NULL DEFAULT -1,
                mod_username TEXT,
                description TEXT NOT NULL DEFAULT '',
                active INTEGER NOT NULL DEFAULT 1
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ModerationError::StorageError(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cc_expansions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                audience_type TEXT NOT NULL,
                code_pattern TEXT NOT NULL,
                group_ids TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| ModerationError::StorageError(e.to_string()))?;
        Ok(())
    }

    /// Insert a rule and return its id. The `id` field of the input is ignored.
    pub async fn insert_rule(&self, rule: &PrivilegeRule) -> Result<i64, ModerationError> {
        let result = sqlx::query(
            r#"
            INSERT INTO privilege_rules (
                audience_type, code_pattern, role, condition, check_type,
                check_value, check_order, mod_required, mod_priority,
                mod_threshold, mod_username, description, active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rule.audience_type)
        .bind(&rule.code_pattern)
        .bind(&rule.role)
        .bind(rule.condition.map(|c| c.to_string()))
        .bind(rule.check_type.map(|c| c.as_str()))
        .bind(&rule.check_value)
        .bind(rule.check_order)
        .bind(rule.mod_required as i64)
        .bind(rule.mod_priority)
        .bind(rule.mod_threshold)
        .bind(&rule.mod_username)
        .bind(&rule.description)
        .bind(rule.active as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| ModerationError::StorageError(e.to_string()))?;
        Ok(result.last_insert_rowid())
    }

    pub async fn deactivate_rule(&self, id: i64) -> Result<(), ModerationError> {
        sqlx::query("UPDATE privilege_rules SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| ModerationError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn insert_expansion(&self, expansion: &CcExpansion) -> Result<i64, ModerationError> {
        let group_ids = serde_json::to_string(&expansion.group_ids)
            .map_err(|e| ModerationError::StorageError(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO cc_expansions (audience_type, code_pattern, group_ids) VALUES (?, ?, ?)",
        )
        .bind(&expansion.audience_type)
        .bind(&expansion.code_pattern)
        .bind(group_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| ModerationError::StorageError(e.to_string()))?;
        Ok(result.last_insert_rowid())
    }

    fn row_to_rule(row: &sqlx::sqlite::SqliteRow) -> PrivilegeRule {
        let condition: Option<String> = row.get("condition");
        let check_type: Option<String> = row.get("check_type");
        PrivilegeRule {
            id: row.get("id"),
            audience_type: row.get("audience_type"),
            code_pattern: row.get("code_pattern"),
            role: row.get("role"),
            condition: condition.and_then(|c| c.parse().ok()),
            check_type: check_type.and_then(|c| c.parse().ok()),
            check_value: row.get("check_value"),
            check_order: row.get("check_order"),
            mod_required: row.get::<i64, _>("mod_required") != 0,
            mod_priority: row.get("mod_priority"),
            mod_threshold: row.get("mod_threshold"),
            mod_username: row.get("mod_username"),
            description: row.get("description"),
            active: row.get::<i64, _>("active") != 0,
        }
    }
}

#[async_trait]
impl PrivilegeStore for SqlitePrivilegeStore {
    async fn rules_for_type(
        &self,
        audience_type: &str,
    ) -> Result<Vec<PrivilegeRule>, ModerationError> {
        let rows = sqlx::query("SELECT * FROM privilege_rules WHERE audience_type = ?")
            .bind(audience_type)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ModerationError::StorageError(e.to_string()))?;
        Ok(rows.iter().map(Self::row_to_rule).collect())
    }
}

#[async_trait]
impl CcExpansionStore for SqlitePrivilegeStore {
    async fn expansions(&self, audience_type: &str) -> Result<Vec<CcExpansion>, ModerationError> {
        let rows = sqlx::query(
            "SELECT audience_type, code_pattern, group_ids FROM cc_expansions WHERE audience_type = ? ORDER BY id",
        )
        .bind(audience_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| ModerationError::StorageError(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let raw: String = row.get("group_ids");
                let group_ids: Vec<String> = serde_json::from_str(&raw)
                    .map_err(|e| ModerationError::StorageError(e.to_string()))?;
                Ok(CcExpansion {
                    audience_type: row.get("audience_type"),
                    code_pattern: row.get("code_pattern"),
                    group_ids,
                })
            })
            .collect()
    }
}
