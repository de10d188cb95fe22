// SQLite-backed directory.
//
// Tables:
// - users: accounts and the site-admin flag
// - courses / enrolments / course_meta / course_group_links: course data
// - group_members: flat group membership
// - profile_values: one value per (user, field)
// - capabilities: site-wide rows have a NULL course_code
// - mentor_links / moderation_assistants: user-to-user relationships

use crate::core::directory::{Directory, DirectoryError};
use async_trait::async_trait;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashSet;

pub struct SqliteDirectory {
    pool: Pool<Sqlite>,
}

impl SqliteDirectory {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Run database migrations to create required tables.
    pub async fn migrate(&self) -> Result<(), DirectoryError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                username TEXT PRIMARY KEY,
                is_admin INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS courses (
                code TEXT PRIMARY KEY
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS enrolments (
                course_code TEXT NOT NULL,
                username TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (course_code, username, role)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS course_meta (
                parent_code TEXT NOT NULL,
                child_code TEXT NOT NULL,
                PRIMARY KEY (parent_code, child_code)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS course_group_links (
                course_code TEXT NOT NULL,
                group_id TEXT NOT NULL,
                PRIMARY KEY (course_code, group_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_members (
                group_id TEXT NOT NULL,
                username TEXT NOT NULL,
                PRIMARY KEY (group_id, username)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS profile_values (
                username TEXT NOT NULL,
                field TEXT NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (username, field)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS capabilities (
                username TEXT NOT NULL,
                capability TEXT NOT NULL,
                course_code TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS mentor_links (
                username TEXT NOT NULL,
                mentor TEXT NOT NULL,
                PRIMARY KEY (username, mentor)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS moderation_assistants (
                moderator TEXT NOT NULL,
                assistant TEXT NOT NULL,
                PRIMARY KEY (moderator, assistant)
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seeding helpers (admin tooling and tests)
    // ------------------------------------------------------------------

    pub async fn add_user(&self, username: &str, is_admin: bool) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR REPLACE INTO users (username, is_admin) VALUES (?, ?)")
            .bind(username)
            .bind(is_admin as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn add_course(&self, code: &str) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO courses (code) VALUES (?)")
            .bind(code)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn enrol(
        &self,
        course_code: &str,
        username: &str,
        role: &str,
    ) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO enrolments (course_code, username, role) VALUES (?, ?, ?)")
            .bind(course_code)
            .bind(username)
            .bind(role)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn link_meta(&self, parent: &str, child: &str) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO course_meta (parent_code, child_code) VALUES (?, ?)")
            .bind(parent)
            .bind(child)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn link_group(&self, course_code: &str, group_id: &str) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO course_group_links (course_code, group_id) VALUES (?, ?)")
            .bind(course_code)
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn add_group_member(
        &self,
        group_id: &str,
        username: &str,
    ) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO group_members (group_id, username) VALUES (?, ?)")
            .bind(group_id)
            .bind(username)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn set_profile_value(
        &self,
        username: &str,
        field: &str,
        value: &str,
    ) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR REPLACE INTO profile_values (username, field, value) VALUES (?, ?, ?)")
            .bind(username)
            .bind(field)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    /// Grant a capability; `course_code = None` makes it site-wide.
    pub async fn grant_capability(
        &self,
        username: &str,
        capability: &str,
        course_code: Option<&str>,
    ) -> Result<(), DirectoryError> {
        sqlx::query("INSERT INTO capabilities (username, capability, course_code) VALUES (?, ?, ?)")
            .bind(username)
            .bind(capability)
            .bind(course_code)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn add_mentor(&self, username: &str, mentor: &str) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO mentor_links (username, mentor) VALUES (?, ?)")
            .bind(username)
            .bind(mentor)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    pub async fn add_assistant(
        &self,
        moderator: &str,
        assistant: &str,
    ) -> Result<(), DirectoryError> {
        sqlx::query("INSERT OR IGNORE INTO moderation_assistants (moderator, assistant) VALUES (?, ?)")
            .bind(moderator)
            .bind(assistant)
            .execute(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(())
    }

    async fn fetch_usernames<'q>(
        &self,
        query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> Result<HashSet<String>, DirectoryError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }
}

#[async_trait]
impl Directory for SqliteDirectory {
    async fn user_exists(&self, username: &str) -> Result<bool, DirectoryError> {
        let row = sqlx::query("SELECT 1 FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn course_exists(&self, course_code: &str) -> Result<bool, DirectoryError> {
        let row = sqlx::query("SELECT 1 FROM courses WHERE code = ?")
            .bind(course_code)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn course_users(
        &self,
        course_code: &str,
        role_code: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        self.fetch_usernames(
            sqlx::query("SELECT username FROM enrolments WHERE course_code = ? AND role = ?")
                .bind(course_code)
                .bind(role_code),
        )
        .await
    }

    async fn course_meta_parents(&self, course_code: &str) -> Result<Vec<String>, DirectoryError> {
        let rows = sqlx::query("SELECT parent_code FROM course_meta WHERE child_code = ? ORDER BY parent_code")
            .bind(course_code)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn course_groups(&self, course_code: &str) -> Result<Vec<String>, DirectoryError> {
        let rows = sqlx::query("SELECT group_id FROM course_group_links WHERE course_code = ? ORDER BY group_id")
            .bind(course_code)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn group_users(&self, group_id: &str) -> Result<HashSet<String>, DirectoryError> {
        self.fetch_usernames(
            sqlx::query("SELECT username FROM group_members WHERE group_id = ?").bind(group_id),
        )
        .await
    }

    async fn group_exists(&self, group_id: &str) -> Result<bool, DirectoryError> {
        let row = sqlx::query(
            "SELECT 1 FROM group_members WHERE group_id = ? \
             UNION ALL SELECT 1 FROM course_group_links WHERE group_id = ? LIMIT 1",
        )
        .bind(group_id)
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn users_with_profile_value(
        &self,
        field: &str,
        value: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        self.fetch_usernames(
            sqlx::query("SELECT username FROM profile_values WHERE field = ? AND value = ?")
                .bind(field)
                .bind(value),
        )
        .await
    }

    async fn profile_value(
        &self,
        username: &str,
        field: &str,
    ) -> Result<Option<String>, DirectoryError> {
        let row = sqlx::query("SELECT value FROM profile_values WHERE username = ? AND field = ?")
            .bind(username)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn mentors_of(&self, username: &str) -> Result<HashSet<String>, DirectoryError> {
        self.fetch_usernames(
            sqlx::query("SELECT mentor FROM mentor_links WHERE username = ?").bind(username),
        )
        .await
    }

    async fn has_capability(
        &self,
        username: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError> {
        let row = sqlx::query(
            "SELECT 1 FROM capabilities WHERE username = ? AND capability = ? AND course_code IS NULL",
        )
        .bind(username)
        .bind(capability)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn has_course_capability(
        &self,
        username: &str,
        course_code: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError> {
        // A site-wide grant satisfies a course-scoped check.
        let row = sqlx::query(
            r#"
            SELECT 1 FROM capabilities
            WHERE username = ? AND capability = ?
              AND (course_code IS NULL OR course_code = ?)
            "#,
        )
        .bind(username)
        .bind(capability)
        .bind(course_code)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.is_some())
    }

    async fn is_site_admin(&self, username: &str) -> Result<bool, DirectoryError> {
        let row = sqlx::query("SELECT is_admin FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| DirectoryError::StorageError(e.to_string()))?;
        Ok(row.map(|r| r.get::<i64, _>(0) != 0).unwrap_or(false))
    }

    async fn moderation_assistants(
        &self,
        moderator: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        self.fetch_usernames(
            sqlx::query("SELECT assistant FROM moderation_assistants WHERE moderator = ?")
                .bind(moderator),
        )
        .await
    }
}
