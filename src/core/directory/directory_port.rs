// Directory port - the acting-user/context accessor plus the membership
// lookups audience providers need.
//
// NO storage engine specifics here - infra provides SQLite and in-memory
// implementations of this trait.

use async_trait::async_trait;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// The user driving a save/preview request. Passed by reference into every
/// privilege-sensitive call; nothing caches per-user state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActingUser {
    pub username: String,
}

impl ActingUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
        }
    }
}

/// Role codes a course audience understands.
pub const ROLE_STUDENT: &str = "student";
pub const ROLE_STAFF: &str = "staff";
pub const ROLE_MENTOR: &str = "mentor";
/// Role code for plain membership (groups, profile-field audiences).
pub const ROLE_MEMBER: &str = "member";
/// Role code the single-user provider treats as "the selected person".
pub const ROLE_SELF: &str = "self";

/// Read-only view of users, courses, groups, profile fields, capabilities and
/// moderation assistants. All lookups are expected to be fast queries; the
/// resolvers never block on anything else.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn user_exists(&self, username: &str) -> Result<bool, DirectoryError>;

    async fn course_exists(&self, course_code: &str) -> Result<bool, DirectoryError>;

    /// Users related to a course under one role code (`student`, `staff`,
    /// `mentor`). Unknown role codes resolve to the empty set.
    async fn course_users(
        &self,
        course_code: &str,
        role_code: &str,
    ) -> Result<HashSet<String>, DirectoryError>;

    /// Meta-courses that include this course.
    async fn course_meta_parents(&self, course_code: &str) -> Result<Vec<String>, DirectoryError>;

    /// Groups attached to a course.
    async fn course_groups(&self, course_code: &str) -> Result<Vec<String>, DirectoryError>;

    async fn group_users(&self, group_id: &str) -> Result<HashSet<String>, DirectoryError>;

    /// Whether the group is known at all (has members or a course link).
    async fn group_exists(&self, group_id: &str) -> Result<bool, DirectoryError>;

    async fn users_with_profile_value(
        &self,
        field: &str,
        value: &str,
    ) -> Result<HashSet<String>, DirectoryError>;

    async fn profile_value(
        &self,
        username: &str,
        field: &str,
    ) -> Result<Option<String>, DirectoryError>;

    /// Mentors linked to one user (used by the single-user audience).
    async fn mentors_of(&self, username: &str) -> Result<HashSet<String>, DirectoryError>;

    /// Site-wide capability check.
    async fn has_capability(
        &self,
        username: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError>;

    /// Course-scoped capability check. A site-wide grant also satisfies it.
    async fn has_course_capability(
        &self,
        username: &str,
        course_code: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError>;

    async fn is_site_admin(&self, username: &str) -> Result<bool, DirectoryError>;

    /// Users registered as assistants for a moderator; posts they write are
    /// auto-approved when that moderator wins the verdict.
    async fn moderation_assistants(
        &self,
        moderator: &str,
    ) -> Result<HashSet<String>, DirectoryError>;
}
