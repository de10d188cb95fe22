// In-memory implementation of the Directory port.
//
// Useful for tests and for demoing the resolvers without a database. The
// SqliteDirectory implements the identical contract against real tables.

use crate::core::directory::{Directory, DirectoryError};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;

#[derive(Clone, Debug, Default)]
struct UserEntry {
    is_admin: bool,
    // field -> value
    profile: Vec<(String, String)>,
    mentors: HashSet<String>,
}

/// Directory backed by concurrent maps. Seeding methods take `&self` so a
/// shared `Arc<InMemoryDirectory>` can still be populated.
pub struct InMemoryDirectory {
    users: DashMap<String, UserEntry>,
    courses: DashSet<String>,
    // (course_code, role) -> usernames
    enrolments: DashMap<(String, String), HashSet<String>>,
    // child course -> parent meta courses
    meta_parents: DashMap<String, Vec<String>>,
    // course -> group ids
    course_groups: DashMap<String, Vec<String>>,
    group_members: DashMap<String, HashSet<String>>,
    // (username, capability) -> course codes, None meaning site-wide
    capabilities: DashMap<(String, String), Vec<Option<String>>>,
    assistants: DashMap<String, HashSet<String>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            courses: DashSet::new(),
            enrolments: DashMap::new(),
            meta_parents: DashMap::new(),
            course_groups: DashMap::new(),
            group_members: DashMap::new(),
            capabilities: DashMap::new(),
            assistants: DashMap::new(),
        }
    }

    pub fn add_user(&self, username: &str, is_admin: bool) {
        self.users
            .entry(username.to_string())
            .or_default()
            .is_admin = is_admin;
    }

    pub fn add_course(&self, code: &str) {
        self.courses.insert(code.to_string());
    }

    pub fn enrol(&self, course_code: &str, username: &str, role: &str) {
        self.enrolments
            .entry((course_code.to_string(), role.to_string()))
            .or_default()
            .insert(username.to_string());
    }

    pub fn link_meta(&self, parent: &str, child: &str) {
        self.meta_parents
            .entry(child.to_string())
            .or_default()
            .push(parent.to_string());
    }

    pub fn link_group(&self, course_code: &str, group_id: &str) {
        self.course_groups
            .entry(course_code.to_string())
            .or_default()
            .push(group_id.to_string());
    }

    pub fn add_group_member(&self, group_id: &str, username: &str) {
        self.group_members
            .entry(group_id.to_string())
            .or_default()
            .insert(username.to_string());
    }

    pub fn set_profile_value(&self, username: &str, field: &str, value: &str) {
        let mut entry = self.users.entry(username.to_string()).or_default();
        entry.profile.retain(|(f, _)| f != field);
        entry.profile.push((field.to_string(), value.to_string()));
    }

    pub fn grant_capability(&self, username: &str, capability: &str, course_code: Option<&str>) {
        self.capabilities
            .entry((username.to_string(), capability.to_string()))
            .or_default()
            .push(course_code.map(str::to_string));
    }

    pub fn add_mentor(&self, username: &str, mentor: &str) {
        self.users
            .entry(username.to_string())
            .or_default()
            .mentors
            .insert(mentor.to_string());
    }

    pub fn add_assistant(&self, moderator: &str, assistant: &str) {
        self.assistants
            .entry(moderator.to_string())
            .or_default()
            .insert(assistant.to_string());
    }
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn user_exists(&self, username: &str) -> Result<bool, DirectoryError> {
        Ok(self.users.contains_key(username))
    }

    async fn course_exists(&self, course_code: &str) -> Result<bool, DirectoryError> {
        Ok(self.courses.contains(course_code))
    }

    async fn course_users(
        &self,
        course_code: &str,
        role_code: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        Ok(self
            .enrolments
            .get(&(course_code.to_string(), role_code.to_string()))
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn course_meta_parents(&self, course_code: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .meta_parents
            .get(course_code)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn course_groups(&self, course_code: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .course_groups
            .get(course_code)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn group_users(&self, group_id: &str) -> Result<HashSet<String>, DirectoryError> {
        Ok(self
            .group_members
            .get(group_id)
            .map(|e| e.clone())
            .unwrap_or_default())
    }

    async fn group_exists(&self, group_id: &str) -> Result<bool, DirectoryError> {
        Ok(self.group_members.contains_key(group_id)
            || self
                .course_groups
                .iter()
                .any(|entry| entry.value().iter().any(|g| g == group_id)))
    }

    async fn users_with_profile_value(
        &self,
        field: &str,
        value: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        Ok(self
            .users
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .profile
                    .iter()
                    .any(|(f, v)| f == field && v == value)
            })
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn profile_value(
        &self,
        username: &str,
        field: &str,
    ) -> Result<Option<String>, DirectoryError> {
        Ok(self.users.get(username).and_then(|entry| {
            entry
                .profile
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, v)| v.clone())
        }))
    }

    async fn mentors_of(&self, username: &str) -> Result<HashSet<String>, DirectoryError> {
        Ok(self
            .users
            .get(username)
            .map(|entry| entry.mentors.clone())
            .unwrap_or_default())
    }

    async fn has_capability(
        &self,
        username: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError> {
        Ok(self
            .capabilities
            .get(&(username.to_string(), capability.to_string()))
            .map(|scopes| scopes.iter().any(Option::is_none))
            .unwrap_or(false))
    }

    async fn has_course_capability(
        &self,
        username: &str,
        course_code: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError> {
        Ok(self
            .capabilities
            .get(&(username.to_string(), capability.to_string()))
            .map(|scopes| {
                scopes
                    .iter()
                    .any(|scope| scope.is_none() || scope.as_deref() == Some(course_code))
            })
            .unwrap_or(false))
    }

    async fn is_site_admin(&self, username: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .users
            .get(username)
            .map(|entry| entry.is_admin)
            .unwrap_or(false))
    }

    async fn moderation_assistants(
        &self,
        moderator: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        Ok(self
            .assistants
            .get(moderator)
            .map(|e| e.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enrolments_are_scoped_by_role() {
        let dir = InMemoryDirectory::new();
        dir.add_course("H810");
        dir.enrol("H810", "u1", "student");
        dir.enrol("H810", "t1", "staff");

        assert!(dir.course_exists("H810").await.unwrap());
        let students = dir.course_users("H810", "student").await.unwrap();
        assert!(students.contains("u1"));
        assert!(!students.contains("t1"));
    }

    #[tokio::test]
    async fn profile_values_overwrite_per_field() {
        let dir = InMemoryDirectory::new();
        dir.set_profile_value("u1", "department", "history");
        dir.set_profile_value("u1", "department", "physics");

        assert_eq!(
            dir.profile_value("u1", "department").await.unwrap().as_deref(),
            Some("physics")
        );
        assert!(dir
            .users_with_profile_value("department", "history")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn capability_scopes() {
        let dir = InMemoryDirectory::new();
        dir.grant_capability("u1", "announce:post", Some("H810"));
        dir.grant_capability("u2", "announce:post", None);

        assert!(!dir.has_capability("u1", "announce:post").await.unwrap());
        assert!(dir
            .has_course_capability("u1", "H810", "announce:post")
            .await
            .unwrap());
        assert!(dir
            .has_course_capability("u2", "ANY", "announce:post")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn groups_exist_via_members_or_course_links() {
        let dir = InMemoryDirectory::new();
        dir.add_group_member("g1", "u1");
        dir.link_group("H810", "g2");

        assert!(dir.group_exists("g1").await.unwrap());
        assert!(dir.group_exists("g2").await.unwrap());
        assert!(!dir.group_exists("g3").await.unwrap());
    }
}
