// Test fakes shared across the core test modules: a provider with canned
// results, a directory seeded through builders, and a no-op CC table.

use crate::core::audience::provider::{AudienceProvider, RelatedCode};
use crate::core::audience::tags::{AudienceError, AudienceSelection, Item, Role, Tag, TagKind};
use crate::core::directory::{ActingUser, Directory, DirectoryError};
use crate::core::moderation::privilege::{
    CcExpansion, CcExpansionStore, CheckType, ModerationError, PrivilegeQuery, PrivilegeRule,
    PrivilegeStore,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Provider with a fixed code -> users table. Roles are ignored; tests that
/// care about role filtering use the real providers over `FakeDirectory`.
pub struct FixedProvider {
    name: String,
    users: HashMap<String, HashSet<String>>,
    allow_posting: bool,
    check_result: bool,
}

impl FixedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            users: HashMap::new(),
            allow_posting: true,
            check_result: true,
        }
    }

    pub fn with_users<I, S>(mut self, code: &str, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.users.insert(
            code.to_string(),
            users.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn deny_posting(mut self) -> Self {
        self.allow_posting = false;
        self
    }

    /// Every privilege check evaluates to false (exercises fail-closed paths).
    pub fn failing_checks(mut self) -> Self {
        self.check_result = false;
        self
    }
}

#[async_trait]
impl AudienceProvider for FixedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn audience_types(&self) -> Vec<String> {
        vec![self.name.clone()]
    }

    async fn related_codes(&self, _code: &str) -> Result<Vec<RelatedCode>, AudienceError> {
        Ok(Vec::new())
    }

    async fn usernames(
        &self,
        code: &str,
        _audience_type: &str,
        _roles: &[Role],
    ) -> Result<HashSet<String>, AudienceError> {
        Ok(self.users.get(code).cloned().unwrap_or_default())
    }

    async fn can_post_to(
        &self,
        _acting: &ActingUser,
        _audience_type: &str,
        _code: &str,
    ) -> Result<bool, AudienceError> {
        Ok(self.allow_posting)
    }

    async fn can_post_to_type(
        &self,
        _acting: &ActingUser,
        _audience_type: &str,
    ) -> Result<bool, AudienceError> {
        Ok(self.allow_posting)
    }

    async fn check_privilege(
        &self,
        _acting: &ActingUser,
        _check_type: CheckType,
        _check_value: &str,
        _code: &str,
    ) -> bool {
        self.check_result
    }
}

/// Directory fake seeded through builder methods; everything else is empty.
#[derive(Default)]
pub struct FakeDirectory {
    users: HashSet<String>,
    admins: HashSet<String>,
    groups: HashMap<String, HashSet<String>>,
    capabilities: HashSet<(String, String)>,
    assistants: HashMap<String, HashSet<String>>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: &str) -> Self {
        self.users.insert(username.to_string());
        self
    }

    pub fn with_admin(mut self, username: &str) -> Self {
        self.users.insert(username.to_string());
        self.admins.insert(username.to_string());
        self
    }

    pub fn with_group<I, S>(mut self, group_id: &str, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups.insert(
            group_id.to_string(),
            members.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn with_capability(mut self, username: &str, capability: &str) -> Self {
        self.capabilities
            .insert((username.to_string(), capability.to_string()));
        self
    }

    pub fn with_assistant(mut self, moderator: &str, assistant: &str) -> Self {
        self.assistants
            .entry(moderator.to_string())
            .or_default()
            .insert(assistant.to_string());
        self
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn user_exists(&self, username: &str) -> Result<bool, DirectoryError> {
        Ok(self.users.contains(username))
    }

    async fn course_exists(&self, _course_code: &str) -> Result<bool, DirectoryError> {
        Ok(true)
    }

    async fn course_users(
        &self,
        _course_code: &str,
        _role_code: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        Ok(HashSet::new())
    }

    async fn course_meta_parents(&self, _course_code: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(Vec::new())
    }

    async fn course_groups(&self, _course_code: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(Vec::new())
    }

    async fn group_users(&self, group_id: &str) -> Result<HashSet<String>, DirectoryError> {
        Ok(self.groups.get(group_id).cloned().unwrap_or_default())
    }

    async fn group_exists(&self, group_id: &str) -> Result<bool, DirectoryError> {
        Ok(self.groups.contains_key(group_id))
    }

    async fn users_with_profile_value(
        &self,
        _field: &str,
        _value: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        Ok(HashSet::new())
    }

    async fn profile_value(
        &self,
        _username: &str,
        _field: &str,
    ) -> Result<Option<String>, DirectoryError> {
        Ok(None)
    }

    async fn mentors_of(&self, _username: &str) -> Result<HashSet<String>, DirectoryError> {
        Ok(HashSet::new())
    }

    async fn has_capability(
        &self,
        username: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError> {
        Ok(self
            .capabilities
            .contains(&(username.to_string(), capability.to_string())))
    }

    async fn has_course_capability(
        &self,
        username: &str,
        _course_code: &str,
        capability: &str,
    ) -> Result<bool, DirectoryError> {
        self.has_capability(username, capability).await
    }

    async fn is_site_admin(&self, username: &str) -> Result<bool, DirectoryError> {
        Ok(self.admins.contains(username))
    }

    async fn moderation_assistants(
        &self,
        moderator: &str,
    ) -> Result<HashSet<String>, DirectoryError> {
        Ok(self.assistants.get(moderator).cloned().unwrap_or_default())
    }
}

/// Rule table with nothing in it.
pub struct NoRules;

#[async_trait]
impl PrivilegeStore for NoRules {
    async fn rules_for_type(
        &self,
        _audience_type: &str,
    ) -> Result<Vec<PrivilegeRule>, ModerationError> {
        Ok(Vec::new())
    }
}

/// Query layer over an empty rule table.
pub fn no_privileges() -> Arc<PrivilegeQuery> {
    Arc::new(PrivilegeQuery::new(Arc::new(NoRules)))
}

/// CC-expansion table with nothing in it.
pub struct NoCc;

#[async_trait]
impl CcExpansionStore for NoCc {
    async fn expansions(&self, _audience_type: &str) -> Result<Vec<CcExpansion>, ModerationError> {
        Ok(Vec::new())
    }
}

/// Build a single-selection tag. `items` pairs each code with the role codes
/// to put on the selection (role lists are merged, order-preserving).
pub fn tag(kind: TagKind, provider: &str, audience_type: &str, items: &[(&str, &[&str])]) -> Tag {
    let mut roles: Vec<Role> = Vec::new();
    for (_, item_roles) in items {
        for role in *item_roles {
            if !roles.iter().any(|r| r.code == *role) {
                roles.push(Role::new(*role, *role));
            }
        }
    }

    Tag {
        kind,
        uid: format!("t-{provider}"),
        audiences: vec![AudienceSelection {
            provider: provider.to_string(),
            audience_type: audience_type.to_string(),
            selected_items: items
                .iter()
                .map(|(code, _)| Item::new(*code, *code))
                .collect(),
            selected_roles: roles,
        }],
    }
}
