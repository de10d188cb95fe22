// Single-user audience: the item code is a username. The one provider where
// an empty role filter still yields recipients - it defaults to the selected
// person only. The `mentor` role adds that person's mentors instead.

use crate::core::audience::provider::{
    can_post_to_type_via_rules, can_post_via_rules, evaluate_check, AudienceProvider, RelatedCode,
};
use crate::core::audience::tags::{AudienceError, Role};
use crate::core::directory::{ActingUser, Directory, ROLE_MENTOR, ROLE_SELF};
use crate::core::moderation::privilege::{CheckType, PrivilegeQuery};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

pub const USER_PROVIDER: &str = "user";

pub struct UserProvider {
    directory: Arc<dyn Directory>,
    privileges: Arc<PrivilegeQuery>,
}

impl UserProvider {
    pub fn new(directory: Arc<dyn Directory>, privileges: Arc<PrivilegeQuery>) -> Self {
        Self {
            directory,
            privileges,
        }
    }
}

#[async_trait]
impl AudienceProvider for UserProvider {
    fn name(&self) -> &str {
        USER_PROVIDER
    }

    fn audience_types(&self) -> Vec<String> {
        vec![USER_PROVIDER.to_string()]
    }

    async fn related_codes(&self, _code: &str) -> Result<Vec<RelatedCode>, AudienceError> {
        Ok(Vec::new())
    }

    async fn usernames(
        &self,
        code: &str,
        _audience_type: &str,
        roles: &[Role],
    ) -> Result<HashSet<String>, AudienceError> {
        let mut users = HashSet::new();

        let include_self =
            roles.is_empty() || roles.iter().any(|role| role.code == ROLE_SELF);
        if include_self && self.directory.user_exists(code).await? {
            users.insert(code.to_string());
        }
        if roles.iter().any(|role| role.code == ROLE_MENTOR) {
            users.extend(self.directory.mentors_of(code).await?);
        }

        Ok(users)
    }

    async fn can_post_to(
        &self,
        acting: &ActingUser,
        audience_type: &str,
        code: &str,
    ) -> Result<bool, AudienceError> {
        if !self.directory.user_exists(code).await? {
            return Ok(false);
        }
        can_post_via_rules(
            self.directory.as_ref(),
            &self.privileges,
            acting,
            audience_type,
            code,
            None,
        )
        .await
    }

    async fn can_post_to_type(
        &self,
        acting: &ActingUser,
        audience_type: &str,
    ) -> Result<bool, AudienceError> {
        can_post_to_type_via_rules(self.directory.as_ref(), &self.privileges, acting, audience_type)
            .await
    }

    async fn check_privilege(
        &self,
        acting: &ActingUser,
        check_type: CheckType,
        check_value: &str,
        _code: &str,
    ) -> bool {
        evaluate_check(self.directory.as_ref(), acting, check_type, check_value, None).await
    }
}
