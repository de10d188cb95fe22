// Profile-field audience: recipients are users whose profile field holds a
// given value. Item codes are `field=value`; a malformed code resolves to
// nobody rather than failing the whole expression.

use crate::core::audience::provider::{
    can_post_to_type_via_rules, can_post_via_rules, evaluate_check, AudienceProvider, RelatedCode,
};
use crate::core::audience::tags::{AudienceError, Role};
use crate::core::directory::{ActingUser, Directory, ROLE_MEMBER};
use crate::core::moderation::privilege::{CheckType, PrivilegeQuery};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

pub const PROFILE_PROVIDER: &str = "profilefield";

pub struct ProfileFieldProvider {
    directory: Arc<dyn Directory>,
    privileges: Arc<PrivilegeQuery>,
}

impl ProfileFieldProvider {
    pub fn new(directory: Arc<dyn Directory>, privileges: Arc<PrivilegeQuery>) -> Self {
        Self {
            directory,
            privileges,
        }
    }
}

fn split_code(code: &str) -> Option<(&str, &str)> {
    code.split_once('=').filter(|(field, _)| !field.is_empty())
}

#[async_trait]
impl AudienceProvider for ProfileFieldProvider {
    fn name(&self) -> &str {
        PROFILE_PROVIDER
    }

    fn audience_types(&self) -> Vec<String> {
        vec![PROFILE_PROVIDER.to_string()]
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
        if !roles.iter().any(|role| role.code == ROLE_MEMBER) {
            return Ok(HashSet::new());
        }
        match split_code(code) {
            Some((field, value)) => {
                Ok(self.directory.users_with_profile_value(field, value).await?)
            }
            None => {
                tracing::warn!(code, "malformed profile-field audience code");
                Ok(HashSet::new())
            }
        }
    }

    async fn can_post_to(
        &self,
        acting: &ActingUser,
        audience_type: &str,
        code: &str,
    ) -> Result<bool, AudienceError> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testsupport::no_privileges;
    use crate::infra::directory::InMemoryDirectory;

    #[test]
    fn split_code_requires_field() {
        assert_eq!(split_code("department=history"), Some(("department", "history")));
        assert_eq!(split_code("=history"), None);
        assert_eq!(split_code("department"), None);
    }

    #[tokio::test]
    async fn usernames_require_the_member_role() {
        let dir = Arc::new(InMemoryDirectory::new());
        dir.set_profile_value("u1", "department", "history");
        dir.set_profile_value("u2", "department", "history");
        dir.set_profile_value("u3", "department", "physics");
        let provider = ProfileFieldProvider::new(dir, no_privileges());

        let matched = provider
            .usernames(
                "department=history",
                PROFILE_PROVIDER,
                &[Role::new(ROLE_MEMBER, "Member")],
            )
            .await
            .unwrap();
        assert_eq!(
            matched,
            HashSet::from(["u1".to_string(), "u2".to_string()])
        );

        let none = provider
            .usernames("department=history", PROFILE_PROVIDER, &[])
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
