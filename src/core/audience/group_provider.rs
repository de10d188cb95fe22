// Group-based audience: recipients are the members of a group. Groups have a
// single relationship class, so only the `member` role code yields anyone.

use crate::core::audience::provider::{
    can_post_to_type_via_rules, can_post_via_rules, evaluate_check, AudienceProvider, RelatedCode,
};
use crate::core::audience::tags::{AudienceError, Role};
use crate::core::directory::{ActingUser, Directory, ROLE_MEMBER};
use crate::core::moderation::privilege::{CheckType, PrivilegeQuery};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

pub const GROUP_PROVIDER: &str = "group";

pub struct GroupProvider {
    directory: Arc<dyn Directory>,
    privileges: Arc<PrivilegeQuery>,
}

impl GroupProvider {
    pub fn new(directory: Arc<dyn Directory>, privileges: Arc<PrivilegeQuery>) -> Self {
        Self {
            directory,
            privileges,
        }
    }
}

#[async_trait]
impl AudienceProvider for GroupProvider {
    fn name(&self) -> &str {
        GROUP_PROVIDER
    }

    fn audience_types(&self) -> Vec<String> {
        vec![GROUP_PROVIDER.to_string()]
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
        if roles.iter().any(|role| role.code == ROLE_MEMBER) {
            Ok(self.directory.group_users(code).await?)
        } else {
            Ok(HashSet::new())
        }
    }

    async fn can_post_to(
        &self,
        acting: &ActingUser,
        audience_type: &str,
        code: &str,
    ) -> Result<bool, AudienceError> {
        if !self.directory.group_exists(code).await? {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testsupport::no_privileges;
    use crate::infra::directory::InMemoryDirectory;

    fn provider() -> (Arc<InMemoryDirectory>, GroupProvider) {
        let dir = Arc::new(InMemoryDirectory::new());
        let provider = GroupProvider::new(dir.clone(), no_privileges());
        (dir, provider)
    }

    #[tokio::test]
    async fn only_the_member_role_yields_group_members() {
        let (dir, provider) = provider();
        dir.add_group_member("g7", "u1");
        dir.add_group_member("g7", "u2");

        let members = provider
            .usernames("g7", GROUP_PROVIDER, &[Role::new(ROLE_MEMBER, "Member")])
            .await
            .unwrap();
        assert_eq!(
            members,
            HashSet::from(["u1".to_string(), "u2".to_string()])
        );

        let none = provider.usernames("g7", GROUP_PROVIDER, &[]).await.unwrap();
        assert!(none.is_empty());

        let wrong_role = provider
            .usernames("g7", GROUP_PROVIDER, &[Role::new("student", "Student")])
            .await
            .unwrap();
        assert!(wrong_role.is_empty());
    }

    #[tokio::test]
    async fn cannot_post_to_an_unknown_group() {
        let (dir, provider) = provider();
        dir.add_user("root", true);
        dir.add_group_member("g7", "u1");
        let admin = ActingUser::new("root");

        assert!(provider.can_post_to(&admin, GROUP_PROVIDER, "g7").await.unwrap());
        assert!(!provider
            .can_post_to(&admin, GROUP_PROVIDER, "g9")
            .await
            .unwrap());
    }
}
