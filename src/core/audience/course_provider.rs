// Course-based audience: recipients are users related to a course under a
// role (students, staff, mentors).

use crate::core::audience::provider::{
    can_post_to_type_via_rules, can_post_via_rules, evaluate_check, AudienceProvider, RelatedCode,
};
use crate::core::audience::tags::{AudienceError, Role};
use crate::core::directory::{ActingUser, Directory};
use crate::core::moderation::privilege::{CheckType, PrivilegeQuery};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

pub const COURSE_PROVIDER: &str = "course";

pub struct CourseProvider {
    directory: Arc<dyn Directory>,
    privileges: Arc<PrivilegeQuery>,
}

impl CourseProvider {
    pub fn new(directory: Arc<dyn Directory>, privileges: Arc<PrivilegeQuery>) -> Self {
        Self {
            directory,
            privileges,
        }
    }
}

#[async_trait]
impl AudienceProvider for CourseProvider {
    fn name(&self) -> &str {
        COURSE_PROVIDER
    }

    fn audience_types(&self) -> Vec<String> {
        vec![COURSE_PROVIDER.to_string()]
    }

    /// A course is equivalent to its meta-course parents (course provider)
    /// and to its groups (group provider) for inbound lookups.
    async fn related_codes(&self, code: &str) -> Result<Vec<RelatedCode>, AudienceError> {
        let mut related = Vec::new();
        for parent in self.directory.course_meta_parents(code).await? {
            related.push(RelatedCode {
                provider: COURSE_PROVIDER.to_string(),
                code: parent,
            });
        }
        for group in self.directory.course_groups(code).await? {
            related.push(RelatedCode {
                provider: "group".to_string(),
                code: group,
            });
        }
        Ok(related)
    }

    async fn usernames(
        &self,
        code: &str,
        _audience_type: &str,
        roles: &[Role],
    ) -> Result<HashSet<String>, AudienceError> {
        let mut users = HashSet::new();
        for role in roles {
            users.extend(self.directory.course_users(code, &role.code).await?);
        }
        Ok(users)
    }

    async fn can_post_to(
        &self,
        acting: &ActingUser,
        audience_type: &str,
        code: &str,
    ) -> Result<bool, AudienceError> {
        if !self.directory.course_exists(code).await? {
            return Ok(false);
        }
        can_post_via_rules(
            self.directory.as_ref(),
            &self.privileges,
            acting,
            audience_type,
            code,
            Some(code),
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
        code: &str,
    ) -> bool {
        evaluate_check(
            self.directory.as_ref(),
            acting,
            check_type,
            check_value,
            Some(code),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::directory::{ROLE_MEMBER, ROLE_STAFF, ROLE_STUDENT};
    use crate::core::testsupport::no_privileges;
    use crate::infra::directory::InMemoryDirectory;

    fn provider() -> (Arc<InMemoryDirectory>, CourseProvider) {
        let dir = Arc::new(InMemoryDirectory::new());
        let provider = CourseProvider::new(dir.clone(), no_privileges());
        (dir, provider)
    }

    #[tokio::test]
    async fn usernames_filter_by_enrolment_role() {
        let (dir, provider) = provider();
        dir.add_course("H810");
        dir.enrol("H810", "u1", ROLE_STUDENT);
        dir.enrol("H810", "u2", ROLE_STUDENT);
        dir.enrol("H810", "t1", ROLE_STAFF);

        let students = provider
            .usernames("H810", COURSE_PROVIDER, &[Role::new(ROLE_STUDENT, "Student")])
            .await
            .unwrap();
        assert_eq!(
            students,
            HashSet::from(["u1".to_string(), "u2".to_string()])
        );

        let both = provider
            .usernames(
                "H810",
                COURSE_PROVIDER,
                &[Role::new(ROLE_STUDENT, "Student"), Role::new(ROLE_STAFF, "Staff")],
            )
            .await
            .unwrap();
        assert_eq!(both.len(), 3);
        assert!(both.contains("t1"));
    }

    #[tokio::test]
    async fn no_roles_or_unknown_roles_yield_nobody() {
        let (dir, provider) = provider();
        dir.add_course("H810");
        dir.enrol("H810", "u1", ROLE_STUDENT);

        let none = provider.usernames("H810", COURSE_PROVIDER, &[]).await.unwrap();
        assert!(none.is_empty());

        let unknown = provider
            .usernames("H810", COURSE_PROVIDER, &[Role::new(ROLE_MEMBER, "Member")])
            .await
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn related_codes_cover_meta_parents_and_groups() {
        let (dir, provider) = provider();
        dir.add_course("H810");
        dir.link_meta("STEM-META", "H810");
        dir.link_group("H810", "g7");

        let related = provider.related_codes("H810").await.unwrap();
        assert!(related.contains(&RelatedCode {
            provider: COURSE_PROVIDER.to_string(),
            code: "STEM-META".to_string(),
        }));
        assert!(related.contains(&RelatedCode {
            provider: "group".to_string(),
            code: "g7".to_string(),
        }));
    }
}
