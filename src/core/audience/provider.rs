// Audience provider interface and the registry that holds one implementation
// per provider name.
//
// The variant set is closed (course, group, profilefield, user, combination)
// and dispatch goes through the trait; the name -> provider map exists only
// because composite codes carry provider names at runtime.

use crate::core::audience::tags::{AudienceError, Role};
use crate::core::directory::{ActingUser, Directory};
use crate::core::moderation::privilege::{code_matches, CheckType, ModerationError, PrivilegeQuery};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

impl From<ModerationError> for AudienceError {
    fn from(err: ModerationError) -> Self {
        match err {
            ModerationError::StorageError(msg) => AudienceError::StorageError(msg),
        }
    }
}

/// A code another provider should treat as equivalent for inbound lookups
/// (e.g. a course's meta-course, or a course's groups).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedCode {
    pub provider: String,
    pub code: String,
}

/// One pluggable audience source.
#[async_trait]
pub trait AudienceProvider: Send + Sync {
    /// Registry key for this provider.
    fn name(&self) -> &str;

    /// Active audience types this provider owns.
    fn audience_types(&self) -> Vec<String>;

    fn owns_type(&self, audience_type: &str) -> bool {
        self.audience_types()
            .iter()
            .any(|t| t == audience_type)
    }

    /// Codes equivalent to `code` for inbound lookups.
    async fn related_codes(&self, code: &str) -> Result<Vec<RelatedCode>, AudienceError>;

    /// Concrete recipients for one selected item under the given role filter.
    /// An empty role list means no recipients, except for the single-user
    /// provider where it defaults to the selected person.
    async fn usernames(
        &self,
        code: &str,
        audience_type: &str,
        roles: &[Role],
    ) -> Result<HashSet<String>, AudienceError>;

    /// May the acting user target this item?
    async fn can_post_to(
        &self,
        acting: &ActingUser,
        audience_type: &str,
        code: &str,
    ) -> Result<bool, AudienceError>;

    /// May the acting user target this audience type at all?
    async fn can_post_to_type(
        &self,
        acting: &ActingUser,
        audience_type: &str,
    ) -> Result<bool, AudienceError>;

    /// Evaluate one atomic privilege check against the acting user. A failing
    /// or erroring check is `false` - checks fail closed, never open.
    async fn check_privilege(
        &self,
        acting: &ActingUser,
        check_type: CheckType,
        check_value: &str,
        code: &str,
    ) -> bool;

    /// Extract the underlying provider-specific code from a composite code.
    /// Identity for every simple provider.
    fn true_code(&self, code: &str) -> String {
        code.to_string()
    }
}

/// Evaluate one privilege check against the directory. `course_code` supplies
/// context for course-scoped capability checks. Any directory failure is
/// logged and treated as "check failed".
pub(crate) async fn evaluate_check(
    directory: &dyn Directory,
    acting: &ActingUser,
    check_type: CheckType,
    check_value: &str,
    course_code: Option<&str>,
) -> bool {
    let outcome = match check_type {
        CheckType::UserCapability => directory
            .has_capability(&acting.username, check_value)
            .await,
        CheckType::CourseCapability => match course_code {
            Some(course) => {
                directory
                    .has_course_capability(&acting.username, course, check_value)
                    .await
            }
            None => Ok(false),
        },
        CheckType::Username => Ok(code_matches(check_value, &acting.username)),
        CheckType::Exclude => Ok(!code_matches(check_value, &acting.username)),
        CheckType::ProfileField => match check_value.split_once('=') {
            Some((field, wanted)) => directory
                .profile_value(&acting.username, field)
                .await
                .map(|value| value.as_deref() == Some(wanted)),
            None => {
                tracing::warn!(check_value, "malformed profilefield check value");
                Ok(false)
            }
        },
    };

    match outcome {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!(
                username = %acting.username,
                check = check_type.as_str(),
                "privilege check failed closed: {err}"
            );
            false
        }
    }
}

/// Shared posting gate: the acting user may post to `(type, code)` when they
/// are a site admin, or when at least one active rule matches the pair and
/// its attached check passes (a rule without a check passes unconditionally).
pub(crate) async fn can_post_via_rules(
    directory: &dyn Directory,
    privileges: &PrivilegeQuery,
    acting: &ActingUser,
    audience_type: &str,
    code: &str,
    course_code: Option<&str>,
) -> Result<bool, AudienceError> {
    if directory.is_site_admin(&acting.username).await? {
        return Ok(true);
    }

    for rule in privileges.matching_rules(audience_type, code).await? {
        match rule.check_type {
            None => return Ok(true),
            Some(check_type) => {
                if evaluate_check(directory, acting, check_type, &rule.check_value, course_code)
                    .await
                {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Same gate over every pattern of the type: used for "may post to this
/// audience type at all" questions.
pub(crate) async fn can_post_to_type_via_rules(
    directory: &dyn Directory,
    privileges: &PrivilegeQuery,
    acting: &ActingUser,
    audience_type: &str,
) -> Result<bool, AudienceError> {
    if directory.is_site_admin(&acting.username).await? {
        return Ok(true);
    }

    for rule in privileges.rules_for_type(audience_type).await? {
        match rule.check_type {
            None => return Ok(true),
            Some(check_type) => {
                if evaluate_check(directory, acting, check_type, &rule.check_value, None).await {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Holds one provider per name. Built once at process start from the fixed
/// variant list, immutable and shared via `Arc` afterwards. Resolving an
/// unknown name yields `None`, never an error - callers treat an absent
/// provider as "this selection resolves to the empty set".
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn AudienceProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register one provider under its name. Construction-time only; the
    /// registry is read-only once shared.
    pub fn register(&mut self, provider: Arc<dyn AudienceProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AudienceProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn all(&self) -> &HashMap<String, Arc<dyn AudienceProvider>> {
        &self.providers
    }

    /// The standard registry: all five variants wired to the given directory
    /// and privilege table. `new_cyclic` lets the combination provider
    /// delegate back through the registry it lives in.
    pub fn standard(
        directory: Arc<dyn Directory>,
        privileges: Arc<PrivilegeQuery>,
    ) -> Arc<Self> {
        use crate::core::audience::combination_provider::CombinationProvider;
        use crate::core::audience::course_provider::CourseProvider;
        use crate::core::audience::group_provider::GroupProvider;
        use crate::core::audience::profile_provider::ProfileFieldProvider;
        use crate::core::audience::user_provider::UserProvider;

        Arc::new_cyclic(|registry| {
            let mut this = Self::new();
            this.register(Arc::new(CourseProvider::new(
                Arc::clone(&directory),
                Arc::clone(&privileges),
            )));
            this.register(Arc::new(GroupProvider::new(
                Arc::clone(&directory),
                Arc::clone(&privileges),
            )));
            this.register(Arc::new(ProfileFieldProvider::new(
                Arc::clone(&directory),
                Arc::clone(&privileges),
            )));
            this.register(Arc::new(UserProvider::new(
                Arc::clone(&directory),
                Arc::clone(&privileges),
            )));
            this.register(Arc::new(CombinationProvider::new(registry.clone())));
            this
        })
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
