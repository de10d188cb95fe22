// Combination audience: a pure delegator. Composite codes of the form
//
//     provider|[scope=]code|name|[groupby]|[roles]
//
// are parsed, the target provider is resolved through the registry, and every
// call is forwarded after substitution. No state beyond the parsing.

use crate::core::audience::provider::{AudienceProvider, ProviderRegistry, RelatedCode};
use crate::core::audience::tags::{AudienceError, Role};
use crate::core::directory::ActingUser;
use crate::core::moderation::privilege::CheckType;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

pub const COMBINATION_PROVIDER: &str = "combination";

/// A parsed composite code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinationCode {
    pub provider: String,
    pub scope: Option<String>,
    pub code: String,
    pub name: String,
    pub group_by: Option<String>,
    /// Roles embedded in the composite code; when present they replace the
    /// selection's role filter for the delegated call.
    pub roles: Vec<Role>,
}

/// Parse `provider|[scope=]code|name|[groupby]|[roles]`. The first three
/// segments are mandatory; `roles` is a comma-separated role-code list.
pub fn parse_combination_code(composite: &str) -> Result<CombinationCode, AudienceError> {
    let parts: Vec<&str> = composite.split('|').collect();
    if parts.len() < 3 || parts.len() > 5 {
        return Err(AudienceError::InvalidExpression(format!(
            "malformed combination code '{composite}'"
        )));
    }
    if parts[0].is_empty() || parts[1].is_empty() {
        return Err(AudienceError::InvalidExpression(format!(
            "malformed combination code '{composite}'"
        )));
    }

    let (scope, code) = match parts[1].split_once('=') {
        Some((scope, code)) if !scope.is_empty() && !code.is_empty() => {
            (Some(scope.to_string()), code.to_string())
        }
        _ => (None, parts[1].to_string()),
    };

    let group_by = parts
        .get(3)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let roles = parts
        .get(4)
        .map(|s| {
            s.split(',')
                .filter(|code| !code.is_empty())
                .map(|code| Role::new(code, code))
                .collect()
        })
        .unwrap_or_default();

    Ok(CombinationCode {
        provider: parts[0].to_string(),
        scope,
        code,
        name: parts[2].to_string(),
        group_by,
        roles,
    })
}

pub struct CombinationProvider {
    // Weak because the registry owns this provider; `ProviderRegistry::standard`
    // wires the cycle with `Arc::new_cyclic`.
    registry: Weak<ProviderRegistry>,
}

impl CombinationProvider {
    pub fn new(registry: Weak<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// Parse the composite and resolve its target. A dangling or renamed
    /// target provider is not an error; the caller degrades to the empty set.
    fn target(
        &self,
        composite: &str,
    ) -> Result<Option<(Arc<dyn AudienceProvider>, CombinationCode)>, AudienceError> {
        let parsed = parse_combination_code(composite)?;
        let Some(registry) = self.registry.upgrade() else {
            return Ok(None);
        };
        match registry.get(&parsed.provider) {
            Some(provider) => Ok(Some((provider, parsed))),
            None => {
                tracing::warn!(provider = %parsed.provider, "combination code names an unknown provider");
                Ok(None)
            }
        }
    }

    fn primary_type(provider: &dyn AudienceProvider) -> String {
        provider
            .audience_types()
            .into_iter()
            .next()
            .unwrap_or_default()
    }
}

#[async_trait]
impl AudienceProvider for CombinationProvider {
    fn name(&self) -> &str {
        COMBINATION_PROVIDER
    }

    fn audience_types(&self) -> Vec<String> {
        vec![COMBINATION_PROVIDER.to_string()]
    }

    async fn related_codes(&self, code: &str) -> Result<Vec<RelatedCode>, AudienceError> {
        match self.target(code)? {
            Some((provider, parsed)) => provider.related_codes(&parsed.code).await,
            None => Ok(Vec::new()),
        }
    }

    async fn usernames(
        &self,
        code: &str,
        _audience_type: &str,
        roles: &[Role],
    ) -> Result<HashSet<String>, AudienceError> {
        match self.target(code)? {
            Some((provider, parsed)) => {
                let audience_type = Self::primary_type(provider.as_ref());
                let effective_roles = if parsed.roles.is_empty() {
                    roles
                } else {
                    &parsed.roles
                };
                provider
                    .usernames(&parsed.code, &audience_type, effective_roles)
                    .await
            }
            None => Ok(HashSet::new()),
        }
    }

    async fn can_post_to(
        &self,
        acting: &ActingUser,
        _audience_type: &str,
        code: &str,
    ) -> Result<bool, AudienceError> {
        match self.target(code)? {
            Some((provider, parsed)) => {
                let audience_type = Self::primary_type(provider.as_ref());
                provider.can_post_to(acting, &audience_type, &parsed.code).await
            }
            None => Ok(false),
        }
    }

    async fn can_post_to_type(
        &self,
        acting: &ActingUser,
        _audience_type: &str,
    ) -> Result<bool, AudienceError> {
        // A combination can target any provider, so the type is postable as
        // soon as any delegate type is.
        let Some(registry) = self.registry.upgrade() else {
            return Ok(false);
        };
        for (name, provider) in registry.all() {
            if name == COMBINATION_PROVIDER {
                continue;
            }
            let audience_type = Self::primary_type(provider.as_ref());
            if provider.can_post_to_type(acting, &audience_type).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn check_privilege(
        &self,
        acting: &ActingUser,
        check_type: CheckType,
        check_value: &str,
        code: &str,
    ) -> bool {
        match self.target(code) {
            Ok(Some((provider, parsed))) => {
                provider
                    .check_privilege(acting, check_type, check_value, &parsed.code)
                    .await
            }
            // Fails closed, like every other check path.
            Ok(None) | Err(_) => false,
        }
    }

    fn true_code(&self, code: &str) -> String {
        parse_combination_code(code)
            .map(|parsed| parsed.code)
            .unwrap_or_else(|_| code.to_string())
    }
}
