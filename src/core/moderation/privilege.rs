// Privilege rule table - ordered, pattern-matched moderation configuration.
//
// Rules are long-lived configuration mutated only by administrators. The
// query layer here filters and orders them; arbitration lives in resolver.rs.

use crate::core::audience::tags::TagKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("Storage error: {0}")]
    StorageError(String),
}

/// `mod_threshold` value meaning "no threshold".
pub const NO_THRESHOLD: i32 = -1;

/// The atomic privilege checks a rule may carry. Evaluation is delegated to
/// the audience provider that owns the rule's audience type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Acting user holds a site-wide capability named by `check_value`.
    UserCapability,
    /// Acting user holds a capability in the course the runtime code names.
    CourseCapability,
    /// Acting user's username matches the `check_value` pattern.
    Username,
    /// Acting user's profile field matches; `check_value` is `field=value`.
    ProfileField,
    /// Acting user's username does NOT match the `check_value` pattern.
    Exclude,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::UserCapability => "usercapability",
            CheckType::CourseCapability => "coursecapability",
            CheckType::Username => "username",
            CheckType::ProfileField => "profilefield",
            CheckType::Exclude => "exclude",
        }
    }
}

impl std::str::FromStr for CheckType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "usercapability" => Ok(CheckType::UserCapability),
            "coursecapability" => Ok(CheckType::CourseCapability),
            "username" => Ok(CheckType::Username),
            "profilefield" => Ok(CheckType::ProfileField),
            "exclude" => Ok(CheckType::Exclude),
            _ => Err(()),
        }
    }
}

/// One row of the privilege table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivilegeRule {
    pub id: i64,
    pub audience_type: String,
    /// Glob pattern the runtime code must satisfy. The pattern lives on the
    /// rule, never on the query; reversing that direction would silently
    /// change authorization semantics.
    pub code_pattern: String,
    /// When set, the rule only applies if this role code is among the
    /// selection's roles.
    pub role: Option<String>,
    /// When set, the rule only applies to tags of this kind.
    pub condition: Option<TagKind>,
    pub check_type: Option<CheckType>,
    pub check_value: String,
    pub check_order: i32,
    pub mod_required: bool,
    pub mod_priority: i32,
    /// Minimum number of matching audience items before this rule counts;
    /// `NO_THRESHOLD` disables thresholding.
    pub mod_threshold: i32,
    pub mod_username: Option<String>,
    pub description: String,
    pub active: bool,
}

/// Does `code` satisfy the stored `pattern`? `*` matches any run of
/// characters; comparison is case-insensitive, mirroring the SQL LIKE the
/// original rule table was queried with.
pub fn code_matches(pattern: &str, code: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let code: Vec<char> = code.to_lowercase().chars().collect();

    // Two-pointer glob match with single-level backtracking to the last star.
    let (mut p, mut c) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_c = 0usize;

    while c < code.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_c = c;
            p += 1;
        } else if p < pattern.len() && pattern[p] == code[c] {
            p += 1;
            c += 1;
        } else if let Some(s) = star {
            star_c += 1;
            p = s + 1;
            c = star_c;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

/// Storage port for the privilege table. The store returns every rule for an
/// audience type; pattern matching and ordering happen in `PrivilegeQuery`.
#[async_trait]
pub trait PrivilegeStore: Send + Sync {
    async fn rules_for_type(&self, audience_type: &str) -> Result<Vec<PrivilegeRule>, ModerationError>;
}

/// Rules that matched one literal pattern, with the candidate codes that
/// satisfied it (batch form only).
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern: String,
    pub rules: Vec<PrivilegeRule>,
    pub codes: Vec<String>,
}

/// Query layer over the privilege table.
pub struct PrivilegeQuery {
    store: Arc<dyn PrivilegeStore>,
}

impl PrivilegeQuery {
    pub fn new(store: Arc<dyn PrivilegeStore>) -> Self {
        Self { store }
    }

    /// Active rules for an audience type regardless of pattern, ordered by
    /// `check_order`.
    pub async fn rules_for_type(
        &self,
        audience_type: &str,
    ) -> Result<Vec<PrivilegeRule>, ModerationError> {
        let mut rules = self.store.rules_for_type(audience_type).await?;
        rules.retain(|rule| rule.active);
        rules.sort_by_key(|rule| (rule.check_order, rule.id));
        Ok(rules)
    }

    /// Active rules whose pattern matches `code`, ordered by `check_order`.
    pub async fn matching_rules(
        &self,
        audience_type: &str,
        code: &str,
    ) -> Result<Vec<PrivilegeRule>, ModerationError> {
        let mut rules = self.rules_for_type(audience_type).await?;
        rules.retain(|rule| code_matches(&rule.code_pattern, code));
        Ok(rules)
    }

    /// Batch form: match many candidate codes at once and group the results
    /// by the literal pattern they matched, since one pattern may match many
    /// candidates. Used when filtering a provider's full candidate list down
    /// to what the acting user may post to.
    pub async fn matching_rules_batch(
        &self,
        audience_type: &str,
        codes: &[String],
    ) -> Result<Vec<PatternMatch>, ModerationError> {
        let rules = self.rules_for_type(audience_type).await?;

        let mut by_pattern: HashMap<String, Vec<PrivilegeRule>> = HashMap::new();
        for rule in rules {
            by_pattern
                .entry(rule.code_pattern.clone())
                .or_default()
                .push(rule);
        }

        let mut groups: Vec<PatternMatch> = Vec::new();
        for (pattern, rules) in by_pattern {
            let matched: Vec<String> = codes
                .iter()
                .filter(|code| code_matches(&pattern, code))
                .cloned()
                .collect();
            if !matched.is_empty() {
                groups.push(PatternMatch {
                    pattern,
                    rules,
                    codes: matched,
                });
            }
        }
        groups.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        Ok(groups)
    }
}

/// One CC-expansion row: every post matching the pattern also copies in the
/// members of these groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CcExpansion {
    pub audience_type: String,
    pub code_pattern: String,
    pub group_ids: Vec<String>,
}

/// Storage port for the CC-expansion table.
#[async_trait]
pub trait CcExpansionStore: Send + Sync {
    async fn expansions(&self, audience_type: &str) -> Result<Vec<CcExpansion>, ModerationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: i64, pattern: &str, order: i32) -> PrivilegeRule {
        PrivilegeRule {
            id,
            audience_type: "course".to_string(),
            code_pattern: pattern.to_string(),
            role: None,
            condition: None,
            check_type: None,
            check_value: String::new(),
            check_order: order,
            mod_required: true,
            mod_priority: 1,
            mod_threshold: NO_THRESHOLD,
            mod_username: Some("mod1".to_string()),
            description: String::new(),
            active: true,
        }
    }

    struct FixedStore(Vec<PrivilegeRule>);

    #[async_trait]
    impl PrivilegeStore for FixedStore {
        async fn rules_for_type(
            &self,
            audience_type: &str,
        ) -> Result<Vec<PrivilegeRule>, ModerationError> {
            Ok(self
                .0
                .iter()
                .filter(|r| r.audience_type == audience_type)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn glob_star_matches_any_run() {
        assert!(code_matches("*", "anything"));
        assert!(code_matches("H8*", "H810"));
        assert!(code_matches("H8*", "H8"));
        assert!(code_matches("*-2024", "H810-2024"));
        assert!(code_matches("H*0", "H810"));
        assert!(!code_matches("H8*", "M810"));
    }

    #[test]
    fn glob_is_case_insensitive() {
        assert!(code_matches("h810", "H810"));
        assert!(code_matches("H8*", "h810"));
    }

    #[test]
    fn glob_direction_is_rule_side() {
        // The pattern lives on the rule. A starred runtime code must not
        // match a literal pattern.
        assert!(!code_matches("H810", "H8*"));
    }

    #[test]
    fn glob_literal_requires_full_match() {
        assert!(code_matches("H810", "H810"));
        assert!(!code_matches("H810", "H810-2024"));
        assert!(!code_matches("H810", "H81"));
    }

    #[tokio::test]
    async fn matching_rules_filters_and_orders() {
        let store = FixedStore(vec![
            rule(1, "H8*", 20),
            rule(2, "*", 10),
            rule(3, "M*", 5),
            {
                let mut r = rule(4, "H810", 1);
                r.active = false;
                r
            },
        ]);
        let query = PrivilegeQuery::new(Arc::new(store));

        let rules = query.matching_rules("course", "H810").await.unwrap();
        let ids: Vec<i64> = rules.iter().map(|r| r.id).collect();
        // Inactive rule 4 dropped, rule 3 does not match, ordered by check_order.
        assert_eq!(ids, vec![2, 1]);
    }

    #[tokio::test]
    async fn batch_groups_by_literal_pattern() {
        let store = FixedStore(vec![rule(1, "H8*", 1), rule(2, "H8*", 2), rule(3, "M*", 3)]);
        let query = PrivilegeQuery::new(Arc::new(store));

        let codes = vec![
            "H810".to_string(),
            "H817".to_string(),
            "M303".to_string(),
            "ZZ1".to_string(),
        ];
        let groups = query.matching_rules_batch("course", &codes).await.unwrap();

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].pattern, "H8*");
        assert_eq!(groups[0].codes, vec!["H810", "H817"]);
        assert_eq!(groups[0].rules.len(), 2);
        assert_eq!(groups[1].pattern, "M*");
        assert_eq!(groups[1].codes, vec!["M303"]);
    }
}
