// Moderation resolver - evaluates a tag list against the privilege table and
// produces the verdict the save workflow stores.
//
// Union and intersection tags aggregate differently: a union item keeps its
// highest-priority candidate, an intersection keeps the lowest across its
// members. That asymmetry matches the observed behavior of the rule table and
// is kept as-is pending product confirmation.

use crate::core::audience::provider::{AudienceProvider, ProviderRegistry};
use crate::core::audience::tags::{Role, Tag, TagKind};
use crate::core::directory::{ActingUser, Directory, DirectoryError};
use crate::core::moderation::privilege::{ModerationError, PrivilegeQuery, NO_THRESHOLD};
use std::collections::HashMap;
use std::sync::Arc;

/// Capability that exempts a user from moderation entirely.
pub const UNMODERATED_CAPABILITY: &str = "announce:unmoderated";

impl From<DirectoryError> for ModerationError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::StorageError(msg) => ModerationError::StorageError(msg),
        }
    }
}

/// The outcome stored as a snapshot on the post. `auto_approve` means the
/// verdict is immediately satisfied even though `required` stays true for
/// audit purposes. `moderator_missing` flags a rule whose configured
/// moderator account does not exist - a data-integrity problem the caller
/// must surface, never silently drop.
#[derive(Debug, Clone, PartialEq)]
pub struct ModerationVerdict {
    pub required: bool,
    pub moderator: Option<String>,
    pub priority: i32,
    pub threshold: i32,
    pub privilege_id: Option<i64>,
    pub description: String,
    pub auto_approve: bool,
    pub moderator_missing: bool,
}

impl ModerationVerdict {
    pub fn not_required() -> Self {
        Self {
            required: false,
            moderator: None,
            priority: 0,
            threshold: NO_THRESHOLD,
            privilege_id: None,
            description: String::new(),
            auto_approve: false,
            moderator_missing: false,
        }
    }
}

/// One rule that survived filtering for one audience item.
#[derive(Debug, Clone, PartialEq)]
struct MatchCandidate {
    privilege_id: i64,
    priority: i32,
    threshold: i32,
    moderator: Option<String>,
    description: String,
}

/// Per-item outcome. `explicitly_clear` means a matching rule said "no
/// moderation" and the item (or its whole intersection tag) contributes
/// nothing; an item with no candidates at all is merely silent.
#[derive(Debug, Default)]
struct ItemModeration {
    explicitly_clear: bool,
    candidates: Vec<MatchCandidate>,
}

pub struct ModerationResolver {
    registry: Arc<ProviderRegistry>,
    privileges: Arc<PrivilegeQuery>,
    directory: Arc<dyn Directory>,
}

impl ModerationResolver {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        privileges: Arc<PrivilegeQuery>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            registry,
            privileges,
            directory,
        }
    }

    pub async fn resolve_moderation(
        &self,
        tags: &[Tag],
        acting: &ActingUser,
    ) -> Result<ModerationVerdict, ModerationError> {
        // Unmoderated announcers and site admins skip rule evaluation
        // entirely.
        if self
            .directory
            .has_capability(&acting.username, UNMODERATED_CAPABILITY)
            .await?
            || self.directory.is_site_admin(&acting.username).await?
        {
            tracing::debug!(username = %acting.username, "moderation bypassed by capability");
            return Ok(ModerationVerdict::not_required());
        }

        let mut matches: Vec<MatchCandidate> = Vec::new();

        for tag in tags {
            match tag.kind {
                TagKind::Union => {
                    let Some(selection) = tag.audiences.first() else {
                        continue;
                    };
                    let Some(provider) = self.registry.get(&selection.provider) else {
                        continue;
                    };
                    for item in &selection.selected_items {
                        let outcome = self
                            .item_moderation(
                                &provider,
                                &selection.audience_type,
                                &item.code,
                                &selection.selected_roles,
                                TagKind::Union,
                                acting,
                            )
                            .await?;
                        if !outcome.explicitly_clear {
                            matches.extend(outcome.candidates);
                        }
                    }
                }
                TagKind::Intersection => {
                    let mut tag_candidates: Vec<MatchCandidate> = Vec::new();
                    let mut cleared = false;

                    for selection in &tag.audiences {
                        let Some(item) = selection.selected_items.first() else {
                            continue;
                        };
                        let Some(provider) = self.registry.get(&selection.provider) else {
                            continue;
                        };
                        let outcome = self
                            .item_moderation(
                                &provider,
                                &selection.audience_type,
                                &item.code,
                                &selection.selected_roles,
                                TagKind::Intersection,
                                acting,
                            )
                            .await?;
                        if outcome.explicitly_clear {
                            // Moderation is only as strict as the weakest
                            // intersected audience.
                            cleared = true;
                            break;
                        }
                        tag_candidates.extend(outcome.candidates);
                    }

                    if !cleared {
                        // Lowest priority across the tag's members; equal
                        // priorities resolve to the lower privilege id so the
                        // pick is stable.
                        if let Some(weakest) = tag_candidates
                            .into_iter()
                            .min_by_key(|c| (c.priority, c.privilege_id))
                        {
                            matches.push(weakest);
                        }
                    }
                }
            }
        }

        // Thresholded privileges only count once enough items matched them.
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for candidate in &matches {
            *counts.entry(candidate.privilege_id).or_default() += 1;
        }
        matches.retain(|candidate| {
            candidate.threshold <= 0
                || counts[&candidate.privilege_id] >= candidate.threshold as usize
        });

        // Highest priority wins; equal priorities resolve to the higher
        // privilege id (deterministic replacement for the original
        // order-dependent scan).
        let Some(winner) = matches
            .into_iter()
            .max_by_key(|c| (c.priority, c.privilege_id))
        else {
            return Ok(ModerationVerdict::not_required());
        };

        let mut verdict = ModerationVerdict {
            required: true,
            moderator: winner.moderator.clone(),
            priority: winner.priority,
            threshold: winner.threshold,
            privilege_id: Some(winner.privilege_id),
            description: winner.description,
            auto_approve: false,
            moderator_missing: false,
        };

        match winner.moderator.as_deref() {
            Some(moderator) if self.directory.user_exists(moderator).await? => {
                let assistants = self.directory.moderation_assistants(moderator).await?;
                if acting.username == moderator || assistants.contains(&acting.username) {
                    verdict.auto_approve = true;
                }
            }
            Some(moderator) => {
                tracing::warn!(
                    privilege_id = winner.privilege_id,
                    moderator,
                    "moderation rule names a moderator account that does not exist"
                );
                verdict.moderator_missing = true;
            }
            None => {
                tracing::warn!(
                    privilege_id = winner.privilege_id,
                    "moderation rule requires moderation but names no moderator"
                );
                verdict.moderator_missing = true;
            }
        }

        Ok(verdict)
    }

    /// Arbitrate the rules for one audience item. Rules arrive ordered by
    /// `check_order`; role, tag-kind and privilege-check filters drop rules
    /// before any of them decide anything.
    async fn item_moderation(
        &self,
        provider: &Arc<dyn AudienceProvider>,
        audience_type: &str,
        code: &str,
        roles: &[Role],
        kind: TagKind,
        acting: &ActingUser,
    ) -> Result<ItemModeration, ModerationError> {
        let rules = self.privileges.matching_rules(audience_type, code).await?;

        let mut primary: Option<MatchCandidate> = None;
        let mut thresholds: Vec<MatchCandidate> = Vec::new();

        for rule in rules {
            if let Some(required_role) = &rule.role {
                if !roles.iter().any(|role| role.code == *required_role) {
                    continue;
                }
            }
            if let Some(condition) = rule.condition {
                if condition != kind {
                    continue;
                }
            }
            if let Some(check_type) = rule.check_type {
                if !provider
                    .check_privilege(acting, check_type, &rule.check_value, code)
                    .await
                {
                    continue;
                }
            }

            // First surviving "no moderation" rule clears the item outright,
            // discarding any candidates collected so far.
            if !rule.mod_required {
                return Ok(ItemModeration {
                    explicitly_clear: true,
                    candidates: Vec::new(),
                });
            }

            let candidate = MatchCandidate {
                privilege_id: rule.id,
                priority: rule.mod_priority,
                threshold: rule.mod_threshold,
                moderator: rule.mod_username.clone(),
                description: rule.description.clone(),
            };

            if rule.mod_threshold > 0 {
                // Threshold candidates stay separate from the primary pick.
                thresholds.push(candidate);
            } else {
                match &primary {
                    Some(current) if current.priority >= candidate.priority => {}
                    _ => primary = Some(candidate),
                }
            }
        }

        let mut candidates: Vec<MatchCandidate> = primary.into_iter().collect();
        candidates.extend(thresholds);
        Ok(ItemModeration {
            explicitly_clear: false,
            candidates,
        })
    }
}
