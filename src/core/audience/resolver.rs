// Audience resolver - evaluates a tag list into a deduplicated recipient set
// plus the relevance map (which condition each recipient personally matched).
//
// Resolution never aborts on a single bad audience: an unknown provider or an
// empty per-item result just contributes nothing.

use crate::core::audience::provider::ProviderRegistry;
use crate::core::audience::tags::{AudienceError, AudienceSelection, Item, Role, Tag, TagKind};
use crate::core::directory::{ActingUser, Directory};
use crate::core::moderation::privilege::{code_matches, CcExpansionStore};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One audience reference inside a condition. A union condition has exactly
/// one part; an intersection condition carries one part per member audience.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionPart {
    pub provider: String,
    pub audience_type: String,
    pub code: String,
    pub name: String,
    pub roles: Vec<Role>,
}

/// One persisted audience-condition record: per resolved item in a Union tag,
/// per whole tag in an Intersection tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceCondition {
    pub kind: TagKind,
    pub tag_uid: String,
    pub parts: Vec<ConditionPart>,
}

/// The output of resolving a tag list. Relevance values index into
/// `conditions`; persistence maps the indexes to row ids. Recipients present
/// only through a catch-all (author, CC expansion) have no relevance entry
/// and consumers must show them every condition.
#[derive(Debug, Clone, Default)]
pub struct ResolvedAudience {
    pub recipients: HashSet<String>,
    pub conditions: Vec<AudienceCondition>,
    pub relevance: HashMap<String, Vec<usize>>,
}

pub struct AudienceResolver {
    registry: Arc<ProviderRegistry>,
    cc_expansions: Arc<dyn CcExpansionStore>,
    directory: Arc<dyn Directory>,
}

impl AudienceResolver {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        cc_expansions: Arc<dyn CcExpansionStore>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            registry,
            cc_expansions,
            directory,
        }
    }

    /// Recipients for one selected item of one audience. Unknown providers
    /// resolve to the empty set, never an error. Also serves the
    /// "who will receive this" preview tooling.
    pub async fn usernames_for_audience(
        &self,
        selection: &AudienceSelection,
        item: &Item,
    ) -> Result<HashSet<String>, AudienceError> {
        let Some(provider) = self.registry.get(&selection.provider) else {
            tracing::warn!(
                provider = %selection.provider,
                "audience names an unregistered provider; resolving to nobody"
            );
            return Ok(HashSet::new());
        };
        provider
            .usernames(&item.code, &selection.audience_type, &selection.selected_roles)
            .await
    }

    /// Evaluate a validated tag list. Tags combine by OR; the acting author
    /// and CC-expansion group members are always included, with no relevance
    /// entries.
    pub async fn resolve(
        &self,
        tags: &[Tag],
        acting: &ActingUser,
    ) -> Result<ResolvedAudience, AudienceError> {
        let mut resolved = ResolvedAudience::default();

        for tag in tags {
            match tag.kind {
                TagKind::Union => self.resolve_union(tag, &mut resolved).await?,
                TagKind::Intersection => self.resolve_intersection(tag, &mut resolved).await?,
            }
        }

        tracing::debug!(
            tags = tags.len(),
            recipients = resolved.recipients.len(),
            conditions = resolved.conditions.len(),
            "tag expression resolved"
        );

        // Catch-alls come last so they never gain relevance entries recorded
        // during tag resolution... unless a tag also reached them directly,
        // which is exactly the intended behavior.
        resolved.recipients.insert(acting.username.clone());
        self.apply_cc_expansion(&mut resolved).await?;

        Ok(resolved)
    }

    /// Union: one condition per item; the tag contributes the union of the
    /// per-item results.
    async fn resolve_union(
        &self,
        tag: &Tag,
        resolved: &mut ResolvedAudience,
    ) -> Result<(), AudienceError> {
        let Some(selection) = tag.audiences.first() else {
            return Ok(());
        };

        for item in &selection.selected_items {
            let users = self.usernames_for_audience(selection, item).await?;

            let condition_idx = resolved.conditions.len();
            resolved.conditions.push(AudienceCondition {
                kind: TagKind::Union,
                tag_uid: tag.uid.clone(),
                parts: vec![condition_part(selection, item)],
            });

            for user in users {
                resolved
                    .relevance
                    .entry(user.clone())
                    .or_default()
                    .push(condition_idx);
                resolved.recipients.insert(user);
            }
        }
        Ok(())
    }

    /// Intersection: one condition for the whole tag; the tag contributes the
    /// intersection of all member results. Disjoint members yield an empty
    /// contribution, not an error.
    async fn resolve_intersection(
        &self,
        tag: &Tag,
        resolved: &mut ResolvedAudience,
    ) -> Result<(), AudienceError> {
        let mut survivors: Option<HashSet<String>> = None;
        let mut parts = Vec::with_capacity(tag.audiences.len());

        for selection in &tag.audiences {
            let Some(item) = selection.selected_items.first() else {
                continue;
            };
            parts.push(condition_part(selection, item));

            let users = self.usernames_for_audience(selection, item).await?;
            survivors = Some(match survivors {
                None => users,
                Some(current) => current.intersection(&users).cloned().collect(),
            });
        }

        let condition_idx = resolved.conditions.len();
        resolved.conditions.push(AudienceCondition {
            kind: TagKind::Intersection,
            tag_uid: tag.uid.clone(),
            parts,
        });

        for user in survivors.unwrap_or_default() {
            resolved
                .relevance
                .entry(user.clone())
                .or_default()
                .push(condition_idx);
            resolved.recipients.insert(user);
        }
        Ok(())
    }

    /// Copy in the members of every CC group configured for an audience type
    /// and code pattern one of the conditions matched.
    async fn apply_cc_expansion(
        &self,
        resolved: &mut ResolvedAudience,
    ) -> Result<(), AudienceError> {
        let mut cc_groups: HashSet<String> = HashSet::new();

        for condition in &resolved.conditions {
            for part in &condition.parts {
                for expansion in self.cc_expansions.expansions(&part.audience_type).await? {
                    if code_matches(&expansion.code_pattern, &part.code) {
                        cc_groups.extend(expansion.group_ids.iter().cloned());
                    }
                }
            }
        }

        for group_id in cc_groups {
            let members = self.directory.group_users(&group_id).await?;
            tracing::debug!(group_id = %group_id, members = members.len(), "CC expansion applied");
            resolved.recipients.extend(members);
        }
        Ok(())
    }
}

fn condition_part(selection: &AudienceSelection, item: &Item) -> ConditionPart {
    ConditionPart {
        provider: selection.provider.clone(),
        audience_type: selection.audience_type.clone(),
        code: item.code.clone(),
        name: item.name.clone(),
        roles: selection.selected_roles.clone(),
    }
}
