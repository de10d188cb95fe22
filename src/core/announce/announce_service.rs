// Announce workflow - the save/preview path around the two resolvers.
//
// Saving a post is validate -> resolve audience -> atomically replace the
// persisted condition/relevance rows -> resolve moderation -> record the
// verdict. Editing an already-saved post runs the whole thing again from
// scratch against fresh rows; there is no partial update.

use crate::core::audience::provider::ProviderRegistry;
use crate::core::audience::resolver::{AudienceCondition, AudienceResolver, ResolvedAudience};
use crate::core::audience::tags::{parse_tags, validate, AudienceError};
use crate::core::directory::ActingUser;
use crate::core::moderation::privilege::ModerationError;
use crate::core::moderation::resolver::{ModerationResolver, ModerationVerdict};
use crate::core::moderation::status::{ModerationRecord, ModerationStatus};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnnounceError {
    #[error("Invalid audience expression: {0}")]
    InvalidExpression(String),

    /// The expression produced no reachable audience. The author and CC
    /// groups do not count; somebody must match the tags themselves.
    #[error("The audience expression resolves to no recipients")]
    EmptyAudience,

    #[error("Moderation record {0} not found")]
    RecordNotFound(i64),

    #[error("Cannot move moderation record from {0} to {1}")]
    InvalidTransition(ModerationStatus, ModerationStatus),

    #[error("Storage error: {0}")]
    StorageError(String),
}

impl From<AudienceError> for AnnounceError {
    fn from(err: AudienceError) -> Self {
        match err {
            AudienceError::InvalidExpression(msg) => AnnounceError::InvalidExpression(msg),
            AudienceError::StorageError(msg) => AnnounceError::StorageError(msg),
        }
    }
}

impl From<ModerationError> for AnnounceError {
    fn from(err: ModerationError) -> Self {
        match err {
            ModerationError::StorageError(msg) => AnnounceError::StorageError(msg),
        }
    }
}

/// A persisted condition row with its storage id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCondition {
    pub id: i64,
    pub condition: AudienceCondition,
}

/// A post's persisted audience, reloaded for display. Relevance values are
/// condition row ids; recipients without an entry see every condition.
#[derive(Debug, Clone, Default)]
pub struct StoredAudience {
    pub recipients: HashSet<String>,
    pub conditions: Vec<StoredCondition>,
    pub relevance: HashMap<String, Vec<i64>>,
}

/// Storage port for a post's resolved audience. `replace_audience` must be
/// atomic per post: the prior rows are deleted and the new set inserted as
/// one logical unit.
#[async_trait]
pub trait ConditionStore: Send + Sync {
    async fn replace_audience(
        &self,
        post_id: i64,
        resolved: &ResolvedAudience,
    ) -> Result<(), AnnounceError>;

    async fn load_audience(&self, post_id: i64) -> Result<Option<StoredAudience>, AnnounceError>;
}

/// Storage port for the moderation history. Moderator actions only ever
/// update a record's status; resolution is never re-run on their behalf.
#[async_trait]
pub trait ModerationLog: Send + Sync {
    async fn insert_record(
        &self,
        post_id: i64,
        status: ModerationStatus,
        moderator: Option<&str>,
        privilege_id: Option<i64>,
        description: &str,
    ) -> Result<i64, AnnounceError>;

    async fn deactivate_records(&self, post_id: i64) -> Result<(), AnnounceError>;

    async fn get_record(&self, record_id: i64) -> Result<Option<ModerationRecord>, AnnounceError>;

    async fn active_record(&self, post_id: i64) -> Result<Option<ModerationRecord>, AnnounceError>;

    async fn set_status(
        &self,
        record_id: i64,
        status: ModerationStatus,
        decided_by: &str,
    ) -> Result<(), AnnounceError>;
}

/// Result of saving a post.
#[derive(Debug)]
pub struct SavedPost {
    pub post_id: i64,
    pub record_id: i64,
    pub status: ModerationStatus,
    pub recipients: HashSet<String>,
    pub verdict: ModerationVerdict,
}

/// Result of the "who will receive this" preview. Nothing is persisted.
#[derive(Debug)]
pub struct AudiencePreview {
    pub recipients: HashSet<String>,
    pub conditions: Vec<AudienceCondition>,
    pub verdict: ModerationVerdict,
}

pub struct AnnounceService<C: ConditionStore, M: ModerationLog> {
    registry: Arc<ProviderRegistry>,
    audience: AudienceResolver,
    moderation: ModerationResolver,
    conditions: C,
    log: M,
}

impl<C: ConditionStore, M: ModerationLog> AnnounceService<C, M> {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        audience: AudienceResolver,
        moderation: ModerationResolver,
        conditions: C,
        log: M,
    ) -> Self {
        Self {
            registry,
            audience,
            moderation,
            conditions,
            log,
        }
    }

    /// Save (or re-save) a post's audience expression. Validation failures
    /// reject before anything is written; an expression nobody matches is
    /// refused rather than finalized.
    pub async fn save_post(
        &self,
        post_id: i64,
        author: &ActingUser,
        tags_json: &str,
    ) -> Result<SavedPost, AnnounceError> {
        let tags = parse_tags(tags_json)?;
        validate(&tags, author, &self.registry).await?;

        let resolved = self.audience.resolve(&tags, author).await?;
        // The relevance map only holds recipients the tags themselves
        // reached; author/CC catch-alls do not make an audience.
        if resolved.relevance.is_empty() {
            return Err(AnnounceError::EmptyAudience);
        }

        self.conditions.replace_audience(post_id, &resolved).await?;

        let verdict = self.moderation.resolve_moderation(&tags, author).await?;
        let status = if !verdict.required {
            ModerationStatus::None
        } else if verdict.auto_approve {
            // Auto-approval never visits the human-pending state.
            ModerationStatus::Approved
        } else {
            ModerationStatus::Pending
        };

        self.log.deactivate_records(post_id).await?;
        let record_id = self
            .log
            .insert_record(
                post_id,
                status,
                verdict.moderator.as_deref(),
                verdict.privilege_id,
                &verdict.description,
            )
            .await?;

        tracing::info!(
            post_id,
            recipients = resolved.recipients.len(),
            status = %status,
            moderator = verdict.moderator.as_deref().unwrap_or("-"),
            "announcement saved"
        );

        Ok(SavedPost {
            post_id,
            record_id,
            status,
            recipients: resolved.recipients,
            verdict,
        })
    }

    /// Validate and resolve without persisting anything.
    pub async fn preview(
        &self,
        author: &ActingUser,
        tags_json: &str,
    ) -> Result<AudiencePreview, AnnounceError> {
        let tags = parse_tags(tags_json)?;
        validate(&tags, author, &self.registry).await?;

        let resolved = self.audience.resolve(&tags, author).await?;
        let verdict = self.moderation.resolve_moderation(&tags, author).await?;

        Ok(AudiencePreview {
            recipients: resolved.recipients,
            conditions: resolved.conditions,
            verdict,
        })
    }

    pub async fn load_audience(&self, post_id: i64) -> Result<Option<StoredAudience>, AnnounceError> {
        self.conditions.load_audience(post_id).await
    }

    pub async fn moderation_state(
        &self,
        post_id: i64,
    ) -> Result<Option<ModerationRecord>, AnnounceError> {
        self.log.active_record(post_id).await
    }

    pub async fn approve(&self, record_id: i64, decided_by: &str) -> Result<(), AnnounceError> {
        self.decide(record_id, ModerationStatus::Approved, decided_by).await
    }

    pub async fn reject(&self, record_id: i64, decided_by: &str) -> Result<(), AnnounceError> {
        self.decide(record_id, ModerationStatus::Rejected, decided_by).await
    }

    async fn decide(
        &self,
        record_id: i64,
        next: ModerationStatus,
        decided_by: &str,
    ) -> Result<(), AnnounceError> {
        let record = self
            .log
            .get_record(record_id)
            .await?
            .ok_or(AnnounceError::RecordNotFound(record_id))?;
        if !record.status.can_transition(next) {
            return Err(AnnounceError::InvalidTransition(record.status, next));
        }

        tracing::info!(record_id, post_id = record.post_id, status = %next, decided_by, "moderation decision");
        self.log.set_status(record_id, next, decided_by).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::privilege::{
        PrivilegeQuery, PrivilegeRule, PrivilegeStore, NO_THRESHOLD,
    };
    use crate::core::testsupport::{FakeDirectory, FixedProvider, NoCc};
    use chrono::Utc;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// In-memory condition store for testing.
    #[derive(Default)]
    struct MockConditionStore {
        audiences: DashMap<i64, StoredAudience>,
        next_id: AtomicI64,
        replace_calls: AtomicI64,
    }

    #[async_trait]
    impl ConditionStore for MockConditionStore {
        async fn replace_audience(
            &self,
            post_id: i64,
            resolved: &ResolvedAudience,
        ) -> Result<(), AnnounceError> {
            self.replace_calls.fetch_add(1, Ordering::SeqCst);

            let mut stored = StoredAudience {
                recipients: resolved.recipients.clone(),
                ..Default::default()
            };
            let mut row_ids = Vec::new();
            for condition in &resolved.conditions {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                row_ids.push(id);
                stored.conditions.push(StoredCondition {
                    id,
                    condition: condition.clone(),
                });
            }
            for (user, indexes) in &resolved.relevance {
                stored.relevance.insert(
                    user.clone(),
                    indexes.iter().map(|idx| row_ids[*idx]).collect(),
                );
            }

            // Whole-audience swap, like the SQLite transaction does.
            self.audiences.insert(post_id, stored);
            Ok(())
        }

        async fn load_audience(
            &self,
            post_id: i64,
        ) -> Result<Option<StoredAudience>, AnnounceError> {
            Ok(self.audiences.get(&post_id).map(|a| a.clone()))
        }
    }

    #[derive(Default)]
    struct MockModerationLog {
        records: DashMap<i64, ModerationRecord>,
        next_id: AtomicI64,
    }

    #[async_trait]
    impl ModerationLog for MockModerationLog {
        async fn insert_record(
            &self,
            post_id: i64,
            status: ModerationStatus,
            moderator: Option<&str>,
            privilege_id: Option<i64>,
            description: &str,
        ) -> Result<i64, AnnounceError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.records.insert(
                id,
                ModerationRecord {
                    id,
                    post_id,
                    status,
                    moderator: moderator.map(str::to_string),
                    privilege_id,
                    description: description.to_string(),
                    created: Utc::now(),
                    decided_by: None,
                    decided_at: None,
                    active: true,
                },
            );
            Ok(id)
        }

        async fn deactivate_records(&self, post_id: i64) -> Result<(), AnnounceError> {
            for mut entry in self.records.iter_mut() {
                if entry.post_id == post_id {
                    entry.active = false;
                }
            }
            Ok(())
        }

        async fn get_record(
            &self,
            record_id: i64,
        ) -> Result<Option<ModerationRecord>, AnnounceError> {
            Ok(self.records.get(&record_id).map(|r| r.clone()))
        }

        async fn active_record(
            &self,
            post_id: i64,
        ) -> Result<Option<ModerationRecord>, AnnounceError> {
            Ok(self
                .records
                .iter()
                .find(|r| r.post_id == post_id && r.active)
                .map(|r| r.clone()))
        }

        async fn set_status(
            &self,
            record_id: i64,
            status: ModerationStatus,
            decided_by: &str,
        ) -> Result<(), AnnounceError> {
            let mut record = self
                .records
                .get_mut(&record_id)
                .ok_or(AnnounceError::RecordNotFound(record_id))?;
            record.status = status;
            record.decided_by = Some(decided_by.to_string());
            record.decided_at = Some(Utc::now());
            Ok(())
        }
    }

    fn required_rule(id: i64, moderator: &str) -> PrivilegeRule {
        PrivilegeRule {
            id,
            audience_type: "course".to_string(),
            code_pattern: "*".to_string(),
            role: None,
            condition: None,
            check_type: None,
            check_value: String::new(),
            check_order: id as i32,
            mod_required: true,
            mod_priority: 1,
            mod_threshold: NO_THRESHOLD,
            mod_username: Some(moderator.to_string()),
            description: "needs sign-off".to_string(),
            active: true,
        }
    }

    struct FixedRules(Vec<PrivilegeRule>);

    #[async_trait]
    impl PrivilegeStore for FixedRules {
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

    fn service(
        provider: FixedProvider,
        rules: Vec<PrivilegeRule>,
        directory: FakeDirectory,
    ) -> AnnounceService<MockConditionStore, MockModerationLog> {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider));
        let registry = Arc::new(registry);

        let directory: Arc<dyn crate::core::directory::Directory> = Arc::new(directory);
        let privileges = Arc::new(PrivilegeQuery::new(Arc::new(FixedRules(rules))));

        AnnounceService::new(
            Arc::clone(&registry),
            AudienceResolver::new(Arc::clone(&registry), Arc::new(NoCc), Arc::clone(&directory)),
            ModerationResolver::new(Arc::clone(&registry), privileges, directory),
            MockConditionStore::default(),
            MockModerationLog::default(),
        )
    }

    fn union_json(codes: &[&str]) -> String {
        let items: Vec<String> = codes
            .iter()
            .map(|code| format!(r#"{{"code": "{code}", "name": "{code}"}}"#))
            .collect();
        format!(
            r#"[{{"type": "union", "uid": "t1", "audiences": [{{
                "audienceprovider": "course", "audiencetype": "course",
                "selecteditems": [{}],
                "selectedroles": [{{"code": "student", "name": "Students"}}]
            }}]}}]"#,
            items.join(",")
        )
    }

    #[tokio::test]
    async fn save_records_pending_moderation() {
        let provider = FixedProvider::new("course").with_users("H810", ["u1", "u2"]);
        let directory = FakeDirectory::new().with_user("modp");
        let svc = service(provider, vec![required_rule(1, "modp")], directory);

        let saved = svc
            .save_post(42, &ActingUser::new("author"), &union_json(&["H810"]))
            .await
            .unwrap();

        assert_eq!(saved.status, ModerationStatus::Pending);
        assert!(saved.recipients.contains("u1"));
        assert!(saved.recipients.contains("author"));

        let record = svc.moderation_state(42).await.unwrap().unwrap();
        assert_eq!(record.id, saved.record_id);
        assert_eq!(record.status, ModerationStatus::Pending);
        assert_eq!(record.moderator.as_deref(), Some("modp"));
    }

    #[tokio::test]
    async fn auto_approved_save_skips_pending() {
        let provider = FixedProvider::new("course").with_users("H810", ["u1"]);
        let directory = FakeDirectory::new().with_user("modp");
        let svc = service(provider, vec![required_rule(1, "modp")], directory);

        // The moderator posting to their own audience.
        let saved = svc
            .save_post(42, &ActingUser::new("modp"), &union_json(&["H810"]))
            .await
            .unwrap();

        assert!(saved.verdict.required);
        assert!(saved.verdict.auto_approve);
        assert_eq!(saved.status, ModerationStatus::Approved);
    }

    #[tokio::test]
    async fn resave_replaces_audience_and_deactivates_record() {
        let provider = FixedProvider::new("course")
            .with_users("A", ["u1"])
            .with_users("B", ["u2"]);
        let directory = FakeDirectory::new().with_user("modp");
        let svc = service(provider, vec![required_rule(1, "modp")], directory);
        let author = ActingUser::new("author");

        let first = svc.save_post(42, &author, &union_json(&["A"])).await.unwrap();
        let second = svc.save_post(42, &author, &union_json(&["B"])).await.unwrap();

        // Only the latest audience rows survive the edit.
        let stored = svc.load_audience(42).await.unwrap().unwrap();
        assert_eq!(stored.conditions.len(), 1);
        assert_eq!(stored.conditions[0].condition.parts[0].code, "B");
        assert!(stored.relevance.contains_key("u2"));
        assert!(!stored.relevance.contains_key("u1"));

        // The first record was deactivated, the second one is live.
        let first_record = svc.log.get_record(first.record_id).await.unwrap().unwrap();
        assert!(!first_record.active);
        let active = svc.moderation_state(42).await.unwrap().unwrap();
        assert_eq!(active.id, second.record_id);
    }

    #[tokio::test]
    async fn empty_audience_is_refused_before_any_write() {
        let provider = FixedProvider::new("course"); // no users anywhere
        let svc = service(provider, vec![], FakeDirectory::new());

        let err = svc
            .save_post(42, &ActingUser::new("author"), &union_json(&["H810"]))
            .await
            .unwrap_err();

        assert!(matches!(err, AnnounceError::EmptyAudience));
        assert!(svc.load_audience(42).await.unwrap().is_none());
        assert_eq!(svc.log.records.len(), 0);
    }

    #[tokio::test]
    async fn invalid_expression_is_refused_before_any_write() {
        let provider = FixedProvider::new("course").with_users("H810", ["u1"]);
        let svc = service(provider, vec![], FakeDirectory::new());

        let err = svc
            .save_post(42, &ActingUser::new("author"), r#"[{"type": "xor", "audiences": []}]"#)
            .await
            .unwrap_err();

        assert!(matches!(err, AnnounceError::InvalidExpression(_)));
        assert_eq!(svc.conditions.replace_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn approve_and_reject_respect_the_state_machine() {
        let provider = FixedProvider::new("course").with_users("H810", ["u1"]);
        let directory = FakeDirectory::new().with_user("modp");
        let svc = service(provider, vec![required_rule(1, "modp")], directory);

        let saved = svc
            .save_post(42, &ActingUser::new("author"), &union_json(&["H810"]))
            .await
            .unwrap();

        svc.approve(saved.record_id, "modp").await.unwrap();
        let record = svc.log.get_record(saved.record_id).await.unwrap().unwrap();
        assert_eq!(record.status, ModerationStatus::Approved);
        assert_eq!(record.decided_by.as_deref(), Some("modp"));

        // A decision is final.
        let err = svc.reject(saved.record_id, "modp").await.unwrap_err();
        assert!(matches!(err, AnnounceError::InvalidTransition(_, _)));

        let err = svc.approve(9999, "modp").await.unwrap_err();
        assert!(matches!(err, AnnounceError::RecordNotFound(9999)));
    }

    #[tokio::test]
    async fn preview_persists_nothing() {
        let provider = FixedProvider::new("course").with_users("H810", ["u1"]);
        let directory = FakeDirectory::new().with_user("modp");
        let svc = service(provider, vec![required_rule(1, "modp")], directory);

        let preview = svc
            .preview(&ActingUser::new("author"), &union_json(&["H810"]))
            .await
            .unwrap();

        assert!(preview.recipients.contains("u1"));
        assert!(preview.verdict.required);
        assert!(svc.load_audience(42).await.unwrap().is_none());
        assert_eq!(svc.log.records.len(), 0);
    }
}
