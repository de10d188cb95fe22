// Tag model - the typed representation of a user's audience selection.
//
// Tag expressions arrive as JSON at the system boundary. They are parsed into
// the typed model here and validated before anything else looks at them;
// untyped data never travels past this file.

use crate::core::audience::provider::ProviderRegistry;
use crate::core::directory::{ActingUser, DirectoryError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AudienceError {
    /// Malformed or unauthorized tag list. Rejected before any resolution;
    /// no partial writes happen.
    #[error("Invalid audience expression: {0}")]
    InvalidExpression(String),

    #[error("Storage error: {0}")]
    StorageError(String),
}

impl From<DirectoryError> for AudienceError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::StorageError(msg) => AudienceError::StorageError(msg),
        }
    }
}

/// How a tag combines its audience selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    /// One audience, many selected items - recipients are the union.
    Union,
    /// Many audiences, one selected item each - recipients are the
    /// intersection.
    Intersection,
}

impl std::fmt::Display for TagKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagKind::Union => write!(f, "union"),
            TagKind::Intersection => write!(f, "intersection"),
        }
    }
}

impl std::str::FromStr for TagKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "union" => Ok(TagKind::Union),
            "intersection" => Ok(TagKind::Intersection),
            _ => Err(()),
        }
    }
}

/// One selectable thing within an audience. `code` is the provider-specific
/// identity (course code, group id, `field=value`, composite code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub code: String,
    pub name: String,
}

impl Item {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// Filters which relationship to an item counts as a recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub code: String,
    pub name: String,
}

impl Role {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
        }
    }
}

/// One audience within a tag: a provider, one of its audience types, the
/// selected items and the role filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudienceSelection {
    pub provider: String,
    pub audience_type: String,
    pub selected_items: Vec<Item>,
    pub selected_roles: Vec<Role>,
}

/// One tag of a post's audience expression. The full expression is an ordered
/// list of tags combined by OR.
///
/// Invariant (enforced by `validate`): a Union tag has exactly one
/// `AudienceSelection` with at least one item; an Intersection tag has one or
/// more selections, each with exactly one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub kind: TagKind,
    pub uid: String,
    pub audiences: Vec<AudienceSelection>,
}

// ============================================================================
// WIRE FORMAT
// ============================================================================
// Field names are fixed by the boundary contract; do not rename.

#[derive(Debug, Serialize, Deserialize)]
struct WireTag {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    uid: serde_json::Value,
    #[serde(default)]
    audiences: Vec<WireAudience>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireAudience {
    #[serde(rename = "audienceprovider")]
    provider: String,
    #[serde(rename = "audiencetype")]
    audience_type: String,
    #[serde(rename = "selecteditems", default)]
    selected_items: Vec<Item>,
    #[serde(rename = "selectedroles", default)]
    selected_roles: Vec<Role>,
}

/// Parse a JSON tag expression into the typed model. Malformed JSON or an
/// unknown tag type rejects the whole expression.
pub fn parse_tags(json: &str) -> Result<Vec<Tag>, AudienceError> {
    let wire: Vec<WireTag> = serde_json::from_str(json)
        .map_err(|e| AudienceError::InvalidExpression(format!("bad tag JSON: {e}")))?;

    wire.into_iter()
        .map(|tag| {
            let kind: TagKind = tag
                .kind
                .parse()
                .map_err(|_| AudienceError::InvalidExpression(format!("unknown tag type '{}'", tag.kind)))?;
            Ok(Tag {
                kind,
                uid: opaque_uid(&tag.uid),
                audiences: tag
                    .audiences
                    .into_iter()
                    .map(|audience| AudienceSelection {
                        provider: audience.provider,
                        audience_type: audience.audience_type,
                        selected_items: audience.selected_items,
                        selected_roles: audience.selected_roles,
                    })
                    .collect(),
            })
        })
        .collect()
}

/// The uid is opaque to us; keep whatever the caller sent as a string.
fn opaque_uid(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Serialize tags back into the boundary JSON (used when persisting the raw
/// expression alongside a post).
pub fn tags_to_json(tags: &[Tag]) -> Result<String, AudienceError> {
    let wire: Vec<WireTag> = tags
        .iter()
        .map(|tag| WireTag {
            kind: tag.kind.to_string(),
            uid: serde_json::Value::String(tag.uid.clone()),
            audiences: tag
                .audiences
                .iter()
                .map(|audience| WireAudience {
                    provider: audience.provider.clone(),
                    audience_type: audience.audience_type.clone(),
                    selected_items: audience.selected_items.clone(),
                    selected_roles: audience.selected_roles.clone(),
                })
                .collect(),
        })
        .collect();
    serde_json::to_string(&wire).map_err(|e| AudienceError::StorageError(e.to_string()))
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Validate a full tag expression for the acting user.
///
/// Checks, in order: structural invariants (tag shape, non-empty audiences and
/// items, intersection single-item rule), provider registration, audience type
/// ownership, then authorization (`can_post_to` for every selected item). Any
/// failure rejects the whole expression; nothing is resolved or persisted.
pub async fn validate(
    tags: &[Tag],
    acting: &ActingUser,
    registry: &ProviderRegistry,
) -> Result<(), AudienceError> {
    if tags.is_empty() {
        return Err(AudienceError::InvalidExpression(
            "expression contains no tags".to_string(),
        ));
    }

    for tag in tags {
        if tag.audiences.is_empty() {
            return Err(AudienceError::InvalidExpression(
                "tag has no audiences".to_string(),
            ));
        }
        if tag.kind == TagKind::Union && tag.audiences.len() != 1 {
            return Err(AudienceError::InvalidExpression(format!(
                "union tag must have exactly one audience, found {}",
                tag.audiences.len()
            )));
        }

        for audience in &tag.audiences {
            if audience.audience_type.is_empty() {
                return Err(AudienceError::InvalidExpression(
                    "audience has an empty audience type".to_string(),
                ));
            }
            if audience.selected_items.is_empty() {
                return Err(AudienceError::InvalidExpression(
                    "audience has no selected items".to_string(),
                ));
            }
            if tag.kind == TagKind::Intersection && audience.selected_items.len() != 1 {
                return Err(AudienceError::InvalidExpression(format!(
                    "intersection audience must have exactly one selected item, found {}",
                    audience.selected_items.len()
                )));
            }

            let provider = registry.get(&audience.provider).ok_or_else(|| {
                AudienceError::InvalidExpression(format!(
                    "unknown audience provider '{}'",
                    audience.provider
                ))
            })?;
            if !provider.owns_type(&audience.audience_type) {
                return Err(AudienceError::InvalidExpression(format!(
                    "provider '{}' does not own audience type '{}'",
                    audience.provider, audience.audience_type
                )));
            }

            for item in &audience.selected_items {
                let allowed = provider
                    .can_post_to(acting, &audience.audience_type, &item.code)
                    .await?;
                if !allowed {
                    return Err(AudienceError::InvalidExpression(format!(
                        "user '{}' may not post to {} '{}'",
                        acting.username, audience.audience_type, item.code
                    )));
                }
            }
        }
    }

    Ok(())
}

/// Boolean wrapper over `validate` for callers that only need a yes/no.
/// Storage failures count as invalid.
pub async fn is_valid(tags: &[Tag], acting: &ActingUser, registry: &ProviderRegistry) -> bool {
    validate(tags, acting, registry).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_union_tag() {
        let json = r#"[{
            "type": "union",
            "uid": "t1",
            "audiences": [{
                "audienceprovider": "course",
                "audiencetype": "course",
                "selecteditems": [{"code": "H810", "name": "Accessible online learning"}],
                "selectedroles": [{"code": "student", "name": "Students"}]
            }]
        }]"#;

        let tags = parse_tags(json).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].kind, TagKind::Union);
        assert_eq!(tags[0].uid, "t1");
        assert_eq!(tags[0].audiences[0].provider, "course");
        assert_eq!(tags[0].audiences[0].selected_items[0].code, "H810");
        assert_eq!(tags[0].audiences[0].selected_roles[0].code, "student");
    }

    #[test]
    fn parse_rejects_unknown_tag_type() {
        let json = r#"[{"type": "xor", "audiences": [{
            "audienceprovider": "course", "audiencetype": "course",
            "selecteditems": [{"code": "A", "name": "A"}], "selectedroles": []
        }]}]"#;

        let err = parse_tags(json).unwrap_err();
        assert!(matches!(err, AudienceError::InvalidExpression(_)));
    }

    #[test]
    fn parse_keeps_numeric_uid_opaque() {
        let json = r#"[{"type": "intersection", "uid": 42, "audiences": []}]"#;
        let tags = parse_tags(json).unwrap();
        assert_eq!(tags[0].uid, "42");
    }

    #[test]
    fn wire_round_trip_preserves_field_names() {
        let tags = vec![Tag {
            kind: TagKind::Union,
            uid: "u1".to_string(),
            audiences: vec![AudienceSelection {
                provider: "group".to_string(),
                audience_type: "group".to_string(),
                selected_items: vec![Item::new("g7", "Tutor group 7")],
                selected_roles: vec![Role::new("member", "Members")],
            }],
        }];

        let json = tags_to_json(&tags).unwrap();
        assert!(json.contains("\"audienceprovider\""));
        assert!(json.contains("\"selecteditems\""));
        assert_eq!(parse_tags(&json).unwrap(), tags);
    }
}
