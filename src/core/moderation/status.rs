// Moderation status state machine and the persisted history row.
//
// A post's status only ever moves forward: NONE -> PENDING -> APPROVED or
// REJECTED. Auto-approval skips the human-pending state at creation time by
// inserting the record as APPROVED directly. Editing a post deactivates the
// old record and starts over; it never reconciles partial state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerationStatus {
    /// Moderation was not required for this post.
    None,
    /// Waiting for the moderator.
    Pending,
    Approved,
    Rejected,
}

impl ModerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModerationStatus::None => "none",
            ModerationStatus::Pending => "pending",
            ModerationStatus::Approved => "approved",
            ModerationStatus::Rejected => "rejected",
        }
    }

    /// Whether a moderator action may move this status to `next`.
    pub fn can_transition(&self, next: ModerationStatus) -> bool {
        matches!(
            (self, next),
            (ModerationStatus::None, ModerationStatus::Pending)
                | (ModerationStatus::Pending, ModerationStatus::Approved)
                | (ModerationStatus::Pending, ModerationStatus::Rejected)
        )
    }
}

impl std::fmt::Display for ModerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ModerationStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ModerationStatus::None),
            "pending" => Ok(ModerationStatus::Pending),
            "approved" => Ok(ModerationStatus::Approved),
            "rejected" => Ok(ModerationStatus::Rejected),
            _ => Err(()),
        }
    }
}

/// One moderation-history row. Exactly one active record exists per post;
/// re-saving deactivates it and inserts a fresh one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationRecord {
    pub id: i64,
    pub post_id: i64,
    pub status: ModerationStatus,
    pub moderator: Option<String>,
    pub privilege_id: Option<i64>,
    pub description: String,
    pub created: DateTime<Utc>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use ModerationStatus::*;

        assert!(None.can_transition(Pending));
        assert!(Pending.can_transition(Approved));
        assert!(Pending.can_transition(Rejected));

        // Decisions are final; nothing moves out of a decided state.
        assert!(!Approved.can_transition(Rejected));
        assert!(!Approved.can_transition(Pending));
        assert!(!Rejected.can_transition(Approved));
        assert!(!None.can_transition(Approved));
        assert!(!Pending.can_transition(Pending));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ModerationStatus::None,
            ModerationStatus::Pending,
            ModerationStatus::Approved,
            ModerationStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<ModerationStatus>(), Ok(status));
        }
        assert!("gone".parse::<ModerationStatus>().is_err());
    }
}
