use crate::package::WpId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The lifecycle state of a work package.
///
/// Lanes are not totally ordered: `ForReview` may return to `InProgress`
/// when a review rejects the work. The reducer in `foreman-events` is the
/// only component that owns lane values; everything else reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Declared but not yet picked up.
    Planned,
    /// Reserved for an agent, process not yet started.
    Claimed,
    /// An agent is actively working on it.
    InProgress,
    /// Implementation finished, awaiting review.
    ForReview,
    /// Accepted with approval evidence.
    Done,
    /// Halted pending human intervention.
    Blocked,
    /// Withdrawn; will never run.
    Canceled,
}

impl Lane {
    /// Lanes from which no further automatic transition is scheduled.
    pub fn is_terminal(self) -> bool {
        matches!(self, Lane::Done | Lane::Canceled)
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lane::Planned => "planned",
            Lane::Claimed => "claimed",
            Lane::InProgress => "in_progress",
            Lane::ForReview => "for_review",
            Lane::Done => "done",
            Lane::Blocked => "blocked",
            Lane::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

/// Kind of structured payload attached to a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceKind {
    /// Human or governance approval; required to enter `done`.
    Approval,
    /// A review verdict, e.g. the rejection that rolls work back.
    Review,
    /// Free-form supporting material.
    Note,
}

/// Structured payload carried by a status event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    /// Pointer to the artifact backing this evidence (review id, PR url...).
    pub reference: String,
    #[serde(default)]
    pub detail: Option<String>,
}

impl Evidence {
    pub fn approval(reference: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Approval,
            reference: reference.into(),
            detail: None,
        }
    }

    pub fn review(reference: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Review,
            reference: reference.into(),
            detail: None,
        }
    }

    pub fn note(reference: impl Into<String>) -> Self {
        Self {
            kind: EvidenceKind::Note,
            reference: reference.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// An immutable record of one lane transition.
///
/// Events are append-only: created by whichever component records the
/// transition, stamped with a logical clock by the log at append time, and
/// never mutated or deleted afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub event_id: Uuid,
    pub work_package_id: WpId,
    pub from_lane: Lane,
    pub to_lane: Lane,
    pub timestamp: DateTime<Utc>,
    /// Who recorded the transition: an agent id, "operator", "engine"...
    pub actor: String,
    /// Bypasses guard conditions; makes `actor` and `reason` mandatory.
    #[serde(default)]
    pub forced: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub evidence: Option<Evidence>,
    /// Monotonic per-feature counter assigned at append; the fold
    /// tie-breaker together with `event_id`.
    #[serde(default)]
    pub logical_clock: u64,
}

impl StatusEvent {
    /// Creates a transition record. The logical clock is left at zero and
    /// stamped by the log on append.
    pub fn new(
        work_package_id: WpId,
        from_lane: Lane,
        to_lane: Lane,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            work_package_id,
            from_lane,
            to_lane,
            timestamp: Utc::now(),
            actor: actor.into(),
            forced: false,
            reason: None,
            evidence: None,
            logical_clock: 0,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Marks the event as forced, bypassing guard conditions.
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// A rollback is a review-backed return from `for_review` to
    /// `in_progress`. Rollbacks take precedence over racing forward
    /// transitions out of the same lane.
    pub fn is_rollback(&self) -> bool {
        self.from_lane == Lane::ForReview
            && self.to_lane == Lane::InProgress
            && self
                .evidence
                .as_ref()
                .is_some_and(|e| e.kind == EvidenceKind::Review)
    }
}

/// Why an append was rejected at guard-check time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectedReason {
    /// `done` requires approval evidence unless the event is forced.
    #[error("transition to done requires approval evidence")]
    MissingApproval,

    /// Forced transitions must identify who forced them.
    #[error("forced transition requires a non-empty actor")]
    MissingActor,

    /// Forced transitions must say why.
    #[error("forced transition requires a reason")]
    MissingReason,

    /// The pair of lanes is not a legal transition.
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        /// Declared source lane.
        from: Lane,
        /// Declared target lane.
        to: Lane,
    },

    /// The governance hook returned a blocking verdict.
    #[error("transition blocked by validation hook: {0}")]
    Blocked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_serialization() {
        let json = serde_json::to_string(&Lane::ForReview).unwrap();
        assert_eq!(json, "\"for_review\"");
        let parsed: Lane = serde_json::from_str("\"in_progress\"").unwrap();
        assert_eq!(parsed, Lane::InProgress);
    }

    #[test]
    fn test_lane_terminal() {
        assert!(Lane::Done.is_terminal());
        assert!(Lane::Canceled.is_terminal());
        assert!(!Lane::Blocked.is_terminal());
        assert!(!Lane::ForReview.is_terminal());
    }

    #[test]
    fn test_event_builder() {
        let ev = StatusEvent::new(
            WpId::new("wp-auth"),
            Lane::ForReview,
            Lane::Done,
            "reviewer-bot",
        )
        .with_evidence(Evidence::approval("review-42"))
        .with_reason("approved");

        assert_eq!(ev.to_lane, Lane::Done);
        assert!(!ev.forced);
        assert_eq!(ev.evidence.unwrap().reference, "review-42");
    }

    #[test]
    fn test_rollback_detection() {
        let rollback = StatusEvent::new(
            WpId::new("wp-1"),
            Lane::ForReview,
            Lane::InProgress,
            "reviewer",
        )
        .with_evidence(Evidence::review("rej-7"));
        assert!(rollback.is_rollback());

        // Same lanes without review evidence is not a rollback.
        let plain = StatusEvent::new(
            WpId::new("wp-1"),
            Lane::ForReview,
            Lane::InProgress,
            "operator",
        );
        assert!(!plain.is_rollback());

        let forward =
            StatusEvent::new(WpId::new("wp-1"), Lane::ForReview, Lane::Done, "agent");
        assert!(!forward.is_rollback());
    }

    #[test]
    fn test_event_tolerates_unknown_fields() {
        let raw = r#"{
            "event_id": "1f0d2a54-9f6e-4f7e-9a1b-0c9d8e7f6a5b",
            "work_package_id": "wp-x",
            "from_lane": "planned",
            "to_lane": "claimed",
            "timestamp": "2026-01-05T10:00:00Z",
            "actor": "engine",
            "logical_clock": 3,
            "some_future_field": {"nested": true}
        }"#;
        let ev: StatusEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.logical_clock, 3);
        assert_eq!(ev.to_lane, Lane::Claimed);
        assert!(ev.reason.is_none());
    }
}
