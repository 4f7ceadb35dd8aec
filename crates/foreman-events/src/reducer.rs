use foreman_core::{Lane, RejectedReason, StatusEvent, WpId};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

/// Whether the pair of lanes is an accepted transition.
///
/// The lane space is deliberately not totally ordered: review can send work
/// back, anything non-terminal can be blocked or canceled, and blocked work
/// can re-enter the flow where it left off.
pub fn legal_transition(from: Lane, to: Lane) -> bool {
    use Lane::*;
    matches!(
        (from, to),
        (Planned, Claimed)
            | (Planned, InProgress)
            | (Planned, Canceled)
            | (Planned, Blocked)
            | (Claimed, InProgress)
            | (Claimed, Planned)
            | (Claimed, Blocked)
            | (Claimed, Canceled)
            | (InProgress, ForReview)
            | (InProgress, Blocked)
            | (InProgress, Canceled)
            | (ForReview, Done)
            | (ForReview, InProgress)
            | (ForReview, Blocked)
            | (ForReview, Canceled)
            | (Blocked, Planned)
            | (Blocked, Claimed)
            | (Blocked, InProgress)
            | (Blocked, ForReview)
            | (Blocked, Canceled)
    )
}

/// Guard conditions, checked at append time.
///
/// Forced events are accepted unconditionally but must carry an actor and a
/// reason. Unforced events must be a legal transition, and entering `done`
/// requires approval evidence.
pub fn check_guards(event: &StatusEvent) -> Result<(), RejectedReason> {
    if event.forced {
        if event.actor.trim().is_empty() {
            return Err(RejectedReason::MissingActor);
        }
        if event.reason.as_deref().map_or(true, |r| r.trim().is_empty()) {
            return Err(RejectedReason::MissingReason);
        }
        return Ok(());
    }

    if !legal_transition(event.from_lane, event.to_lane) {
        return Err(RejectedReason::IllegalTransition {
            from: event.from_lane,
            to: event.to_lane,
        });
    }

    if event.to_lane == Lane::Done {
        let has_approval = event
            .evidence
            .as_ref()
            .is_some_and(|e| e.kind == foreman_core::EvidenceKind::Approval);
        if !has_approval {
            return Err(RejectedReason::MissingApproval);
        }
    }

    Ok(())
}

/// Bookkeeping for the most recent event applied to a work package, used to
/// detect races between concurrent transitions out of the same lane.
#[derive(Debug, Clone, Copy)]
struct LastApplied {
    from_lane: Lane,
    rollback: bool,
}

/// Incremental fold state. [`fold`] drives one of these over a sorted event
/// sequence; `StatusLog` keeps one as its cached snapshot and feeds appends
/// through the same `apply` so the cache and a fresh fold agree.
#[derive(Debug, Default, Clone)]
pub(crate) struct FoldState {
    lanes: BTreeMap<WpId, Lane>,
    last: HashMap<WpId, LastApplied>,
}

impl FoldState {
    /// Builds fold state from scratch: sorts by `(logical_clock, event_id)`
    /// and applies every event.
    pub(crate) fn from_events(events: &[StatusEvent]) -> Self {
        let mut sorted: Vec<&StatusEvent> = events.iter().collect();
        sorted.sort_by_key(|e| (e.logical_clock, e.event_id));

        let mut state = FoldState::default();
        for event in sorted {
            state.apply(event);
        }
        state
    }

    pub(crate) fn lanes(&self) -> &BTreeMap<WpId, Lane> {
        &self.lanes
    }

    #[cfg(test)]
    pub(crate) fn set_lane_for_tests(&mut self, wp: WpId, lane: Lane) {
        self.lanes.insert(wp, lane);
    }

    pub(crate) fn lane_of(&self, wp: &WpId) -> Lane {
        self.lanes.get(wp).copied().unwrap_or(Lane::Planned)
    }

    /// Applies one event under the precedence rules:
    ///
    /// 1. Forced events always apply.
    /// 2. An event whose `from_lane` matches the current lane applies.
    /// 3. A rollback whose race partner already advanced the lane applies
    ///    anyway — an explicit human rejection is never overridden by a race
    ///    with forward progress.
    /// 4. A forward event racing a transition out of the same lane applies
    ///    last-writer-by-logical-clock, unless the earlier writer was a
    ///    rollback; either way the pair is flagged.
    /// 5. Anything else is stale and skipped.
    pub(crate) fn apply(&mut self, event: &StatusEvent) {
        let wp = event.work_package_id.clone();
        let current = self.lanes.get(&wp).copied();

        let applies = match current {
            None => true,
            Some(lane) if event.forced => {
                if event.from_lane != lane {
                    warn!(
                        wp = %wp,
                        current = %lane,
                        declared = %event.from_lane,
                        "forced transition from a lane that is not current"
                    );
                }
                true
            }
            Some(lane) if event.from_lane == lane => true,
            Some(lane) => {
                let last = self.last.get(&wp);
                if event.is_rollback() && last.is_some_and(|l| l.from_lane == Lane::ForReview) {
                    // The race partner already advanced for_review -> done;
                    // the rejection still wins regardless of arrival order.
                    warn!(
                        wp = %wp,
                        current = %lane,
                        event = %event.event_id,
                        "rollback overrides racing forward transition"
                    );
                    true
                } else if last.is_some_and(|l| l.from_lane == event.from_lane) {
                    let rollback_won = last.is_some_and(|l| l.rollback);
                    if rollback_won {
                        warn!(
                            wp = %wp,
                            event = %event.event_id,
                            "forward transition raced an applied rollback; rollback wins"
                        );
                    } else {
                        warn!(
                            wp = %wp,
                            event = %event.event_id,
                            from = %event.from_lane,
                            "concurrent forward transitions; last writer by logical clock wins"
                        );
                    }
                    !rollback_won
                } else {
                    warn!(
                        wp = %wp,
                        current = %lane,
                        declared = %event.from_lane,
                        event = %event.event_id,
                        "stale event skipped"
                    );
                    false
                }
            }
        };

        if applies {
            self.lanes.insert(wp.clone(), event.to_lane);
            self.last.insert(
                wp,
                LastApplied {
                    from_lane: event.from_lane,
                    rollback: event.is_rollback(),
                },
            );
        }
    }
}

/// Folds an event sequence into the current lane per work package.
///
/// Pure: the input is sorted by `(logical_clock, event_id)` before folding,
/// so the result is identical for any read order of the same log.
pub fn fold(events: &[StatusEvent]) -> BTreeMap<WpId, Lane> {
    FoldState::from_events(events).lanes
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::Evidence;

    fn ev(wp: &str, from: Lane, to: Lane, clock: u64) -> StatusEvent {
        let mut e = StatusEvent::new(WpId::new(wp), from, to, "test");
        e.logical_clock = clock;
        e
    }

    #[test]
    fn test_legal_transitions() {
        assert!(legal_transition(Lane::Planned, Lane::Claimed));
        assert!(legal_transition(Lane::ForReview, Lane::InProgress));
        assert!(legal_transition(Lane::ForReview, Lane::Done));
        assert!(!legal_transition(Lane::Planned, Lane::Done));
        assert!(!legal_transition(Lane::Done, Lane::InProgress));
        assert!(!legal_transition(Lane::Canceled, Lane::Planned));
    }

    #[test]
    fn test_done_requires_approval() {
        let bare = ev("wp-1", Lane::ForReview, Lane::Done, 1);
        assert_eq!(check_guards(&bare), Err(RejectedReason::MissingApproval));

        let approved = ev("wp-1", Lane::ForReview, Lane::Done, 1)
            .with_evidence(Evidence::approval("rev-1"));
        assert_eq!(check_guards(&approved), Ok(()));

        // Review evidence is not approval evidence.
        let reviewed = ev("wp-1", Lane::ForReview, Lane::Done, 1)
            .with_evidence(Evidence::review("rev-1"));
        assert_eq!(check_guards(&reviewed), Err(RejectedReason::MissingApproval));
    }

    #[test]
    fn test_forced_requires_actor_and_reason() {
        let mut forced = ev("wp-1", Lane::Planned, Lane::Done, 1).forced();
        assert_eq!(check_guards(&forced), Err(RejectedReason::MissingReason));

        forced = forced.with_reason("operator override");
        assert_eq!(check_guards(&forced), Ok(()));

        let mut anonymous = ev("wp-1", Lane::Planned, Lane::Done, 1)
            .forced()
            .with_reason("x");
        anonymous.actor = "  ".to_string();
        assert_eq!(check_guards(&anonymous), Err(RejectedReason::MissingActor));
    }

    #[test]
    fn test_forced_skips_legality_and_approval() {
        let forced = ev("wp-1", Lane::Planned, Lane::Done, 1)
            .forced()
            .with_reason("hotfix already shipped");
        assert_eq!(check_guards(&forced), Ok(()));
    }

    #[test]
    fn test_fold_simple_progression() {
        let events = vec![
            ev("wp-a", Lane::Planned, Lane::Claimed, 1),
            ev("wp-a", Lane::Claimed, Lane::InProgress, 2),
            ev("wp-a", Lane::InProgress, Lane::ForReview, 3),
            ev("wp-b", Lane::Planned, Lane::InProgress, 4),
        ];
        let lanes = fold(&events);
        assert_eq!(lanes[&WpId::new("wp-a")], Lane::ForReview);
        assert_eq!(lanes[&WpId::new("wp-b")], Lane::InProgress);
    }

    #[test]
    fn test_fold_is_read_order_independent() {
        let mut events = vec![
            ev("wp-a", Lane::Planned, Lane::InProgress, 1),
            ev("wp-a", Lane::InProgress, Lane::ForReview, 2),
            ev("wp-b", Lane::Planned, Lane::Claimed, 3),
            ev("wp-b", Lane::Claimed, Lane::InProgress, 4),
        ];
        let forward = fold(&events);
        events.reverse();
        let reversed = fold(&events);
        events.swap(0, 2);
        let shuffled = fold(&events);
        assert_eq!(forward, reversed);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_rollback_beats_forward_when_forward_folds_first() {
        // done (clock 2) folds before the rollback (clock 3) arrives.
        let done = ev("wp-r", Lane::ForReview, Lane::Done, 2)
            .with_evidence(Evidence::approval("ok"));
        let rollback = ev("wp-r", Lane::ForReview, Lane::InProgress, 3)
            .with_evidence(Evidence::review("rejected-by-alice"));

        let lanes = fold(&[
            ev("wp-r", Lane::Planned, Lane::InProgress, 0),
            ev("wp-r", Lane::InProgress, Lane::ForReview, 1),
            done,
            rollback,
        ]);
        assert_eq!(lanes[&WpId::new("wp-r")], Lane::InProgress);
    }

    #[test]
    fn test_rollback_beats_forward_when_rollback_folds_first() {
        // Rollback has the lower clock; the racing done must not override it.
        let rollback = ev("wp-r", Lane::ForReview, Lane::InProgress, 2)
            .with_evidence(Evidence::review("rejected-by-alice"));
        let done = ev("wp-r", Lane::ForReview, Lane::Done, 3)
            .with_evidence(Evidence::approval("ok"));

        let lanes = fold(&[
            ev("wp-r", Lane::Planned, Lane::InProgress, 0),
            ev("wp-r", Lane::InProgress, Lane::ForReview, 1),
            rollback,
            done,
        ]);
        assert_eq!(lanes[&WpId::new("wp-r")], Lane::InProgress);
    }

    #[test]
    fn test_concurrent_forward_pair_last_writer_wins() {
        // Two non-rollback transitions out of in_progress: blocked at clock
        // 2, for_review at clock 3. Last writer by clock wins.
        let lanes = fold(&[
            ev("wp-c", Lane::Planned, Lane::InProgress, 1),
            ev("wp-c", Lane::InProgress, Lane::Blocked, 2),
            ev("wp-c", Lane::InProgress, Lane::ForReview, 3),
        ]);
        assert_eq!(lanes[&WpId::new("wp-c")], Lane::ForReview);
    }

    #[test]
    fn test_stale_event_skipped() {
        let lanes = fold(&[
            ev("wp-s", Lane::Planned, Lane::InProgress, 1),
            ev("wp-s", Lane::InProgress, Lane::ForReview, 2),
            // Claims to come out of planned long after the WP left it.
            ev("wp-s", Lane::Planned, Lane::Canceled, 3),
        ]);
        assert_eq!(lanes[&WpId::new("wp-s")], Lane::ForReview);
    }

    #[test]
    fn test_forced_event_applies_regardless_of_current_lane() {
        let forced = ev("wp-f", Lane::Planned, Lane::Done, 3)
            .forced()
            .with_reason("operator accepted out of band");
        let lanes = fold(&[
            ev("wp-f", Lane::Planned, Lane::InProgress, 1),
            ev("wp-f", Lane::InProgress, Lane::Blocked, 2),
            forced,
        ]);
        assert_eq!(lanes[&WpId::new("wp-f")], Lane::Done);
    }

    #[test]
    fn test_clock_tie_broken_by_event_id() {
        // Same logical clock: the fold must still be deterministic.
        let mut a = ev("wp-t", Lane::Planned, Lane::InProgress, 1);
        let mut b = ev("wp-t", Lane::Planned, Lane::Canceled, 1);
        // Pin ids so the winner is known: higher id folds second.
        a.event_id = uuid::Uuid::from_u128(1);
        b.event_id = uuid::Uuid::from_u128(2);

        let one = fold(&[a.clone(), b.clone()]);
        let two = fold(&[b, a]);
        assert_eq!(one, two);
        // b folds last and the pair raced out of planned, so b wins.
        assert_eq!(one[&WpId::new("wp-t")], Lane::Canceled);
    }
}
