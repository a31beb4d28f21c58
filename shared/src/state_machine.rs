//! Drone Ownership State Machine
//!
//! Defines the per-drone ownership states a node tracks locally and the
//! deterministic tie-break two nodes use to settle a contested claim.

use std::fmt;

/// Ownership status of one drone as seen by this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OwnershipStatus {
    /// Nobody has been asked yet
    #[default]
    Unknown,
    /// Claim broadcast, waiting for replies
    Pending,
    /// This node publishes the track
    PublishLocally,
    /// A peer publishes the track, sightings are forwarded to it
    ForwardToPeer,
    /// Owner went away, buffered points must be re-arbitrated
    Reevaluate,
}

impl fmt::Display for OwnershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipStatus::Unknown => write!(f, "unknown"),
            OwnershipStatus::Pending => write!(f, "pending"),
            OwnershipStatus::PublishLocally => write!(f, "ok-publish-locally"),
            OwnershipStatus::ForwardToPeer => write!(f, "forward-to-client"),
            OwnershipStatus::Reevaluate => write!(f, "reevaluate"),
        }
    }
}

/// Events that can trigger ownership transitions
#[derive(Debug, Clone, PartialEq)]
pub enum OwnershipEvent {
    /// Claim sent to at least one peer
    ClaimBroadcast,
    /// No contest: no peers, already ours, or every reply was an ack
    ClaimWon,
    /// A peer holds the drone
    PeerOwns,
    /// The owner released the drone or disappeared
    OwnerReleased,
    /// Track archived or discarded
    Reset,
}

/// Result of a state transition attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionResult {
    /// Transition was valid and state changed (or stayed)
    Success(OwnershipStatus),
    /// Transition was invalid from current state
    Invalid {
        from: OwnershipStatus,
        event: OwnershipEvent,
    },
    /// A peer took over a drone this node had started publishing
    Demoted,
}

/// Ownership state for a single drone
#[derive(Debug, Default)]
pub struct OwnershipMachine {
    current: OwnershipStatus,
}

impl OwnershipMachine {
    /// Create a machine in the Unknown state
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current status
    pub fn status(&self) -> OwnershipStatus {
        self.current
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: OwnershipEvent) -> TransitionResult {
        // Losing a race after publishing started is reported separately
        if self.current == OwnershipStatus::PublishLocally && event == OwnershipEvent::PeerOwns {
            self.current = OwnershipStatus::ForwardToPeer;
            return TransitionResult::Demoted;
        }

        match self.get_next_state(&event) {
            Some(state) => {
                self.current = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn get_next_state(&self, event: &OwnershipEvent) -> Option<OwnershipStatus> {
        use OwnershipEvent::*;
        use OwnershipStatus::*;

        match (self.current, event) {
            // Reset is always allowed
            (_, Reset) => Some(Unknown),

            // Start of arbitration
            (Unknown | Reevaluate, ClaimBroadcast) => Some(Pending),

            // Settled in our favour
            (Unknown | Pending | Reevaluate | PublishLocally, ClaimWon) => Some(PublishLocally),

            // Settled in a peer's favour
            (Unknown | Pending | Reevaluate | ForwardToPeer, PeerOwns) => Some(ForwardToPeer),

            // Owner went away
            (ForwardToPeer | PublishLocally | Pending, OwnerReleased) => Some(Reevaluate),

            _ => None,
        }
    }
}

/// Check if a transition from one status to another is generally valid
pub fn is_valid_transition(from: OwnershipStatus, to: OwnershipStatus) -> bool {
    use OwnershipStatus::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Reset can be reached from anywhere
        (_, Unknown) => true,

        (Unknown | Reevaluate, Pending) => true,
        (Unknown | Pending | Reevaluate, PublishLocally) => true,
        (Unknown | Pending | Reevaluate | PublishLocally, ForwardToPeer) => true,
        (ForwardToPeer | PublishLocally | Pending, Reevaluate) => true,

        _ => false,
    }
}

/// One side's view of a contested drone
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimInputs {
    /// Timestamp of this side's first waypoint, zero or negative if unknown
    pub first_timestamp_ms: i64,
    /// Distance from this side to the drone, None if unknown
    pub distance_m: Option<f64>,
    /// UUID of this side
    pub node_id: String,
}

/// Outcome of a claim evaluated from one side
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimDecision {
    /// The evaluating node keeps the drone
    LocalWins { note: &'static str },
    /// The other node gets the drone
    RemoteWins { note: &'static str },
}

impl ClaimDecision {
    pub fn local_wins(&self) -> bool {
        matches!(self, ClaimDecision::LocalWins { .. })
    }
}

/// Decide a contested claim
///
/// Precedence: earlier first-waypoint timestamp, then shorter distance,
/// then the lexicographically lower node id. Unknown values skip their
/// rule. `decide_claim(a, b)` and `decide_claim(b, a)` always name the
/// same winner as long as the node ids differ.
pub fn decide_claim(mine: &ClaimInputs, theirs: &ClaimInputs) -> ClaimDecision {
    let (ts_mine, ts_theirs) = (mine.first_timestamp_ms, theirs.first_timestamp_ms);
    if ts_mine > 0 && ts_theirs > 0 && ts_mine != ts_theirs {
        return if ts_mine < ts_theirs {
            ClaimDecision::LocalWins { note: "saw it first" }
        } else {
            ClaimDecision::RemoteWins { note: "you saw it first" }
        };
    }

    let known = |d: Option<f64>| d.filter(|v| v.is_finite() && *v >= 0.0);
    if let (Some(d_mine), Some(d_theirs)) = (known(mine.distance_m), known(theirs.distance_m)) {
        if d_mine < d_theirs {
            return ClaimDecision::LocalWins { note: "closer to it" };
        }
        if d_theirs < d_mine {
            return ClaimDecision::RemoteWins { note: "you are closer" };
        }
    }

    if mine.node_id < theirs.node_id {
        ClaimDecision::LocalWins { note: "lower id" }
    } else {
        ClaimDecision::RemoteWins { note: "your id is lower" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(ts: i64, dist: Option<f64>, id: &str) -> ClaimInputs {
        ClaimInputs {
            first_timestamp_ms: ts,
            distance_m: dist,
            node_id: id.into(),
        }
    }

    #[test]
    fn test_initial_state() {
        let fsm = OwnershipMachine::new();
        assert_eq!(fsm.status(), OwnershipStatus::Unknown);
    }

    #[test]
    fn test_contested_claim_flow() {
        let mut fsm = OwnershipMachine::new();

        let result = fsm.process_event(OwnershipEvent::ClaimBroadcast);
        assert_eq!(result, TransitionResult::Success(OwnershipStatus::Pending));

        let result = fsm.process_event(OwnershipEvent::PeerOwns);
        assert_eq!(result, TransitionResult::Success(OwnershipStatus::ForwardToPeer));

        let result = fsm.process_event(OwnershipEvent::OwnerReleased);
        assert_eq!(result, TransitionResult::Success(OwnershipStatus::Reevaluate));

        let result = fsm.process_event(OwnershipEvent::ClaimBroadcast);
        assert_eq!(result, TransitionResult::Success(OwnershipStatus::Pending));

        let result = fsm.process_event(OwnershipEvent::ClaimWon);
        assert_eq!(result, TransitionResult::Success(OwnershipStatus::PublishLocally));
    }

    #[test]
    fn test_demotion_after_publishing() {
        let mut fsm = OwnershipMachine::new();
        fsm.process_event(OwnershipEvent::ClaimWon);
        assert_eq!(fsm.process_event(OwnershipEvent::PeerOwns), TransitionResult::Demoted);
        assert_eq!(fsm.status(), OwnershipStatus::ForwardToPeer);
    }

    #[test]
    fn test_invalid_transition() {
        let mut fsm = OwnershipMachine::new();

        // Nothing to release before a claim
        let result = fsm.process_event(OwnershipEvent::OwnerReleased);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.status(), OwnershipStatus::Unknown);

        fsm.process_event(OwnershipEvent::ClaimBroadcast);
        let result = fsm.process_event(OwnershipEvent::ClaimBroadcast);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
    }

    #[test]
    fn test_reset_from_any_state() {
        let mut fsm = OwnershipMachine::new();
        fsm.process_event(OwnershipEvent::ClaimWon);
        assert_eq!(
            fsm.process_event(OwnershipEvent::Reset),
            TransitionResult::Success(OwnershipStatus::Unknown)
        );
    }

    #[test]
    fn test_valid_transitions() {
        use OwnershipStatus::*;
        assert!(is_valid_transition(Pending, PublishLocally));
        assert!(is_valid_transition(PublishLocally, Unknown));
        assert!(!is_valid_transition(Unknown, Reevaluate));
        assert!(!is_valid_transition(ForwardToPeer, Pending));
    }

    #[test]
    fn test_earlier_timestamp_wins() {
        let a = inputs(100, Some(500.0), "bbb");
        let b = inputs(200, Some(10.0), "aaa");
        assert!(decide_claim(&a, &b).local_wins());
        assert!(!decide_claim(&b, &a).local_wins());
    }

    #[test]
    fn test_distance_breaks_timestamp_tie() {
        // Equal first-seen time, B is closer
        let a = inputs(100, Some(50.0), "aaa");
        let b = inputs(100, Some(30.0), "bbb");
        assert!(!decide_claim(&a, &b).local_wins());
        assert!(decide_claim(&b, &a).local_wins());
    }

    #[test]
    fn test_unknown_timestamp_falls_through() {
        let a = inputs(0, Some(10.0), "bbb");
        let b = inputs(100, Some(20.0), "aaa");
        assert!(decide_claim(&a, &b).local_wins());
        assert!(!decide_claim(&b, &a).local_wins());
    }

    #[test]
    fn test_uuid_breaks_full_tie() {
        let a = inputs(100, None, "0f6c");
        let b = inputs(100, Some(5.0), "a1b2");
        assert!(decide_claim(&a, &b).local_wins());
        assert!(!decide_claim(&b, &a).local_wins());
    }

    #[test]
    fn test_decision_is_symmetric() {
        let timestamps = [0, 100, 200];
        let distances = [None, Some(10.0), Some(30.0), Some(f64::NAN)];
        for &ts_a in &timestamps {
            for &ts_b in &timestamps {
                for &d_a in &distances {
                    for &d_b in &distances {
                        let a = inputs(ts_a, d_a, "node-a");
                        let b = inputs(ts_b, d_b, "node-b");
                        assert_ne!(
                            decide_claim(&a, &b).local_wins(),
                            decide_claim(&b, &a).local_wins(),
                            "disagreement for {:?} vs {:?}",
                            a,
                            b
                        );
                    }
                }
            }
        }
    }
}
