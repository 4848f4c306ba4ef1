//! Pure routing after a phase's fan-in
//!
//! No I/O and no async: given the phase, the merged decision and how many
//! times the phase has already been retried, return where the workflow goes.
//! Routing from a side state is reported as `Invalid`, never a panic.

use keel_core::{Phase, RoutingDecision};

/// Where the workflow goes next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Phase passed; move to the next one
    Advance { from: Phase, to: Phase },
    /// Re-run the phase from its start
    Retry { phase: Phase, iteration: u32 },
    /// Hand over to a human
    Escalate { from: Phase, forced: bool },
    /// Terminal failure
    Abort { from: Phase },
    /// Routing was requested from a state that has no routing
    Invalid { reason: String },
}

impl Transition {
    /// Phase the workflow is in after the transition
    pub fn target(&self) -> Option<Phase> {
        match self {
            Self::Advance { to, .. } => Some(*to),
            Self::Retry { phase, .. } => Some(*phase),
            Self::Escalate { .. } => Some(Phase::HumanEscalation),
            Self::Abort { .. } => Some(Phase::Aborted),
            Self::Invalid { .. } => None,
        }
    }

    /// Decision actually taken (a forced escalation reports `Escalate`)
    pub fn decision(&self) -> Option<RoutingDecision> {
        match self {
            Self::Advance { .. } => Some(RoutingDecision::Continue),
            Self::Retry { .. } => Some(RoutingDecision::Retry),
            Self::Escalate { .. } => Some(RoutingDecision::Escalate),
            Self::Abort { .. } => Some(RoutingDecision::Abort),
            Self::Invalid { .. } => None,
        }
    }
}

/// Route a merged decision
///
/// `retries_so_far` is the number of retries the phase has already had. Once
/// it reaches `max_retries`, a further `Retry` is forced to `Escalate`.
pub fn route(
    phase: Phase,
    decision: RoutingDecision,
    retries_so_far: u32,
    max_retries: u32,
) -> Transition {
    if !phase.is_pipeline() {
        return Transition::Invalid {
            reason: format!("cannot route {} from {}", decision, phase),
        };
    }

    match decision {
        RoutingDecision::Continue => Transition::Advance {
            from: phase,
            to: phase.next(),
        },
        RoutingDecision::Retry if retries_so_far >= max_retries => Transition::Escalate {
            from: phase,
            forced: true,
        },
        RoutingDecision::Retry => Transition::Retry {
            phase,
            iteration: retries_so_far + 1,
        },
        RoutingDecision::Escalate => Transition::Escalate {
            from: phase,
            forced: false,
        },
        RoutingDecision::Abort => Transition::Abort { from: phase },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continue_advances() {
        assert_eq!(
            route(Phase::Validation, RoutingDecision::Continue, 0, 3),
            Transition::Advance {
                from: Phase::Validation,
                to: Phase::Implementation
            }
        );
        assert_eq!(
            route(Phase::Completion, RoutingDecision::Continue, 0, 3).target(),
            Some(Phase::Completed)
        );
    }

    #[test]
    fn test_retry_increments_iteration() {
        assert_eq!(
            route(Phase::Verification, RoutingDecision::Retry, 1, 3),
            Transition::Retry {
                phase: Phase::Verification,
                iteration: 2
            }
        );
    }

    #[test]
    fn test_retry_forced_to_escalate_at_max() {
        let transition = route(Phase::Validation, RoutingDecision::Retry, 3, 3);
        assert_eq!(
            transition,
            Transition::Escalate {
                from: Phase::Validation,
                forced: true
            }
        );
        assert_eq!(transition.decision(), Some(RoutingDecision::Escalate));
        assert_eq!(transition.target(), Some(Phase::HumanEscalation));
    }

    #[test]
    fn test_max_zero_never_retries() {
        assert!(matches!(
            route(Phase::Planning, RoutingDecision::Retry, 0, 0),
            Transition::Escalate { forced: true, .. }
        ));
    }

    #[test]
    fn test_abort_and_escalate() {
        assert_eq!(
            route(Phase::Implementation, RoutingDecision::Abort, 0, 3).target(),
            Some(Phase::Aborted)
        );
        assert_eq!(
            route(Phase::Planning, RoutingDecision::Escalate, 0, 3),
            Transition::Escalate {
                from: Phase::Planning,
                forced: false
            }
        );
    }

    #[test]
    fn test_side_states_are_invalid() {
        for phase in [Phase::HumanEscalation, Phase::Aborted, Phase::Completed] {
            let transition = route(phase, RoutingDecision::Continue, 0, 3);
            assert!(matches!(transition, Transition::Invalid { .. }));
            assert_eq!(transition.target(), None);
        }
    }
}
