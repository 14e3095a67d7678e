//! Transaction state machine (§4.4): the legal-transition table a
//! [`super::handle::TrxHandleMaster`] walks from `Executing` to a terminal
//! state.

/// ```text
/// Executing --*--> Replicating --> Certifying --> Applying --> Committing --> Committed
///    |  \--*--> MustAbort --> Aborting --> RolledBack
///    \----*--> RolledBack
/// Replicating --*--> MustAbort | MustCertAndReplay
/// Certifying --> Aborting (cert fail) | MustReplayAm | MustReplayCm | MustReplay
/// MustCertAndReplay / MustReplayAm / MustReplayCm / MustReplay --> Replaying
/// Replaying --> Applying | Committing | Committed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrxState {
    Executing,
    MustAbort,
    Aborting,
    Replicating,
    Certifying,
    MustCertAndReplay,
    MustReplayAm,
    MustReplayCm,
    MustReplay,
    Replaying,
    Applying,
    Committing,
    Committed,
    RolledBack,
}

impl TrxState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TrxState::Committed | TrxState::RolledBack)
    }
}

/// Every edge the FSM permits. Checked linearly: the table is small and
/// fixed at compile time, so a `Vec`/`HashSet` of legal successors per
/// state would just be this table with extra allocation.
const TRANSITIONS: &[(TrxState, TrxState)] = &[
    (TrxState::Executing, TrxState::Replicating),
    (TrxState::Executing, TrxState::MustAbort),
    (TrxState::Executing, TrxState::RolledBack),
    (TrxState::Replicating, TrxState::Certifying),
    (TrxState::Replicating, TrxState::MustAbort),
    (TrxState::Replicating, TrxState::MustCertAndReplay),
    (TrxState::Certifying, TrxState::Applying),
    (TrxState::Certifying, TrxState::Aborting),
    (TrxState::Certifying, TrxState::MustReplayAm),
    (TrxState::Certifying, TrxState::MustReplayCm),
    (TrxState::Certifying, TrxState::MustReplay),
    (TrxState::Applying, TrxState::Committing),
    (TrxState::Committing, TrxState::Committed),
    (TrxState::MustAbort, TrxState::Aborting),
    (TrxState::Aborting, TrxState::RolledBack),
    (TrxState::MustCertAndReplay, TrxState::Replaying),
    (TrxState::MustReplayAm, TrxState::Replaying),
    (TrxState::MustReplayCm, TrxState::Replaying),
    (TrxState::MustReplay, TrxState::Replaying),
    (TrxState::Replaying, TrxState::Applying),
    (TrxState::Replaying, TrxState::Committing),
    (TrxState::Replaying, TrxState::Committed),
];

pub fn is_legal_transition(from: TrxState, to: TrxState) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executing_to_replicating_is_legal() {
        assert!(is_legal_transition(TrxState::Executing, TrxState::Replicating));
    }

    #[test]
    fn committed_is_terminal_and_has_no_successors() {
        assert!(TrxState::Committed.is_terminal());
        assert!(!is_legal_transition(TrxState::Committed, TrxState::Executing));
    }

    #[test]
    fn cannot_skip_certification() {
        assert!(!is_legal_transition(TrxState::Replicating, TrxState::Applying));
    }

    #[test]
    fn replay_paths_reconverge_on_replaying() {
        assert!(is_legal_transition(TrxState::MustReplayAm, TrxState::Replaying));
        assert!(is_legal_transition(TrxState::MustReplayCm, TrxState::Replaying));
        assert!(is_legal_transition(TrxState::MustReplay, TrxState::Replaying));
        assert!(is_legal_transition(TrxState::Replaying, TrxState::Committing));
    }
}
