use crate::model::TransferState;

/// The events that drive a record's state machine (spec §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Start,
    Pause,
    Resume,
    UnitSucceeded,
    AllUnitsSucceeded,
    UnitFailed,
    Cancel,
    Remove,
}

/// Applies spec.md §4.4's closed transition table to a single state. Returns `None` for any
/// `(state, event)` pair the table does not name, which callers treat as a no-op rather than an
/// error: an event arriving for a state it doesn't apply to (e.g. `Pause` on an already-`Paused`
/// transfer) is expected under concurrent delivery, not a protocol violation.
pub fn transition(state: TransferState, event: TransferEvent) -> Option<TransferState> {
    use TransferEvent::*;
    use TransferState::*;

    match (state, event) {
        (Pending, Start) => Some(InProgress),
        (Pending, Pause) => Some(Paused),
        (Pending, Cancel) => Some(Canceled),
        (Pending, Remove) => Some(Deleted),

        (InProgress, Pause) => Some(Paused),
        (InProgress, UnitFailed) => Some(Failed),
        (InProgress, AllUnitsSucceeded) => Some(Complete),
        (InProgress, Cancel) => Some(Canceled),
        (InProgress, UnitSucceeded) => None,

        (Paused, Resume) => Some(InProgress),
        (Paused, Cancel) => Some(Canceled),
        (Paused, Remove) => Some(Deleted),

        (Failed, Resume) => Some(InProgress),
        (Failed, Cancel) => Some(Canceled),
        (Failed, Remove) => Some(Deleted),

        (Complete, Remove) => Some(Deleted),
        (Canceled, Remove) => Some(Deleted),

        _ => None,
    }
}

/// Derives a `BlobTransfer`'s state from the states of its `BlockTransfer` children, applied
/// after each child transition lands (spec §4.4: "a parent is `complete` once every child is
/// `complete`; a parent is `failed` once any child is `failed` and none remain retryable").
pub fn derive_parent_state(children: &[TransferState]) -> Option<TransferState> {
    if children.is_empty() {
        return None;
    }

    if children.iter().any(|s| *s == TransferState::Failed) {
        return Some(TransferState::Failed);
    }

    if children.iter().all(|s| *s == TransferState::Complete) {
        return Some(TransferState::Complete);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_moves_pending_to_in_progress() {
        assert_eq!(
            transition(TransferState::Pending, TransferEvent::Start),
            Some(TransferState::InProgress)
        );
    }

    #[test]
    fn pause_only_applies_while_in_progress() {
        assert_eq!(
            transition(TransferState::InProgress, TransferEvent::Pause),
            Some(TransferState::Paused)
        );
        assert_eq!(transition(TransferState::Complete, TransferEvent::Pause), None);
    }

    #[test]
    fn resume_applies_to_paused_and_failed() {
        assert_eq!(
            transition(TransferState::Paused, TransferEvent::Resume),
            Some(TransferState::InProgress)
        );
        assert_eq!(
            transition(TransferState::Failed, TransferEvent::Resume),
            Some(TransferState::InProgress)
        );
    }

    #[test]
    fn terminal_states_only_accept_remove() {
        for state in [TransferState::Complete, TransferState::Canceled] {
            assert_eq!(
                transition(state, TransferEvent::Remove),
                Some(TransferState::Deleted)
            );
            assert_eq!(transition(state, TransferEvent::Start), None);
        }
    }

    #[test]
    fn parent_state_follows_children() {
        assert_eq!(
            derive_parent_state(&[TransferState::Complete, TransferState::Complete]),
            Some(TransferState::Complete)
        );
        assert_eq!(
            derive_parent_state(&[TransferState::Complete, TransferState::InProgress]),
            None
        );
        assert_eq!(
            derive_parent_state(&[TransferState::Complete, TransferState::Failed]),
            Some(TransferState::Failed)
        );
        assert_eq!(derive_parent_state(&[]), None);
    }
}
