//! Auto-sort suppression.
//!
//! While the user is dragging items into a manual order, automatic sorting
//! must not reshuffle the list under them. A sort requested mid-drag is
//! remembered and runs once the drag ends.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortState {
    #[default]
    Idle,
    UserReordering {
        /// An auto-sort was requested during the drag.
        deferred: bool,
    },
    AutoSorting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortEvent {
    BeginUserReorder,
    EndUserReorder,
    AutoSortRequested,
    AutoSortFinished,
}

/// What the caller should do after feeding an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortAction {
    /// Nothing to do.
    None,
    /// Run the auto-sort now, then send `AutoSortFinished`.
    RunAutoSort,
    /// The request was parked until the current drag ends.
    Deferred,
}

#[derive(Debug, Clone, Default)]
pub struct SortMachine {
    state: SortState,
}

impl SortMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SortState {
        self.state
    }

    pub fn is_user_reordering(&self) -> bool {
        matches!(self.state, SortState::UserReordering { .. })
    }

    pub fn handle(&mut self, event: SortEvent) -> SortAction {
        use SortEvent::*;
        use SortState::*;

        let (next, action) = match (self.state, event) {
            (Idle, BeginUserReorder) | (AutoSorting, BeginUserReorder) => {
                (UserReordering { deferred: false }, SortAction::None)
            }
            (Idle, AutoSortRequested) => (AutoSorting, SortAction::RunAutoSort),
            (UserReordering { .. }, AutoSortRequested) => {
                (UserReordering { deferred: true }, SortAction::Deferred)
            }
            (UserReordering { deferred: true }, EndUserReorder) => {
                (AutoSorting, SortAction::RunAutoSort)
            }
            (UserReordering { deferred: false }, EndUserReorder) => (Idle, SortAction::None),
            (AutoSorting, AutoSortFinished) => (Idle, SortAction::None),
            (state, _) => (state, SortAction::None),
        };
        self.state = next;
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_sort_runs_when_idle() {
        let mut fsm = SortMachine::new();
        assert_eq!(fsm.handle(SortEvent::AutoSortRequested), SortAction::RunAutoSort);
        assert_eq!(fsm.state(), SortState::AutoSorting);
        fsm.handle(SortEvent::AutoSortFinished);
        assert_eq!(fsm.state(), SortState::Idle);
    }

    #[test]
    fn test_auto_sort_deferred_during_drag() {
        let mut fsm = SortMachine::new();
        fsm.handle(SortEvent::BeginUserReorder);
        assert_eq!(fsm.handle(SortEvent::AutoSortRequested), SortAction::Deferred);
        assert_eq!(fsm.handle(SortEvent::AutoSortRequested), SortAction::Deferred);
        assert_eq!(fsm.handle(SortEvent::EndUserReorder), SortAction::RunAutoSort);
        assert_eq!(fsm.handle(SortEvent::AutoSortFinished), SortAction::None);
        assert_eq!(fsm.state(), SortState::Idle);
    }

    #[test]
    fn test_drag_without_request_returns_to_idle() {
        let mut fsm = SortMachine::new();
        fsm.handle(SortEvent::BeginUserReorder);
        assert!(fsm.is_user_reordering());
        assert_eq!(fsm.handle(SortEvent::EndUserReorder), SortAction::None);
        assert_eq!(fsm.state(), SortState::Idle);
    }

    #[test]
    fn test_stray_events_are_ignored() {
        let mut fsm = SortMachine::new();
        assert_eq!(fsm.handle(SortEvent::EndUserReorder), SortAction::None);
        assert_eq!(fsm.handle(SortEvent::AutoSortFinished), SortAction::None);
        assert_eq!(fsm.state(), SortState::Idle);

        fsm.handle(SortEvent::AutoSortRequested);
        assert_eq!(fsm.handle(SortEvent::AutoSortRequested), SortAction::None);
        assert_eq!(fsm.state(), SortState::AutoSorting);
    }
}
