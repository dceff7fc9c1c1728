use crate::twopc::EndFlag;

/// 2PC state of a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TransactionState {
    Active = 0,
    MarkedRollbackOnly = 1,
    Preparing = 2,
    Committing = 3,
    Committed = 4,
    RollingBack = 5,
    RolledBack = 6,
}

/// Inputs of the [`TransactionState::next`] transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    SetRollbackOnly,
    TimedOut,
    /// A start, end or synchronization call failed.
    ResourceFailure,
    /// Commit was requested with this many branches enlisted.
    BeginCommit { branches: usize },
    AllPrepared,
    PrepareFailed,
    AllCommitted,
    /// The coordinating branch failed to commit; the others can still be aborted.
    CoordinatorCommitFailed,
    BeginRollback,
    RollbackFinished,
}

impl TransactionState {
    /// Applies `event`, returning `None` when the state does not accept it.
    pub fn next(self, event: TransitionEvent) -> Option<TransactionState> {
        use TransactionState::*;
        use TransitionEvent::*;
        match (self, event) {
            (Active | MarkedRollbackOnly, SetRollbackOnly | TimedOut | ResourceFailure) => {
                Some(MarkedRollbackOnly)
            }
            (Active, BeginCommit { branches: 0 }) => Some(Committed),
            (Active, BeginCommit { branches: 1 }) => Some(Committing),
            (Active, BeginCommit { .. }) => Some(Preparing),
            (MarkedRollbackOnly, BeginCommit { .. }) => Some(RollingBack),
            (Preparing, AllPrepared) => Some(Committing),
            (Preparing, PrepareFailed) => Some(RollingBack),
            (Committing, AllCommitted) => Some(Committed),
            (Committing, CoordinatorCommitFailed) => Some(RollingBack),
            (Active | MarkedRollbackOnly | Preparing | RollingBack, BeginRollback) => {
                Some(RollingBack)
            }
            (RollingBack, RollbackFinished) => Some(RolledBack),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::RolledBack)
    }

    /// Whether the transaction can still do work.
    pub fn is_active(self) -> bool {
        self == TransactionState::Active
    }

    /// Whether the outcome is or will be a rollback.
    pub fn is_rolling_back(self) -> bool {
        matches!(
            self,
            TransactionState::MarkedRollbackOnly
                | TransactionState::RollingBack
                | TransactionState::RolledBack
        )
    }

    /// Flag passed to `end` when branches are delisted in this state.
    pub fn end_flag(self) -> EndFlag {
        match self {
            TransactionState::Active => EndFlag::Success,
            _ => EndFlag::Fail,
        }
    }

    pub(crate) fn from_u8(value: u8) -> TransactionState {
        match value {
            0 => TransactionState::Active,
            1 => TransactionState::MarkedRollbackOnly,
            2 => TransactionState::Preparing,
            3 => TransactionState::Committing,
            4 => TransactionState::Committed,
            5 => TransactionState::RollingBack,
            _ => TransactionState::RolledBack,
        }
    }
}
