//! Two-phase commit coordination.
//!
//! Two variants drive the same state machine ([`TransactionState::next`]):
//! [`LocalCoordinator`] keeps its state behind one lock and calls every
//! resource manager in place, [`ThreadedCoordinator`] swaps its state
//! atomically and may fan resource calls out to per-resource executors.

mod local;
mod state;
mod threaded;

use std::sync::Arc;
use std::time::Duration;

use log::error;

use crate::errors::{Result, ThothError};
use crate::twopc::{EndFlag, GlobalTransactionId, ResourceError, ResourceManager};

pub use local::LocalCoordinator;
pub use state::{TransactionState, TransitionEvent};
pub use threaded::ThreadedCoordinator;

/// Outcome reported to [`Synchronization::after_completion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Committed,
    RolledBack,
}

/// Callback around the completion of a global transaction.
pub trait Synchronization: Send + Sync {
    /// Runs before the commit decision, only while the transaction is active.
    /// An error marks the transaction rollback-only.
    fn before_completion(&self) -> Result<()> {
        Ok(())
    }

    /// Runs once the transaction reached a terminal state. Errors are logged.
    fn after_completion(&self, status: CompletionStatus) -> Result<()>;
}

/// Coordinator of one global transaction.
///
/// All methods take `&self`: a coordinator is shared between the thread
/// that owns the unit of work and threads that wait on it, which may force
/// an abandoned transaction to roll back.
pub trait TransactionCoordinator: Send + Sync {
    fn global_id(&self) -> GlobalTransactionId;

    /// Current state. Observing an expired deadline while active marks the
    /// transaction rollback-only.
    fn state(&self) -> TransactionState;

    /// Whether the deadline expired while the transaction was active.
    fn is_timed_out(&self) -> bool;

    fn timeout(&self) -> Duration;

    /// Associates `resource` with the transaction.
    ///
    /// A handle whose resource manager already has a branch joins it,
    /// otherwise a new branch is started.
    ///
    /// # Errors
    ///
    /// * `ThothError::Configuration` - the handle is enlisted, or was delisted before.
    /// * `ThothError::RollbackOnly` - the transaction is marked rollback-only.
    /// * `ThothError::ResourceFailure` - `start` failed; the transaction is
    ///   then marked rollback-only.
    fn enlist(&self, resource: Arc<dyn ResourceManager>) -> Result<()>;

    fn is_enlisted(&self, resource: &Arc<dyn ResourceManager>) -> bool;

    /// Handles currently enlisted, in enlistment order.
    fn enlisted_resources(&self) -> Vec<Arc<dyn ResourceManager>>;

    /// Ends the work of `resource` on its branch.
    ///
    /// # Returns
    ///
    /// `Ok(false)` if the resource manager refused; the transaction is then
    /// marked rollback-only.
    fn delist(&self, resource: &Arc<dyn ResourceManager>, flag: EndFlag) -> Result<bool>;

    /// Runs the prepare and commit phases.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::RollbackOnly` when the transaction rolled back
    /// instead of committing, or the first rollback failure.
    fn commit(&self) -> Result<()>;

    /// Rolls back every branch, attempting all of them even when some fail.
    fn rollback(&self) -> Result<()>;

    fn set_rollback_only(&self) -> Result<()>;

    fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()>;

    /// Number of branches in the commit list.
    fn branch_count(&self) -> usize;

    /// Commit failures of non-coordinating branches after the decision to commit.
    fn late_commit_failures(&self) -> Vec<ResourceError>;
}

pub(crate) fn rollback_only_error(timed_out: bool) -> ThothError {
    let mut message = String::from("transaction is marked rollback only");
    if timed_out {
        message.push_str(" due to timeout");
    }
    ThothError::RollbackOnly { message, timed_out }
}

pub(crate) fn rolled_back_instead(timed_out: bool, cause: Option<&str>) -> ThothError {
    let mut message = String::from("commit did not succeed. Rolled back instead.");
    if timed_out {
        message.push_str(" rollback was due to timeout");
    }
    if let Some(cause) = cause {
        message.push_str(" cause: ");
        message.push_str(cause);
    }
    ThothError::RollbackOnly { message, timed_out }
}

/// Runs every `before_completion`, stopping at the first failure.
pub(crate) fn before_completion(synchronizations: &[Arc<dyn Synchronization>]) -> Result<()> {
    for synchronization in synchronizations {
        if let Err(e) = synchronization.before_completion() {
            error!(
                "The synchronization before completion failed. marked for rollback: {}",
                e
            );
            return Err(e);
        }
    }
    Ok(())
}

pub(crate) fn after_completion(
    synchronizations: &[Arc<dyn Synchronization>],
    status: CompletionStatus,
) {
    for synchronization in synchronizations {
        if let Err(e) = synchronization.after_completion(status) {
            error!("error calling after completion on synchronization: {}", e);
        }
    }
}

/// Remaining whole seconds before `deadline`, at least one.
pub(crate) fn remaining_seconds(deadline: std::time::Instant) -> u64 {
    deadline
        .saturating_duration_since(std::time::Instant::now())
        .as_secs()
        .max(1)
}
