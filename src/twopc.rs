use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A unique identifier for a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalTransactionId(pub u64);

/// Identifies one resource manager's participation in a global transaction.
///
/// Branches of the same transaction share the global id and differ in the
/// qualifier, which is minted by the coordinator starting at `1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchId {
    pub global_id: GlobalTransactionId,
    pub qualifier: u16,
}

impl BranchId {
    pub const FORMAT_ID: i32 = 108;

    pub fn new(global_id: GlobalTransactionId, qualifier: u16) -> Self {
        Self {
            global_id,
            qualifier,
        }
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}.{}", self.global_id.0, self.qualifier)
    }
}

/// Flags of [`ResourceManager::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartFlag {
    /// A new branch.
    NoFlags,
    /// Joins a branch already started on the same resource manager.
    Join,
}

/// Flags of [`ResourceManager::end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndFlag {
    Success,
    /// The work done under the branch must be rolled back.
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverFlag {
    NoFlags,
    StartScan,
    EndScan,
    /// Single pass: start and end the scan in one call.
    StartEndScan,
}

/// Outcome of phase 1 for one branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepareVote {
    Ok,
    /// The branch made no durable changes and takes no part in phase 2.
    ReadOnly,
}

/// Error raised by a resource manager call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceError {
    /// The branch was rolled back by the resource manager itself.
    #[error("branch rolled back by resource manager: {0}")]
    RolledBack(String),
    /// The call was invalid for the branch state the resource manager holds.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("resource manager failure: {0}")]
    Failed(String),
}

/// XA-style resource manager protocol.
///
/// The coordinator drives every enlisted resource manager through
/// `start` → `end` → (`prepare`) → `commit` | `rollback`. The coordinator is
/// an initiator of this protocol, it is never a resource manager itself.
///
/// Implementations must be `Send` and `Sync`, calls for one branch may be
/// issued from a per-resource executor thread.
pub trait ResourceManager: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Identity of the physical resource manager behind this handle.
    ///
    /// Two handles with the same id share one branch: the second one joins
    /// the branch of the first instead of minting a new one.
    fn resource_manager_id(&self) -> &str;

    /// Begins work on behalf of `branch`.
    ///
    /// # Arguments
    ///
    /// * `branch` - The branch identifier minted by the coordinator.
    /// * `flags` - [`StartFlag::Join`] when the branch was started by another
    ///   handle of the same resource manager.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceError` if the resource manager refuses the branch.
    fn start(&self, branch: &BranchId, flags: StartFlag) -> Result<(), ResourceError>;

    /// Ends the work done on behalf of `branch`.
    fn end(&self, branch: &BranchId, flags: EndFlag) -> Result<(), ResourceError>;

    /// Phase 1: asks the resource manager to prepare `branch`.
    ///
    /// # Returns
    ///
    /// Returns `Ok(PrepareVote::Ok)` if the branch is prepared and must be
    /// committed or rolled back later, or `Ok(PrepareVote::ReadOnly)` if it
    /// made no durable changes.
    ///
    /// # Errors
    ///
    /// Returns a `ResourceError` if the branch cannot be prepared. The branch
    /// is then presumed rolled back.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use thoth::{BranchId, EndFlag, PrepareVote, ResourceError, ResourceManager, StartFlag};
    ///
    /// struct ReadOnlyResource;
    ///
    /// impl ResourceManager for ReadOnlyResource {
    ///     fn name(&self) -> &str { "reporting" }
    ///     fn resource_manager_id(&self) -> &str { "reporting-db" }
    ///     fn start(&self, _: &BranchId, _: StartFlag) -> Result<(), ResourceError> { Ok(()) }
    ///     fn end(&self, _: &BranchId, _: EndFlag) -> Result<(), ResourceError> { Ok(()) }
    ///     fn prepare(&self, _: &BranchId) -> Result<PrepareVote, ResourceError> {
    ///         // nothing was written under this branch
    ///         Ok(PrepareVote::ReadOnly)
    ///     }
    ///     fn commit(&self, _: &BranchId, _: bool) -> Result<(), ResourceError> { Ok(()) }
    ///     fn rollback(&self, _: &BranchId) -> Result<(), ResourceError> { Ok(()) }
    /// }
    /// ```
    fn prepare(&self, branch: &BranchId) -> Result<PrepareVote, ResourceError>;

    /// Phase 2: commits `branch`. `one_phase` is set for the coordinating
    /// branch, which is never prepared.
    fn commit(&self, branch: &BranchId, one_phase: bool) -> Result<(), ResourceError>;

    /// Phase 2: rolls back `branch`.
    fn rollback(&self, branch: &BranchId) -> Result<(), ResourceError>;

    fn is_same_resource_manager(&self, other: &dyn ResourceManager) -> bool {
        self.resource_manager_id() == other.resource_manager_id()
    }

    /// Single-phase-only resources are always ordered first so they become
    /// the coordinating branch.
    fn is_single_phase_only(&self) -> bool {
        false
    }

    /// Returns `Ok(false)` when the resource manager does not support timeouts.
    fn set_timeout(&self, seconds: u64) -> Result<bool, ResourceError> {
        let _ = seconds;
        Ok(false)
    }

    /// Lists prepared branches the resource manager still holds.
    fn recover(&self, flags: RecoverFlag) -> Result<Vec<BranchId>, ResourceError> {
        let _ = flags;
        Ok(Vec::new())
    }
}

/// Pointer identity of two resource handles.
pub fn same_resource(a: &Arc<dyn ResourceManager>, b: &Arc<dyn ResourceManager>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
