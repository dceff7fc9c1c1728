use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::branch::{Branch, BranchRegistry, EnlistPlan};
use crate::errors::{Result, ThothError};
use crate::twopc::{
    EndFlag, GlobalTransactionId, PrepareVote, ResourceError, ResourceManager, StartFlag,
};

use super::{
    CompletionStatus, Synchronization, TransactionCoordinator, TransactionState, TransitionEvent,
    after_completion, before_completion, remaining_seconds, rollback_only_error,
    rolled_back_instead,
};

struct LocalInner {
    state: TransactionState,
    timed_out: bool,
    registry: BranchRegistry,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    rollback_cause: Option<String>,
    late_commit_failures: Vec<ResourceError>,
}

impl LocalInner {
    fn apply(&mut self, event: TransitionEvent) {
        match self.state.next(event) {
            Some(next) => {
                debug!("transaction {:?} -> {:?} on {:?}", self.state, next, event);
                self.state = next;
            }
            None => debug!("{:?} ignored in state {:?}", event, self.state),
        }
    }
}

/// Coordinator driven by the thread that owns the unit of work.
///
/// Every resource call runs synchronously on the calling thread. The lock
/// is released around synchronization callbacks so they may query the
/// coordinator.
pub struct LocalCoordinator {
    global_id: GlobalTransactionId,
    timeout: Duration,
    deadline: Instant,
    inner: Mutex<LocalInner>,
}

impl LocalCoordinator {
    pub fn new(global_id: GlobalTransactionId, timeout: Duration) -> Self {
        Self {
            global_id,
            timeout,
            deadline: Instant::now() + timeout,
            inner: Mutex::new(LocalInner {
                state: TransactionState::Active,
                timed_out: false,
                registry: BranchRegistry::new(global_id),
                synchronizations: Vec::new(),
                rollback_cause: None,
                late_commit_failures: Vec::new(),
            }),
        }
    }

    fn check_timeout(&self, inner: &mut LocalInner) -> bool {
        if inner.state == TransactionState::Active && Instant::now() > self.deadline {
            warn!("Transaction {:?} marked for rollback due to timeout", self.global_id);
            inner.apply(TransitionEvent::TimedOut);
            inner.timed_out = true;
        }
        inner.timed_out
    }

    fn pre_enlist_check(&self, inner: &mut LocalInner) -> Result<()> {
        self.check_timeout(inner);
        match inner.state {
            TransactionState::Active => Ok(()),
            TransactionState::MarkedRollbackOnly => Err(rollback_only_error(inner.timed_out)),
            state => Err(ThothError::InvalidState {
                action: "enlist",
                state,
            }),
        }
    }

    fn enlist_failed(
        inner: &mut LocalInner,
        resource: &Arc<dyn ResourceManager>,
        cause: ResourceError,
    ) -> ThothError {
        warn!("Unable to enlist resource {}: {}", resource.name(), cause);
        inner.apply(TransitionEvent::ResourceFailure);
        ThothError::resource(format!("Unable to enlist resource {}", resource.name()), cause)
    }

    /// Ends every active handle with the flag of the current state.
    fn best_effort_end(inner: &mut LocalInner) {
        let flag = inner.state.end_flag();
        for enlistment in inner.registry.take_active() {
            if let Err(e) = enlistment.branch.end(&enlistment.resource, flag).wait() {
                error!(
                    "could not call end on resource {}: {}",
                    enlistment.resource.name(),
                    e
                );
                inner.apply(TransitionEvent::ResourceFailure);
            }
        }
    }

    /// Phase 1 for every branch but the coordinating one.
    fn prepare(inner: &mut LocalInner) {
        let branches: Vec<Arc<Branch>> = inner.registry.branches().iter().skip(1).cloned().collect();
        for branch in branches {
            match branch.prepare().wait() {
                Ok(PrepareVote::Ok) => {}
                Ok(PrepareVote::ReadOnly) => {
                    debug!("{:?} is read only", branch);
                    inner.registry.remove_branch(branch.id());
                }
                Err(e) => {
                    error!("Error preparing {:?}. Rolling back instead: {}", branch, e);
                    // presumed rolled back by the resource manager
                    inner.registry.remove_branch(branch.id());
                    inner.rollback_cause = Some(e.to_string());
                    inner.apply(TransitionEvent::PrepareFailed);
                    return;
                }
            }
        }
        inner.apply(TransitionEvent::AllPrepared);
    }

    fn commit_resources(inner: &mut LocalInner) -> Result<()> {
        let branches: Vec<Arc<Branch>> = inner.registry.branches().to_vec();
        for (i, branch) in branches.iter().enumerate() {
            if let Err(e) = branch.commit(i == 0).wait() {
                error!(
                    "Unexpected exception committing {}; continuing to commit: {}",
                    branch.resource().name(),
                    e
                );
                if i == 0 {
                    inner.rollback_cause = Some(e.to_string());
                    inner.apply(TransitionEvent::CoordinatorCommitFailed);
                    return Self::rollback_resources(inner);
                }
                inner.late_commit_failures.push(e);
            }
        }
        inner.apply(TransitionEvent::AllCommitted);
        Ok(())
    }

    fn rollback_resources(inner: &mut LocalInner) -> Result<()> {
        inner.apply(TransitionEvent::BeginRollback);
        let mut cause = None;
        for branch in inner.registry.branches() {
            if let Err(e) = branch.rollback().wait() {
                error!(
                    "Unexpected exception rolling back {}; continuing with rollback: {}",
                    branch.resource().name(),
                    e
                );
                if cause.is_none() {
                    cause = Some(ThothError::resource(
                        format!("Unexpected exception rolling back {}", branch.resource().name()),
                        e,
                    ));
                }
            }
        }
        inner.apply(TransitionEvent::RollbackFinished);
        cause.map_or(Ok(()), Err)
    }
}

impl TransactionCoordinator for LocalCoordinator {
    fn global_id(&self) -> GlobalTransactionId {
        self.global_id
    }

    fn state(&self) -> TransactionState {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        inner.state
    }

    fn is_timed_out(&self) -> bool {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner)
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn enlist(&self, resource: Arc<dyn ResourceManager>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.pre_enlist_check(&mut inner)?;
        match inner.registry.plan_enlist(&resource)? {
            EnlistPlan::Join(branch) => {
                let started = branch.start(&resource, StartFlag::Join);
                if let Err(e) = started.wait() {
                    return Err(Self::enlist_failed(&mut inner, &resource, e));
                }
                inner.registry.add_joined(resource, branch, started);
            }
            EnlistPlan::New(id) => {
                if let Err(e) = resource.set_timeout(remaining_seconds(self.deadline)) {
                    debug!("{} refused a timeout: {}", resource.name(), e);
                }
                let branch = Arc::new(Branch::new(id, Arc::clone(&resource), None));
                let started = branch.start(&resource, StartFlag::NoFlags);
                if let Err(e) = started.wait() {
                    return Err(Self::enlist_failed(&mut inner, &resource, e));
                }
                inner.registry.add_branch(branch, started);
            }
        }
        Ok(())
    }

    fn is_enlisted(&self, resource: &Arc<dyn ResourceManager>) -> bool {
        self.inner.lock().registry.is_enlisted(resource)
    }

    fn enlisted_resources(&self) -> Vec<Arc<dyn ResourceManager>> {
        let inner = self.inner.lock();
        inner
            .registry
            .active()
            .iter()
            .map(|e| Arc::clone(&e.resource))
            .collect()
    }

    fn delist(&self, resource: &Arc<dyn ResourceManager>, flag: EndFlag) -> Result<bool> {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        let flag = match inner.state {
            TransactionState::Active => {
                if flag == EndFlag::Fail {
                    inner.apply(TransitionEvent::SetRollbackOnly);
                }
                flag
            }
            TransactionState::MarkedRollbackOnly => EndFlag::Fail,
            state => {
                return Err(ThothError::InvalidState {
                    action: "delist",
                    state,
                });
            }
        };
        let enlistment = inner.registry.remove_active(resource)?;
        match enlistment.branch.end(&enlistment.resource, flag).wait() {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Unable to delist resource {}: {}", resource.name(), e);
                inner.apply(TransitionEvent::ResourceFailure);
                Ok(false)
            }
        }
    }

    fn commit(&self) -> Result<()> {
        let synchronizations = {
            let mut inner = self.inner.lock();
            self.check_timeout(&mut inner);
            match inner.state {
                TransactionState::Active | TransactionState::MarkedRollbackOnly => {}
                state => {
                    return Err(ThothError::InvalidState {
                        action: "commit",
                        state,
                    });
                }
            }
            Self::best_effort_end(&mut inner);
            inner.state.is_active().then(|| inner.synchronizations.clone())
        };
        if let Some(synchronizations) = synchronizations {
            if before_completion(&synchronizations).is_err() {
                self.inner.lock().apply(TransitionEvent::ResourceFailure);
            }
        }

        let (result, synchronizations, state) = {
            let mut inner = self.inner.lock();
            let branches = inner.registry.len();
            inner.apply(TransitionEvent::BeginCommit { branches });
            if inner.state == TransactionState::Preparing {
                Self::prepare(&mut inner);
            }
            let result = match inner.state {
                TransactionState::Committing => Self::commit_resources(&mut inner),
                TransactionState::RollingBack => Self::rollback_resources(&mut inner),
                _ => Ok(()),
            };
            (result, inner.synchronizations.clone(), inner.state)
        };

        let status = if state == TransactionState::Committed {
            CompletionStatus::Committed
        } else {
            CompletionStatus::RolledBack
        };
        after_completion(&synchronizations, status);
        result?;

        let inner = self.inner.lock();
        if inner.state == TransactionState::RolledBack {
            return Err(rolled_back_instead(
                inner.timed_out,
                inner.rollback_cause.as_deref(),
            ));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let (result, synchronizations) = {
            let mut inner = self.inner.lock();
            self.check_timeout(&mut inner);
            match inner.state {
                TransactionState::Active => inner.apply(TransitionEvent::SetRollbackOnly),
                TransactionState::MarkedRollbackOnly => {}
                state => {
                    return Err(ThothError::InvalidState {
                        action: "rollback",
                        state,
                    });
                }
            }
            Self::best_effort_end(&mut inner);
            let result = Self::rollback_resources(&mut inner);
            (result, inner.synchronizations.clone())
        };
        after_completion(&synchronizations, CompletionStatus::RolledBack);
        result
    }

    fn set_rollback_only(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        match inner.state {
            TransactionState::Active | TransactionState::MarkedRollbackOnly => {
                inner.apply(TransitionEvent::SetRollbackOnly);
                Ok(())
            }
            state => Err(ThothError::InvalidState {
                action: "set rollback only",
                state,
            }),
        }
    }

    fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_timeout(&mut inner);
        match inner.state {
            TransactionState::Active => {
                inner.synchronizations.push(synchronization);
                Ok(())
            }
            state => Err(ThothError::InvalidState {
                action: "register synchronization",
                state,
            }),
        }
    }

    fn branch_count(&self) -> usize {
        self.inner.lock().registry.len()
    }

    fn late_commit_failures(&self) -> Vec<ResourceError> {
        self.inner.lock().late_commit_failures.clone()
    }
}
