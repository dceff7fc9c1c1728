use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use parking_lot::Mutex;

use crate::branch::{Branch, BranchRegistry, EnlistPlan};
use crate::errors::{Result, ThothError};
use crate::executor::{PendingResult, SerialExecutor};
use crate::twopc::{
    EndFlag, GlobalTransactionId, PrepareVote, ResourceError, ResourceManager, StartFlag,
};

use super::{
    CompletionStatus, Synchronization, TransactionCoordinator, TransactionState, TransitionEvent,
    after_completion, before_completion, remaining_seconds, rollback_only_error,
    rolled_back_instead,
};

struct Structure {
    registry: BranchRegistry,
    synchronizations: Vec<Arc<dyn Synchronization>>,
    rollback_cause: Option<String>,
    late_commit_failures: Vec<ResourceError>,
}

/// Coordinator that may be driven from several threads.
///
/// The state is an atomic swapped by compare-and-set, so the deadline is
/// flipped to rollback-only exactly once whichever thread observes it
/// first. Branch bookkeeping sits behind a mutex. With `async_resources`
/// every branch gets its own [`SerialExecutor`]: calls to different
/// resource managers overlap, calls to the same one stay ordered, and the
/// coordinator joins on a [`PendingResult`] only when it needs the value.
pub struct ThreadedCoordinator {
    global_id: GlobalTransactionId,
    timeout: Duration,
    deadline: Instant,
    async_resources: bool,
    state: AtomicU8,
    timed_out: AtomicBool,
    structure: Mutex<Structure>,
}

impl ThreadedCoordinator {
    pub fn new(global_id: GlobalTransactionId, timeout: Duration, async_resources: bool) -> Self {
        Self {
            global_id,
            timeout,
            deadline: Instant::now() + timeout,
            async_resources,
            state: AtomicU8::new(TransactionState::Active as u8),
            timed_out: AtomicBool::new(false),
            structure: Mutex::new(Structure {
                registry: BranchRegistry::new(global_id),
                synchronizations: Vec::new(),
                rollback_cause: None,
                late_commit_failures: Vec::new(),
            }),
        }
    }

    fn load(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Applies `event` with a compare-and-set loop.
    fn apply(&self, event: TransitionEvent) -> Option<TransactionState> {
        let mut current = self.load();
        loop {
            let next = current.next(event)?;
            match self.state.compare_exchange(
                current as u8,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!("transaction {:?} -> {:?} on {:?}", current, next, event);
                    return Some(next);
                }
                Err(actual) => current = TransactionState::from_u8(actual),
            }
        }
    }

    fn check_timeout(&self) -> bool {
        if Instant::now() > self.deadline
            && self
                .state
                .compare_exchange(
                    TransactionState::Active as u8,
                    TransactionState::MarkedRollbackOnly as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
        {
            self.timed_out.store(true, Ordering::Release);
            warn!("Transaction marked for rollback due to timeout");
        }
        self.timed_out.load(Ordering::Acquire)
    }

    fn enlist_failed(&self, resource: &Arc<dyn ResourceManager>, cause: ResourceError) -> ThothError {
        warn!("Unable to enlist resource {}: {}", resource.name(), cause);
        self.apply(TransitionEvent::ResourceFailure);
        ThothError::resource(format!("Unable to enlist resource {}", resource.name()), cause)
    }

    fn new_branch(
        &self,
        id: crate::twopc::BranchId,
        resource: &Arc<dyn ResourceManager>,
    ) -> Result<Arc<Branch>> {
        let executor = if self.async_resources {
            Some(Arc::new(SerialExecutor::new(format!(
                "{}-{}",
                resource.name(),
                id.qualifier
            ))?))
        } else {
            None
        };
        Ok(Arc::new(Branch::new(id, Arc::clone(resource), executor)))
    }

    /// Ends every active handle, issuing all calls before joining any.
    fn best_effort_end(&self, structure: &mut Structure) {
        let flag = self.load().end_flag();
        let pending: Vec<_> = structure
            .registry
            .take_active()
            .into_iter()
            .map(|enlistment| {
                let ended = match enlistment.started.wait() {
                    Ok(()) => enlistment.branch.end(&enlistment.resource, flag),
                    Err(e) => PendingResult::ready(Err(e)),
                };
                (enlistment.resource, ended)
            })
            .collect();
        for (resource, ended) in pending {
            if let Err(e) = ended.wait() {
                error!("could not call end on resource {}: {}", resource.name(), e);
                self.apply(TransitionEvent::ResourceFailure);
            }
        }
    }

    /// Phase 1: every prepare is issued first, then the votes are collected.
    fn prepare(&self, structure: &mut Structure) {
        let votes: Vec<(Arc<Branch>, PendingResult<PrepareVote>)> = structure
            .registry
            .branches()
            .iter()
            .skip(1)
            .map(|branch| (Arc::clone(branch), branch.prepare()))
            .collect();
        let mut failed = false;
        for (branch, vote) in votes {
            match vote.wait() {
                Ok(PrepareVote::Ok) => {}
                Ok(PrepareVote::ReadOnly) => {
                    debug!("{:?} is read only", branch);
                    structure.registry.remove_branch(branch.id());
                }
                Err(e) => {
                    error!("Error preparing {:?}. Rolling back instead: {}", branch, e);
                    structure.registry.remove_branch(branch.id());
                    if structure.rollback_cause.is_none() {
                        structure.rollback_cause = Some(e.to_string());
                    }
                    failed = true;
                }
            }
        }
        if failed {
            self.apply(TransitionEvent::PrepareFailed);
        } else {
            self.apply(TransitionEvent::AllPrepared);
        }
    }

    /// The coordinating branch commits first and alone. Once it succeeded the
    /// remaining branches commit concurrently and their failures no longer
    /// change the outcome.
    fn commit_resources(&self, structure: &mut Structure) -> Result<()> {
        let branches: Vec<Arc<Branch>> = structure.registry.branches().to_vec();
        let Some((coordinating, rest)) = branches.split_first() else {
            self.apply(TransitionEvent::AllCommitted);
            return Ok(());
        };
        if let Err(e) = coordinating.commit(true).wait() {
            error!(
                "Unexpected exception committing {}: {}",
                coordinating.resource().name(),
                e
            );
            structure.rollback_cause = Some(e.to_string());
            self.apply(TransitionEvent::CoordinatorCommitFailed);
            return self.rollback_resources(structure);
        }
        let pending: Vec<_> = rest
            .iter()
            .map(|branch| (Arc::clone(branch), branch.commit(false)))
            .collect();
        for (branch, committed) in pending {
            if let Err(e) = committed.wait() {
                error!(
                    "Unexpected exception committing {}; continuing to commit: {}",
                    branch.resource().name(),
                    e
                );
                structure.late_commit_failures.push(e);
            }
        }
        self.apply(TransitionEvent::AllCommitted);
        Ok(())
    }

    fn rollback_resources(&self, structure: &mut Structure) -> Result<()> {
        self.apply(TransitionEvent::BeginRollback);
        let pending: Vec<_> = structure
            .registry
            .branches()
            .iter()
            .map(|branch| (Arc::clone(branch), branch.rollback()))
            .collect();
        let mut cause = None;
        for (branch, rolled_back) in pending {
            if let Err(e) = rolled_back.wait() {
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
        self.apply(TransitionEvent::RollbackFinished);
        cause.map_or(Ok(()), Err)
    }
}

impl TransactionCoordinator for ThreadedCoordinator {
    fn global_id(&self) -> GlobalTransactionId {
        self.global_id
    }

    fn state(&self) -> TransactionState {
        self.check_timeout();
        self.load()
    }

    fn is_timed_out(&self) -> bool {
        self.check_timeout()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn enlist(&self, resource: Arc<dyn ResourceManager>) -> Result<()> {
        let mut structure = self.structure.lock();
        self.check_timeout();
        match self.load() {
            TransactionState::Active => {}
            TransactionState::MarkedRollbackOnly => {
                return Err(rollback_only_error(self.timed_out.load(Ordering::Acquire)));
            }
            state => {
                return Err(ThothError::InvalidState {
                    action: "enlist",
                    state,
                });
            }
        }
        match structure.registry.plan_enlist(&resource)? {
            EnlistPlan::Join(branch) => {
                // queued behind the branch's own start on the same executor
                let started = branch.start(&resource, StartFlag::Join);
                if !self.async_resources {
                    if let Err(e) = started.wait() {
                        return Err(self.enlist_failed(&resource, e));
                    }
                }
                structure.registry.add_joined(resource, branch, started);
            }
            EnlistPlan::New(id) => {
                let branch = match self.new_branch(id, &resource) {
                    Ok(branch) => branch,
                    Err(e) => {
                        self.apply(TransitionEvent::ResourceFailure);
                        return Err(e);
                    }
                };
                let seconds = remaining_seconds(self.deadline);
                let started = branch.dispatch(&resource, move |rm, id| {
                    if let Err(e) = rm.set_timeout(seconds) {
                        debug!("{} refused a timeout: {}", rm.name(), e);
                    }
                    rm.start(id, StartFlag::NoFlags)
                });
                if !self.async_resources {
                    if let Err(e) = started.wait() {
                        return Err(self.enlist_failed(&resource, e));
                    }
                }
                structure.registry.add_branch(branch, started);
            }
        }
        Ok(())
    }

    fn is_enlisted(&self, resource: &Arc<dyn ResourceManager>) -> bool {
        self.structure.lock().registry.is_enlisted(resource)
    }

    fn enlisted_resources(&self) -> Vec<Arc<dyn ResourceManager>> {
        self.structure
            .lock()
            .registry
            .active()
            .iter()
            .map(|e| Arc::clone(&e.resource))
            .collect()
    }

    fn delist(&self, resource: &Arc<dyn ResourceManager>, flag: EndFlag) -> Result<bool> {
        let mut structure = self.structure.lock();
        self.check_timeout();
        let flag = match self.load() {
            TransactionState::Active => {
                if flag == EndFlag::Fail && self.apply(TransitionEvent::SetRollbackOnly).is_some()
                {
                    warn!("transaction marked for rollback due to end with failure");
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
        let enlistment = structure.registry.remove_active(resource)?;
        let ended = enlistment
            .started
            .wait()
            .and_then(|()| enlistment.branch.end(&enlistment.resource, flag).wait());
        match ended {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Unable to delist resource {}: {}", resource.name(), e);
                self.apply(TransitionEvent::ResourceFailure);
                Ok(false)
            }
        }
    }

    fn commit(&self) -> Result<()> {
        let synchronizations = {
            let mut structure = self.structure.lock();
            self.check_timeout();
            match self.load() {
                TransactionState::Active | TransactionState::MarkedRollbackOnly => {}
                state => {
                    return Err(ThothError::InvalidState {
                        action: "commit",
                        state,
                    });
                }
            }
            self.best_effort_end(&mut structure);
            self.load()
                .is_active()
                .then(|| structure.synchronizations.clone())
        };
        if let Some(synchronizations) = synchronizations {
            if before_completion(&synchronizations).is_err() {
                self.apply(TransitionEvent::ResourceFailure);
            }
        }

        let (result, synchronizations) = {
            let mut structure = self.structure.lock();
            let branches = structure.registry.len();
            self.apply(TransitionEvent::BeginCommit { branches });
            if self.load() == TransactionState::Preparing {
                self.prepare(&mut structure);
            }
            let result = match self.load() {
                TransactionState::Committing => self.commit_resources(&mut structure),
                TransactionState::RollingBack => self.rollback_resources(&mut structure),
                _ => Ok(()),
            };
            (result, structure.synchronizations.clone())
        };

        let status = if self.load() == TransactionState::Committed {
            CompletionStatus::Committed
        } else {
            CompletionStatus::RolledBack
        };
        after_completion(&synchronizations, status);
        result?;

        if self.load() == TransactionState::RolledBack {
            let structure = self.structure.lock();
            return Err(rolled_back_instead(
                self.timed_out.load(Ordering::Acquire),
                structure.rollback_cause.as_deref(),
            ));
        }
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let (result, synchronizations) = {
            let mut structure = self.structure.lock();
            self.check_timeout();
            match self.load() {
                TransactionState::Active | TransactionState::MarkedRollbackOnly => {
                    self.apply(TransitionEvent::SetRollbackOnly);
                }
                state => {
                    return Err(ThothError::InvalidState {
                        action: "rollback",
                        state,
                    });
                }
            }
            self.best_effort_end(&mut structure);
            let result = self.rollback_resources(&mut structure);
            (result, structure.synchronizations.clone())
        };
        after_completion(&synchronizations, CompletionStatus::RolledBack);
        result
    }

    fn set_rollback_only(&self) -> Result<()> {
        self.check_timeout();
        match self.apply(TransitionEvent::SetRollbackOnly) {
            Some(_) => {
                warn!("Transaction marked for rollback by request");
                Ok(())
            }
            None => Err(ThothError::InvalidState {
                action: "set rollback only",
                state: self.load(),
            }),
        }
    }

    fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        let mut structure = self.structure.lock();
        self.check_timeout();
        match self.load() {
            TransactionState::Active => {
                structure.synchronizations.push(synchronization);
                Ok(())
            }
            state => Err(ThothError::InvalidState {
                action: "register synchronization",
                state,
            }),
        }
    }

    fn branch_count(&self) -> usize {
        self.structure.lock().registry.len()
    }

    fn late_commit_failures(&self) -> Vec<ResourceError> {
        self.structure.lock().late_commit_failures.clone()
    }
}
