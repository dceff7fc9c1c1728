use std::sync::Arc;

use log::debug;

use crate::errors::{Result, ThothError};
use crate::executor::{PendingResult, SerialExecutor};
use crate::twopc::{
    BranchId, EndFlag, GlobalTransactionId, PrepareVote, ResourceError, ResourceManager,
    StartFlag, same_resource,
};

/// One resource manager's participation in a global transaction.
///
/// Calls go through [`Branch::dispatch`], which runs them on the branch's
/// serial executor when it has one and in place otherwise. Either way the
/// caller gets a [`PendingResult`] and decides when to join on it.
pub struct Branch {
    id: BranchId,
    resource: Arc<dyn ResourceManager>,
    executor: Option<Arc<SerialExecutor>>,
}

impl Branch {
    pub fn new(
        id: BranchId,
        resource: Arc<dyn ResourceManager>,
        executor: Option<Arc<SerialExecutor>>,
    ) -> Self {
        Self {
            id,
            resource,
            executor,
        }
    }

    pub fn id(&self) -> BranchId {
        self.id
    }

    /// The handle that started the branch. Prepare, commit and rollback go through it.
    pub fn resource(&self) -> &Arc<dyn ResourceManager> {
        &self.resource
    }

    pub fn is_single_phase_only(&self) -> bool {
        self.resource.is_single_phase_only()
    }

    pub fn dispatch<T, F>(&self, resource: &Arc<dyn ResourceManager>, call: F) -> PendingResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&dyn ResourceManager, &BranchId) -> std::result::Result<T, ResourceError>
            + Send
            + 'static,
    {
        match &self.executor {
            Some(executor) => {
                let resource = Arc::clone(resource);
                let id = self.id;
                executor.submit(move || call(resource.as_ref(), &id))
            }
            None => PendingResult::ready(call(resource.as_ref(), &self.id)),
        }
    }

    pub fn start(&self, resource: &Arc<dyn ResourceManager>, flags: StartFlag) -> PendingResult<()> {
        self.dispatch(resource, move |rm, id| rm.start(id, flags))
    }

    pub fn end(&self, resource: &Arc<dyn ResourceManager>, flags: EndFlag) -> PendingResult<()> {
        self.dispatch(resource, move |rm, id| rm.end(id, flags))
    }

    pub fn prepare(&self) -> PendingResult<PrepareVote> {
        self.dispatch(&self.resource, |rm, id| rm.prepare(id))
    }

    pub fn commit(&self, one_phase: bool) -> PendingResult<()> {
        self.dispatch(&self.resource, move |rm, id| rm.commit(id, one_phase))
    }

    pub fn rollback(&self) -> PendingResult<()> {
        self.dispatch(&self.resource, |rm, id| rm.rollback(id))
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Branch({} on {})", self.id, self.resource.name())
    }
}

/// A resource handle currently associated with a branch.
#[derive(Clone)]
pub struct Enlistment {
    pub resource: Arc<dyn ResourceManager>,
    pub branch: Arc<Branch>,
    /// Outcome of the handle's `start` call.
    pub started: PendingResult<()>,
}

/// What enlisting a resource handle amounts to.
pub enum EnlistPlan {
    /// The handle shares a resource manager with an existing branch.
    Join(Arc<Branch>),
    /// A branch id was minted for a resource manager not seen before.
    New(BranchId),
}

/// Branches of one global transaction, in commit order, plus the handles
/// currently enlisted on them.
///
/// The first branch is the coordinating branch: it is committed first and
/// with the one-phase flag. Single-phase-only resources are always placed
/// first.
pub struct BranchRegistry {
    global_id: GlobalTransactionId,
    branches: Vec<Arc<Branch>>,
    active: Vec<Enlistment>,
    last_qualifier: u16,
}

impl BranchRegistry {
    pub fn new(global_id: GlobalTransactionId) -> Self {
        Self {
            global_id,
            branches: Vec::new(),
            active: Vec::new(),
            last_qualifier: 0,
        }
    }

    pub fn global_id(&self) -> GlobalTransactionId {
        self.global_id
    }

    /// Decides how `resource` joins the transaction.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::Configuration` if the handle is already enlisted,
    /// or if it was enlisted before and has since been delisted.
    pub fn plan_enlist(&mut self, resource: &Arc<dyn ResourceManager>) -> Result<EnlistPlan> {
        if self
            .active
            .iter()
            .any(|e| same_resource(&e.resource, resource))
        {
            return Err(ThothError::Configuration(format!(
                "resource {} is already enlisted!",
                resource.name()
            )));
        }
        for branch in &self.branches {
            if same_resource(branch.resource(), resource) {
                return Err(ThothError::Configuration(format!(
                    "resource {} was already delisted. Can't re-enlist!",
                    resource.name()
                )));
            }
            if resource.is_same_resource_manager(branch.resource().as_ref()) {
                return Ok(EnlistPlan::Join(Arc::clone(branch)));
            }
        }
        self.last_qualifier = self.last_qualifier.wrapping_add(1);
        Ok(EnlistPlan::New(BranchId::new(
            self.global_id,
            self.last_qualifier,
        )))
    }

    /// Records a branch once its first `start` was issued.
    pub fn add_branch(&mut self, branch: Arc<Branch>, started: PendingResult<()>) {
        debug!("new branch {:?}", branch);
        self.active.push(Enlistment {
            resource: Arc::clone(branch.resource()),
            branch: Arc::clone(&branch),
            started,
        });
        if branch.is_single_phase_only() {
            self.branches.insert(0, branch);
        } else {
            self.branches.push(branch);
        }
    }

    /// Records a handle that joined an existing branch.
    pub fn add_joined(
        &mut self,
        resource: Arc<dyn ResourceManager>,
        branch: Arc<Branch>,
        started: PendingResult<()>,
    ) {
        debug!("{} joined {:?}", resource.name(), branch);
        self.active.push(Enlistment {
            resource,
            branch,
            started,
        });
    }

    /// Removes and returns every active handle.
    pub fn take_active(&mut self) -> Vec<Enlistment> {
        std::mem::take(&mut self.active)
    }

    /// Removes `resource` from the active handles.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::Configuration` if the handle is not enlisted.
    pub fn remove_active(&mut self, resource: &Arc<dyn ResourceManager>) -> Result<Enlistment> {
        let position = self
            .active
            .iter()
            .position(|e| same_resource(&e.resource, resource))
            .ok_or_else(|| {
                ThothError::Configuration(format!(
                    "Cannot delist a resource that's not enlisted {}",
                    resource.name()
                ))
            })?;
        Ok(self.active.remove(position))
    }

    pub fn active(&self) -> &[Enlistment] {
        &self.active
    }

    pub fn is_enlisted(&self, resource: &Arc<dyn ResourceManager>) -> bool {
        self.active
            .iter()
            .any(|e| same_resource(&e.resource, resource))
    }

    pub fn branches(&self) -> &[Arc<Branch>] {
        &self.branches
    }

    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Drops a branch from the commit list, e.g. after a read-only vote.
    pub fn remove_branch(&mut self, id: BranchId) -> Option<Arc<Branch>> {
        let position = self.branches.iter().position(|b| b.id() == id)?;
        Some(self.branches.remove(position))
    }
}
