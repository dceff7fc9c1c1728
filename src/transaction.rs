use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use ahash::AHashSet as HashSet;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::ThothConfig;
use crate::consolidator::OperationBuffer;
use crate::coordinator::{
    CompletionStatus, Synchronization, TransactionCoordinator, TransactionState,
};
use crate::errors::{Result, ThothError};
use crate::model::{AttributeUpdate, ObjectRef};
use crate::nested::NestedTransaction;
use crate::operation::Operation;
use crate::persister::{Cache, ExecutionContext};
use crate::portal::{Portal, Predicate};
use crate::twopc::{EndFlag, GlobalTransactionId, ResourceManager};
use crate::wait_chain::{ThreadLiveness, WaitChain};

/// Extra time granted to a unit of work past its own deadline before a
/// waiter considers it abandoned.
const MAX_WAIT_FOR_DEAD_TRANSACTION: Duration = Duration::from_secs(2);
const MIN_WAIT: Duration = Duration::from_millis(10);

/// Hooks around the commit and rollback of a unit of work.
pub trait LifecycleListener: Send + Sync {
    /// Runs after buffered operations were flushed, before any resource is
    /// delisted. An error fails the commit.
    fn before_commit(&self) -> Result<()> {
        Ok(())
    }

    /// Runs before resources are delisted on rollback. Errors are logged.
    fn before_rollback(&self) -> Result<()> {
        Ok(())
    }
}

/// Mutable state of the unit of work, owned by its thread.
struct Work {
    buffer: OperationBuffer,
    /// Buffers of cache-isolated portals, in first-use order.
    independent: Vec<(Arc<Portal>, OperationBuffer)>,
    immediate: bool,
    cautious: bool,
    retry_on_optimistic_lock_failure: bool,
    listeners: Vec<Arc<dyn LifecycleListener>>,
}

impl Work {
    fn buffer_for(&mut self, portal: &Arc<Portal>, config: &ThothConfig) -> &mut OperationBuffer {
        if !portal.is_independent() {
            return &mut self.buffer;
        }
        let position = match self
            .independent
            .iter()
            .position(|(p, _)| p.same_as(portal))
        {
            Some(position) => position,
            None => {
                self.independent.push((
                    Arc::clone(portal),
                    OperationBuffer::new(config.consolidation),
                ));
                self.independent.len() - 1
            }
        };
        &mut self.independent[position].1
    }

    fn buffers_mut(&mut self) -> impl Iterator<Item = &mut OperationBuffer> {
        std::iter::once(&mut self.buffer).chain(self.independent.iter_mut().map(|(_, b)| b))
    }

    fn pending(&self) -> usize {
        self.buffer.total_operations()
            + self
                .independent
                .iter()
                .map(|(_, b)| b.total_operations())
                .sum::<usize>()
    }
}

/// Completion bookkeeping shared with threads waiting on the unit of work.
struct Completion {
    status: Option<CompletionStatus>,
    caches: Vec<Arc<dyn Cache>>,
    /// Touched and read-locked objects, in enrollment order.
    objects: Vec<ObjectRef>,
    /// Addresses of `objects`, which keeps them alive.
    enrolled: HashSet<usize>,
}

/// A top-level unit of work.
///
/// Mutations are buffered per unit of work and consolidated before they
/// reach the persisters. Resources of touched portals are enlisted with the
/// transaction coordinator on first use, and the buffered operations are
/// flushed before commit, before a predicate delete that depends on them,
/// or right away in immediate and cautious modes.
///
/// Always handled through an `Arc`: waiters on other threads hold it too.
pub struct RootTransaction {
    id: u64,
    name: String,
    config: ThothConfig,
    coordinator: Arc<dyn TransactionCoordinator>,
    wait_chain: Arc<WaitChain>,
    owner: ThreadLiveness,
    started_at: Instant,
    timeout: Duration,
    work: Mutex<Work>,
    completion: Mutex<Completion>,
    finished: Condvar,
    nesting: AtomicUsize,
    expect_rollback: AtomicBool,
    committing: AtomicBool,
    prepared: AtomicBool,
    /// Set once buffers, caches and objects heard the outcome.
    settled: AtomicBool,
}

/// Runs cache and update-count completion once the coordinator finished,
/// on whichever thread finished it.
struct CompletionCallback {
    root: Weak<RootTransaction>,
}

impl Synchronization for CompletionCallback {
    fn after_completion(&self, status: CompletionStatus) -> Result<()> {
        if let Some(root) = self.root.upgrade() {
            root.complete(status);
        }
        Ok(())
    }
}

impl RootTransaction {
    pub(crate) fn begin(
        id: u64,
        name: String,
        timeout: Duration,
        config: ThothConfig,
        coordinator: Arc<dyn TransactionCoordinator>,
        wait_chain: Arc<WaitChain>,
    ) -> Result<Arc<Self>> {
        let work = Work {
            buffer: OperationBuffer::new(config.consolidation),
            independent: Vec::new(),
            immediate: false,
            cautious: false,
            retry_on_optimistic_lock_failure: config.retry_on_optimistic_lock_failure,
            listeners: Vec::new(),
        };
        let root = Arc::new(Self {
            id,
            name,
            config,
            coordinator,
            wait_chain,
            owner: ThreadLiveness::current(),
            started_at: Instant::now(),
            timeout,
            work: Mutex::new(work),
            completion: Mutex::new(Completion {
                status: None,
                caches: Vec::new(),
                objects: Vec::new(),
                enrolled: HashSet::new(),
            }),
            finished: Condvar::new(),
            nesting: AtomicUsize::new(0),
            expect_rollback: AtomicBool::new(false),
            committing: AtomicBool::new(false),
            prepared: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        });
        root.coordinator
            .register_synchronization(Arc::new(CompletionCallback {
                root: Arc::downgrade(&root),
            }))?;
        debug!("began transaction {} ({})", root.name, root.id);
        Ok(root)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn global_id(&self) -> GlobalTransactionId {
        self.coordinator.global_id()
    }

    /// State of the underlying coordinator.
    pub fn state(&self) -> TransactionState {
        self.coordinator.state()
    }

    pub fn coordinator(&self) -> &Arc<dyn TransactionCoordinator> {
        &self.coordinator
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether commit or rollback completed.
    pub fn is_finished(&self) -> bool {
        self.completion.lock().status.is_some()
    }

    /// Number of open nested units of work.
    pub fn nesting_depth(&self) -> usize {
        self.nesting.load(Ordering::Acquire)
    }

    fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    fn is_timed_out(&self) -> bool {
        self.coordinator.is_timed_out() || self.elapsed() >= self.timeout
    }

    fn time_to_live(&self) -> Duration {
        self.timeout.saturating_sub(self.elapsed())
    }

    fn execution_context(&self, work: &Work) -> ExecutionContext {
        ExecutionContext {
            tx_id: self.id,
            retry_on_optimistic_lock_failure: work.retry_on_optimistic_lock_failure,
            bulk_insert_threshold: self.config.bulk_insert_threshold,
        }
    }

    /// Fails unless the unit of work can still accept work.
    fn check_active(&self) -> Result<()> {
        match self.coordinator.state() {
            TransactionState::Active => Ok(()),
            TransactionState::MarkedRollbackOnly | TransactionState::RollingBack => {
                let timed_out = self.is_timed_out();
                let mut message = format!("transaction {} is marked rollback only", self.name);
                if timed_out {
                    message.push_str(" due to timeout");
                }
                Err(ThothError::RollbackOnly { message, timed_out })
            }
            TransactionState::Committed | TransactionState::RolledBack => Err(
                ThothError::Configuration(format!("Transaction {} is no longer active", self.name)),
            ),
            state => Err(ThothError::InvalidState {
                action: "buffer operations",
                state,
            }),
        }
    }

    /// Enlists `resource` unless it is already enlisted.
    ///
    /// # Errors
    ///
    /// See [`TransactionCoordinator::enlist`].
    pub fn enlist_resource(&self, resource: Arc<dyn ResourceManager>) -> Result<()> {
        if self.coordinator.is_enlisted(&resource) {
            return Ok(());
        }
        self.coordinator.enlist(resource)
    }

    /// Enrolls `cache` for commit and rollback notifications, once per name.
    pub fn enroll_cache(&self, cache: Arc<dyn Cache>) {
        let mut completion = self.completion.lock();
        if !completion.caches.iter().any(|c| c.name() == cache.name()) {
            completion.caches.push(cache);
        }
    }

    /// Enrolls `object` for the commit or rollback notification, once per
    /// instance.
    fn enroll_object(&self, object: &ObjectRef) {
        let address = Arc::as_ptr(object) as *const () as usize;
        let mut completion = self.completion.lock();
        if completion.enrolled.insert(address) {
            completion.objects.push(Arc::clone(object));
        }
    }

    /// Enrolls an object read under a shared lock by this unit of work.
    ///
    /// The object hears the outcome like the objects the unit of work wrote,
    /// so it can release its read lock at commit or rollback.
    pub fn enroll_read_locked(&self, object: &ObjectRef) -> Result<()> {
        self.check_active()?;
        self.enroll_object(object);
        Ok(())
    }

    fn enlist_portal(&self, portal: &Portal) -> Result<()> {
        if let Some(resource) = portal.resource() {
            self.enlist_resource(Arc::clone(resource))?;
        }
        if let Some(cache) = portal.cache() {
            self.enroll_cache(Arc::clone(cache));
        }
        Ok(())
    }

    /// Buffers `op` and flushes right away in immediate or cautious mode.
    fn buffer(&self, portal: &Arc<Portal>, op: Operation) -> Result<()> {
        let mut work = self.work.lock();
        work.buffer_for(portal, &self.config).add(op);
        self.after_buffering(&mut work)
    }

    fn after_buffering(&self, work: &mut Work) -> Result<()> {
        if work.immediate || work.cautious {
            return self.execute_locked(work);
        }
        Ok(())
    }

    /// Buffers the insert of `object` into `portal`.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::RollbackOnly` if the unit of work is marked
    /// rollback-only, or the enlistment error of the portal's resource.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use thoth::prelude::*;
    ///
    /// # #[derive(Debug)]
    /// # struct Account(i64);
    /// # impl TransactionalObject for Account {
    /// #     fn primary_key(&self) -> ObjectKey { ObjectKey::single(self.0) }
    /// # }
    /// # struct Accounts;
    /// # impl Persister for Accounts {
    /// #     fn insert(&self, _: &ObjectRef) -> Result<()> { Ok(()) }
    /// #     fn delete(&self, _: &ObjectRef) -> Result<()> { Ok(()) }
    /// #     fn purge(&self, _: &ObjectRef) -> Result<()> { Ok(()) }
    /// #     fn update(&self, _: &ObjectRef, _: &[AttributeUpdate]) -> Result<usize> { Ok(1) }
    /// #     fn delete_using_operation(&self, _: &Predicate) -> Result<usize> { Ok(0) }
    /// # }
    /// let thoth = Thoth::new(ThothConfig::default());
    /// let accounts = Portal::builder("account", Arc::new(Accounts)).build();
    ///
    /// let tx = thoth.begin()?;
    /// tx.insert(&accounts, Arc::new(Account(1)))?;
    /// tx.insert(&accounts, Arc::new(Account(2)))?;
    /// // both inserts reach the persister as one batch
    /// tx.commit()?;
    /// # Ok::<(), ThothError>(())
    /// ```
    pub fn insert(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.check_active()?;
        self.enlist_portal(portal)?;
        object.mark_inserted();
        self.enroll_object(&object);
        self.buffer(portal, Operation::insert(portal, object))
    }

    /// Buffers one attribute change of `object`.
    ///
    /// Consecutive changes of the same object are folded into one update,
    /// and a change of an object inserted in this unit of work is carried
    /// by the insert.
    pub fn update(
        &self,
        portal: &Arc<Portal>,
        object: &ObjectRef,
        change: AttributeUpdate,
    ) -> Result<()> {
        self.check_active()?;
        self.enlist_portal(portal)?;
        object.mark_updated(&change);
        self.enroll_object(object);
        let mut work = self.work.lock();
        work.buffer_for(portal, &self.config)
            .add_update(portal, object, change);
        self.after_buffering(&mut work)
    }

    pub fn delete(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.check_active()?;
        self.enlist_portal(portal)?;
        object.mark_deleted();
        self.enroll_object(&object);
        self.buffer(portal, Operation::delete(portal, object))
    }

    /// Like [`delete`](Self::delete), tolerating a row that is already gone.
    pub fn delete_quietly(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.check_active()?;
        self.enlist_portal(portal)?;
        object.mark_deleted();
        self.enroll_object(&object);
        self.buffer(portal, Operation::delete_quietly(portal, object))
    }

    /// Buffers the removal of every milestone of a dated object.
    pub fn purge(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.check_active()?;
        self.enlist_portal(portal)?;
        object.mark_deleted();
        self.enroll_object(&object);
        self.buffer(portal, Operation::purge(portal, object))
    }

    /// Buffers a delete of every row matching `predicate`.
    ///
    /// Nothing buffered before it is combined with anything buffered after it.
    pub fn delete_using_operation(&self, predicate: Predicate) -> Result<()> {
        self.check_active()?;
        let portal = Arc::clone(predicate.target());
        self.enlist_portal(&portal)?;
        self.buffer(&portal, Operation::delete_by_predicate(predicate))
    }

    pub fn purge_using_operation(&self, predicate: Predicate) -> Result<()> {
        self.check_active()?;
        let portal = Arc::clone(predicate.target());
        self.enlist_portal(&portal)?;
        self.buffer(&portal, Operation::purge_by_predicate(predicate))
    }

    /// Deletes matching rows in chunks of `batch_size`, without buffering.
    ///
    /// Buffered operations of the portals `predicate` depends on are flushed
    /// first.
    ///
    /// # Returns
    ///
    /// The number of rows deleted.
    pub fn delete_batch_using_operation(
        &self,
        predicate: &Predicate,
        batch_size: usize,
    ) -> Result<usize> {
        self.check_active()?;
        self.enlist_portal(predicate.target())?;
        self.execute_buffered_operations_for_operation(predicate)?;
        predicate
            .target()
            .persister()
            .delete_batch_using_operation(predicate, batch_size)
            .map_err(|e| self.execution_failed(e))
    }

    /// Consolidates and executes every buffered operation.
    ///
    /// # Errors
    ///
    /// Returns the first persister error. All buffers are then discarded and
    /// the unit of work is marked rollback-only.
    pub fn execute_buffered_operations(&self) -> Result<()> {
        let mut work = self.work.lock();
        self.execute_locked(&mut work)
    }

    fn execute_locked(&self, work: &mut Work) -> Result<()> {
        let ctx = self.execution_context(work);
        let mut outcome = Ok(());
        for buffer in work.buffers_mut() {
            if let Err(e) = buffer.execute_all(&ctx) {
                outcome = Err(e);
                break;
            }
        }
        if let Err(e) = outcome {
            for buffer in work.buffers_mut() {
                buffer.mark_failed();
            }
            return Err(self.execution_failed(e));
        }
        Ok(())
    }

    fn execution_failed(&self, e: ThothError) -> ThothError {
        warn!("transaction {} failed to execute operations: {}", self.name, e);
        if let Err(mark) = self.coordinator.set_rollback_only() {
            debug!("could not mark {} rollback only: {}", self.name, mark);
        }
        e
    }

    /// Executes the buffers only when more than `count` operations are pending.
    pub fn execute_buffered_operations_if_more_than(&self, count: usize) -> Result<()> {
        let mut work = self.work.lock();
        if work.pending() > count {
            return self.execute_locked(&mut work);
        }
        Ok(())
    }

    /// Flushes the buffer holding operations of `portal`, if it holds any.
    pub fn execute_buffered_operations_for_portal(&self, portal: &Portal) -> Result<()> {
        let mut work = self.work.lock();
        let ctx = self.execution_context(&work);
        let result = if portal.is_independent() {
            match work.independent.iter_mut().find(|(p, _)| p.same_as(portal)) {
                Some((_, buffer)) => buffer.execute_for_portal(portal, &ctx),
                None => Ok(()),
            }
        } else {
            work.buffer.execute_for_portal(portal, &ctx)
        };
        if let Err(e) = result {
            for buffer in work.buffers_mut() {
                buffer.mark_failed();
            }
            return Err(self.execution_failed(e));
        }
        Ok(())
    }

    /// Flushes everything `predicate` reads before it is evaluated.
    pub fn execute_buffered_operations_for_operation(&self, predicate: &Predicate) -> Result<()> {
        for portal in predicate.depends_on() {
            self.execute_buffered_operations_for_portal(portal)?;
        }
        Ok(())
    }

    pub fn pending_operation_count(&self) -> usize {
        self.work.lock().pending()
    }

    /// Executes every later mutation as soon as it is buffered.
    /// Enabling it flushes what is already buffered.
    pub fn set_immediate_operations(&self, immediate: bool) -> Result<()> {
        let mut work = self.work.lock();
        if immediate {
            self.execute_locked(&mut work)?;
        }
        work.immediate = immediate;
        Ok(())
    }

    /// Like immediate mode, for callers that must observe each write.
    pub fn set_cautious(&self, cautious: bool) -> Result<()> {
        let mut work = self.work.lock();
        if cautious {
            self.execute_locked(&mut work)?;
        }
        work.cautious = cautious;
        Ok(())
    }

    pub fn set_retry_on_optimistic_lock_failure(&self, retry: bool) {
        self.work.lock().retry_on_optimistic_lock_failure = retry;
    }

    pub fn register_lifecycle_listener(&self, listener: Arc<dyn LifecycleListener>) {
        self.work.lock().listeners.push(listener);
    }

    pub fn register_synchronization(&self, synchronization: Arc<dyn Synchronization>) -> Result<()> {
        self.coordinator.register_synchronization(synchronization)
    }

    pub fn set_rollback_only(&self) -> Result<()> {
        self.coordinator.set_rollback_only()
    }

    /// Opens a nested unit of work sharing this transaction's buffers and resources.
    pub fn begin_nested(self: &Arc<Self>, name: &str) -> Result<NestedTransaction> {
        self.check_active()?;
        let depth = self.nesting.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(NestedTransaction::new(
            Arc::clone(self),
            format!("{} in {}", name, self.name),
            depth,
        ))
    }

    pub(crate) fn pop_nested(&self) {
        if self
            .nesting
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
        {
            warn!(
                "transaction {} closed a nested transaction it did not have open",
                self.name
            );
        }
    }

    /// Makes the next commit of this root fail and roll back.
    pub(crate) fn expect_rollback(&self) {
        self.expect_rollback.store(true, Ordering::Release);
    }

    pub(crate) fn flushes_nested_at_commit(&self) -> bool {
        self.config.flush_nested_at_commit
    }

    fn delist_all(&self, flag: EndFlag) -> Result<()> {
        for resource in self.coordinator.enlisted_resources() {
            self.coordinator.delist(&resource, flag)?;
        }
        Ok(())
    }

    /// Flushes buffered operations and commits every enlisted resource.
    ///
    /// # Errors
    ///
    /// * `ThothError::Configuration` - nested units of work are still open,
    ///   or a nested unit of work rolled back. The transaction is rolled back.
    /// * `ThothError::RollbackOnly` - the transaction was marked rollback-only.
    ///   It is rolled back.
    /// * `ThothError::CommitFailed` - flushing, a listener, or the coordinator
    ///   failed. The source error says which, [`ThothError::is_timed_out`]
    ///   tells a timeout apart.
    pub fn commit(&self) -> Result<()> {
        if self.nesting.load(Ordering::Acquire) > 0 {
            return Err(ThothError::Configuration(format!(
                "cannot commit {} while {} nested transactions are open",
                self.name,
                self.nesting.load(Ordering::Acquire)
            )));
        }
        let state = self.coordinator.state();
        if state.is_terminal() {
            return Err(ThothError::Configuration(format!(
                "Transaction {} is no longer active",
                self.name
            )));
        }
        if state.is_rolling_back() {
            let timed_out = self.is_timed_out();
            self.rollback_after_failure();
            return Err(ThothError::RollbackOnly {
                message: format!("cannot commit rolledback transaction {}", self.name),
                timed_out,
            });
        }
        if self.expect_rollback.load(Ordering::Acquire) {
            self.rollback_after_failure();
            return Err(ThothError::Configuration(
                "cannot commit a transaction that expects a rollback (most probably a nested transaction failed)"
                    .to_string(),
            ));
        }

        self.committing.store(true, Ordering::Release);
        match self.commit_inner() {
            Ok(()) => {
                debug!("committed transaction {}", self.name);
                Ok(())
            }
            Err(e) => {
                if !self.coordinator.state().is_terminal() {
                    self.rollback_after_failure();
                }
                Err(ThothError::CommitFailed {
                    message: format!("could not commit transaction {}", self.name),
                    timed_out: e.is_timed_out() || self.is_timed_out(),
                    source: Some(Box::new(e)),
                })
            }
        }
    }

    fn commit_inner(&self) -> Result<()> {
        let listeners = {
            let mut work = self.work.lock();
            self.execute_locked(&mut work)?;
            work.listeners.clone()
        };
        for listener in &listeners {
            listener.before_commit()?;
        }
        self.delist_all(EndFlag::Success)?;
        let caches = self.completion.lock().caches.clone();
        for cache in &caches {
            cache.prepare_for_commit(self.id)?;
        }
        self.prepared.store(true, Ordering::Release);
        self.coordinator.commit()
    }

    /// Rolls back every enlisted resource and discards buffered operations.
    ///
    /// Rolling back a unit of work that already rolled back (for instance
    /// one abandoned and rolled back by a waiter) is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::Configuration` if the transaction already
    /// committed, or the first resource rollback failure.
    pub fn rollback(&self) -> Result<()> {
        match self.coordinator.state() {
            TransactionState::Committed => {
                return Err(ThothError::Configuration(format!(
                    "cannot rollback committed transaction {}",
                    self.name
                )));
            }
            TransactionState::RolledBack => {
                self.discard_buffers();
                return Ok(());
            }
            _ => {}
        }
        self.expect_rollback();
        let listeners = self.work.lock().listeners.clone();
        for listener in &listeners {
            if let Err(e) = listener.before_rollback() {
                error!("before rollback listener failed for {}: {}", self.name, e);
            }
        }
        self.discard_buffers();
        self.delist_all(EndFlag::Fail)?;
        self.coordinator.rollback()
    }

    fn discard_buffers(&self) {
        let mut work = self.work.lock();
        for buffer in work.buffers_mut() {
            buffer.clear();
        }
    }

    /// Rollback on behalf of a failed commit; failures are only logged.
    fn rollback_after_failure(&self) {
        self.expect_rollback();
        self.discard_buffers();
        if let Err(e) = self.delist_all(EndFlag::Fail) {
            error!("could not delist resources of {}: {}", self.name, e);
        }
        if let Err(e) = self.coordinator.rollback() {
            error!("could not roll back {}: {}", self.name, e);
        }
    }

    /// Settles the outcome, then wakes waiters.
    fn complete(&self, status: CompletionStatus) {
        self.settle(status);
        self.mark_finished(status);
    }

    /// Update counts, caches and enrolled objects hear `status`. Runs once.
    fn settle(&self, status: CompletionStatus) {
        if self.settled.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut work = self.work.lock();
            for buffer in work.buffers_mut() {
                match status {
                    CompletionStatus::Committed => buffer.commit_update_counts(),
                    CompletionStatus::RolledBack => {
                        buffer.clear();
                        buffer.rollback_update_counts();
                    }
                }
            }
        }
        let (caches, objects) = {
            let mut completion = self.completion.lock();
            completion.enrolled.clear();
            (
                std::mem::take(&mut completion.caches),
                std::mem::take(&mut completion.objects),
            )
        };
        for cache in &caches {
            match status {
                CompletionStatus::Committed => cache.commit(self.id),
                CompletionStatus::RolledBack => cache.rollback(self.id),
            }
        }
        for object in &objects {
            match status {
                CompletionStatus::Committed => object.handle_commit(),
                CompletionStatus::RolledBack => object.handle_rollback(),
            }
        }
    }

    /// Records the outcome seen by waiters. Never touches the work lock, so
    /// it is safe while the owner thread is stuck holding it.
    fn mark_finished(&self, status: CompletionStatus) {
        let mut completion = self.completion.lock();
        if completion.status.is_some() {
            return;
        }
        completion.status = Some(status);
        self.finished.notify_all();
        debug!("transaction {} finished: {:?}", self.name, status);
    }

    /// Blocks until this unit of work finishes.
    ///
    /// `waiter` is the unit of work of the calling thread, if any. Before
    /// blocking, the wait is checked against the waits-for chain: if this
    /// unit of work is (transitively) waiting on `waiter`, the call fails
    /// instead of deadlocking.
    ///
    /// # Errors
    ///
    /// * `ThothError::DeadlockDetected` - waiting would close a cycle. Retriable.
    /// * `ThothError::TimedOut` - the bounded wait expired and the unit of
    ///   work still looks alive. Retriable.
    ///
    /// A unit of work whose owner thread died, or that outlived its timeout
    /// by a wide margin, is reported finished right away and rolled back in
    /// the background, and the wait returns `Ok`.
    pub fn wait_for_transaction_to_finish(
        self: &Arc<Self>,
        waiter: Option<&Arc<RootTransaction>>,
    ) -> Result<()> {
        let Some(waiter) = waiter else {
            return self.wait_until_done(self.timeout);
        };
        if waiter.id == self.id || self.is_finished() {
            return Ok(());
        }
        let _edge = self.wait_chain.begin_wait(waiter.id, self.id)?;
        self.wait_until_done(waiter.time_to_live())
    }

    fn wait_until_done(self: &Arc<Self>, waiter_ttl: Duration) -> Result<()> {
        {
            let mut completion = self.completion.lock();
            if completion.status.is_none() && self.owner.is_alive() {
                let own_ttl = self.time_to_live() + MAX_WAIT_FOR_DEAD_TRANSACTION;
                let wait = waiter_ttl.min(own_ttl).max(MIN_WAIT);
                self.finished
                    .wait_while_for(&mut completion, |c| c.status.is_none(), wait);
            }
            if completion.status.is_some() {
                return Ok(());
            }
        }
        self.check_for_hung_or_abandoned()
    }

    fn check_for_hung_or_abandoned(self: &Arc<Self>) -> Result<()> {
        let owner_dead = !self.owner.is_alive();
        let overdue = !self.prepared.load(Ordering::Acquire)
            && !self.timeout.is_zero()
            && !self.committing.load(Ordering::Acquire)
            && self.elapsed() > self.timeout * 11 / 10 + MAX_WAIT_FOR_DEAD_TRANSACTION;
        if !(owner_dead || overdue) {
            return Err(ThothError::TimedOut {
                message: "waited too long for transaction to finish!".to_string(),
                retriable: true,
            });
        }
        error!(
            "Waiting for objects in hung or abandoned transaction! Attempting to rollback the bad transaction. \
             Find and fix the cause of this dead transaction: Name: {} started {:?} ago in thread {} which is {}",
            self.name,
            self.elapsed(),
            self.owner.thread_name().unwrap_or("<unnamed>"),
            if owner_dead { "dead" } else { "alive" }
        );
        self.mark_finished(CompletionStatus::RolledBack);
        self.async_rollback();
        Ok(())
    }

    /// Rolls the coordinator back on another thread, logging every failure.
    fn async_rollback(self: &Arc<Self>) {
        let root = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("thoth-rollback-{}", self.id))
            .spawn(move || root.rollback_abandoned());
        if let Err(e) = spawned {
            error!("could not start async rollback of {}: {}", self.name, e);
        }
    }

    /// Runs off the waiter's thread: a hung owner may still hold the work
    /// or coordinator locks.
    fn rollback_abandoned(&self) {
        if let Err(e) = self.coordinator.set_rollback_only() {
            debug!("could not mark {} rollback only: {}", self.name, e);
        }
        self.settle(CompletionStatus::RolledBack);
        if let Err(e) = self.delist_all(EndFlag::Fail) {
            error!("could not delist resources of abandoned {}: {}", self.name, e);
        }
        if let Err(e) = self.coordinator.rollback() {
            error!("could not roll back abandoned {}: {}", self.name, e);
        }
    }
}

impl std::fmt::Debug for RootTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootTransaction")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.coordinator.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::Thoth;
    use crate::config::ThothConfig;

    #[test]
    fn test_unbalanced_pop_keeps_depth_at_zero() {
        let thoth = Thoth::new(ThothConfig::default());
        let root = thoth.begin().unwrap();

        root.pop_nested();
        assert_eq!(root.nesting_depth(), 0);

        let nested = root.begin_nested("inner").unwrap();
        assert_eq!(nested.depth(), 1);
        nested.commit().unwrap();
        assert_eq!(root.nesting_depth(), 0);
        root.commit().unwrap();
    }
}
