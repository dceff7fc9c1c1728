//! Buffered write operations.
//!
//! Operations form a closed sum type. Each variant knows how to execute
//! against its portal's persister ([`Operation::execute`]) and how to merge
//! with a later neighbour ([`Operation::combine`], in `combine.rs`).

mod combine;
mod identity;

use std::borrow::Cow;
use std::sync::Arc;

use ahash::AHashSet as HashSet;
use log::{debug, warn};

use crate::errors::{Result, ThothError};
use crate::model::{AttributeUpdate, ObjectKey, ObjectRef, ObjectSet};
use crate::persister::ExecutionContext;
use crate::portal::{Portal, Predicate};

pub use identity::touches_same_object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Insert,
    Delete,
    Purge,
    Update,
    BatchUpdate,
    MultiUpdate,
    DeleteByPredicate,
    NoOp,
}

/// Whether an operation may be moved past a neighbour without changing the persisted outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughDirection {
    None,
    /// May move later in the buffer.
    Forward,
    /// May move earlier in the buffer.
    Backward,
    Both,
}

impl PassThroughDirection {
    pub fn allows_forward(self) -> bool {
        matches!(self, PassThroughDirection::Forward | PassThroughDirection::Both)
    }

    pub fn allows_backward(self) -> bool {
        matches!(self, PassThroughDirection::Backward | PassThroughDirection::Both)
    }
}

/// Single or batched insert.
#[derive(Debug, Clone)]
pub struct InsertOperation {
    portal: Arc<Portal>,
    objects: ObjectSet,
}

impl InsertOperation {
    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        let persister = self.portal.persister();
        match self.objects.as_slice() {
            [object] => persister.insert(object),
            objects => persister.batch_insert(objects, ctx.bulk_insert_threshold),
        }
    }
}

/// Single or batched delete.
#[derive(Debug, Clone)]
pub struct DeleteOperation {
    portal: Arc<Portal>,
    objects: ObjectSet,
    quiet: bool,
}

impl DeleteOperation {
    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    /// Quiet deletes tolerate rows that are already gone.
    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    fn execute(&self) -> Result<()> {
        let persister = self.portal.persister();
        if self.quiet {
            return persister.batch_delete_quietly(self.objects.as_slice());
        }
        match self.objects.as_slice() {
            [object] => persister.delete(object),
            objects => persister.batch_delete(objects),
        }
    }
}

/// Single or batched purge: removes every milestone of a dated object.
#[derive(Debug, Clone)]
pub struct PurgeOperation {
    portal: Arc<Portal>,
    objects: ObjectSet,
}

impl PurgeOperation {
    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    fn execute(&self) -> Result<()> {
        let persister = self.portal.persister();
        match self.objects.as_slice() {
            [object] => persister.purge(object),
            objects => persister.batch_purge(objects),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOperation {
    portal: Arc<Portal>,
    object: ObjectRef,
    changes: Vec<AttributeUpdate>,
}

impl UpdateOperation {
    pub fn object(&self) -> &ObjectRef {
        &self.object
    }

    pub fn changes(&self) -> &[AttributeUpdate] {
        &self.changes
    }

    /// Records `change`, replacing an earlier change of the same attribute.
    pub(crate) fn add_change(&mut self, change: AttributeUpdate) {
        match self
            .changes
            .iter_mut()
            .find(|existing| existing.attribute == change.attribute)
        {
            Some(existing) => *existing = change,
            None => self.changes.push(change),
        }
    }

    fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        let updated = self.portal.persister().update(&self.object, &self.changes)?;
        check_update_result(&self.portal, 1, updated, ctx)
    }
}

/// Updates of several objects sharing one attribute list, values may differ per object.
#[derive(Debug, Clone)]
pub struct BatchUpdateOperation {
    portal: Arc<Portal>,
    updates: Vec<UpdateOperation>,
}

impl BatchUpdateOperation {
    pub fn updates(&self) -> &[UpdateOperation] {
        &self.updates
    }

    pub fn portal(&self) -> &Arc<Portal> {
        &self.portal
    }

    fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        let updated = self.portal.persister().batch_update(self)?;
        check_update_result(&self.portal, self.updates.len(), updated, ctx)
    }
}

/// One set of attribute changes applied to objects whose keys differ in a single position.
#[derive(Debug, Clone)]
pub struct MultiUpdateOperation {
    portal: Arc<Portal>,
    changes: Vec<AttributeUpdate>,
    objects: ObjectSet,
    varying_key: usize,
}

impl MultiUpdateOperation {
    pub fn changes(&self) -> &[AttributeUpdate] {
        &self.changes
    }

    pub fn objects(&self) -> &ObjectSet {
        &self.objects
    }

    pub fn portal(&self) -> &Arc<Portal> {
        &self.portal
    }

    /// Position of the primary key attribute that varies across the objects.
    pub fn varying_key(&self) -> usize {
        self.varying_key
    }

    fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        let updated = self.portal.persister().multi_update(self)?;
        check_update_result(&self.portal, self.objects.len(), updated, ctx)
    }
}

/// Delete or purge of every row matching a predicate. Never combined.
#[derive(Debug, Clone)]
pub struct PredicateOperation {
    predicate: Predicate,
    purge: bool,
}

impl PredicateOperation {
    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    fn execute(&self) -> Result<()> {
        let persister = self.predicate.target().persister();
        let deleted = if self.purge {
            persister.purge_using_operation(&self.predicate)?
        } else {
            persister.delete_using_operation(&self.predicate)?
        };
        debug!("{:?} removed {} rows", self.predicate, deleted);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Operation {
    /// Placeholder left behind by a combined-away slot.
    NoOp,
    Insert(InsertOperation),
    Delete(DeleteOperation),
    Purge(PurgeOperation),
    Update(UpdateOperation),
    BatchUpdate(BatchUpdateOperation),
    MultiUpdate(MultiUpdateOperation),
    DeleteByPredicate(PredicateOperation),
}

impl Operation {
    pub fn insert(portal: &Arc<Portal>, object: ObjectRef) -> Self {
        Operation::Insert(InsertOperation {
            portal: Arc::clone(portal),
            objects: ObjectSet::one(object),
        })
    }

    pub fn delete(portal: &Arc<Portal>, object: ObjectRef) -> Self {
        Operation::Delete(DeleteOperation {
            portal: Arc::clone(portal),
            objects: ObjectSet::one(object),
            quiet: false,
        })
    }

    pub fn delete_quietly(portal: &Arc<Portal>, object: ObjectRef) -> Self {
        Operation::Delete(DeleteOperation {
            portal: Arc::clone(portal),
            objects: ObjectSet::one(object),
            quiet: true,
        })
    }

    pub fn purge(portal: &Arc<Portal>, object: ObjectRef) -> Self {
        Operation::Purge(PurgeOperation {
            portal: Arc::clone(portal),
            objects: ObjectSet::one(object),
        })
    }

    pub fn update(portal: &Arc<Portal>, object: ObjectRef, changes: Vec<AttributeUpdate>) -> Self {
        Operation::Update(UpdateOperation {
            portal: Arc::clone(portal),
            object,
            changes,
        })
    }

    pub fn delete_by_predicate(predicate: Predicate) -> Self {
        Operation::DeleteByPredicate(PredicateOperation {
            predicate,
            purge: false,
        })
    }

    pub fn purge_by_predicate(predicate: Predicate) -> Self {
        Operation::DeleteByPredicate(PredicateOperation {
            predicate,
            purge: true,
        })
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::NoOp => OperationKind::NoOp,
            Operation::Insert(_) => OperationKind::Insert,
            Operation::Delete(_) => OperationKind::Delete,
            Operation::Purge(_) => OperationKind::Purge,
            Operation::Update(_) => OperationKind::Update,
            Operation::BatchUpdate(_) => OperationKind::BatchUpdate,
            Operation::MultiUpdate(_) => OperationKind::MultiUpdate,
            Operation::DeleteByPredicate(_) => OperationKind::DeleteByPredicate,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Operation::NoOp)
    }

    pub fn portal(&self) -> Option<&Arc<Portal>> {
        match self {
            Operation::NoOp => None,
            Operation::Insert(op) => Some(&op.portal),
            Operation::Delete(op) => Some(&op.portal),
            Operation::Purge(op) => Some(&op.portal),
            Operation::Update(op) => Some(&op.portal),
            Operation::BatchUpdate(op) => Some(&op.portal),
            Operation::MultiUpdate(op) => Some(&op.portal),
            Operation::DeleteByPredicate(op) => Some(op.predicate.target()),
        }
    }

    /// Every subject object, in execution order.
    pub fn objects(&self) -> Cow<'_, [ObjectRef]> {
        match self {
            Operation::NoOp | Operation::DeleteByPredicate(_) => Cow::Borrowed(&[]),
            Operation::Insert(op) => Cow::Borrowed(op.objects.as_slice()),
            Operation::Delete(op) => Cow::Borrowed(op.objects.as_slice()),
            Operation::Purge(op) => Cow::Borrowed(op.objects.as_slice()),
            Operation::Update(op) => Cow::Borrowed(std::slice::from_ref(&op.object)),
            Operation::BatchUpdate(op) => {
                Cow::Owned(op.updates.iter().map(|u| Arc::clone(&u.object)).collect())
            }
            Operation::MultiUpdate(op) => Cow::Borrowed(op.objects.as_slice()),
        }
    }

    /// Key index cached by the operation, when it keeps one.
    pub(crate) fn indexed_keys(&self) -> Option<&HashSet<ObjectKey>> {
        match self {
            Operation::Insert(op) => Some(op.objects.key_index()),
            Operation::Delete(op) => Some(op.objects.key_index()),
            Operation::Purge(op) => Some(op.objects.key_index()),
            Operation::MultiUpdate(op) => Some(op.objects.key_index()),
            _ => None,
        }
    }

    /// Number of persister round trips this operation stands for before batching.
    pub fn total_operations(&self) -> usize {
        match self {
            Operation::NoOp => 0,
            Operation::DeleteByPredicate(_) => 1,
            other => other.objects().len(),
        }
    }

    pub fn is_any_update(&self) -> bool {
        matches!(
            self,
            Operation::Update(_) | Operation::BatchUpdate(_) | Operation::MultiUpdate(_)
        )
    }

    /// True when every change only touches temporal as-of attributes.
    pub fn is_as_of_attribute_only_update(&self) -> bool {
        let only_as_of = |changes: &[AttributeUpdate]| {
            !changes.is_empty() && changes.iter().all(|c| c.as_of)
        };
        match self {
            Operation::Update(op) => only_as_of(&op.changes),
            Operation::MultiUpdate(op) => only_as_of(&op.changes),
            Operation::BatchUpdate(op) => op.updates.iter().all(|u| only_as_of(&u.changes)),
            _ => false,
        }
    }

    /// Predicate deletes act as barriers: nothing is combined across them.
    pub fn is_combinable_with_insert(&self) -> bool {
        !matches!(self, Operation::DeleteByPredicate(_))
    }

    pub fn execute(&self, ctx: &ExecutionContext) -> Result<()> {
        match self {
            Operation::NoOp => Ok(()),
            Operation::Insert(op) => op.execute(ctx),
            Operation::Delete(op) => op.execute(),
            Operation::Purge(op) => op.execute(),
            Operation::Update(op) => op.execute(ctx),
            Operation::BatchUpdate(op) => op.execute(ctx),
            Operation::MultiUpdate(op) => op.execute(ctx),
            Operation::DeleteByPredicate(op) => op.execute(),
        }
    }
}

fn check_update_result(
    portal: &Portal,
    expected: usize,
    updated: usize,
    ctx: &ExecutionContext,
) -> Result<()> {
    if updated < expected {
        if portal.uses_optimistic_locking() {
            return Err(ThothError::OptimisticLock {
                message: format!(
                    "{}: expected to update {} rows but updated {}",
                    portal.name(),
                    expected,
                    updated
                ),
                retriable: ctx.retry_on_optimistic_lock_failure,
            });
        }
        warn!(
            "{}: did not update the correct number of rows, expected {} but got {}",
            portal.name(),
            expected,
            updated
        );
    }
    Ok(())
}
