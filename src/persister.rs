use crate::errors::Result;
use crate::model::{AttributeUpdate, ObjectRef};
use crate::operation::{BatchUpdateOperation, MultiUpdateOperation};
use crate::portal::Predicate;

/// Writes buffered operations to the backing store of one portal.
///
/// The engine hands the persister fully consolidated operations. It does
/// not interpret persister errors beyond [`crate::ThothError::is_retriable`].
///
/// Implementations must be `Send` and `Sync`, they are shared by every
/// unit of work that touches the portal.
pub trait Persister: Send + Sync {
    fn insert(&self, object: &ObjectRef) -> Result<()>;

    /// Inserts several objects in one round trip.
    ///
    /// # Arguments
    ///
    /// * `objects` - The objects in buffer order.
    /// * `bulk_insert_threshold` - Size above which the persister may switch
    ///   to a bulk load path. `0` disables bulk loading.
    ///
    /// # Errors
    ///
    /// Returns `ThothError::Persistence` when the store rejects the batch.
    fn batch_insert(&self, objects: &[ObjectRef], bulk_insert_threshold: usize) -> Result<()> {
        let _ = bulk_insert_threshold;
        for object in objects {
            self.insert(object)?;
        }
        Ok(())
    }

    fn delete(&self, object: &ObjectRef) -> Result<()>;

    fn batch_delete(&self, objects: &[ObjectRef]) -> Result<()> {
        for object in objects {
            self.delete(object)?;
        }
        Ok(())
    }

    /// Like [`Persister::batch_delete`] but tolerates rows that are already gone.
    fn batch_delete_quietly(&self, objects: &[ObjectRef]) -> Result<()> {
        self.batch_delete(objects)
    }

    fn purge(&self, object: &ObjectRef) -> Result<()>;

    fn batch_purge(&self, objects: &[ObjectRef]) -> Result<()> {
        for object in objects {
            self.purge(object)?;
        }
        Ok(())
    }

    /// Returns the number of rows updated.
    fn update(&self, object: &ObjectRef, changes: &[AttributeUpdate]) -> Result<usize>;

    /// Returns the number of rows updated across the whole batch.
    fn batch_update(&self, batch: &BatchUpdateOperation) -> Result<usize> {
        let mut updated = 0;
        for op in batch.updates() {
            updated += self.update(op.object(), op.changes())?;
        }
        Ok(updated)
    }

    /// Applies one set of attribute changes to every object of `multi`.
    /// Returns the number of rows updated.
    fn multi_update(&self, multi: &MultiUpdateOperation) -> Result<usize> {
        let mut updated = 0;
        for object in multi.objects().as_slice() {
            updated += self.update(object, multi.changes())?;
        }
        Ok(updated)
    }

    /// Returns the number of rows deleted.
    fn delete_using_operation(&self, predicate: &Predicate) -> Result<usize>;

    fn purge_using_operation(&self, predicate: &Predicate) -> Result<usize> {
        self.delete_using_operation(predicate)
    }

    /// Deletes matching rows in chunks of `batch_size`, returning the total row count.
    fn delete_batch_using_operation(&self, predicate: &Predicate, batch_size: usize) -> Result<usize> {
        let _ = batch_size;
        self.delete_using_operation(predicate)
    }
}

/// Object cache notified at the commit/rollback boundary of each unit of work it is enrolled in.
pub trait Cache: Send + Sync {
    /// Identity used to enroll a cache only once per unit of work.
    fn name(&self) -> &str;

    fn prepare_for_commit(&self, tx_id: u64) -> Result<()>;

    fn commit(&self, tx_id: u64);

    fn rollback(&self, tx_id: u64);
}

/// Counter backing cached query results of one portal.
///
/// Incremented inside the unit of work as operations are buffered, then
/// confirmed or reverted when the unit of work completes.
pub trait UpdateCountHolder: Send + Sync {
    fn increment_update_count(&self);

    fn commit_update_count(&self);

    fn rollback_update_count(&self);
}

/// Per-unit-of-work settings an operation needs while it executes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionContext {
    pub tx_id: u64,
    pub retry_on_optimistic_lock_failure: bool,
    pub bulk_insert_threshold: usize,
}
