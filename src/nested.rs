use std::sync::Arc;

use log::{debug, warn};

use crate::errors::{Result, ThothError};
use crate::model::{AttributeUpdate, ObjectRef};
use crate::portal::{Portal, Predicate};
use crate::transaction::RootTransaction;

/// A unit of work opened inside a [`RootTransaction`].
///
/// A nested unit of work shares the buffers, resources, and coordinator of
/// its root: committing it only closes the nesting level, optionally
/// flushing buffered operations. Rolling it back, or dropping it without
/// committing, makes the root fail at commit and roll back.
pub struct NestedTransaction {
    root: Arc<RootTransaction>,
    name: String,
    depth: usize,
    finished: bool,
}

impl NestedTransaction {
    pub(crate) fn new(root: Arc<RootTransaction>, name: String, depth: usize) -> Self {
        debug!("began nested transaction {} at depth {}", name, depth);
        Self {
            root,
            name,
            depth,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nesting level, `1` for a unit of work opened directly on the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn root(&self) -> &Arc<RootTransaction> {
        &self.root
    }

    pub fn insert(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.root.insert(portal, object)
    }

    pub fn update(
        &self,
        portal: &Arc<Portal>,
        object: &ObjectRef,
        change: AttributeUpdate,
    ) -> Result<()> {
        self.root.update(portal, object, change)
    }

    pub fn delete(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.root.delete(portal, object)
    }

    pub fn delete_quietly(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.root.delete_quietly(portal, object)
    }

    pub fn purge(&self, portal: &Arc<Portal>, object: ObjectRef) -> Result<()> {
        self.root.purge(portal, object)
    }

    pub fn delete_using_operation(&self, predicate: Predicate) -> Result<()> {
        self.root.delete_using_operation(predicate)
    }

    pub fn purge_using_operation(&self, predicate: Predicate) -> Result<()> {
        self.root.purge_using_operation(predicate)
    }

    pub fn delete_batch_using_operation(
        &self,
        predicate: &Predicate,
        batch_size: usize,
    ) -> Result<usize> {
        self.root.delete_batch_using_operation(predicate, batch_size)
    }

    pub fn execute_buffered_operations(&self) -> Result<()> {
        self.root.execute_buffered_operations()
    }

    /// Opens a unit of work one level deeper, on the same root.
    pub fn begin_nested(&self, name: &str) -> Result<NestedTransaction> {
        self.root.begin_nested(name)
    }

    /// Closes this nesting level.
    ///
    /// # Errors
    ///
    /// * `ThothError::Configuration` - a deeper nested unit of work is still
    ///   open. This unit of work is dropped unfinished, which dooms the root.
    /// * With `flush_nested_at_commit` set, a flush failure is returned and
    ///   the root is left to roll back.
    pub fn commit(mut self) -> Result<()> {
        let open = self.root.nesting_depth();
        if open != self.depth {
            return Err(ThothError::Configuration(format!(
                "cannot commit nested transaction {} at depth {} while depth {} is open",
                self.name, self.depth, open
            )));
        }
        self.finished = true;
        self.root.pop_nested();
        if self.root.flushes_nested_at_commit() {
            if let Err(e) = self.root.execute_buffered_operations() {
                self.root.expect_rollback();
                return Err(e);
            }
        }
        debug!("committed nested transaction {}", self.name);
        Ok(())
    }

    /// Closes this nesting level and dooms the root.
    pub fn rollback(mut self) {
        self.abandon();
    }

    fn abandon(&mut self) {
        self.finished = true;
        self.root.expect_rollback();
        self.root.pop_nested();
    }
}

impl Drop for NestedTransaction {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "nested transaction {} was neither committed nor rolled back",
                self.name
            );
            self.abandon();
        }
    }
}

impl std::fmt::Debug for NestedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NestedTransaction")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish()
    }
}
