use std::sync::Arc;

use log::{debug, error};

use crate::config::ConsolidationConfig;
use crate::errors::Result;
use crate::model::{AttributeUpdate, ObjectRef, same_instance};
use crate::operation::Operation;
use crate::persister::{ExecutionContext, UpdateCountHolder};
use crate::portal::Portal;

/// Ordered buffer of pending write operations for one unit of work.
///
/// Operations are appended as mutations are buffered, merged into as few
/// persister round trips as the ordering rules allow by [`consolidate`],
/// and written out by [`execute_all`]. A buffer whose execution failed is
/// discarded: its remaining operations are never executed.
///
/// [`consolidate`]: OperationBuffer::consolidate
/// [`execute_all`]: OperationBuffer::execute_all
pub struct OperationBuffer {
    operations: Vec<Operation>,
    config: ConsolidationConfig,
    failed: bool,
    update_counters: Vec<Arc<dyn UpdateCountHolder>>,
}

impl OperationBuffer {
    pub fn new(config: ConsolidationConfig) -> Self {
        Self {
            operations: Vec::new(),
            config,
            failed: false,
            update_counters: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Sum of [`Operation::total_operations`] over the buffer.
    pub fn total_operations(&self) -> usize {
        self.operations.iter().map(Operation::total_operations).sum()
    }

    /// Buffers `op`, merging it into the last operation when possible.
    ///
    /// A merge that cancels out (an insert followed by a delete of the same
    /// object) removes the last operation altogether.
    pub fn add(&mut self, op: Operation) {
        if let Some(portal) = op.portal() {
            self.touch_update_counter(portal);
        }
        match op {
            Operation::NoOp => {}
            Operation::Insert(_) | Operation::Delete(_) | Operation::Purge(_) => {
                let combined = self.operations.last().and_then(|last| last.combine(&op));
                match combined {
                    Some(Operation::NoOp) => {
                        self.operations.pop();
                    }
                    Some(combined) => {
                        if let Some(last) = self.operations.last_mut() {
                            *last = combined;
                        }
                    }
                    None => self.operations.push(op),
                }
            }
            other => self.operations.push(other),
        }
    }

    /// Buffers one attribute change of `object`.
    ///
    /// Trailing operations on the same object instance absorb the change: an
    /// update records it (replacing an earlier value of the same attribute),
    /// an insert already carries the object's latest data.
    ///
    /// # Returns
    ///
    /// `true` if a new operation was appended, `false` if the change was absorbed.
    pub fn add_update(
        &mut self,
        portal: &Arc<Portal>,
        object: &ObjectRef,
        change: AttributeUpdate,
    ) -> bool {
        self.touch_update_counter(portal);
        for op in self.operations.iter_mut().rev() {
            let same_subject = op.portal().is_some_and(|p| Arc::ptr_eq(p, portal))
                && matches!(&*op.objects(), [only] if same_instance(only, object));
            if !same_subject {
                break;
            }
            match op {
                Operation::Update(update) => {
                    update.add_change(change);
                    return false;
                }
                Operation::Insert(_) => return false,
                _ => {}
            }
        }
        self.operations
            .push(Operation::update(portal, Arc::clone(object), vec![change]));
        true
    }

    /// Whether any buffered operation targets `portal`.
    pub fn has_operations_for(&self, portal: &Portal) -> bool {
        self.operations
            .iter()
            .any(|op| op.portal().is_some_and(|p| p.same_as(portal)))
    }

    /// Merges buffered operations in place.
    ///
    /// Adjacent updates are merged first. Forward and backward passes then
    /// alternate until a round leaves the size unchanged, or the configured
    /// round bound is reached.
    pub fn consolidate(&mut self) {
        let before = self.operations.len();
        if self.combine_updates() {
            self.pair_combine();
        }
        let mut rounds = 0;
        while self.operations.len() > 1 && rounds < self.config.max_rounds {
            rounds += 1;
            let size = self.operations.len();
            self.combine_forward();
            self.combine_backward();
            if size == self.operations.len() {
                break;
            }
        }
        debug!(
            "consolidated {} operations into {} in {} rounds",
            before,
            self.operations.len(),
            rounds
        );
    }

    /// Consolidates and executes every buffered operation, leaving the buffer empty.
    ///
    /// # Errors
    ///
    /// Returns the first execution error. The buffer is then marked failed
    /// and its remaining operations are dropped.
    pub fn execute_all(&mut self, ctx: &ExecutionContext) -> Result<()> {
        if self.operations.is_empty() {
            return Ok(());
        }
        if self.failed {
            error!("Transaction already failed");
            self.operations.clear();
            return Ok(());
        }
        self.consolidate();
        let operations = std::mem::take(&mut self.operations);
        for op in &operations {
            if let Err(e) = op.execute(ctx) {
                self.failed = true;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Executes the buffer only when it holds more than `count` operations.
    pub fn execute_if_more_than(&mut self, count: usize, ctx: &ExecutionContext) -> Result<()> {
        if self.total_operations() > count {
            self.execute_all(ctx)?;
        }
        Ok(())
    }

    /// Executes the buffer if it holds anything for `portal`.
    ///
    /// The whole buffer is flushed, not only the operations of `portal`, so
    /// ordering across portals is preserved.
    pub fn execute_for_portal(&mut self, portal: &Portal, ctx: &ExecutionContext) -> Result<()> {
        if self.has_operations_for(portal) {
            self.execute_all(ctx)?;
        }
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        self.failed = true;
        self.operations.clear();
    }

    pub fn clear(&mut self) {
        self.operations.clear();
    }

    pub fn commit_update_counts(&mut self) {
        for counter in self.update_counters.drain(..) {
            counter.commit_update_count();
        }
    }

    pub fn rollback_update_counts(&mut self) {
        for counter in self.update_counters.drain(..) {
            counter.rollback_update_count();
        }
    }

    fn touch_update_counter(&mut self, portal: &Portal) {
        if let Some(counter) = portal.update_counter() {
            counter.increment_update_count();
            if !self.update_counters.iter().any(|c| Arc::ptr_eq(c, counter)) {
                self.update_counters.push(Arc::clone(counter));
            }
        }
    }

    /// Merges each operation with its immediate successor via [`Operation::combine_update`].
    fn combine_updates(&mut self) -> bool {
        let mut changed = false;
        for i in 0..self.operations.len().saturating_sub(1) {
            if let Some(combined) = self.operations[i].combine_update(&self.operations[i + 1]) {
                self.operations[i] = Operation::NoOp;
                self.operations[i + 1] = combined;
                changed = true;
            }
        }
        if changed {
            self.clean_up();
        }
        changed
    }

    fn pair_combine(&mut self) {
        let mut changed = false;
        for i in 0..self.operations.len().saturating_sub(1) {
            if let Some(combined) = self.operations[i].combine(&self.operations[i + 1]) {
                self.operations[i] = Operation::NoOp;
                self.operations[i + 1] = combined;
                changed = true;
            }
        }
        if changed {
            self.clean_up();
        }
    }

    /// Moves operations later in the buffer onto a combinable partner.
    fn combine_forward(&mut self) {
        let lookahead = self.config.max_lookahead;
        let ops = &mut self.operations;
        let len = ops.len();
        let mut changed = false;
        for i in 0..len.saturating_sub(2) {
            if ops[i].is_noop() || !ops[i].pass_through_direction(&ops[i + 1]).allows_forward() {
                continue;
            }
            let mut op = ops[i].clone();
            let mut current = i;
            let mut j = 0;
            while j < lookahead && current + j + 2 < len {
                let target = current + j + 2;
                let Some(combined) = op.combine(&ops[target]) else {
                    if !op.pass_through_direction(&ops[target]).allows_forward() {
                        break;
                    }
                    j += 1;
                    continue;
                };
                ops[target] = combined;
                ops[current] = Operation::NoOp;
                changed = true;
                // the gap may have brought two combinable neighbours together
                if current > 0 && !ops[current - 1].is_noop() {
                    if let Some(joined) = ops[current - 1].combine(&ops[current + 1]) {
                        ops[current - 1] = Operation::NoOp;
                        ops[current + 1] = joined;
                    }
                }
                current = target;
                op = ops[current].clone();
                j = 0;
                if current + 1 >= len
                    || !op.pass_through_direction(&ops[current + 1]).allows_forward()
                {
                    break;
                }
            }
        }
        if changed {
            self.clean_up();
        }
    }

    /// Mirror of [`combine_forward`](Self::combine_forward), moving operations earlier.
    fn combine_backward(&mut self) {
        let lookahead = self.config.max_lookahead;
        let ops = &mut self.operations;
        let len = ops.len();
        let mut changed = false;
        for i in (1..len).rev() {
            if ops[i].is_noop() || !ops[i].pass_through_direction(&ops[i - 1]).allows_backward() {
                continue;
            }
            let mut op = ops[i].clone();
            let mut current = i;
            let mut j = 0;
            while j < lookahead && current >= j + 2 {
                let target = current - j - 2;
                let Some(combined) = ops[target].combine(&op) else {
                    if !op.pass_through_direction(&ops[target]).allows_backward() {
                        break;
                    }
                    j += 1;
                    continue;
                };
                ops[target] = combined;
                ops[current] = Operation::NoOp;
                changed = true;
                if current + 1 < len && !ops[current + 1].is_noop() {
                    if let Some(joined) = ops[current - 1].combine(&ops[current + 1]) {
                        ops[current + 1] = Operation::NoOp;
                        ops[current - 1] = joined;
                    }
                }
                current = target;
                op = ops[current].clone();
                j = 0;
                if current == 0 || !op.pass_through_direction(&ops[current - 1]).allows_backward()
                {
                    break;
                }
            }
        }
        if changed {
            self.clean_up();
        }
    }

    fn clean_up(&mut self) {
        self.operations.retain(|op| !op.is_noop());
    }
}

impl std::fmt::Debug for OperationBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationBuffer")
            .field("operations", &self.operations.len())
            .field("failed", &self.failed)
            .finish()
    }
}
