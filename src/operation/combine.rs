//! Combination matrix and pass-through rules.
//!
//! Calls are always `earlier.combine(later)`. A `Some(Operation::NoOp)`
//! result means the pair cancelled out.

use std::sync::Arc;

use crate::model::{AttributeUpdate, ObjectSet, same_instance};
use crate::portal::Portal;

use super::identity::touches_same_object;
use super::{
    BatchUpdateOperation, DeleteOperation, InsertOperation, MultiUpdateOperation, Operation,
    PassThroughDirection, PurgeOperation, UpdateOperation,
};

impl Operation {
    /// Merges `later` into `self`, returning the replacement for the pair.
    pub fn combine(&self, later: &Operation) -> Option<Operation> {
        match later {
            Operation::Insert(incoming) => self.combine_insert_operation(incoming),
            Operation::Delete(_) | Operation::Purge(_) => self.combine_delete_operation(later),
            Operation::Update(_) => self.combine_update(later),
            Operation::MultiUpdate(incoming) => self.combine_multi_update(incoming),
            Operation::BatchUpdate(incoming) => self.combine_batch_update(incoming),
            Operation::NoOp | Operation::DeleteByPredicate(_) => None,
        }
    }

    /// Merges a later single update into `self`.
    pub fn combine_update(&self, later: &Operation) -> Option<Operation> {
        let Operation::Update(incoming) = later else {
            return None;
        };
        if !self.same_portal(&incoming.portal) {
            return None;
        }
        match self {
            Operation::Update(existing) => combine_two_updates(existing, incoming),
            Operation::MultiUpdate(multi) => {
                absorb_into_multi(multi, incoming).map(Operation::MultiUpdate)
            }
            Operation::BatchUpdate(batch) => {
                absorb_into_batch(batch, incoming).map(Operation::BatchUpdate)
            }
            Operation::Insert(insert) => insert_absorbs(insert, later),
            _ => None,
        }
    }

    fn combine_insert_operation(&self, incoming: &InsertOperation) -> Option<Operation> {
        match self {
            Operation::Insert(existing)
                if existing.portal.same_as(&incoming.portal)
                    && !touches_same_object(self, &Operation::Insert(incoming.clone())) =>
            {
                Some(Operation::Insert(InsertOperation {
                    portal: Arc::clone(&existing.portal),
                    objects: existing.objects.concat(&incoming.objects),
                }))
            }
            _ => None,
        }
    }

    fn combine_delete_operation(&self, later: &Operation) -> Option<Operation> {
        if !later.portal().is_some_and(|p| self.same_portal(p)) {
            return None;
        }
        match (self, later) {
            (Operation::Insert(insert), Operation::Delete(_) | Operation::Purge(_)) => {
                cancel_insert(insert, later)
            }
            (Operation::Delete(existing), Operation::Delete(incoming))
                if existing.quiet == incoming.quiet && !touches_same_object(self, later) =>
            {
                Some(Operation::Delete(DeleteOperation {
                    portal: Arc::clone(&existing.portal),
                    objects: existing.objects.concat(&incoming.objects),
                    quiet: existing.quiet,
                }))
            }
            (Operation::Purge(existing), Operation::Purge(incoming))
                if !touches_same_object(self, later) =>
            {
                Some(Operation::Purge(PurgeOperation {
                    portal: Arc::clone(&existing.portal),
                    objects: existing.objects.concat(&incoming.objects),
                }))
            }
            _ => None,
        }
    }

    fn combine_multi_update(&self, incoming: &MultiUpdateOperation) -> Option<Operation> {
        if !self.same_portal(&incoming.portal) {
            return None;
        }
        match self {
            Operation::Update(single) => {
                prepend_to_multi(single, incoming).map(Operation::MultiUpdate)
            }
            Operation::MultiUpdate(existing) => {
                merge_multi_updates(existing, incoming).map(Operation::MultiUpdate)
            }
            Operation::Insert(insert) => {
                insert_absorbs(insert, &Operation::MultiUpdate(incoming.clone()))
            }
            _ => None,
        }
    }

    fn combine_batch_update(&self, incoming: &BatchUpdateOperation) -> Option<Operation> {
        if !self.same_portal(&incoming.portal) {
            return None;
        }
        let later = Operation::BatchUpdate(incoming.clone());
        match self {
            Operation::BatchUpdate(existing)
                if same_attributes(&existing.updates[0].changes, &incoming.updates[0].changes)
                    && !touches_same_object(self, &later) =>
            {
                let mut updates = existing.updates.clone();
                updates.extend(incoming.updates.iter().cloned());
                Some(Operation::BatchUpdate(BatchUpdateOperation {
                    portal: Arc::clone(&existing.portal),
                    updates,
                }))
            }
            Operation::Update(single)
                if same_attributes(&single.changes, &incoming.updates[0].changes)
                    && !touches_same_object(self, &later) =>
            {
                let mut updates = Vec::with_capacity(incoming.updates.len() + 1);
                updates.push(single.clone());
                updates.extend(incoming.updates.iter().cloned());
                Some(Operation::BatchUpdate(BatchUpdateOperation {
                    portal: Arc::clone(&single.portal),
                    updates,
                }))
            }
            Operation::Insert(insert) => insert_absorbs(insert, &later),
            _ => None,
        }
    }

    /// Direction in which `self` may be moved past its neighbour `next`.
    pub fn pass_through_direction(&self, next: &Operation) -> PassThroughDirection {
        if next.is_noop() {
            return PassThroughDirection::Both;
        }
        if !next.is_combinable_with_insert() || !self.is_combinable_with_insert() {
            return PassThroughDirection::None;
        }
        let (Some(this_portal), Some(next_portal)) = (self.portal(), next.portal()) else {
            return PassThroughDirection::None;
        };
        if this_portal.same_as(next_portal) && touches_same_object(self, next) {
            if this_portal.is_dated() {
                return self.pass_through_for_same_dated(next);
            }
            return PassThroughDirection::None;
        }
        if this_portal.is_parent_of(next_portal) {
            self.combine_direction_for_parent()
        } else if next_portal.is_parent_of(this_portal) {
            self.combine_direction_for_child()
        } else {
            PassThroughDirection::Both
        }
    }

    /// An insert and an as-of-only update of the same dated object address
    /// different milestone rows, so their relative order does not matter.
    fn pass_through_for_same_dated(&self, next: &Operation) -> PassThroughDirection {
        if matches!(self, Operation::Insert(_))
            && next.is_any_update()
            && next.is_as_of_attribute_only_update()
        {
            return PassThroughDirection::Forward;
        }
        if matches!(next, Operation::Insert(_))
            && self.is_any_update()
            && self.is_as_of_attribute_only_update()
        {
            return PassThroughDirection::Backward;
        }
        PassThroughDirection::None
    }

    /// Direction allowed when `self` targets the parent of its neighbour's portal.
    /// A parent insert must stay ahead of child rows, a parent delete behind them.
    fn combine_direction_for_parent(&self) -> PassThroughDirection {
        match self {
            Operation::NoOp => PassThroughDirection::Both,
            Operation::Insert(_) => PassThroughDirection::Backward,
            Operation::Delete(_) | Operation::Purge(_) => PassThroughDirection::Forward,
            Operation::Update(_) | Operation::BatchUpdate(_) | Operation::MultiUpdate(_) => {
                PassThroughDirection::Forward
            }
            Operation::DeleteByPredicate(_) => PassThroughDirection::None,
        }
    }

    fn combine_direction_for_child(&self) -> PassThroughDirection {
        match self {
            Operation::NoOp => PassThroughDirection::Both,
            Operation::Insert(_) => PassThroughDirection::Forward,
            Operation::Delete(_) | Operation::Purge(_) => PassThroughDirection::Backward,
            Operation::Update(_) | Operation::BatchUpdate(_) | Operation::MultiUpdate(_) => {
                PassThroughDirection::Forward
            }
            Operation::DeleteByPredicate(_) => PassThroughDirection::None,
        }
    }

    fn same_portal(&self, portal: &Portal) -> bool {
        self.portal().is_some_and(|p| p.same_as(portal))
    }
}

fn combine_two_updates(existing: &UpdateOperation, incoming: &UpdateOperation) -> Option<Operation> {
    if same_instance(&existing.object, &incoming.object)
        || existing
            .object
            .same_object_ignoring_temporal_keys(incoming.object.as_ref())
    {
        let mut merged = existing.clone();
        for change in &incoming.changes {
            merged.add_change(change.clone());
        }
        return Some(Operation::Update(merged));
    }
    if same_changes(&existing.changes, &incoming.changes) {
        let varying = existing
            .object
            .primary_key()
            .single_difference(&incoming.object.primary_key());
        if let Some(varying_key) = varying {
            return Some(Operation::MultiUpdate(MultiUpdateOperation {
                portal: Arc::clone(&existing.portal),
                changes: existing.changes.clone(),
                objects: ObjectSet::new(vec![
                    Arc::clone(&existing.object),
                    Arc::clone(&incoming.object),
                ]),
                varying_key,
            }));
        }
    }
    if same_attributes(&existing.changes, &incoming.changes) {
        return Some(Operation::BatchUpdate(BatchUpdateOperation {
            portal: Arc::clone(&existing.portal),
            updates: vec![existing.clone(), incoming.clone()],
        }));
    }
    None
}

/// Whether `single` may join `multi` as one more object.
fn fits_multi(multi: &MultiUpdateOperation, single: &UpdateOperation) -> bool {
    let Some(first) = multi.objects.first() else {
        return false;
    };
    let key = single.object.primary_key();
    let reference = first.primary_key();
    same_changes(&multi.changes, &single.changes)
        && !multi.objects.contains_key(&key)
        && key.matches_except(&reference, multi.varying_key)
}

fn absorb_into_multi(
    multi: &MultiUpdateOperation,
    single: &UpdateOperation,
) -> Option<MultiUpdateOperation> {
    if !fits_multi(multi, single) {
        return None;
    }
    Some(MultiUpdateOperation {
        portal: Arc::clone(&multi.portal),
        changes: multi.changes.clone(),
        objects: multi.objects.concat(&ObjectSet::one(Arc::clone(&single.object))),
        varying_key: multi.varying_key,
    })
}

fn prepend_to_multi(
    single: &UpdateOperation,
    multi: &MultiUpdateOperation,
) -> Option<MultiUpdateOperation> {
    if !fits_multi(multi, single) {
        return None;
    }
    Some(MultiUpdateOperation {
        portal: Arc::clone(&multi.portal),
        changes: multi.changes.clone(),
        objects: ObjectSet::one(Arc::clone(&single.object)).concat(&multi.objects),
        varying_key: multi.varying_key,
    })
}

fn merge_multi_updates(
    existing: &MultiUpdateOperation,
    incoming: &MultiUpdateOperation,
) -> Option<MultiUpdateOperation> {
    let same_objects = existing.objects.len() == incoming.objects.len()
        && existing
            .objects
            .as_slice()
            .iter()
            .zip(incoming.objects.as_slice())
            .all(|(a, b)| a.primary_key() == b.primary_key());
    if same_objects {
        let mut changes = existing.changes.clone();
        for change in &incoming.changes {
            match changes.iter_mut().find(|c| c.attribute == change.attribute) {
                Some(slot) => *slot = change.clone(),
                None => changes.push(change.clone()),
            }
        }
        return Some(MultiUpdateOperation {
            portal: Arc::clone(&existing.portal),
            changes,
            objects: existing.objects.clone(),
            varying_key: existing.varying_key,
        });
    }
    let compatible = existing.varying_key == incoming.varying_key
        && same_changes(&existing.changes, &incoming.changes)
        && match (existing.objects.first(), incoming.objects.first()) {
            (Some(a), Some(b)) => a
                .primary_key()
                .matches_except(&b.primary_key(), existing.varying_key),
            _ => false,
        }
        && !incoming
            .objects
            .as_slice()
            .iter()
            .any(|o| existing.objects.contains_key(&o.primary_key()));
    if !compatible {
        return None;
    }
    Some(MultiUpdateOperation {
        portal: Arc::clone(&existing.portal),
        changes: existing.changes.clone(),
        objects: existing.objects.concat(&incoming.objects),
        varying_key: existing.varying_key,
    })
}

fn absorb_into_batch(
    batch: &BatchUpdateOperation,
    single: &UpdateOperation,
) -> Option<BatchUpdateOperation> {
    let mut updates = batch.updates.clone();
    if let Some(existing) = updates
        .iter_mut()
        .find(|u| same_instance(&u.object, &single.object))
    {
        for change in &single.changes {
            existing.add_change(change.clone());
        }
    } else if same_attributes(&batch.updates[0].changes, &single.changes)
        && !updates.iter().any(|u| {
            u.object
                .same_object_ignoring_temporal_keys(single.object.as_ref())
        })
    {
        updates.push(single.clone());
    } else {
        return None;
    }
    Some(BatchUpdateOperation {
        portal: Arc::clone(&batch.portal),
        updates,
    })
}

/// An insert writes the latest in-transaction data, so later updates of
/// the same objects are already part of it. Dated portals keep them apart:
/// there the update addresses another milestone row.
fn insert_absorbs(insert: &InsertOperation, update: &Operation) -> Option<Operation> {
    if insert.portal.is_dated() {
        return None;
    }
    let objects = update.objects();
    let all_inserted = !objects.is_empty()
        && objects
            .iter()
            .all(|o| insert.objects.contains_key(&o.primary_key()));
    all_inserted.then(|| Operation::Insert(insert.clone()))
}

/// Insert followed by a delete of the same objects cancels out.
fn cancel_insert(insert: &InsertOperation, removal: &Operation) -> Option<Operation> {
    if insert.portal.is_dated() {
        return None;
    }
    let removed = match removal {
        Operation::Delete(op) => &op.objects,
        Operation::Purge(op) => &op.objects,
        _ => return None,
    };
    let all_inserted = removed
        .as_slice()
        .iter()
        .all(|o| insert.objects.contains_key(&o.primary_key()));
    if !all_inserted {
        return None;
    }
    let remaining = insert.objects.without(removed);
    if remaining.is_empty() {
        Some(Operation::NoOp)
    } else {
        Some(Operation::Insert(InsertOperation {
            portal: Arc::clone(&insert.portal),
            objects: remaining,
        }))
    }
}

fn attribute_names(changes: &[AttributeUpdate]) -> Vec<&str> {
    let mut names: Vec<&str> = changes.iter().map(|c| c.attribute.as_str()).collect();
    names.sort_unstable();
    names
}

fn same_attributes(a: &[AttributeUpdate], b: &[AttributeUpdate]) -> bool {
    a.len() == b.len() && attribute_names(a) == attribute_names(b)
}

/// Same attributes set to the same values, in any order.
fn same_changes(a: &[AttributeUpdate], b: &[AttributeUpdate]) -> bool {
    same_attributes(a, b)
        && a.iter().all(|change| {
            b.iter()
                .any(|other| other.attribute == change.attribute && other.value == change.value)
        })
}
