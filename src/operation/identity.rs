use ahash::AHashSet as HashSet;

use crate::model::{ObjectKey, ObjectRef};

use super::Operation;

/// Operations at most this large are compared pairwise.
const LOOP_COMPARE_LIMIT: usize = 8;

/// Whether `a` and `b` share a subject object, ignoring temporal keys.
pub fn touches_same_object(a: &Operation, b: &Operation) -> bool {
    let left = a.objects();
    let right = b.objects();
    if left.is_empty() || right.is_empty() {
        return false;
    }
    if left.len() == 1 && right.len() == 1 {
        return left[0].same_object_ignoring_temporal_keys(right[0].as_ref());
    }
    if left.len() <= LOOP_COMPARE_LIMIT || right.len() <= LOOP_COMPARE_LIMIT {
        return loop_compare(&left, &right);
    }
    let (smaller, bigger) = if left.len() > right.len() {
        (b, &left)
    } else {
        (a, &right)
    };
    match smaller.indexed_keys() {
        Some(index) => index_compare(index, bigger),
        None => {
            let index: HashSet<ObjectKey> =
                smaller.objects().iter().map(|o| o.primary_key()).collect();
            index_compare(&index, bigger)
        }
    }
}

fn loop_compare(left: &[ObjectRef], right: &[ObjectRef]) -> bool {
    let (small, large) = if left.len() > right.len() {
        (right, left)
    } else {
        (left, right)
    };
    large.iter().any(|object| {
        small
            .iter()
            .any(|other| object.same_object_ignoring_temporal_keys(other.as_ref()))
    })
}

fn index_compare(index: &HashSet<ObjectKey>, large: &[ObjectRef]) -> bool {
    large.iter().any(|object| index.contains(&object.primary_key()))
}
