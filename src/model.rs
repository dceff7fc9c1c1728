use std::fmt;
use std::sync::{Arc, OnceLock};

use ahash::AHashSet as HashSet;
use serde::{Deserialize, Serialize};

/// A scalar attribute value as seen by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Bytes(Vec<u8>),
    /// Milliseconds since the epoch.
    Timestamp(i64),
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Primary key of a persisted object with the bitemporal as-of attributes left out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(pub Vec<Value>);

impl ObjectKey {
    pub fn new(values: impl IntoIterator<Item = Value>) -> Self {
        Self(values.into_iter().collect())
    }

    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Returns the only position in which `self` and `other` differ, if exactly one does.
    pub fn single_difference(&self, other: &ObjectKey) -> Option<usize> {
        if self.arity() != other.arity() {
            return None;
        }
        let mut differing = self
            .0
            .iter()
            .zip(other.0.iter())
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(position, _)| position);
        match (differing.next(), differing.next()) {
            (Some(position), None) => Some(position),
            _ => None,
        }
    }

    /// True when both keys agree everywhere except possibly at `position`.
    pub fn matches_except(&self, other: &ObjectKey, position: usize) -> bool {
        self.arity() == other.arity()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .enumerate()
                .all(|(i, (a, b))| i == position || a == b)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:?}", value)?;
        }
        write!(f, ")")
    }
}

/// A single attribute change carried by an update operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeUpdate {
    pub attribute: String,
    pub value: Value,
    /// Set when the attribute is a temporal as-of attribute (e.g. terminating a milestone).
    pub as_of: bool,
}

impl AttributeUpdate {
    pub fn new(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
            as_of: false,
        }
    }

    pub fn as_of(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
            as_of: true,
        }
    }
}

/// In-memory transactional state of a persisted object.
///
/// The engine never looks inside an object. It only needs the identity
/// predicates used by consolidation and the `mark_*` notifications, which
/// are fired when a mutation is buffered so the object can track its
/// in-transaction data. Once the unit of work finishes, every object it
/// touched or read-locked hears the outcome through `handle_commit` or
/// `handle_rollback`, exactly once.
pub trait TransactionalObject: Send + Sync + fmt::Debug {
    /// Primary key, ignoring as-of attributes.
    fn primary_key(&self) -> ObjectKey;

    /// Whether `other` denotes the same logical row once temporal keys are ignored.
    fn same_object_ignoring_temporal_keys(&self, other: &dyn TransactionalObject) -> bool {
        self.primary_key() == other.primary_key()
    }

    /// In-transaction attribute values, read by persisters when the object is inserted.
    fn attribute_values(&self) -> Vec<(String, Value)> {
        Vec::new()
    }

    fn mark_inserted(&self) {}

    /// Applies `update` to the in-transaction data of the object.
    fn mark_updated(&self, _update: &AttributeUpdate) {}

    fn mark_deleted(&self) {}

    /// The unit of work that enrolled the object committed. The
    /// in-transaction data becomes the committed data.
    fn handle_commit(&self) {}

    /// The unit of work that enrolled the object rolled back. In-transaction
    /// changes are discarded and shared read locks released.
    fn handle_rollback(&self) {}
}

pub type ObjectRef = Arc<dyn TransactionalObject>;

/// Pointer identity of two object handles.
pub fn same_instance(a: &ObjectRef, b: &ObjectRef) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Ordered list of subject objects with a lazily built unique key index.
#[derive(Clone, Default)]
pub struct ObjectSet {
    objects: Vec<ObjectRef>,
    index: OnceLock<Arc<HashSet<ObjectKey>>>,
}

impl ObjectSet {
    pub fn new(objects: Vec<ObjectRef>) -> Self {
        Self {
            objects,
            index: OnceLock::new(),
        }
    }

    pub fn one(object: ObjectRef) -> Self {
        Self::new(vec![object])
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn as_slice(&self) -> &[ObjectRef] {
        &self.objects
    }

    pub fn first(&self) -> Option<&ObjectRef> {
        self.objects.first()
    }

    /// Built on first use and reused for the lifetime of the set.
    pub fn key_index(&self) -> &HashSet<ObjectKey> {
        self.index.get_or_init(|| {
            Arc::new(self.objects.iter().map(|o| o.primary_key()).collect())
        })
    }

    pub fn contains_key(&self, key: &ObjectKey) -> bool {
        self.key_index().contains(key)
    }

    /// Concatenation of `self` followed by `other`.
    pub fn concat(&self, other: &ObjectSet) -> ObjectSet {
        let mut objects = Vec::with_capacity(self.len() + other.len());
        objects.extend(self.objects.iter().cloned());
        objects.extend(other.objects.iter().cloned());
        ObjectSet::new(objects)
    }

    /// Objects of `self` whose key does not appear in `removed`.
    pub fn without(&self, removed: &ObjectSet) -> ObjectSet {
        let remaining = self
            .objects
            .iter()
            .filter(|o| !removed.contains_key(&o.primary_key()))
            .cloned()
            .collect();
        ObjectSet::new(remaining)
    }
}

impl fmt::Debug for ObjectSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.objects.iter().map(|o| o.primary_key()))
            .finish()
    }
}
