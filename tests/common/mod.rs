//! Common utilities for Thoth integration tests.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use ahash::AHashMap as HashMap;
use thoth::operation::{BatchUpdateOperation, MultiUpdateOperation};
use thoth::prelude::*;

pub type Row = BTreeMap<String, Value>;

// --- MockObject ---

/// An in-memory object whose in-transaction data follows `mark_updated`.
///
/// `committed` holds the data as of the last commit, a rollback restores it.
#[derive(Debug)]
pub struct MockObject {
    key: ObjectKey,
    data: Mutex<Row>,
    committed: Mutex<Row>,
    inserted: AtomicBool,
    deleted: AtomicBool,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl MockObject {
    pub fn new(id: i64) -> Arc<Self> {
        Self::with_key(ObjectKey::single(id))
    }

    /// An object with a two part key, used for multi-update tests.
    pub fn composite(a: i64, b: i64) -> Arc<Self> {
        Self::with_key(ObjectKey::new([Value::Int(a), Value::Int(b)]))
    }

    pub fn with_key(key: ObjectKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            data: Mutex::new(Row::new()),
            committed: Mutex::new(Row::new()),
            inserted: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        })
    }

    pub fn with_value(id: i64, attribute: &str, value: impl Into<Value>) -> Arc<Self> {
        let object = Self::new(id);
        let value = value.into();
        object
            .data
            .lock()
            .unwrap()
            .insert(attribute.to_string(), value.clone());
        object
            .committed
            .lock()
            .unwrap()
            .insert(attribute.to_string(), value);
        object
    }

    pub fn get(&self, attribute: &str) -> Option<Value> {
        self.data.lock().unwrap().get(attribute).cloned()
    }

    pub fn is_inserted(&self) -> bool {
        self.inserted.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

impl TransactionalObject for MockObject {
    fn primary_key(&self) -> ObjectKey {
        self.key.clone()
    }

    fn attribute_values(&self) -> Vec<(String, Value)> {
        self.data
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn mark_inserted(&self) {
        self.inserted.store(true, Ordering::SeqCst);
    }

    fn mark_updated(&self, update: &AttributeUpdate) {
        self.data
            .lock()
            .unwrap()
            .insert(update.attribute.clone(), update.value.clone());
    }

    fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    fn handle_commit(&self) {
        let data = self.data.lock().unwrap().clone();
        *self.committed.lock().unwrap() = data;
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_rollback(&self) {
        let committed = self.committed.lock().unwrap().clone();
        *self.data.lock().unwrap() = committed;
        self.inserted.store(false, Ordering::SeqCst);
        self.deleted.store(false, Ordering::SeqCst);
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Upcasts a mock to the handle the engine works with.
pub fn obj(object: &Arc<MockObject>) -> ObjectRef {
    Arc::clone(object) as ObjectRef
}

// --- MockPersister ---

/// Every call the engine made on a [`MockPersister`], keyed by primary key.
#[derive(Debug, Clone, PartialEq)]
pub enum PersisterCall {
    Insert(ObjectKey),
    BatchInsert(Vec<ObjectKey>),
    Delete(ObjectKey),
    BatchDelete(Vec<ObjectKey>),
    BatchDeleteQuietly(Vec<ObjectKey>),
    Purge(ObjectKey),
    BatchPurge(Vec<ObjectKey>),
    Update(ObjectKey, Vec<AttributeUpdate>),
    BatchUpdate(Vec<ObjectKey>),
    MultiUpdate(Vec<ObjectKey>, Vec<AttributeUpdate>),
    DeleteUsingOperation(String),
    PurgeUsingOperation(String),
    DeleteBatchUsingOperation(String, usize),
}

impl PersisterCall {
    /// Whether the call writes anything, as opposed to a predicate delete.
    pub fn is_object_write(&self) -> bool {
        !matches!(
            self,
            PersisterCall::DeleteUsingOperation(_)
                | PersisterCall::PurgeUsingOperation(_)
                | PersisterCall::DeleteBatchUsingOperation(..)
        )
    }
}

/// Calls of several persisters in global order, tagged with the persister name.
pub type Journal = Arc<Mutex<Vec<(String, PersisterCall)>>>;

pub fn new_journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

/// A persister backed by an in-memory table.
///
/// Predicates are written `attribute=value` (integer values) or `*`.
#[derive(Default)]
pub struct MockPersister {
    name: String,
    journal: Option<Journal>,
    calls: Mutex<Vec<PersisterCall>>,
    table: Mutex<HashMap<ObjectKey, Row>>,
    fail_next: Mutex<Option<String>>,
    short_updates: AtomicBool,
}

impl MockPersister {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A persister that also appends its calls to `journal`.
    pub fn journaled(name: &str, journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            journal: Some(Arc::clone(journal)),
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<PersisterCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// The persisted table, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<ObjectKey, Row> {
        self.table
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn row(&self, id: i64) -> Option<Row> {
        self.table.lock().unwrap().get(&ObjectKey::single(id)).cloned()
    }

    /// Seeds a committed row without going through a unit of work.
    pub fn seed(&self, key: ObjectKey, row: Row) {
        self.table.lock().unwrap().insert(key, row);
    }

    /// Makes the next write call fail with `message`.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock().unwrap() = Some(message.to_string());
    }

    /// Makes updates report zero rows.
    pub fn set_short_updates(&self, short: bool) {
        self.short_updates.store(short, Ordering::SeqCst);
    }

    fn record(&self, call: PersisterCall) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push((self.name.clone(), call.clone()));
        }
        self.calls.lock().unwrap().push(call);
        match self.fail_next.lock().unwrap().take() {
            Some(message) => Err(ThothError::Persistence {
                message,
                retriable: false,
            }),
            None => Ok(()),
        }
    }

    fn write_row(&self, object: &ObjectRef) {
        let row: Row = object.attribute_values().into_iter().collect();
        self.table.lock().unwrap().insert(object.primary_key(), row);
    }

    fn apply_update(&self, object: &ObjectRef, changes: &[AttributeUpdate]) -> usize {
        if self.short_updates.load(Ordering::SeqCst) {
            return 0;
        }
        let mut table = self.table.lock().unwrap();
        match table.get_mut(&object.primary_key()) {
            Some(row) => {
                for change in changes {
                    row.insert(change.attribute.clone(), change.value.clone());
                }
                1
            }
            None => 0,
        }
    }

    fn delete_matching(&self, expression: &str) -> usize {
        let mut table = self.table.lock().unwrap();
        let before = table.len();
        if expression == "*" {
            table.clear();
        } else if let Some((attribute, value)) = expression.split_once('=') {
            let value = value
                .parse::<i64>()
                .map(Value::Int)
                .unwrap_or_else(|_| Value::from(value));
            table.retain(|_, row| row.get(attribute) != Some(&value));
        }
        before - table.len()
    }
}

fn keys(objects: &[ObjectRef]) -> Vec<ObjectKey> {
    objects.iter().map(|o| o.primary_key()).collect()
}

impl Persister for MockPersister {
    fn insert(&self, object: &ObjectRef) -> Result<()> {
        self.record(PersisterCall::Insert(object.primary_key()))?;
        self.write_row(object);
        Ok(())
    }

    fn batch_insert(&self, objects: &[ObjectRef], _bulk_insert_threshold: usize) -> Result<()> {
        self.record(PersisterCall::BatchInsert(keys(objects)))?;
        for object in objects {
            self.write_row(object);
        }
        Ok(())
    }

    fn delete(&self, object: &ObjectRef) -> Result<()> {
        self.record(PersisterCall::Delete(object.primary_key()))?;
        self.table.lock().unwrap().remove(&object.primary_key());
        Ok(())
    }

    fn batch_delete(&self, objects: &[ObjectRef]) -> Result<()> {
        self.record(PersisterCall::BatchDelete(keys(objects)))?;
        let mut table = self.table.lock().unwrap();
        for object in objects {
            table.remove(&object.primary_key());
        }
        Ok(())
    }

    fn batch_delete_quietly(&self, objects: &[ObjectRef]) -> Result<()> {
        self.record(PersisterCall::BatchDeleteQuietly(keys(objects)))?;
        let mut table = self.table.lock().unwrap();
        for object in objects {
            table.remove(&object.primary_key());
        }
        Ok(())
    }

    fn purge(&self, object: &ObjectRef) -> Result<()> {
        self.record(PersisterCall::Purge(object.primary_key()))?;
        self.table.lock().unwrap().remove(&object.primary_key());
        Ok(())
    }

    fn batch_purge(&self, objects: &[ObjectRef]) -> Result<()> {
        self.record(PersisterCall::BatchPurge(keys(objects)))?;
        let mut table = self.table.lock().unwrap();
        for object in objects {
            table.remove(&object.primary_key());
        }
        Ok(())
    }

    fn update(&self, object: &ObjectRef, changes: &[AttributeUpdate]) -> Result<usize> {
        self.record(PersisterCall::Update(object.primary_key(), changes.to_vec()))?;
        Ok(self.apply_update(object, changes))
    }

    fn batch_update(&self, batch: &BatchUpdateOperation) -> Result<usize> {
        let objects: Vec<ObjectRef> = batch.updates().iter().map(|u| Arc::clone(u.object())).collect();
        self.record(PersisterCall::BatchUpdate(keys(&objects)))?;
        Ok(batch
            .updates()
            .iter()
            .map(|u| self.apply_update(u.object(), u.changes()))
            .sum())
    }

    fn multi_update(&self, multi: &MultiUpdateOperation) -> Result<usize> {
        let objects = multi.objects().as_slice();
        self.record(PersisterCall::MultiUpdate(keys(objects), multi.changes().to_vec()))?;
        Ok(objects
            .iter()
            .map(|o| self.apply_update(o, multi.changes()))
            .sum())
    }

    fn delete_using_operation(&self, predicate: &Predicate) -> Result<usize> {
        self.record(PersisterCall::DeleteUsingOperation(
            predicate.expression().to_string(),
        ))?;
        Ok(self.delete_matching(predicate.expression()))
    }

    fn purge_using_operation(&self, predicate: &Predicate) -> Result<usize> {
        self.record(PersisterCall::PurgeUsingOperation(
            predicate.expression().to_string(),
        ))?;
        Ok(self.delete_matching(predicate.expression()))
    }

    fn delete_batch_using_operation(&self, predicate: &Predicate, batch_size: usize) -> Result<usize> {
        self.record(PersisterCall::DeleteBatchUsingOperation(
            predicate.expression().to_string(),
            batch_size,
        ))?;
        Ok(self.delete_matching(predicate.expression()))
    }
}

// --- MockCache ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Prepare(u64),
    Commit(u64),
    Rollback(u64),
}

pub struct MockCache {
    name: String,
    events: Mutex<Vec<CacheEvent>>,
    fail_prepare: AtomicBool,
}

impl MockCache {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
            fail_prepare: AtomicBool::new(false),
        })
    }

    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn set_fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }
}

impl Cache for MockCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare_for_commit(&self, tx_id: u64) -> Result<()> {
        self.events.lock().unwrap().push(CacheEvent::Prepare(tx_id));
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(ThothError::Persistence {
                message: format!("cache {} refused to prepare", self.name),
                retriable: false,
            });
        }
        Ok(())
    }

    fn commit(&self, tx_id: u64) {
        self.events.lock().unwrap().push(CacheEvent::Commit(tx_id));
    }

    fn rollback(&self, tx_id: u64) {
        self.events.lock().unwrap().push(CacheEvent::Rollback(tx_id));
    }
}

// --- MockUpdateCounter ---

#[derive(Default)]
pub struct MockUpdateCounter {
    pub increments: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
}

impl MockUpdateCounter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl UpdateCountHolder for MockUpdateCounter {
    fn increment_update_count(&self) {
        self.increments.fetch_add(1, Ordering::SeqCst);
    }

    fn commit_update_count(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }

    fn rollback_update_count(&self) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }
}

// --- Helper Functions ---

/// A plain portal over a fresh [`MockPersister`].
pub fn setup_portal(name: &str) -> (Arc<Portal>, Arc<MockPersister>) {
    let persister = MockPersister::new();
    let portal = Portal::builder(name, Arc::clone(&persister) as Arc<dyn Persister>).build();
    (portal, persister)
}

pub fn setup_thoth() -> Thoth {
    Thoth::new(ThothConfig::default())
}

pub fn seed_row(persister: &MockPersister, id: i64, attribute: &str, value: impl Into<Value>) {
    let mut row = Row::new();
    row.insert(attribute.to_string(), value.into());
    persister.seed(ObjectKey::single(id), row);
}

pub fn int(value: i64) -> Value {
    Value::Int(value)
}
