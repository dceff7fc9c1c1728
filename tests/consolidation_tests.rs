mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::{Journal, MockObject, MockPersister, PersisterCall, Row, int, new_journal, obj};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thoth::prelude::*;

fn portal_over(name: &str, persister: &Arc<MockPersister>) -> Arc<Portal> {
    Portal::builder(name, Arc::clone(persister) as Arc<dyn Persister>).build()
}

fn journaled_portal(name: &str, journal: &Journal) -> (Arc<Portal>, Arc<MockPersister>) {
    let persister = MockPersister::journaled(name, journal);
    (portal_over(name, &persister), persister)
}

fn value_row(value: i64) -> Row {
    let mut row = Row::new();
    row.insert("value".to_string(), int(value));
    row
}

/// Write calls flattened to one `(kind, key)` pair per touched object.
fn flatten(calls: &[PersisterCall]) -> Vec<(&'static str, ObjectKey)> {
    let mut flat = Vec::new();
    for call in calls {
        match call {
            PersisterCall::Insert(k) => flat.push(("insert", k.clone())),
            PersisterCall::BatchInsert(ks) => flat.extend(ks.iter().map(|k| ("insert", k.clone()))),
            PersisterCall::Delete(k) => flat.push(("delete", k.clone())),
            PersisterCall::BatchDelete(ks) | PersisterCall::BatchDeleteQuietly(ks) => {
                flat.extend(ks.iter().map(|k| ("delete", k.clone())))
            }
            PersisterCall::Purge(k) => flat.push(("purge", k.clone())),
            PersisterCall::BatchPurge(ks) => flat.extend(ks.iter().map(|k| ("purge", k.clone()))),
            PersisterCall::Update(k, _) => flat.push(("update", k.clone())),
            PersisterCall::BatchUpdate(ks) | PersisterCall::MultiUpdate(ks, _) => {
                flat.extend(ks.iter().map(|k| ("update", k.clone())))
            }
            other => panic!("unexpected predicate call {:?}", other),
        }
    }
    flat.sort();
    flat
}

fn call_keys(call: &PersisterCall) -> Vec<ObjectKey> {
    match call {
        PersisterCall::Insert(k)
        | PersisterCall::Delete(k)
        | PersisterCall::Purge(k)
        | PersisterCall::Update(k, _) => vec![k.clone()],
        PersisterCall::BatchInsert(ks)
        | PersisterCall::BatchDelete(ks)
        | PersisterCall::BatchDeleteQuietly(ks)
        | PersisterCall::BatchPurge(ks)
        | PersisterCall::BatchUpdate(ks)
        | PersisterCall::MultiUpdate(ks, _) => ks.clone(),
        _ => Vec::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Life {
    New,
    Exists,
    Gone,
}

/// One subject of a generated workload, mirrored on two portal sets.
struct Subject {
    object: Arc<MockObject>,
    portal: usize,
    life: Life,
}

/// Buffers a random workload into `buffer` and records the same operations,
/// one by one, in `twin` against the twin portals.
struct Workload {
    subjects: Vec<Subject>,
    buffer: OperationBuffer,
    twin: Vec<Operation>,
}

impl Workload {
    fn new(
        rng: &mut StdRng,
        count: usize,
        portals: &[Arc<Portal>],
        persisters: &[Arc<MockPersister>],
        twin_persisters: &[Arc<MockPersister>],
    ) -> Self {
        let mut subjects = Vec::with_capacity(count);
        for id in 0..count as i64 {
            let portal = rng.random_range(0..portals.len());
            let initial = rng.random_range(0..3);
            let object = MockObject::with_value(id, "value", int(initial));
            let life = if rng.random_bool(0.5) {
                persisters[portal].seed(ObjectKey::single(id), value_row(initial));
                twin_persisters[portal].seed(ObjectKey::single(id), value_row(initial));
                Life::Exists
            } else {
                Life::New
            };
            subjects.push(Subject {
                object,
                portal,
                life,
            });
        }
        Self {
            subjects,
            buffer: OperationBuffer::new(ConsolidationConfig::default()),
            twin: Vec::new(),
        }
    }

    /// Applies one lifecycle step to subject `index`. Returns false once the subject is gone.
    fn step(
        &mut self,
        rng: &mut StdRng,
        index: usize,
        portals: &[Arc<Portal>],
        twin_portals: &[Arc<Portal>],
    ) -> bool {
        let subject = &mut self.subjects[index];
        let object = obj(&subject.object);
        let portal = &portals[subject.portal];
        let twin_portal = &twin_portals[subject.portal];
        match subject.life {
            Life::Gone => return false,
            Life::New => {
                subject.object.mark_inserted();
                self.buffer.add(Operation::insert(portal, Arc::clone(&object)));
                self.twin.push(Operation::insert(twin_portal, object));
                subject.life = Life::Exists;
            }
            Life::Exists => match rng.random_range(0..6) {
                0 => {
                    subject.object.mark_deleted();
                    self.buffer.add(Operation::delete(portal, Arc::clone(&object)));
                    self.twin.push(Operation::delete(twin_portal, object));
                    subject.life = Life::Gone;
                }
                1 => {
                    subject.object.mark_deleted();
                    self.buffer
                        .add(Operation::delete_quietly(portal, Arc::clone(&object)));
                    self.twin.push(Operation::delete_quietly(twin_portal, object));
                    subject.life = Life::Gone;
                }
                2 => {
                    subject.object.mark_deleted();
                    self.buffer.add(Operation::purge(portal, Arc::clone(&object)));
                    self.twin.push(Operation::purge(twin_portal, object));
                    subject.life = Life::Gone;
                }
                _ => {
                    let change = AttributeUpdate::new("value", int(rng.random_range(0..3)));
                    subject.object.mark_updated(&change);
                    self.buffer.add_update(portal, &object, change.clone());
                    self.twin
                        .push(Operation::update(twin_portal, object, vec![change]));
                }
            },
        }
        true
    }
}

fn two_portal_sets() -> (
    Vec<Arc<Portal>>,
    Vec<Arc<MockPersister>>,
    Vec<Arc<Portal>>,
    Vec<Arc<MockPersister>>,
) {
    let persisters = vec![MockPersister::new(), MockPersister::new()];
    let twins = vec![MockPersister::new(), MockPersister::new()];
    let portals = vec![
        portal_over("account", &persisters[0]),
        portal_over("ledger", &persisters[1]),
    ];
    let twin_portals = vec![
        portal_over("account", &twins[0]),
        portal_over("ledger", &twins[1]),
    ];
    (portals, persisters, twin_portals, twins)
}

#[test]
fn test_consolidation_matches_individual_execution_for_disjoint_objects() {
    let ctx = ExecutionContext::default();
    for seed in 0..50 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (portals, persisters, twin_portals, twins) = two_portal_sets();
        let count = rng.random_range(1..30);
        let mut workload = Workload::new(&mut rng, count, &portals, &persisters, &twins);

        let mut order: Vec<usize> = (0..count).collect();
        // shuffle so the two portals interleave
        for i in (1..order.len()).rev() {
            let j = rng.random_range(0..=i);
            order.swap(i, j);
        }
        for index in order {
            workload.step(&mut rng, index, &portals, &twin_portals);
        }

        let issued = workload.twin.len();
        workload.buffer.execute_all(&ctx).unwrap();
        for op in &workload.twin {
            op.execute(&ctx).unwrap();
        }

        for (mine, twin) in persisters.iter().zip(&twins) {
            assert_eq!(mine.snapshot(), twin.snapshot(), "state differs for seed {}", seed);
            assert_eq!(
                flatten(&mine.calls()),
                flatten(&twin.calls()),
                "calls differ for seed {}",
                seed
            );
        }
        let round_trips: usize = persisters.iter().map(|p| p.calls().len()).sum();
        assert!(round_trips <= issued);
        assert!(workload.buffer.is_empty());
    }
}

#[test]
fn test_consolidation_preserves_state_across_object_lifecycles() {
    let ctx = ExecutionContext::default();
    for seed in 100..160 {
        let mut rng = StdRng::seed_from_u64(seed);
        let (portals, persisters, twin_portals, twins) = two_portal_sets();
        let count = rng.random_range(2..12);
        let mut workload = Workload::new(&mut rng, count, &portals, &persisters, &twins);

        for _ in 0..rng.random_range(5..40) {
            let index = rng.random_range(0..count);
            workload.step(&mut rng, index, &portals, &twin_portals);
        }

        workload.buffer.execute_all(&ctx).unwrap();
        for op in &workload.twin {
            op.execute(&ctx).unwrap();
        }

        for (mine, twin) in persisters.iter().zip(&twins) {
            assert_eq!(mine.snapshot(), twin.snapshot(), "state differs for seed {}", seed);
        }
    }
}

#[test]
fn test_insert_then_delete_leaves_no_trace() {
    let ctx = ExecutionContext::default();
    for seed in 0..40 {
        let mut rng = StdRng::seed_from_u64(seed);
        let journal = new_journal();
        let (accounts, _) = journaled_portal("account", &journal);
        let (ledger, ledger_persister) = journaled_portal("ledger", &journal);
        let mut buffer = OperationBuffer::new(ConsolidationConfig::default());

        let doomed = MockObject::with_value(0, "value", int(1));
        buffer.add(Operation::insert(&accounts, obj(&doomed)));
        for _ in 0..rng.random_range(0..3) {
            let change = AttributeUpdate::new("value", int(rng.random_range(0..5)));
            doomed.mark_updated(&change);
            buffer.add_update(&accounts, &obj(&doomed), change);
        }

        let mut next_id = 1;
        for _ in 0..rng.random_range(0..7) {
            let other = MockObject::with_value(next_id, "value", int(0));
            next_id += 1;
            match rng.random_range(0..5) {
                0 => buffer.add(Operation::insert(&accounts, obj(&other))),
                1 => {
                    buffer.add_update(&accounts, &obj(&other), AttributeUpdate::new("value", int(3)));
                }
                2 => buffer.add(Operation::insert(&ledger, obj(&other))),
                3 => {
                    ledger_persister.seed(other.primary_key(), value_row(0));
                    buffer.add(Operation::delete(&ledger, obj(&other)));
                }
                _ => {
                    ledger_persister.seed(other.primary_key(), value_row(0));
                    buffer.add(Operation::purge(&ledger, obj(&other)));
                }
            }
        }

        if rng.random_bool(0.5) {
            buffer.add(Operation::delete(&accounts, obj(&doomed)));
        } else {
            buffer.add(Operation::purge(&accounts, obj(&doomed)));
        }
        buffer.execute_all(&ctx).unwrap();

        let doomed_key = doomed.primary_key();
        for (portal, call) in journal.lock().unwrap().iter() {
            assert!(
                !(portal == "account" && call_keys(call).contains(&doomed_key)),
                "seed {}: {:?} touched the cancelled object",
                seed,
                call
            );
        }
    }
}

#[test]
fn test_adjacent_insert_and_delete_cancel_while_buffering() {
    let journal = new_journal();
    let (accounts, persister) = journaled_portal("account", &journal);
    let a = MockObject::new(1);
    let b = MockObject::new(2);
    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());

    buffer.add(Operation::insert(&accounts, obj(&a)));
    buffer.add(Operation::insert(&accounts, obj(&b)));
    assert_eq!(buffer.len(), 1);
    buffer.add(Operation::delete(&accounts, obj(&a)));
    assert_eq!(buffer.len(), 1);
    buffer.add(Operation::purge(&accounts, obj(&b)));
    assert!(buffer.is_empty());

    buffer.execute_all(&ExecutionContext::default()).unwrap();
    assert!(persister.calls().is_empty());
}

fn parent_and_child(journal: &Journal) -> (Arc<Portal>, Arc<MockPersister>, Arc<Portal>, Arc<MockPersister>) {
    let customer_persister = MockPersister::journaled("customer", journal);
    let order_persister = MockPersister::journaled("order", journal);
    let customers = Portal::builder(
        "customer",
        Arc::clone(&customer_persister) as Arc<dyn Persister>,
    )
    .parent_of("order")
    .build();
    let orders = portal_over("order", &order_persister);
    (customers, customer_persister, orders, order_persister)
}

#[test]
fn test_parent_inserts_stay_ahead_of_child_inserts() {
    let journal = new_journal();
    let (customers, _, orders, _) = parent_and_child(&journal);
    let p1 = MockObject::new(1);
    let p2 = MockObject::new(2);
    let c1 = MockObject::new(101);
    let c2 = MockObject::new(102);

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    buffer.add(Operation::insert(&customers, obj(&p1)));
    buffer.add(Operation::insert(&orders, obj(&c1)));
    buffer.add(Operation::insert(&customers, obj(&p2)));
    buffer.add(Operation::insert(&orders, obj(&c2)));
    buffer.consolidate();

    let kinds: Vec<OperationKind> = buffer.operations().iter().map(Operation::kind).collect();
    assert_eq!(kinds, vec![OperationKind::Insert, OperationKind::Insert]);

    buffer.execute_all(&ExecutionContext::default()).unwrap();
    let journal = journal.lock().unwrap().clone();
    assert_eq!(
        journal,
        vec![
            (
                "customer".to_string(),
                PersisterCall::BatchInsert(vec![ObjectKey::single(1), ObjectKey::single(2)])
            ),
            (
                "order".to_string(),
                PersisterCall::BatchInsert(vec![ObjectKey::single(101), ObjectKey::single(102)])
            ),
        ]
    );
}

#[test]
fn test_child_deletes_stay_ahead_of_parent_deletes() {
    let journal = new_journal();
    let (customers, _, orders, _) = parent_and_child(&journal);
    let p1 = MockObject::new(1);
    let p2 = MockObject::new(2);
    let c1 = MockObject::new(101);
    let c2 = MockObject::new(102);

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    buffer.add(Operation::delete(&orders, obj(&c1)));
    buffer.add(Operation::delete(&customers, obj(&p1)));
    buffer.add(Operation::delete(&orders, obj(&c2)));
    buffer.add(Operation::delete(&customers, obj(&p2)));
    buffer.execute_all(&ExecutionContext::default()).unwrap();

    let journal = journal.lock().unwrap().clone();
    assert_eq!(
        journal,
        vec![
            (
                "order".to_string(),
                PersisterCall::BatchDelete(vec![ObjectKey::single(101), ObjectKey::single(102)])
            ),
            (
                "customer".to_string(),
                PersisterCall::BatchDelete(vec![ObjectKey::single(1), ObjectKey::single(2)])
            ),
        ]
    );
}

#[test]
fn test_parent_child_order_survives_random_workloads() {
    for seed in 0..60 {
        let mut rng = StdRng::seed_from_u64(seed);
        let journal = new_journal();
        let (customers, customer_persister, orders, order_persister) = parent_and_child(&journal);
        let mut buffer = OperationBuffer::new(ConsolidationConfig::default());

        // (is_parent, is_insert, key) in issue order
        let mut issued = Vec::new();
        for id in 0..rng.random_range(2..25) {
            let is_parent = rng.random_bool(0.5);
            let is_insert = rng.random_bool(0.5);
            let (portal, persister) = if is_parent {
                (&customers, &customer_persister)
            } else {
                (&orders, &order_persister)
            };
            let object = MockObject::with_value(id, "value", int(0));
            if is_insert {
                buffer.add(Operation::insert(portal, obj(&object)));
            } else {
                persister.seed(object.primary_key(), value_row(0));
                buffer.add(Operation::delete(portal, obj(&object)));
            }
            issued.push((is_parent, is_insert, object.primary_key()));
        }
        buffer.execute_all(&ExecutionContext::default()).unwrap();

        let journal = journal.lock().unwrap().clone();
        let position = |is_parent: bool, key: &ObjectKey| {
            let name = if is_parent { "customer" } else { "order" };
            journal
                .iter()
                .position(|(portal, call)| portal == name && call_keys(call).contains(key))
                .unwrap()
        };
        for (i, (first_parent, first_insert, first_key)) in issued.iter().enumerate() {
            for (second_parent, second_insert, second_key) in &issued[i + 1..] {
                if first_parent == second_parent || first_insert != second_insert {
                    continue;
                }
                let first = position(*first_parent, first_key);
                let second = position(*second_parent, second_key);
                if *first_insert && *first_parent {
                    assert!(first < second, "seed {}: child insert moved before its parent", seed);
                }
                if !*first_insert && !*first_parent {
                    assert!(first < second, "seed {}: parent delete moved before its child", seed);
                }
            }
        }
    }
}

#[test]
fn test_lookahead_bounds_how_far_operations_travel() {
    let build = |config: ConsolidationConfig| {
        let (accounts, _) = common::setup_portal("account");
        let (ledger, _) = common::setup_portal("ledger");
        let (audit, _) = common::setup_portal("audit");
        let mut buffer = OperationBuffer::new(config);
        buffer.add(Operation::insert(&accounts, obj(&MockObject::new(1))));
        buffer.add(Operation::insert(&ledger, obj(&MockObject::new(2))));
        buffer.add(Operation::insert(&audit, obj(&MockObject::new(3))));
        buffer.add(Operation::insert(&accounts, obj(&MockObject::new(4))));
        buffer.consolidate();
        buffer.len()
    };

    assert_eq!(build(ConsolidationConfig::default()), 3);
    assert_eq!(
        build(ConsolidationConfig {
            max_lookahead: 1,
            ..ConsolidationConfig::default()
        }),
        4
    );
    assert_eq!(
        build(ConsolidationConfig {
            max_lookahead: 10,
            max_rounds: 0,
        }),
        4
    );
}

#[test]
fn test_updates_with_equal_values_become_a_multi_update() {
    let (accounts, persister) = common::setup_portal("account");
    let objects: Vec<Arc<MockObject>> = (1..=3)
        .map(|b| MockObject::composite(7, b))
        .collect();
    for o in &objects {
        persister.seed(o.primary_key(), value_row(0));
    }

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    for o in &objects {
        assert!(buffer.add_update(&accounts, &obj(o), AttributeUpdate::new("value", int(9))));
    }
    buffer.consolidate();
    assert_eq!(buffer.len(), 1);
    assert_eq!(buffer.operations()[0].kind(), OperationKind::MultiUpdate);
    assert_eq!(buffer.total_operations(), 3);

    buffer.execute_all(&ExecutionContext::default()).unwrap();
    assert_eq!(
        persister.calls(),
        vec![PersisterCall::MultiUpdate(
            objects.iter().map(|o| o.primary_key()).collect(),
            vec![AttributeUpdate::new("value", int(9))]
        )]
    );
    for o in &objects {
        assert_eq!(persister.snapshot()[&o.primary_key()]["value"], int(9));
    }
}

#[test]
fn test_keys_differing_twice_fall_back_to_a_batch_update() {
    let (accounts, persister) = common::setup_portal("account");
    let a = MockObject::composite(1, 1);
    let b = MockObject::composite(2, 2);

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    buffer.add_update(&accounts, &obj(&a), AttributeUpdate::new("value", int(5)));
    buffer.add_update(&accounts, &obj(&b), AttributeUpdate::new("value", int(5)));
    buffer.execute_all(&ExecutionContext::default()).unwrap();

    assert_eq!(
        persister.calls(),
        vec![PersisterCall::BatchUpdate(vec![a.primary_key(), b.primary_key()])]
    );
}

#[test]
fn test_dated_portals_keep_milestone_operations_apart() {
    let persister = MockPersister::new();
    let positions = Portal::builder("position", Arc::clone(&persister) as Arc<dyn Persister>)
        .dated(true)
        .build();
    let a = MockObject::new(1);

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    buffer.add(Operation::insert(&positions, obj(&a)));
    buffer.add(Operation::update(
        &positions,
        obj(&a),
        vec![AttributeUpdate::as_of("out_z", Value::Timestamp(1_000))],
    ));
    buffer.add(Operation::delete(&positions, obj(&a)));
    buffer.consolidate();
    assert_eq!(buffer.len(), 3);

    buffer.execute_all(&ExecutionContext::default()).unwrap();
    let calls = persister.calls();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[0], PersisterCall::Insert(a.primary_key()));
    assert_eq!(calls[2], PersisterCall::Delete(a.primary_key()));
}

#[test]
fn test_failed_buffer_drops_remaining_operations() {
    let journal = new_journal();
    let (accounts, account_persister) = journaled_portal("account", &journal);
    let (ledger, ledger_persister) = journaled_portal("ledger", &journal);
    account_persister.fail_next("disk full");

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    buffer.add(Operation::insert(&accounts, obj(&MockObject::new(1))));
    buffer.add(Operation::insert(&ledger, obj(&MockObject::new(2))));
    let result = buffer.execute_all(&ExecutionContext::default());

    assert!(matches!(result, Err(ThothError::Persistence { .. })));
    assert!(buffer.is_failed());
    assert!(buffer.is_empty());
    assert!(ledger_persister.calls().is_empty());

    // a failed buffer swallows whatever is added later
    buffer.add(Operation::insert(&ledger, obj(&MockObject::new(3))));
    buffer.execute_all(&ExecutionContext::default()).unwrap();
    assert!(ledger_persister.calls().is_empty());
    assert!(buffer.is_empty());
}

#[test]
fn test_update_counters_are_settled_once_per_portal() {
    let persister = MockPersister::new();
    let counter = common::MockUpdateCounter::new();
    let accounts = Portal::builder("account", Arc::clone(&persister) as Arc<dyn Persister>)
        .update_counter(Arc::clone(&counter) as Arc<dyn UpdateCountHolder>)
        .build();

    let mut buffer = OperationBuffer::new(ConsolidationConfig::default());
    buffer.add(Operation::insert(&accounts, obj(&MockObject::new(1))));
    buffer.add(Operation::insert(&accounts, obj(&MockObject::new(2))));
    buffer.commit_update_counts();
    buffer.commit_update_counts();

    assert_eq!(counter.increments.load(Ordering::SeqCst), 2);
    assert_eq!(counter.commits.load(Ordering::SeqCst), 1);
    assert_eq!(counter.rollbacks.load(Ordering::SeqCst), 0);
}
