/// Identifier generation tests
///
/// Batched sequence allocation under concurrency and across sessions.
/// Run with: cargo test --test id_generator_tests

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use common::*;
use rustmemorm::id::SequenceGenerator;
use rustmemorm::{MemoryDatabase, OrmError, Ref};

#[test]
fn test_threads_receive_distinct_values() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 25;
    const ALLOCATION: u32 = 10;

    let db = MemoryDatabase::new();
    db.create_sequence("ticket_seq", 1, i64::from(ALLOCATION)).unwrap();
    let generator = Arc::new(SequenceGenerator::new("ticket_seq", ALLOCATION).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let generator = Arc::clone(&generator);
            let db = db.clone();
            thread::spawn(move || {
                let mut conn = db.open();
                (0..PER_THREAD)
                    .map(|_| generator.next(&mut conn).unwrap())
                    .collect::<Vec<i64>>()
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    let distinct: HashSet<i64> = all.iter().copied().collect();
    assert_eq!(distinct.len(), THREADS * PER_THREAD);
    let expected: HashSet<i64> = (1..=(THREADS * PER_THREAD) as i64).collect();
    assert_eq!(distinct, expected);
    assert_eq!(
        db.stats().sequence_calls,
        (THREADS * PER_THREAD) as u64 / u64::from(ALLOCATION)
    );
}

#[test]
fn test_block_is_exhausted_before_reallocation() {
    let db = MemoryDatabase::new();
    db.create_sequence("s", 1, 5).unwrap();
    let generator = SequenceGenerator::new("s", 5).unwrap();
    let mut conn = db.open();

    let first: Vec<i64> = (0..5).map(|_| generator.next(&mut conn).unwrap()).collect();
    assert_eq!(first, vec![1, 2, 3, 4, 5]);
    assert_eq!(db.stats().sequence_calls, 1);

    assert_eq!(generator.next(&mut conn).unwrap(), 6);
    assert_eq!(db.stats().sequence_calls, 2);
}

#[test]
fn test_zero_allocation_size_is_rejected() {
    assert!(matches!(
        SequenceGenerator::new("s", 0),
        Err(OrmError::Configuration(_))
    ));
}

#[test]
fn test_sessions_share_one_generator() {
    let (db, factory) = setup();
    let first = factory.open_session().unwrap();
    let second = factory.open_session().unwrap();

    let mut ids = Vec::new();
    for session in [&first, &second, &first] {
        let customer = Ref::new(Customer::new("c"));
        session.persist(&customer).unwrap();
        ids.push(customer.read(|c| c.id).unwrap());
    }
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(db.stats().sequence_calls, 1);

    let generator = factory.generators().generator("customer_seq", 10).unwrap();
    assert_eq!(generator.allocation_size(), 10);
    assert!(matches!(
        factory.generators().generator("customer_seq", 20),
        Err(OrmError::Configuration(_))
    ));
}

#[test]
fn test_concurrent_sessions_persist_distinct_keys() {
    let (db, factory) = setup();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let factory = factory.clone();
            thread::spawn(move || {
                let session = factory.open_session().unwrap();
                let mut ids = Vec::new();
                for i in 0..15 {
                    let customer = Ref::new(Customer::new(&format!("c{}-{}", t, i)));
                    session.persist(&customer).unwrap();
                    ids.push(customer.read(|c| c.id).unwrap());
                }
                session.flush().unwrap();
                ids
            })
        })
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(all.insert(id));
        }
    }
    assert_eq!(all.len(), 60);
    assert_eq!(db.row_count("customers").unwrap(), 60);
    assert_eq!(db.stats().sequence_calls, 6);
}
