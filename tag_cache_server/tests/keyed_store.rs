use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tag_cache_server::errors::CacheError;
use tag_cache_server::store::{CacheObject, KeyedStore, LockPolicy};

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    id: u64,
    hits: Vec<u64>,
}

impl Counter {
    fn new(id: u64) -> Self {
        Counter { id, hits: Vec::new() }
    }
}

impl CacheObject for Counter {
    fn id(&self) -> u64 {
        self.id
    }

    fn deep_copy(&self) -> Self {
        self.clone()
    }
}

#[test]
fn basic_operations() {
    let store = KeyedStore::<Counter>::new("counter");
    assert!(store.is_empty());

    store.put(Counter::new(1));
    assert!(store.put_if_absent(Counter::new(2)));
    assert!(!store.put_if_absent(Counter::new(2)));
    assert_eq!(store.len(), 2);

    let mut ids = store.ids();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2]);

    store.with_write(1, |counter| counter.hits.push(7)).unwrap();
    assert_eq!(store.with_read(1, |counter| counter.hits.len()).unwrap(), 1);

    let copy = store.get_copy(1).unwrap();
    store.with_write(1, |counter| counter.hits.push(8)).unwrap();
    assert_eq!(copy.hits, vec![7]);
    assert_eq!(store.get_copy(1).unwrap().hits, vec![7, 8]);

    // Replacing drops the old value.
    store.put(Counter::new(1));
    assert!(store.get_copy(1).unwrap().hits.is_empty());

    assert!(store.remove(2));
    assert!(!store.remove(2));
    assert!(!store.contains(2));
}

#[test]
fn missing_key_is_not_found() {
    let store = KeyedStore::<Counter>::new("counter");
    let err = store.get(9).err().unwrap();
    assert!(err.is_not_found());
    assert_eq!(err.to_string(), "counter 9 not found in cache");
    assert!(store.with_write(9, |counter| counter.hits.clear()).is_err());
}

#[test]
fn handles_share_one_lock() {
    let store = KeyedStore::<Counter>::new("counter");
    store.put(Counter::new(1));
    let first = store.get(1).unwrap();
    let second = first.clone();

    let held = first.lock();
    // Other threads wait for the holder.
    thread::scope(|scope| {
        let blocked = scope
            .spawn(|| second.try_lock(Duration::from_millis(10)).is_none())
            .join()
            .unwrap();
        assert!(blocked);
    });
    drop(held);

    second.write(|counter| counter.hits.push(1)).unwrap();
    assert_eq!(first.snapshot().unwrap().hits, vec![1]);
}

#[test]
fn holding_thread_can_lock_again() {
    let store = KeyedStore::<Counter>::new("counter");
    store.put(Counter::new(1));
    let handle = store.get(1).unwrap();

    let outer = handle.lock();
    let inner = handle.try_lock(Duration::from_millis(10));
    assert!(inner.is_some());
    drop(inner);
    store.with_write(1, |counter| counter.hits.push(1)).unwrap();
    assert_eq!(store.with_read(1, |counter| counter.hits.clone()).unwrap(), vec![1]);
    outer.borrow_mut().hits.push(2);
    drop(outer);

    // Touching the object while it is being modified higher up the stack is reported.
    let nested = store
        .with_write(1, |_| store.with_read(1, |counter| counter.hits.len()))
        .unwrap();
    match nested {
        Err(CacheError::LockConflict { store, id }) => {
            assert_eq!(store, "counter");
            assert_eq!(id, 1);
        }
        other => panic!("expected a lock conflict, got {:?}", other),
    }
    assert_eq!(store.get_copy(1).unwrap().hits, vec![1, 2]);
    assert_eq!(store.lock_warnings(), 0);
}

#[test]
fn waiting_writer_logs_lock_warnings() {
    let store = Arc::new(KeyedStore::<Counter>::with_policy(
        "counter",
        LockPolicy {
            retry_interval: Duration::from_millis(5),
            warn_after_retries: 2,
        },
    ));
    store.put(Counter::new(1));

    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            let handle = store.get(1).unwrap();
            let guard = handle.lock();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_millis(100));
            guard.borrow_mut().hits.push(1);
        })
    };

    locked_rx.recv().unwrap();
    store.with_write(1, |counter| counter.hits.push(2)).unwrap();
    holder.join().unwrap();

    assert_eq!(store.get_copy(1).unwrap().hits, vec![1, 2]);
    assert!(store.lock_warnings() > 0);
}

#[test]
fn handles_are_collected_for_every_key() {
    let store = KeyedStore::<Counter>::new("counter");
    for id in 0..10 {
        store.put(Counter::new(id));
    }
    for handle in store.handles() {
        let id = handle.id();
        handle.write(|counter| counter.hits.push(id * 2)).unwrap();
    }
    assert_eq!(store.get_copy(4).unwrap().hits, vec![8]);
    assert_eq!(store.lock_warnings(), 0);
}
