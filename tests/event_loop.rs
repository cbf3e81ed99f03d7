use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::{EventLoop, LoopPool, LoopThread};

mod util;

use util::{init, wait_for};

#[test]
fn run_in_loop_is_inline_on_the_owning_thread() {
    init();

    let event_loop = EventLoop::new().unwrap();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    event_loop.run_in_loop(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });
    // No run() needed: the caller owns the loop thread.
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
#[should_panic]
fn second_loop_on_one_thread_panics() {
    init();

    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new();
}

#[test]
fn cross_thread_tasks_run_in_enqueue_order() {
    init();

    let mut thread = LoopThread::new(None, "order-test".to_owned());
    let event_loop = thread.start_loop().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let seen = Arc::clone(&seen);
        event_loop.queue_in_loop(move || {
            seen.lock().unwrap().push(i);
        });
    }

    let seen2 = Arc::clone(&seen);
    wait_for(Duration::from_secs(5), "all queued tasks", move || {
        seen2.lock().unwrap().len() == 100
    });
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..100).collect::<Vec<_>>());
}

#[test]
fn cross_thread_queue_wakes_the_poller() {
    init();

    let mut thread = LoopThread::new(None, "wakeup-test".to_owned());
    let event_loop = thread.start_loop().unwrap();

    // The poll timeout is 10 s; anything close to instant proves the
    // wakeup fd fired.
    let start = Instant::now();
    let ran = Arc::new(AtomicUsize::new(0));
    let ran2 = Arc::clone(&ran);
    event_loop.queue_in_loop(move || {
        ran2.fetch_add(1, Ordering::SeqCst);
    });

    let ran2 = Arc::clone(&ran);
    wait_for(Duration::from_secs(5), "queued task", move || {
        ran2.load(Ordering::SeqCst) == 1
    });
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn tasks_queued_during_a_drain_run_promptly() {
    init();

    let mut thread = LoopThread::new(None, "requeue-test".to_owned());
    let event_loop = thread.start_loop().unwrap();

    let ran = Arc::new(AtomicUsize::new(0));
    let inner_loop = Arc::clone(&event_loop);
    let ran2 = Arc::clone(&ran);
    event_loop.queue_in_loop(move || {
        // Re-entrant queueing from inside the drain must not wait out the
        // poll timeout.
        let ran3 = Arc::clone(&ran2);
        inner_loop.queue_in_loop(move || {
            ran3.fetch_add(1, Ordering::SeqCst);
        });
    });

    let start = Instant::now();
    let ran2 = Arc::clone(&ran);
    wait_for(Duration::from_secs(5), "requeued task", move || {
        ran2.load(Ordering::SeqCst) == 1
    });
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn loop_thread_drop_quits_and_joins() {
    init();

    let mut thread = LoopThread::new(None, "drop-test".to_owned());
    let event_loop = thread.start_loop().unwrap();
    assert!(!event_loop.is_in_loop_thread());
    // Dropping must unblock the worker's poll and join it; a hang here
    // fails the test by timeout.
    drop(thread);
}

#[test]
fn thread_init_callback_runs_on_the_worker() {
    init();

    let inited = Arc::new(AtomicUsize::new(0));
    let inited2 = Arc::clone(&inited);
    let mut thread = LoopThread::new(
        Some(Arc::new(move |event_loop: &Arc<EventLoop>| {
            assert!(event_loop.is_in_loop_thread());
            inited2.fetch_add(1, Ordering::SeqCst);
        })),
        "init-test".to_owned(),
    );
    let _event_loop = thread.start_loop().unwrap();
    assert_eq!(inited.load(Ordering::SeqCst), 1);
}

#[test]
fn pool_round_robin_cycles_through_workers() {
    init();

    let base_loop = EventLoop::new().unwrap();
    let mut pool = LoopPool::new(Arc::clone(&base_loop), "pool-test");
    pool.set_thread_num(2);
    pool.start(None).unwrap();

    let first = pool.next_loop();
    let second = pool.next_loop();
    let third = pool.next_loop();

    assert!(!Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &third));
    assert!(!Arc::ptr_eq(&first, &base_loop));
    assert!(!Arc::ptr_eq(&second, &base_loop));
}

#[test]
fn empty_pool_hands_out_the_base_loop() {
    init();

    let base_loop = EventLoop::new().unwrap();
    let mut pool = LoopPool::new(Arc::clone(&base_loop), "empty-pool-test");
    pool.start(None).unwrap();

    assert!(Arc::ptr_eq(&pool.next_loop(), &base_loop));
    assert!(Arc::ptr_eq(&pool.next_loop(), &base_loop));
}
