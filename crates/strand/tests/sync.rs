//! Synchronization primitive integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand::{
    sleep_for, yield_now, FiberCondvar, FiberError, FiberMutex, Latch, Runtime, RuntimeConfig,
};

fn runtime(workers: usize) -> Runtime {
    let rt = Runtime::new(RuntimeConfig::new().concurrency(workers)).expect("runtime");
    rt.start().expect("start");
    rt
}

/// Eight fibers each increment a counter and count a latch down; the main
/// thread's wait returns only once all eight ran, at any concurrency.
fn latch_fan_in(workers: usize) {
    let rt = runtime(workers);
    let latch = Arc::new(Latch::new(&rt, 8));
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let latch = Arc::clone(&latch);
        let counter = Arc::clone(&counter);
        rt.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            latch.count_down(1);
        })
        .unwrap();
    }
    latch.wait().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    rt.stop();
}

#[test]
fn latch_fan_in_concurrency_1() {
    latch_fan_in(1);
}

#[test]
fn latch_fan_in_concurrency_2() {
    latch_fan_in(2);
}

#[test]
fn latch_fan_in_concurrency_16() {
    latch_fan_in(16);
}

#[test]
fn latch_wait_from_fiber() {
    let rt = runtime(2);
    let latch = Arc::new(Latch::new(&rt, 1));
    let done = Arc::new(AtomicBool::new(false));

    let latch2 = Arc::clone(&latch);
    let done2 = Arc::clone(&done);
    let waiter = rt
        .spawn(move || {
            latch2.wait().unwrap();
            done2.store(true, Ordering::SeqCst);
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::SeqCst));
    latch.count_down(1);
    rt.join(waiter).unwrap();
    assert!(done.load(Ordering::SeqCst));
    rt.stop();
}

#[test]
fn mutex_mixed_fiber_and_thread_holders() {
    let rt = runtime(4);
    let mutex = Arc::new(FiberMutex::new(&rt, 0u64));

    let mut ids = Vec::new();
    for _ in 0..4 {
        let mutex = Arc::clone(&mutex);
        ids.push(
            rt.spawn(move || {
                for _ in 0..200 {
                    *mutex.lock() += 1;
                }
            })
            .unwrap(),
        );
    }
    // The main thread contends as a plain-thread waiter.
    for _ in 0..200 {
        *mutex.lock() += 1;
    }
    for tid in ids {
        rt.join(tid).unwrap();
    }
    assert_eq!(*mutex.lock(), 1000);
    rt.stop();
}

#[test]
fn mutex_guard_releases_on_drop() {
    let rt = runtime(1);
    let mutex = FiberMutex::new(&rt, ());
    drop(mutex.lock());
    assert!(mutex.try_lock().is_some());
    rt.stop();
}

#[test]
fn condvar_producer_consumer() {
    let rt = runtime(2);
    let state = Arc::new((
        FiberMutex::new(&rt, Vec::<u32>::new()),
        FiberCondvar::new(&rt),
    ));
    let received = Arc::new(AtomicUsize::new(0));

    let state2 = Arc::clone(&state);
    let received2 = Arc::clone(&received);
    let consumer = rt
        .spawn(move || {
            let (queue, cvar) = &*state2;
            let mut taken = 0;
            while taken < 10 {
                let mut q = queue.lock();
                while q.is_empty() {
                    cvar.wait(&mut q).unwrap();
                }
                taken += q.drain(..).count();
            }
            received2.store(taken, Ordering::SeqCst);
        })
        .unwrap();

    let state3 = Arc::clone(&state);
    let producer = rt
        .spawn(move || {
            let (queue, cvar) = &*state3;
            for i in 0..10 {
                queue.lock().push(i);
                cvar.signal();
                yield_now();
            }
        })
        .unwrap();

    rt.join(producer).unwrap();
    rt.join(consumer).unwrap();
    assert_eq!(received.load(Ordering::SeqCst), 10);
    rt.stop();
}

#[test]
fn condvar_broadcast_from_main_thread() {
    let rt = runtime(4);
    let state = Arc::new((FiberMutex::new(&rt, false), FiberCondvar::new(&rt)));
    let latch = Arc::new(Latch::new(&rt, 5));

    for _ in 0..5 {
        let state = Arc::clone(&state);
        let latch = Arc::clone(&latch);
        rt.spawn(move || {
            let (lock, cvar) = &*state;
            let mut go = lock.lock();
            while !*go {
                cvar.wait(&mut go).unwrap();
            }
            drop(go);
            latch.count_down(1);
        })
        .unwrap();
    }

    std::thread::sleep(Duration::from_millis(100));
    {
        let (lock, cvar) = &*state;
        *lock.lock() = true;
        cvar.broadcast();
    }
    latch.wait().unwrap();
    rt.stop();
}

#[test]
fn mutex_wait_timeout_via_condvar() {
    let rt = runtime(1);
    let mutex = FiberMutex::new(&rt, ());
    let cvar = FiberCondvar::new(&rt);
    let begin = Instant::now();
    let mut guard = mutex.lock();
    assert_eq!(
        cvar.wait_for(&mut guard, Duration::from_millis(60)),
        Err(FiberError::TimedOut)
    );
    assert!(begin.elapsed() >= Duration::from_millis(50));
    rt.stop();
}

#[test]
fn token_cancellation_pattern() {
    // The RPC-call pattern: a handler locks the token to write a result;
    // a canceller destroying the token first makes the write fail cleanly.
    let rt = runtime(2);
    let id = rt.create_token().unwrap();
    let wrote = Arc::new(AtomicBool::new(false));

    let rt2 = rt.clone();
    let wrote2 = Arc::clone(&wrote);
    let handler = rt
        .spawn(move || {
            sleep_for(Duration::from_millis(100)).unwrap();
            if rt2.token_lock(id).is_ok() {
                wrote2.store(true, Ordering::SeqCst);
                rt2.token_unlock(id).unwrap();
            }
        })
        .unwrap();

    // Cancel before the handler gets to the token.
    rt.token_lock(id).unwrap();
    rt.token_unlock_and_destroy(id).unwrap();
    rt.join(handler).unwrap();
    assert!(!wrote.load(Ordering::SeqCst));
    rt.stop();
}

#[test]
fn sleep_wakes_near_deadline() {
    let rt = runtime(1);
    let elapsed_ms = Arc::new(AtomicUsize::new(0));
    let elapsed2 = Arc::clone(&elapsed_ms);
    let tid = rt
        .spawn(move || {
            let begin = Instant::now();
            sleep_for(Duration::from_millis(50)).unwrap();
            elapsed2.store(begin.elapsed().as_millis() as usize, Ordering::SeqCst);
        })
        .unwrap();
    rt.join(tid).unwrap();
    let ms = elapsed_ms.load(Ordering::SeqCst);
    assert!(ms >= 45, "slept only {}ms", ms);
    assert!(ms < 500, "slept {}ms", ms);
    rt.stop();
}
