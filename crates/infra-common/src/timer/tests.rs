use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{sleep, Instant};

use super::*;
use crate::errors::Error;

#[test]
fn test_fire_expired_in_expiry_order() {
    let wheel = TimerWheel::new_detached();
    let order = Arc::new(Mutex::new(Vec::new()));
    let now = Instant::now();

    for (label, delay) in [("b", 20u64), ("a", 10), ("c", 30)] {
        let order = order.clone();
        wheel
            .start_at(now + Duration::from_millis(delay), move || order.lock().push(label))
            .unwrap();
    }

    assert_eq!(wheel.fire_expired(now + Duration::from_millis(5)), 0);
    assert_eq!(wheel.fire_expired(now + Duration::from_millis(25)), 2);
    assert_eq!(*order.lock(), vec!["a", "b"]);
    assert_eq!(wheel.pending(), 1);
}

#[test]
fn test_stop_after_fire_reports_not_found() {
    let wheel = TimerWheel::new_detached();
    let now = Instant::now();
    let handle = wheel.start_at(now, || {}).unwrap();

    assert!(wheel.is_pending(handle));
    assert_eq!(wheel.fire_expired(now), 1);
    assert_eq!(wheel.stop(handle), Err(Error::TimerNotFound));
}

#[test]
fn test_stop_twice() {
    let wheel = TimerWheel::new_detached();
    let handle = wheel.start(Duration::from_secs(1), || {}).unwrap();
    assert_eq!(wheel.stop(handle), Ok(()));
    assert_eq!(wheel.stop(handle), Err(Error::TimerNotFound));
    assert_eq!(wheel.pending(), 0);
}

#[test]
fn test_callback_may_rearm_without_deadlock() {
    let wheel = TimerWheel::new_detached();
    let count = Arc::new(AtomicUsize::new(0));
    let now = Instant::now();

    let inner_wheel = wheel.clone();
    let inner_count = count.clone();
    wheel
        .start_at(now, move || {
            inner_count.fetch_add(1, Ordering::SeqCst);
            let again = inner_count.clone();
            inner_wheel
                .start_at(now, move || {
                    again.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(wheel.fire_expired(now), 1);
    assert_eq!(wheel.fire_expired(now), 1);
    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_timeout_fires_within_one_tick() {
    let wheel = TimerWheel::init();
    let fired_at = Arc::new(Mutex::new(None));
    let armed_at = Instant::now();

    let slot = fired_at.clone();
    wheel
        .start(Duration::ZERO, move || {
            *slot.lock() = Some(Instant::now());
        })
        .unwrap();

    sleep(TICK * 3).await;
    let fired = (*fired_at.lock()).expect("timer did not fire");
    assert!(fired.duration_since(armed_at) <= TICK);
    wheel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_worker_fires_on_virtual_time() {
    let wheel = TimerWheel::init();
    let count = Arc::new(AtomicUsize::new(0));

    for delay in [500u64, 1000, 32_000] {
        let count = count.clone();
        wheel
            .start(Duration::from_millis(delay), move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
    }

    sleep(Duration::from_millis(1_100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 2);
    sleep(Duration::from_secs(32)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    wheel.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cancels_pending() {
    let wheel = TimerWheel::init();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    wheel
        .start(Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    wheel.shutdown().await;
    assert_eq!(wheel.pending(), 0);
    assert!(matches!(wheel.start(Duration::ZERO, || {}), Err(Error::TimerShutdown)));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
}
