use std::sync::Arc;
use std::time::Duration;
use tollgate::rate_limit::{spawn_idle_sweeper, Decision, RateLimitRegistry, RateLimiter};
use tollgate::{LimiterConfig, ManualClock};

fn registry(capacity: u32, rpm: u32) -> (RateLimitRegistry, ManualClock) {
    let clock = ManualClock::new();
    let registry = RateLimitRegistry::new(LimiterConfig::new(rpm, capacity).expect("valid"))
        .expect("valid registry")
        .with_clock(clock.clone());
    (registry, clock)
}

#[test]
fn scenario_a_burst_then_one_per_second() {
    let (registry, clock) = registry(10, 60);
    for i in 0..10 {
        assert!(registry.is_allowed("tokens"), "admission {i} should succeed");
    }
    assert!(!registry.is_allowed("tokens"), "11th admission must be denied");
    assert_eq!(registry.seconds_until_reset("tokens"), 1);

    clock.advance(Duration::from_secs(1));
    assert!(registry.is_allowed("tokens"));
    assert!(!registry.is_allowed("tokens"), "exactly one token accrued");
}

#[test]
fn remaining_never_exceeds_capacity() {
    let (registry, clock) = registry(3, 600);
    assert!(registry.is_allowed("p"));
    clock.advance(Duration::from_secs(3600));
    assert_eq!(registry.remaining("p"), 3);
}

#[test]
fn denial_reports_retry_after_from_rate() {
    let (registry, _clock) = registry(1, 7);
    assert!(registry.check("p").is_allowed());
    match registry.check("p") {
        Decision::Denied { retry_after } => assert_eq!(retry_after, Duration::from_secs(9)),
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_never_over_admit() {
    let (registry, _clock) = registry(25, 60);
    let registry = Arc::new(registry);
    let mut handles = Vec::new();
    for _ in 0..10 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let mut admitted = 0;
            for _ in 0..10 {
                if registry.is_allowed("shared") {
                    admitted += 1;
                }
                tokio::task::yield_now().await;
            }
            admitted
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, 25);
}

#[test]
fn cleanup_runs_alongside_admissions_on_other_keys() {
    let (registry, clock) = registry(1_000, 60);
    let registry = Arc::new(registry);
    assert!(registry.is_allowed("idle"));
    clock.advance(Duration::from_secs(2 * 60 * 60));

    let worker = {
        let registry = registry.clone();
        std::thread::spawn(move || (0..500).filter(|_| registry.is_allowed("busy")).count())
    };
    let removed = registry.cleanup_expired(Duration::from_secs(60 * 60));
    assert_eq!(worker.join().unwrap(), 500);
    assert_eq!(removed, 1);
    assert_eq!(registry.bucket_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn sweeper_recreates_buckets_full() {
    let (registry, clock) = registry(1, 1);
    let registry = Arc::new(registry);
    assert!(registry.is_allowed("p"));
    assert!(!registry.is_allowed("p"));

    let sweeper =
        spawn_idle_sweeper(registry.clone(), Duration::from_secs(60), Duration::from_secs(600));
    clock.advance(Duration::from_secs(601));
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(registry.bucket_count(), 0);
    assert!(registry.is_allowed("p"));
    sweeper.abort();
}
