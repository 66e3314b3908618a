//! End-to-end engine tests: submission, delivery modes, the owner safety
//! gate, cancellation, silent tasks, and shutdown.
//!
//! Timing-sensitive paths use gated tasks (released through `Notify`) and
//! polling waits instead of bare sleeps, so the assertions hold under
//! scheduler jitter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use taskgate::{
    DeliveryMode, EngineBuilder, EngineError, HandlerSet, SubmitOptions, Task, TaskContext,
    TaskEngine, TaskKey,
};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};

/// A task that completes immediately with a fixed value.
struct Fixed(i32);

#[async_trait]
impl Task for Fixed {
    type Output = i32;

    async fn run(&self, _ctx: &TaskContext) -> i32 {
        self.0
    }
}

/// A task that completes with `value` once `release` is notified.
struct Gated {
    release: Arc<Notify>,
    value: i32,
}

#[async_trait]
impl Task for Gated {
    type Output = i32;

    async fn run(&self, _ctx: &TaskContext) -> i32 {
        self.release.notified().await;
        self.value
    }
}

/// A task that spins until cancelled, then returns the `-1` sentinel.
struct UntilCancelled;

#[async_trait]
impl Task for UntilCancelled {
    type Output = i32;

    async fn run(&self, ctx: &TaskContext) -> i32 {
        while !ctx.is_cancelled() {
            sleep(Duration::from_millis(5)).await;
        }
        -1
    }
}

/// A task whose body panics.
struct Explodes;

#[async_trait]
impl Task for Explodes {
    type Output = i32;

    async fn run(&self, _ctx: &TaskContext) -> i32 {
        panic!("task body blew up");
    }
}

/// A task that records how many bodies overlap in time.
struct TrackPeak {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Task for TrackPeak {
    type Output = ();

    async fn run(&self, _ctx: &TaskContext) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(10)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A task that completes immediately with a `u32` marker; paired with
/// [`parking_set`] so its delivery occupies the dispatcher.
struct Ping;

#[async_trait]
impl Task for Ping {
    type Output = u32;

    async fn run(&self, _ctx: &TaskContext) -> u32 {
        0
    }
}

type Log = Arc<Mutex<Vec<i32>>>;

fn new_log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

/// A handler set that appends every received `i32` to `log`.
fn recording_set(log: &Log) -> HandlerSet {
    let sink = Arc::clone(log);
    HandlerSet::new().on(move |value: &i32| sink.lock().push(*value))
}

/// A handler set whose `u32` handler bumps `entered` and then blocks until
/// `unpark` gets a message, holding the dispatcher mid-invocation.
fn parking_set(entered: &Arc<AtomicUsize>, unpark: mpsc::Receiver<()>) -> HandlerSet {
    let entered = Arc::clone(entered);
    let unpark = Mutex::new(unpark);
    HandlerSet::new().on(move |_: &u32| {
        entered.fetch_add(1, Ordering::SeqCst);
        let _ = unpark.lock().recv();
    })
}

fn gate() -> Arc<Notify> {
    Arc::new(Notify::new())
}

/// Polls `condition` until it holds; panics with `label` after 5 seconds.
async fn wait_until(label: &str, condition: impl Fn() -> bool) {
    const DEADLINE: Duration = Duration::from_secs(5);
    let start = Instant::now();
    while start.elapsed() < DEADLINE {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within {DEADLINE:?}: {label}");
}

// --------------------------------------------------------------------------
// Test 1: Immediate mode delivers exactly once, no safety gate
// --------------------------------------------------------------------------

#[tokio::test]
async fn immediate_mode_delivers_exactly_once() {
    let engine = EngineBuilder::new()
        .delivery_mode(DeliveryMode::Immediate)
        .build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    // never marked safe: Immediate bypasses the gate entirely

    let handle = engine.submit(Fixed(7), &owner);
    assert_eq!(handle.result().await.as_deref(), Some(&7));

    wait_until("handler invoked", || log.lock().as_slice() == [7]).await;
    wait_until("task left the registry", || engine.task(handle.key()).is_none()).await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(log.lock().as_slice(), [7], "no second delivery");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 2: Dispatcher mode (default) delivers through the hand-off
// --------------------------------------------------------------------------

#[tokio::test]
async fn dispatcher_mode_delivers_to_a_safe_owner() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let handle = engine.submit(Fixed(5), &owner);
    assert_eq!(handle.result().await.as_deref(), Some(&5));
    wait_until("dispatcher delivered", || log.lock().as_slice() == [5]).await;
    wait_until("task cleaned up", || engine.task(handle.key()).is_none()).await;
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 3: results arriving while unsafe are cached and drained in order
// --------------------------------------------------------------------------

#[tokio::test]
async fn unsafe_window_caches_results_then_drains_fifo() {
    // AnyThread drains synchronously inside mark_safe, which makes the
    // post-transition assertions exact.
    let engine = EngineBuilder::new()
        .delivery_mode(DeliveryMode::AnyThread)
        .build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    // owner stays Initializing: attached but not yet safe

    let gates = [gate(), gate(), gate()];
    for (i, release) in gates.iter().enumerate() {
        let task = Gated {
            release: Arc::clone(release),
            value: i32::try_from(i).expect("small index") + 1,
        };
        let _handle = engine.submit(task, &owner);
    }

    // Release one at a time so the cache order is deterministic.
    for (i, release) in gates.iter().enumerate() {
        release.notify_one();
        let expected = i + 1;
        wait_until("result cached", || engine.pending_count(owner.id()) == expected).await;
    }
    assert!(log.lock().is_empty(), "nothing delivered while unsafe");

    engine.lifecycle().mark_safe(&owner);
    assert_eq!(log.lock().as_slice(), [1, 2, 3], "drained in arrival order");
    assert_eq!(engine.pending_count(owner.id()), 0);

    // A second safe window must not re-deliver anything.
    engine.lifecycle().mark_unsafe(&owner);
    engine.lifecycle().mark_safe(&owner);
    assert_eq!(log.lock().as_slice(), [1, 2, 3]);
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 4: routing ids partition deliveries between handlers
// --------------------------------------------------------------------------

#[tokio::test]
async fn routed_submissions_reach_only_their_handler() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log_a = new_log();
    let log_b = new_log();
    let sink_a = Arc::clone(&log_a);
    let sink_b = Arc::clone(&log_b);
    engine
        .mount(
            &owner,
            HandlerSet::new()
                .on_routed("a", move |value: &i32| sink_a.lock().push(*value))
                .on_routed("b", move |value: &i32| sink_b.lock().push(*value)),
        )
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    engine.submit_with(Fixed(1), &owner, SubmitOptions::new().routing_id("a"));
    engine.submit_with(Fixed(2), &owner, SubmitOptions::new().routing_id("b"));

    wait_until("routed deliveries", || {
        log_a.lock().as_slice() == [1] && log_b.lock().as_slice() == [2]
    })
    .await;
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 5: a panicking task body releases the latch and delivers nothing
// --------------------------------------------------------------------------

#[tokio::test]
async fn crashed_task_releases_latch_without_delivery() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let handle = engine.submit(Explodes, &owner);
    assert_eq!(handle.result().await, None, "crash means no result");
    wait_until("crashed task cleaned up", || engine.task(handle.key()).is_none()).await;
    sleep(Duration::from_millis(30)).await;
    assert!(log.lock().is_empty(), "no delivery for a crashed task");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 6: a panicking handler leaves the engine fully usable
// --------------------------------------------------------------------------

#[tokio::test]
async fn handler_panic_does_not_poison_the_engine() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    let sink = Arc::clone(&log);
    engine
        .mount(
            &owner,
            HandlerSet::new().on(move |value: &i32| {
                assert_ne!(*value, 13, "unlucky result");
                sink.lock().push(*value);
            }),
        )
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let poisoned = engine.submit(Fixed(13), &owner);
    assert_eq!(poisoned.result().await.as_deref(), Some(&13));
    wait_until("panicked delivery cleaned up", || {
        engine.task(poisoned.key()).is_none()
    })
    .await;

    // The dispatcher survived; the next delivery goes through.
    engine.submit(Fixed(2), &owner);
    wait_until("later delivery succeeds", || log.lock().as_slice() == [2]).await;
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 7: cooperative cancellation flows the sentinel through delivery
// --------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_is_cooperative_and_still_delivers() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let handle = engine.submit(UntilCancelled, &owner);
    wait_until("task is running", || handle.is_executing()).await;

    assert!(engine.cancel(handle.key()), "live task accepts cancel");
    assert_eq!(handle.result().await.as_deref(), Some(&-1));
    wait_until("sentinel delivered", || log.lock().as_slice() == [-1]).await;
    assert!(!engine.cancel(handle.key()), "finished task rejects cancel");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 8: shutdown suppresses in-flight work and rejects new submissions
// --------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_interrupts_and_rejects() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let never_released = gate();
    let inflight = engine.submit(
        Gated {
            release: Arc::clone(&never_released),
            value: 99,
        },
        &owner,
    );
    assert!(inflight.is_valid());

    engine.shutdown();
    assert!(engine.is_shut_down());
    assert_eq!(inflight.result().await, None, "latch opens with no result");
    assert!(inflight.is_cancelled());

    let late = engine.submit(Fixed(1), &owner);
    assert_eq!(late.key(), TaskKey::INVALID);
    assert_eq!(late.result().await, None);
    sleep(Duration::from_millis(30)).await;
    assert!(log.lock().is_empty(), "nothing was ever delivered");
}

// --------------------------------------------------------------------------
// Test 9: silent submissions skip resolution entirely
// --------------------------------------------------------------------------

#[tokio::test]
async fn silent_tasks_complete_without_delivery() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let handle = engine.submit_with(Fixed(9), &owner, SubmitOptions::new().silent());
    // Completion is still observable through the handle.
    assert_eq!(handle.result().await.as_deref(), Some(&9));
    wait_until("silent task cleaned up", || engine.task(handle.key()).is_none()).await;
    sleep(Duration::from_millis(30)).await;
    assert!(log.lock().is_empty(), "silent results never reach handlers");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 10: replace_owner redirects an in-flight delivery
// --------------------------------------------------------------------------

#[tokio::test]
async fn replace_owner_redirects_inflight_task() {
    let engine = EngineBuilder::new().build();
    let first = engine.lifecycle().attach("first");
    let second = engine.lifecycle().attach("second");
    let log = new_log();
    engine
        .mount(&second, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&second);
    // "first" is never marked safe; without the hand-off the result would sit
    // in its pending queue forever.

    let release = gate();
    let handle = engine.submit(
        Gated {
            release: Arc::clone(&release),
            value: 42,
        },
        &first,
    );
    assert!(engine.replace_owner(handle.key(), &second, None));

    release.notify_one();
    wait_until("redirected delivery", || log.lock().as_slice() == [42]).await;
    assert_eq!(engine.pending_count(first.id()), 0);

    wait_until("task cleaned up", || engine.task(handle.key()).is_none()).await;
    assert!(
        !engine.replace_owner(handle.key(), &first, None),
        "finished task cannot be re-bound"
    );
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 11: snapshot queries reflect live state
// --------------------------------------------------------------------------

#[tokio::test]
async fn snapshots_track_live_tasks() {
    let engine = EngineBuilder::new().build();
    let owner_a = engine.lifecycle().attach("a");
    let owner_b = engine.lifecycle().attach("b");
    // No handlers mounted: owner_a's result takes the discard path once
    // it is safe, owner_b's task is silent.
    engine.lifecycle().mark_safe(&owner_a);

    let release_one = gate();
    let release_two = gate();
    let one = engine.submit(
        Gated {
            release: Arc::clone(&release_one),
            value: 1,
        },
        &owner_a,
    );
    let two = engine.submit_with(
        Gated {
            release: Arc::clone(&release_two),
            value: 2,
        },
        &owner_b,
        SubmitOptions::new().routing_id("page").silent(),
    );

    let all = engine.tasks();
    assert_eq!(all.len(), 2);
    assert!(all[0].key < all[1].key, "ordered by key");

    let only_b = engine.tasks_matching(|task| task.owner.as_str() == "b");
    assert_eq!(only_b.len(), 1);
    assert_eq!(only_b[0].key, two.key());
    assert_eq!(only_b[0].routing_id.as_deref(), Some("page"));
    assert!(only_b[0].name.contains("Gated"));
    assert!(!only_b[0].finished);

    assert!(engine.task(TaskKey::INVALID).is_none());

    release_one.notify_one();
    release_two.notify_one();
    wait_until("registry empties", || engine.tasks().is_empty()).await;
    assert!(engine.task(one.key()).is_none());
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 12: max_concurrency bounds overlapping bodies
// --------------------------------------------------------------------------

#[tokio::test]
async fn concurrency_limit_bounds_overlap() {
    let engine = EngineBuilder::new().max_concurrency(1).build();
    let owner = engine.lifecycle().attach("screen");
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        engine.submit_with(
            TrackPeak {
                current: Arc::clone(&current),
                peak: Arc::clone(&peak),
            },
            &owner,
            SubmitOptions::new().silent(),
        );
    }

    wait_until("all tasks finished", || engine.tasks().is_empty()).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1, "bodies never overlapped");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 13: the process-wide default engine
// --------------------------------------------------------------------------

#[tokio::test]
async fn global_default_is_lazy_and_resettable() {
    // Claim a clean slate; no other test in this binary touches the default.
    let _ = TaskEngine::reset_global();

    let first = TaskEngine::global();
    let alias = TaskEngine::global();
    first.shutdown();
    assert!(
        alias.is_shut_down(),
        "global() must return the same engine while it lives"
    );

    // A shut-down default is replaced lazily.
    let rebuilt = TaskEngine::global();
    assert!(!rebuilt.is_shut_down());

    // install_global replaces, reset_global hands back.
    let custom = EngineBuilder::new()
        .delivery_mode(DeliveryMode::Immediate)
        .install_global();
    let current = TaskEngine::global();
    current.shutdown();
    assert!(custom.is_shut_down(), "installed engine was the default");

    let leftover = TaskEngine::reset_global();
    assert!(leftover.is_none(), "shutdown released the default slot");
    rebuilt.shutdown();
}

// --------------------------------------------------------------------------
// Test 14: a starved dispatcher cannot wedge the workers
// --------------------------------------------------------------------------

// The parked handler blocks its runtime thread outright, so this test needs
// the multi-thread scheduler.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn starved_dispatcher_frees_the_worker_at_the_ack_timeout() {
    let engine = EngineBuilder::new()
        .max_concurrency(1)
        .dispatch_timeout(Duration::from_millis(200))
        .build();
    let blocker = engine.lifecycle().attach("blocker");
    let bystander = engine.lifecycle().attach("bystander");
    let entered = Arc::new(AtomicUsize::new(0));
    let (unpark_tx, unpark_rx) = mpsc::channel();
    engine
        .mount(&blocker, parking_set(&entered, unpark_rx))
        .expect("owner is live");
    let log = new_log();
    engine
        .mount(&bystander, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&blocker);
    engine.lifecycle().mark_safe(&bystander);

    let parked = engine.submit(Ping, &blocker);
    wait_until("dispatcher is parked", || entered.load(Ordering::SeqCst) == 1).await;

    // The only permit is held by the worker awaiting the parked hand-off;
    // its bounded ack wait is what lets this second task run at all.
    let handle = engine.submit(Fixed(2), &bystander);
    let result = handle
        .result_timeout(Duration::from_secs(3))
        .await
        .expect("permit freed at the ack timeout");
    assert_eq!(result.as_deref(), Some(&2));
    assert!(log.lock().is_empty(), "delivery still queued behind the park");

    unpark_tx.send(()).expect("handler is parked on this channel");
    wait_until("queued delivery lands", || log.lock().as_slice() == [2]).await;
    wait_until("both tasks cleaned up", || {
        engine.task(parked.key()).is_none() && engine.task(handle.key()).is_none()
    })
    .await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(log.lock().as_slice(), [2], "exactly one delivery");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 15: the dispatcher re-checks safety at invocation time
// --------------------------------------------------------------------------

// Same parked-handler setup as test 14, hence the same scheduler flavor.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dispatcher_stashes_when_the_safe_window_closes_in_queue() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let entered = Arc::new(AtomicUsize::new(0));
    let (unpark_tx, unpark_rx) = mpsc::channel();
    let log = new_log();
    let sink = Arc::clone(&log);
    // One tree: the u32 handler parks the dispatcher, the i32 handler records.
    engine
        .mount(
            &owner,
            parking_set(&entered, unpark_rx).on(move |value: &i32| sink.lock().push(*value)),
        )
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let parked = engine.submit(Ping, &owner);
    wait_until("dispatcher is parked", || entered.load(Ordering::SeqCst) == 1).await;

    let handle = engine.submit(Fixed(7), &owner);
    assert_eq!(handle.result().await.as_deref(), Some(&7));
    // Completed inside the safe window, so the worker queued a hand-off
    // behind the park instead of caching.
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        engine.pending_count(owner.id()),
        0,
        "hand-off is queued, not cached"
    );

    // The safe window closes while the hand-off is still in the queue.
    engine.lifecycle().mark_unsafe(&owner);
    unpark_tx.send(()).expect("handler is parked on this channel");

    wait_until("re-check cached the result", || {
        engine.pending_count(owner.id()) == 1
    })
    .await;
    assert!(log.lock().is_empty(), "no invocation outside the safe window");

    engine.lifecycle().mark_safe(&owner);
    wait_until("cached result delivered", || log.lock().as_slice() == [7]).await;
    wait_until("both tasks cleaned up", || {
        engine.task(parked.key()).is_none() && engine.task(handle.key()).is_none()
    })
    .await;
    sleep(Duration::from_millis(30)).await;
    assert_eq!(log.lock().as_slice(), [7], "exactly one delivery");
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 16: result_timeout expires without consuming the latch
// --------------------------------------------------------------------------

#[tokio::test]
async fn result_timeout_expiry_leaves_the_latch_usable() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    let log = new_log();
    engine
        .mount(&owner, recording_set(&log))
        .expect("owner is live");
    engine.lifecycle().mark_safe(&owner);

    let release = gate();
    let handle = engine.submit(
        Gated {
            release: Arc::clone(&release),
            value: 6,
        },
        &owner,
    );

    let err = handle
        .result_timeout(Duration::from_millis(100))
        .await
        .expect_err("gate never released yet");
    assert!(matches!(err, EngineError::ResultTimeout { timeout_ms: 100 }));

    // The expired wait observed nothing; the next one gets the result.
    release.notify_one();
    let result = handle
        .result_timeout(Duration::from_secs(3))
        .await
        .expect("released gate completes promptly");
    assert_eq!(result.as_deref(), Some(&6));
    wait_until("delivery reached the handler", || log.lock().as_slice() == [6]).await;
    engine.shutdown();
}

// --------------------------------------------------------------------------
// Test 17: the mount family refuses a shut-down engine
// --------------------------------------------------------------------------

#[tokio::test]
async fn mounting_after_shutdown_is_refused() {
    let engine = EngineBuilder::new().build();
    let owner = engine.lifecycle().attach("screen");
    engine
        .mount(&owner, HandlerSet::new().on(|_: &i32| {}))
        .expect("mount succeeds while running");

    engine.shutdown();

    let err = engine
        .mount(&owner, HandlerSet::new().on(|_: &i32| {}))
        .expect_err("mount after shutdown");
    assert!(matches!(err, EngineError::ShutDown));
    assert!(matches!(
        engine.mount_at(&owner, "panel", HandlerSet::new()),
        Err(EngineError::ShutDown)
    ));
    assert!(matches!(
        engine.unmount(&owner, "panel"),
        Err(EngineError::ShutDown)
    ));
}
