// Scheduling semantics under a paused clock: non-overlap, manual
// triggers, pause/resume, interval changes, and visibility handling.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use maplive_core::error::LiveError;
use maplive_core::poller::{PollConfig, Poller, TickFn, TickFuture};
use maplive_core::visibility::VisibilitySignal;

fn counting_tick(counter: Arc<AtomicU64>, duration: Duration) -> TickFn {
    Arc::new(move || {
        let counter = Arc::clone(&counter);
        let fut: TickFuture = Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if !duration.is_zero() {
                tokio::time::sleep(duration).await;
            }
            Ok(())
        });
        fut
    })
}

fn failing_tick() -> TickFn {
    Arc::new(|| {
        let fut: TickFuture = Box::pin(async {
            Err(LiveError::Transport("endpoint briefly down".to_string()))
        });
        fut
    })
}

const SECOND: Duration = Duration::from_millis(1_000);

#[tokio::test(start_paused = true)]
async fn test_slow_ticks_never_overlap() {
    let poller = Poller::new();
    let ticks = Arc::new(AtomicU64::new(0));
    let in_flight = Arc::new(AtomicI64::new(0));
    let max_in_flight = Arc::new(AtomicI64::new(0));

    let tick_in_flight = Arc::clone(&in_flight);
    let tick_max = Arc::clone(&max_in_flight);
    let tick_count = Arc::clone(&ticks);
    let on_tick: TickFn = Arc::new(move || {
        let in_flight = Arc::clone(&tick_in_flight);
        let max = Arc::clone(&tick_max);
        let ticks = Arc::clone(&tick_count);
        let fut: TickFuture = Box::pin(async move {
            ticks.fetch_add(1, Ordering::SeqCst);
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2_500)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
        fut
    });

    poller.start("feed", PollConfig::new(SECOND, on_tick)).unwrap();

    // Tick 1 runs 1000..3500, reschedules for 4500; tick 2 starts at
    // 4500 and is still executing at 5010.
    tokio::time::sleep(Duration::from_millis(5_010)).await;

    assert_eq!(ticks.load(Ordering::SeqCst), 2);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    let state = poller.state("feed").unwrap();
    assert!(state.executing);
    assert_eq!(state.tick_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_first_tick_waits_one_interval_unless_immediate() {
    let poller = Poller::new();
    let ticks = Arc::new(AtomicU64::new(0));
    poller
        .start(
            "delayed",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    let immediate_ticks = Arc::new(AtomicU64::new(0));
    let mut config = PollConfig::new(
        SECOND,
        counting_tick(Arc::clone(&immediate_ticks), Duration::ZERO),
    );
    config.immediate = true;
    poller.start("eager", config).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(immediate_ticks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_now_leaves_the_armed_timer_alone() {
    let poller = Poller::new();
    let ticks = Arc::new(AtomicU64::new(0));
    poller
        .start(
            "feed",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    poller.trigger_now("feed").await.unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    // The scheduled tick still fires at t=1000, not t=1200.
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_trigger_now_fails_for_unknown_subscription() {
    let poller = Poller::new();
    let err = poller.trigger_now("ghost").await.unwrap_err();
    assert!(matches!(err, LiveError::Misconfiguration(_)));
}

#[tokio::test(start_paused = true)]
async fn test_pause_cancels_timer_and_resume_schedules_full_interval() {
    let poller = Poller::new();
    let ticks = Arc::new(AtomicU64::new(0));
    poller
        .start(
            "feed",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO)),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    poller.pause("feed");
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    let state = poller.state("feed").unwrap();
    assert!(state.paused);
    assert!(state.next_tick_at.is_none());

    poller.resume("feed");
    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 0, "no catch-up tick");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_interval_rearms_from_now() {
    let poller = Poller::new();
    let ticks = Arc::new(AtomicU64::new(0));
    poller
        .start(
            "feed",
            PollConfig::new(
                Duration::from_millis(5_000),
                counting_tick(Arc::clone(&ticks), Duration::ZERO),
            ),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    poller.set_interval("feed", SECOND).unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(ticks.load(Ordering::SeqCst), 1);

    assert!(matches!(
        poller.set_interval("feed", Duration::from_millis(999)),
        Err(LiveError::Misconfiguration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_tick_errors_count_and_polling_continues() {
    let poller = Poller::new();
    let errors_seen = Arc::new(AtomicU64::new(0));

    let seen = Arc::clone(&errors_seen);
    let mut config = PollConfig::new(SECOND, failing_tick());
    config.on_error = Some(Arc::new(move |_err| {
        seen.fetch_add(1, Ordering::SeqCst);
    }));
    poller.start("feed", config).unwrap();

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    let state = poller.state("feed").unwrap();
    assert_eq!(state.tick_count, 3);
    assert_eq!(state.error_count, 3);
    assert_eq!(errors_seen.load(Ordering::SeqCst), 3);
    assert!(state.active);
}

#[tokio::test(start_paused = true)]
async fn test_rejects_duplicates_and_sub_second_intervals() {
    let poller = Poller::new();
    let ticks = Arc::new(AtomicU64::new(0));

    assert!(matches!(
        poller.start(
            "fast",
            PollConfig::new(
                Duration::from_millis(999),
                counting_tick(Arc::clone(&ticks), Duration::ZERO)
            )
        ),
        Err(LiveError::Misconfiguration(_))
    ));

    poller
        .start(
            "feed",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO)),
        )
        .unwrap();
    assert!(matches!(
        poller.start(
            "feed",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO))
        ),
        Err(LiveError::Misconfiguration(_))
    ));

    assert!(poller.has("feed"));
    assert_eq!(poller.active_ids(), vec!["feed".to_string()]);
    assert!(poller.stop("feed"));
    assert!(!poller.has("feed"));
}

#[tokio::test(start_paused = true)]
async fn test_visibility_pauses_and_resumes_tagged_subscriptions() {
    let signal = VisibilitySignal::new(true);
    let poller = Poller::with_visibility(&signal);
    let ticks = Arc::new(AtomicU64::new(0));

    poller
        .start(
            "auto",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO)),
        )
        .unwrap();

    let mut opted_out = PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO));
    opted_out.pause_when_hidden = false;
    poller.start("always-on", opted_out).unwrap();

    signal.set_visible(false);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let auto = poller.state("auto").unwrap();
    assert!(auto.paused);
    assert!(auto.paused_by_visibility);
    let always_on = poller.state("always-on").unwrap();
    assert!(!always_on.paused);

    signal.set_visible(true);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let auto = poller.state("auto").unwrap();
    assert!(!auto.paused);
    assert!(!auto.paused_by_visibility);
}

#[tokio::test(start_paused = true)]
async fn test_user_pause_survives_visibility_changes() {
    let signal = VisibilitySignal::new(true);
    let poller = Poller::with_visibility(&signal);
    let ticks = Arc::new(AtomicU64::new(0));

    poller
        .start(
            "feed",
            PollConfig::new(SECOND, counting_tick(Arc::clone(&ticks), Duration::ZERO)),
        )
        .unwrap();

    poller.pause("feed");
    signal.set_visible(false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    signal.set_visible(true);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A visibility round-trip must not undo an explicit pause.
    let state = poller.state("feed").unwrap();
    assert!(state.paused);
    assert!(!state.paused_by_visibility);
}
