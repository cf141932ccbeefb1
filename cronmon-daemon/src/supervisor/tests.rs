use super::*;

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::journal::MemoryJournal;
use crate::process::SleepProcess;

const FOREVER: Duration = Duration::MAX;

/// Monotonically increasing fake PIDs, starting at 1.
fn pid_counter() -> impl Fn() -> i32 + Send + 'static {
    let next = AtomicI32::new(0);
    move || next.fetch_add(1, Ordering::SeqCst) + 1
}

/// A spawner handing out [`SleepProcess`] children with sequential PIDs.
fn sleepers(run_for: Duration, signal_delay: Duration) -> SpawnFn {
    let next_pid = pid_counter();
    Box::new(move || {
        let proc: Arc<dyn Process> =
            Arc::new(SleepProcess::new(run_for, signal_delay, next_pid()));
        Ok(proc)
    })
}

struct Fixture {
    journal: Arc<MemoryJournal>,
    status: Arc<StatusDir>,
    _tmp: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let status = Arc::new(StatusDir::open_in(tmp.path(), "memory").unwrap());
        Self {
            journal: Arc::new(MemoryJournal::new()),
            status,
            _tmp: tmp,
        }
    }

    fn supervisor(&self, options: SupervisorOptions, spawner: SpawnFn) -> ServiceSupervisor {
        ServiceSupervisor::with_spawner(
            "sleep",
            self.journal.clone(),
            self.status.clone(),
            options,
            spawner,
        )
    }
}

fn no_backoff() -> SupervisorOptions {
    SupervisorOptions {
        retry_backoff: vec![Duration::ZERO],
        ..Default::default()
    }
}

fn spawned(pid: i32) -> Event {
    Event::ProcessSpawned { file: "sleep".into(), pid }
}

fn exited(pid: i32, exit_code: i32) -> Event {
    Event::ProcessExited {
        file: "sleep".into(),
        pid,
        error: None,
        exit_code,
    }
}

/// Assert that the journal starts with `expect`.
fn verify_prefix(journal: &MemoryJournal, expect: &[Event]) {
    let events = journal.events();
    assert!(
        events.len() >= expect.len(),
        "journal has {} events, expected at least {}: {events:#?}",
        events.len(),
        expect.len(),
    );
    for (i, want) in expect.iter().enumerate() {
        assert_eq!(&events[i], want, "journal record {i}");
    }
}

/// Poll the journal until it holds at least `count` events. The generous
/// timeout is virtual time under a paused clock.
async fn wait_for_events(journal: &MemoryJournal, count: usize) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if journal.events().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "journal never reached {count} events: {:#?}",
            journal.events()
        )
    });
}

#[tokio::test(start_paused = true)]
async fn graceful_interrupt() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor(no_backoff(), sleepers(FOREVER, Duration::ZERO));

    sup.start(false);
    sup.stop().await.expect("stop should succeed");

    assert_eq!(fx.journal.events(), vec![spawned(1), exited(1, 0)]);
}

#[tokio::test(start_paused = true)]
async fn kill_timeout_escalates_and_reports() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor(
        SupervisorOptions {
            wait_timeout: Duration::from_micros(1),
            retry_backoff: vec![Duration::ZERO],
        },
        // The child ignores catchable signals forever.
        sleepers(FOREVER, FOREVER),
    );

    sup.start(false);
    let err = sup.stop().await.expect_err("stop should time out");
    assert!(matches!(err, CronmonError::StopTimeout));

    assert_eq!(fx.journal.events(), vec![spawned(1), exited(1, -1)]);
}

#[tokio::test(start_paused = true)]
async fn spawn_failures_back_off_and_keep_retrying() {
    let fx = Fixture::new();

    let attempts = Arc::new(AtomicU32::new(0));
    let spawner_attempts = attempts.clone();

    let mut sup = fx.supervisor(
        SupervisorOptions {
            retry_backoff: vec![
                Duration::ZERO,
                Duration::from_micros(1),
                Duration::from_micros(5),
                Duration::from_secs(1),
            ],
            ..Default::default()
        },
        Box::new(move || -> io::Result<Arc<dyn Process>> {
            let attempt = spawner_attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > 3 {
                Err(io::Error::other("after"))
            } else {
                Err(io::Error::other("before"))
            }
        }),
    );

    sup.start(false);
    tokio::time::sleep(Duration::from_micros(500)).await;
    sup.stop().await.expect("stop should succeed");

    fx.journal.finalize();
    let spawn_error = |reason: &str| Event::ProcessSpawnError {
        file: "sleep".into(),
        reason: reason.into(),
    };
    verify_prefix(
        &fx.journal,
        &[
            spawn_error("before"),
            spawn_error("before"),
            spawn_error("before"),
            spawn_error("after"),
        ],
    );
}

#[tokio::test]
async fn restarts_after_every_exit() {
    let fx = Fixture::new();
    // Children exit immediately with code 0; no backoff between restarts.
    let mut sup = fx.supervisor(no_backoff(), sleepers(Duration::ZERO, Duration::ZERO));

    sup.start(false);
    wait_for_events(&fx.journal, 10).await;
    sup.stop().await.expect("stop should succeed");
    fx.journal.finalize();

    let mut expect = Vec::new();
    for pid in 1..=5 {
        expect.push(spawned(pid));
        expect.push(exited(pid, 0));
    }
    verify_prefix(&fx.journal, &expect);
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent_while_running() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor(no_backoff(), sleepers(FOREVER, Duration::ZERO));

    sup.start(false);
    sup.start(false);
    sup.start(false);
    sup.stop().await.unwrap();

    // One spawn, one exit; the extra starts were no-ops.
    assert_eq!(fx.journal.events(), vec![spawned(1), exited(1, 0)]);
}

#[tokio::test(start_paused = true)]
async fn restart_stops_the_old_child_first() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor(no_backoff(), sleepers(FOREVER, Duration::ZERO));

    sup.start(false);
    sup.start(true);
    sup.stop().await.unwrap();

    assert_eq!(
        fx.journal.events(),
        vec![spawned(1), exited(1, 0), spawned(2), exited(2, 0)],
    );
}

#[tokio::test(start_paused = true)]
async fn stop_is_idempotent() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor(no_backoff(), sleepers(FOREVER, Duration::ZERO));

    // Never started; stop twice.
    sup.stop().await.unwrap();
    sup.stop().await.unwrap();
    assert!(fx.journal.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn takeover_without_a_sentinel_reports_and_restarts() {
    let fx = Fixture::new();
    let mut sup = fx.supervisor(no_backoff(), sleepers(FOREVER, Duration::ZERO));

    // No sentinel was ever created for this service, so adopting pid 42
    // must fail and the service starts fresh instead.
    sup.takeover(42);
    wait_for_events(&fx.journal, 2).await;
    sup.stop().await.unwrap();

    let events = fx.journal.events();
    match &events[0] {
        Event::ProcessTakeoverError { file, pid, status_file, .. } => {
            assert_eq!(file, "sleep");
            assert_eq!(*pid, 42);
            assert!(status_file.ends_with("sleep"));
        }
        other => panic!("expected a takeover error first, got {other:?}"),
    }
    assert_eq!(events[1], spawned(1));
}

#[tokio::test(start_paused = true)]
async fn a_long_lived_child_resets_the_backoff() {
    let fx = Fixture::new();
    let started = tokio::time::Instant::now();

    // First child dies instantly, the second lives well past the reset
    // window, the third idles. If the long run did not reset the schedule,
    // the third spawn would be delayed by five extra seconds.
    let next_pid = pid_counter();
    let attempt = Arc::new(AtomicU32::new(0));
    let spawner_attempt = attempt.clone();
    let mut sup = fx.supervisor(
        SupervisorOptions {
            retry_backoff: vec![
                Duration::ZERO,
                Duration::from_secs(5),
                Duration::from_secs(60),
            ],
            ..Default::default()
        },
        Box::new(move || {
            let run_for = match spawner_attempt.fetch_add(1, Ordering::SeqCst) {
                0 => Duration::ZERO,
                1 => Duration::from_secs(20),
                _ => FOREVER,
            };
            let proc: Arc<dyn Process> =
                Arc::new(SleepProcess::new(run_for, Duration::ZERO, next_pid()));
            Ok(proc)
        }),
    );

    sup.start(false);
    wait_for_events(&fx.journal, 5).await;

    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_secs(24),
        "third spawn was delayed by an unreset backoff: {elapsed:?}",
    );
    assert_eq!(fx.journal.events()[4], spawned(3));

    sup.stop().await.unwrap();
}

mod backoff {
    use super::*;

    fn secs(all: &[u64]) -> Vec<Duration> {
        all.iter().copied().map(Duration::from_secs).collect()
    }

    #[test]
    fn advances_and_caps() {
        let backoffs = secs(&[0, 5, 15, 30]);
        let mut ix = -1;

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next_backoff(&backoffs, &mut ix));
        }

        let pair =
            |start: u64, reset: u64| (Duration::from_secs(start), Duration::from_secs(reset));
        assert_eq!(
            seen,
            vec![
                pair(0, 5),
                pair(5, 15),
                // The reset cursor stops one entry short of the cap.
                pair(15, 15),
                pair(30, 30),
                pair(30, 30),
            ],
        );
        assert_eq!(ix, 3);
    }

    #[test]
    fn single_entry_repeats() {
        let backoffs = secs(&[7]);
        let mut ix = -1;
        assert_eq!(
            next_backoff(&backoffs, &mut ix),
            (Duration::from_secs(7), Duration::from_secs(7)),
        );
        assert_eq!(
            next_backoff(&backoffs, &mut ix),
            (Duration::from_secs(7), Duration::from_secs(7)),
        );
        assert_eq!(ix, 0);
    }

    #[test]
    fn two_entries_never_reset_early() {
        let backoffs = secs(&[1, 9]);
        let mut ix = -1;
        assert_eq!(
            next_backoff(&backoffs, &mut ix),
            (Duration::from_secs(1), Duration::from_secs(1)),
        );
        assert_eq!(
            next_backoff(&backoffs, &mut ix),
            (Duration::from_secs(9), Duration::from_secs(9)),
        );
    }

    #[test]
    fn start_delays_never_decrease_while_failing() {
        let backoffs = secs(&[0, 2, 4, 8, 16]);
        let mut ix = -1;

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            let (start, _) = next_backoff(&backoffs, &mut ix);
            assert!(start >= last, "backoff went backwards");
            last = start;
        }
        assert_eq!(last, Duration::from_secs(16));
    }

    #[test]
    fn empty_schedule_degrades_to_zero() {
        let mut ix = -1;
        assert_eq!(next_backoff(&[], &mut ix), (Duration::ZERO, Duration::ZERO));
    }
}
