//! End-to-end monitor tests: real scripts directory, real directory watcher,
//! real child processes.

use std::sync::Arc;
use std::time::Duration;

use cronmon_daemon::events::{Event, ListOp};
use cronmon_daemon::journal::{read_previous_state, MemoryJournal};
use cronmon_daemon::monitor::Monitor;
use cronmon_tests::helpers::{wait_until, write_script};

const PATIENCE: Duration = Duration::from_secs(15);

fn spawned_pid(journal: &MemoryJournal, file: &str) -> Option<i32> {
    journal.events().iter().find_map(|event| match event {
        Event::ProcessSpawned { file: f, pid } if f == file => Some(*pid),
        _ => None,
    })
}

fn has_exit(journal: &MemoryJournal, file: &str, pid: i32) -> bool {
    journal.events().iter().any(|event| {
        matches!(
            event,
            Event::ProcessExited { file: f, pid: p, .. } if f == file && *p == pid,
        )
    })
}

#[tokio::test]
async fn supervises_a_real_child_through_its_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = tmp.path().join("scripts");
    write_script(&scripts, "svc-e2e-lifecycle", "exec sleep 30");

    let journal = Arc::new(MemoryJournal::new());
    let mut monitor = Monitor::new(&scripts, journal.clone()).unwrap();

    assert!(
        wait_until(PATIENCE, || spawned_pid(&journal, "svc-e2e-lifecycle").is_some()).await,
        "service never spawned: {:#?}",
        journal.events(),
    );
    let pid = spawned_pid(&journal, "svc-e2e-lifecycle").unwrap();
    assert!(pid > 0);
    assert!(cronmon_unix_alive(pid));

    monitor.stop().await;

    // The child was interrupted; its exit made it into the journal before
    // stop() returned, and the clean shutdown ends with the quit record.
    assert!(has_exit(&journal, "svc-e2e-lifecycle", pid));
    assert!(!cronmon_unix_alive(pid));
    let events = journal.events();
    assert_eq!(events.last(), Some(&Event::Quit {}));

    let state = read_previous_state(journal.replay()).unwrap();
    assert!(state.processes.is_empty(), "clean shutdown must recover empty");
}

#[tokio::test]
async fn a_crashing_service_is_restarted() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = tmp.path().join("scripts");
    // Exits immediately; the supervisor must respawn it (backoff starts at
    // zero, so two spawns arrive quickly).
    write_script(&scripts, "svc-e2e-crashy", "exit 3");

    let journal = Arc::new(MemoryJournal::new());
    let mut monitor = Monitor::new(&scripts, journal.clone()).unwrap();

    assert!(
        wait_until(PATIENCE, || {
            let spawns = journal
                .events()
                .iter()
                .filter(|event| {
                    matches!(event, Event::ProcessSpawned { file, .. } if file == "svc-e2e-crashy")
                })
                .count();
            spawns >= 2
        })
        .await,
        "service was not restarted: {:#?}",
        journal.events(),
    );

    // Exit codes of the crashing child are recorded verbatim.
    assert!(journal.events().iter().any(|event| {
        matches!(
            event,
            Event::ProcessExited { file, exit_code: 3, .. } if file == "svc-e2e-crashy",
        )
    }));

    monitor.stop().await;
}

#[tokio::test]
async fn files_created_while_running_become_services() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = tmp.path().join("scripts");
    std::fs::create_dir_all(&scripts).unwrap();

    let journal = Arc::new(MemoryJournal::new());
    let mut monitor = Monitor::new(&scripts, journal.clone()).unwrap();

    // Let the watch settle before churning the directory.
    tokio::time::sleep(Duration::from_millis(200)).await;
    write_script(&scripts, "svc-e2e-late", "exec sleep 30");

    assert!(
        wait_until(PATIENCE, || {
            let events = journal.events();
            let added = events.iter().any(|event| {
                matches!(
                    event,
                    Event::ProcessListModify { op: ListOp::Add, file } if file == "svc-e2e-late",
                )
            });
            added && spawned_pid(&journal, "svc-e2e-late").is_some()
        })
        .await,
        "late file never became a service: {:#?}",
        journal.events(),
    );

    monitor.stop().await;
}

#[tokio::test]
async fn removing_the_file_stops_the_service() {
    let tmp = tempfile::tempdir().unwrap();
    let scripts = tmp.path().join("scripts");
    let path = write_script(&scripts, "svc-e2e-removed", "exec sleep 30");

    let journal = Arc::new(MemoryJournal::new());
    let mut monitor = Monitor::new(&scripts, journal.clone()).unwrap();

    assert!(
        wait_until(PATIENCE, || spawned_pid(&journal, "svc-e2e-removed").is_some()).await,
        "service never spawned",
    );
    let pid = spawned_pid(&journal, "svc-e2e-removed").unwrap();

    std::fs::remove_file(&path).unwrap();

    assert!(
        wait_until(PATIENCE, || has_exit(&journal, "svc-e2e-removed", pid)).await,
        "removed service never exited: {:#?}",
        journal.events(),
    );
    assert!(
        wait_until(PATIENCE, || !cronmon_unix_alive(pid)).await,
        "child outlived its removal",
    );

    monitor.stop().await;
}

/// `kill(pid, 0)` probe without dragging the unix crate into the test list.
fn cronmon_unix_alive(pid: i32) -> bool {
    // A zombie still "exists"; treat it as dead once it cannot be signalled
    // or has been reaped by the supervisor.
    std::path::Path::new(&format!("/proc/{pid}/stat"))
        .metadata()
        .map(|_| {
            std::fs::read_to_string(format!("/proc/{pid}/stat"))
                .map(|stat| !stat.contains(") Z "))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}
