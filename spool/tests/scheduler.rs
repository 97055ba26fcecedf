//! Integration tests for transfers running on a scheduler
//!
//! The scripted engine from spool-test-utils stands in for libcurl. Most tests
//! inject readiness by hand; the async ones run the scheduler's pump with
//! socket pairs and the tokio timer.

use std::cell::{Cell, RefCell};
use std::io::{Cursor, Read, Seek, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use spool::{
    EngineOption, EventMask, OptionValue, ResultCode, Scheduler, SeekResult, SocketInterest,
    Token, Transfer, TransferEvent,
};
use spool_test_utils::{SimControl, SimDriver, Step};
use tokio::sync::mpsc;
use tokio::task::LocalSet;

type SimTransfer = Transfer<SimDriver>;

// ============================================================================
// Helper Functions
// ============================================================================

fn setup() -> (Scheduler<SimDriver>, SimControl) {
    let scheduler = Scheduler::<SimDriver>::new().expect("scheduler");
    let control = scheduler.with_driver(|d| d.control()).expect("driver");
    (scheduler, control)
}

fn transfer(scheduler: &Scheduler<SimDriver>, url: &str) -> SimTransfer {
    let transfer = SimTransfer::with_scheduler(scheduler).expect("transfer");
    transfer.set_url(url).expect("url");
    transfer
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Record the size of every write
fn record_writes(transfer: &SimTransfer) -> Rc<RefCell<Vec<usize>>> {
    let sizes = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&sizes);
    transfer
        .set_write_function(move |data| {
            sink.borrow_mut().push(data.len());
            data.len()
        })
        .unwrap();
    sizes
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_running_flag_follows_last_call() {
    let (scheduler, _control) = setup();
    let t = transfer(&scheduler, "sim://lifecycle");
    let mut events = t.subscribe();

    assert!(!t.is_running());
    t.start().unwrap();
    t.start().unwrap();
    assert!(t.is_running());

    t.abort();
    assert!(!t.is_running());
    t.abort();
    assert!(!t.is_running());

    t.start().unwrap();
    assert!(t.is_running());
    t.abort();

    assert_eq!(
        drain(&mut events),
        vec![
            TransferEvent::Aborted { token: t.token() },
            TransferEvent::Aborted { token: t.token() },
        ]
    );
}

#[test]
fn test_double_start_registers_once() {
    let (scheduler, control) = setup();
    let t = transfer(&scheduler, "sim://twice");

    t.start().unwrap();
    t.start().unwrap();

    assert_eq!(control.added(), vec![t.token()]);
    assert_eq!(scheduler.active_count(), 1);
}

#[test]
fn test_handle_reused_after_completion() {
    let (scheduler, control) = setup();
    control.script("sim://again", [Step::write(4), Step::ok()]);
    let t = transfer(&scheduler, "sim://again");
    let sizes = record_writes(&t);

    for _ in 0..2 {
        t.start().unwrap();
        scheduler.timeout_elapsed();
        assert!(!t.is_running());
        assert_eq!(t.result(), Some(ResultCode::Ok));
    }

    assert_eq!(*sizes.borrow(), vec![4, 4]);
    assert_eq!(control.added(), vec![t.token(), t.token()]);
    assert_eq!(control.removed(), vec![t.token(), t.token()]);
}

// ============================================================================
// Abort
// ============================================================================

#[test]
fn test_no_callbacks_after_abort_from_callback() {
    let (scheduler, control) = setup();
    control.script(
        "sim://abort-inside",
        [
            Step::write(10),
            Step::download_progress(10, 100),
            Step::write(10),
            Step::ok(),
        ],
    );
    let t = transfer(&scheduler, "sim://abort-inside");
    let handle = t.abort_handle();
    let writes = Rc::new(Cell::new(0));
    let counter = Rc::clone(&writes);
    t.set_write_function(move |data| {
        counter.set(counter.get() + 1);
        handle.abort();
        data.len()
    })
    .unwrap();
    let mut events = t.subscribe();

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert_eq!(writes.get(), 1);
    assert_eq!(
        drain(&mut events),
        vec![TransferEvent::Aborted { token: t.token() }]
    );
    assert_eq!(t.result(), None);
    assert_eq!(scheduler.active_count(), 0);
}

#[test]
fn test_no_callbacks_after_abort_between_actions() {
    let (scheduler, control) = setup();
    control.script(
        "sim://abort-outside",
        [
            Step::Watch(21, SocketInterest::In),
            Step::write(10),
            Step::Yield,
            Step::download_progress(20, 100),
            Step::write(10),
            Step::ok(),
        ],
    );
    let t = transfer(&scheduler, "sim://abort-outside");
    let sizes = record_writes(&t);
    let mut events = t.subscribe();

    t.start().unwrap();
    scheduler.timeout_elapsed();
    t.abort();

    // Readiness that was already pending for the transfer's socket
    scheduler.socket_ready(21, EventMask::IN);
    scheduler.timeout_elapsed();

    assert_eq!(*sizes.borrow(), vec![10]);
    assert_eq!(
        drain(&mut events),
        vec![TransferEvent::Aborted { token: t.token() }]
    );
}

#[test]
fn test_scheduler_drop_aborts_every_transfer() {
    let (scheduler, _control) = setup();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let transfers: Vec<SimTransfer> = (0..3)
        .map(|i| {
            let t = transfer(&scheduler, &format!("sim://drop/{i}"));
            t.subscribe_with(tx.clone());
            t.start().unwrap();
            t
        })
        .collect();
    assert_eq!(scheduler.active_count(), 3);

    drop(scheduler);

    let aborted: Vec<Token> = drain(&mut rx)
        .into_iter()
        .map(|event| {
            assert!(matches!(event, TransferEvent::Aborted { .. }));
            event.token()
        })
        .collect();
    let tokens: Vec<Token> = transfers.iter().map(SimTransfer::token).collect();
    assert_eq!(aborted, tokens);
    assert!(transfers.iter().all(|t| !t.is_running()));
    assert!(matches!(
        transfers[0].start(),
        Err(spool::Error::SchedulerGone)
    ));
}

// ============================================================================
// Headers
// ============================================================================

#[test]
fn test_header_round_trip_printable_ascii() {
    let (scheduler, _control) = setup();
    let t = transfer(&scheduler, "sim://headers");
    let printable: String = (0x20u8..=0x7e).map(char::from).collect();

    t.set_http_header("X-Printable", &printable);

    assert_eq!(t.http_header("X-Printable").as_deref(), Some(printable.as_str()));
    let raw = t.http_header_raw("X-Printable").unwrap();
    assert!(!raw.contains(' '));
    assert!(raw.starts_with("%20%21"));
}

#[test]
fn test_headers_sent_at_start() {
    let (scheduler, _control) = setup();
    let t = transfer(&scheduler, "sim://sent");
    t.set_http_header("X-Name", "a b");
    t.start().unwrap();

    let sent = scheduler
        .with_driver(|d| {
            d.handle(t.token())
                .and_then(|h| h.option(EngineOption::HttpHeaders).cloned())
        })
        .unwrap();
    assert_eq!(
        sent,
        Some(OptionValue::List(vec!["X-Name: a%20b".to_string()]))
    );
}

#[test]
fn test_removing_unset_header_changes_nothing() {
    let (scheduler, _control) = setup();
    let t = transfer(&scheduler, "sim://no-header");

    t.remove_http_header("X-Never");
    assert!(!t.has_http_header("X-Never"));

    // The list was never dirtied, so none is installed
    t.start().unwrap();
    assert!(t.option(EngineOption::HttpHeaders).is_none());
}

// ============================================================================
// Data and completion
// ============================================================================

#[test]
fn test_writes_then_success() {
    let (scheduler, control) = setup();
    control.script(
        "sim://100-50-0",
        [Step::write(100), Step::write(50), Step::write(0), Step::ok()],
    );
    let t = transfer(&scheduler, "sim://100-50-0");
    let sizes = record_writes(&t);
    let mut events = t.subscribe();

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert_eq!(*sizes.borrow(), vec![100, 50, 0]);
    assert_eq!(
        drain(&mut events),
        vec![TransferEvent::Completed {
            token: t.token(),
            result: ResultCode::Ok
        }]
    );
    assert!(!t.is_running());
}

#[test]
fn test_failure_before_any_write() {
    let (scheduler, control) = setup();
    control.script("sim://refused", [Step::Done(ResultCode::CouldntConnect)]);
    let t = transfer(&scheduler, "sim://refused");
    let sizes = record_writes(&t);
    let mut events = t.subscribe();

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert!(sizes.borrow().is_empty());
    assert_eq!(
        drain(&mut events),
        vec![TransferEvent::Completed {
            token: t.token(),
            result: ResultCode::CouldntConnect
        }]
    );
    assert_eq!(t.result(), Some(ResultCode::CouldntConnect));
}

#[test]
fn test_short_write_fails_transfer() {
    let (scheduler, control) = setup();
    control.script("sim://short", [Step::write(8), Step::ok()]);
    let t = transfer(&scheduler, "sim://short");
    t.set_write_function(|data| data.len() / 2).unwrap();

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert_eq!(t.result(), Some(ResultCode::WriteError));
}

#[test]
fn test_completions_delivered_in_engine_order() {
    let (scheduler, control) = setup();
    let fd = 50;
    control.script(
        "sim://first",
        [
            Step::Watch(fd, SocketInterest::In),
            Step::AwaitSocket(fd),
            Step::ok(),
        ],
    );
    control.script(
        "sim://second",
        [
            Step::Watch(fd, SocketInterest::In),
            Step::AwaitSocket(fd),
            Step::Done(ResultCode::HttpReturnedError),
        ],
    );
    let (tx, mut rx) = mpsc::unbounded_channel();

    // Engine order follows registration order
    let second = transfer(&scheduler, "sim://second");
    let first = transfer(&scheduler, "sim://first");
    second.subscribe_with(tx.clone());
    first.subscribe_with(tx);
    second.start().unwrap();
    first.start().unwrap();

    scheduler.timeout_elapsed();
    assert_eq!(scheduler.socket_interest(fd), Some(SocketInterest::In));
    assert!(drain(&mut rx).is_empty());

    // One readiness finishes both
    scheduler.socket_ready(fd, EventMask::IN);

    assert_eq!(
        drain(&mut rx),
        vec![
            TransferEvent::Completed {
                token: second.token(),
                result: ResultCode::HttpReturnedError
            },
            TransferEvent::Completed {
                token: first.token(),
                result: ResultCode::Ok
            },
        ]
    );
}

#[test]
fn test_headers_and_progress_reported() {
    let (scheduler, control) = setup();
    control.script(
        "sim://progress",
        [
            Step::header("HTTP/1.1 200 OK"),
            Step::download_progress(50, 100),
            Step::write(50),
            Step::download_progress(100, 100),
            Step::write(50),
            Step::ok(),
        ],
    );
    let t = transfer(&scheduler, "sim://progress");
    let lines = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&lines);
    t.set_header_function(move |line| {
        sink.borrow_mut().push(String::from_utf8_lossy(line).into_owned());
        line.len()
    })
    .unwrap();
    let mut events = t.subscribe();

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert_eq!(*lines.borrow(), vec!["HTTP/1.1 200 OK\r\n".to_string()]);
    let progress: Vec<u64> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            TransferEvent::Progress { progress, .. } => Some(progress.download_now),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![50, 100]);
}

#[test]
fn test_upload_reads_and_seeks() {
    let (scheduler, control) = setup();
    control.script(
        "sim://upload",
        [
            Step::Read(4),
            Step::Seek(std::io::SeekFrom::Start(0)),
            Step::Read(4),
            Step::Read(4),
            Step::Read(4),
            Step::ok(),
        ],
    );
    let t = transfer(&scheduler, "sim://upload");
    t.set(EngineOption::Upload, true).unwrap();
    t.set(EngineOption::InFileSize, 6i64).unwrap();

    let source = Rc::new(RefCell::new(Cursor::new(b"abcdef".to_vec())));
    let reader = Rc::clone(&source);
    t.set_read_function(move |buf| Ok(reader.borrow_mut().read(buf).unwrap_or(0)))
        .unwrap();
    let seeker = Rc::clone(&source);
    t.set_seek_function(move |pos| match seeker.borrow_mut().seek(pos) {
        Ok(_) => SeekResult::Ok,
        Err(_) => SeekResult::Fail,
    })
    .unwrap();

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert_eq!(t.result(), Some(ResultCode::Ok));
    assert_eq!(control.uploaded(t.token()), b"abcdabcdef".to_vec());
    assert_eq!(control.seeks().len(), 1);
}

#[test]
fn test_unseekable_upload_without_seek_function() {
    let (scheduler, control) = setup();
    control.script(
        "sim://no-seek",
        [Step::Seek(std::io::SeekFrom::Start(0)), Step::ok()],
    );
    let t = transfer(&scheduler, "sim://no-seek");

    t.start().unwrap();
    scheduler.timeout_elapsed();

    assert_eq!(control.seeks()[0].2, SeekResult::CantSeek);
}

// ============================================================================
// Host event loop
// ============================================================================

#[tokio::test]
async fn test_socket_readiness_drives_transfer() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (a, mut b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            let fd = a.as_raw_fd();

            let (scheduler, control) = setup();
            let _pump = tokio::task::spawn_local(scheduler.run());
            control.set_kick_on_add(true);
            control.script(
                "sim://socket",
                [
                    Step::Watch(fd, SocketInterest::In),
                    Step::AwaitSocket(fd),
                    Step::write(5),
                    Step::Watch(fd, SocketInterest::Remove),
                    Step::ok(),
                ],
            );
            let t = transfer(&scheduler, "sim://socket");
            let sizes = record_writes(&t);
            let mut events = t.subscribe();
            t.start().unwrap();

            // Let the kick timer fire and the watch be installed
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(scheduler.socket_interest(fd), Some(SocketInterest::In));
            assert!(sizes.borrow().is_empty());

            b.write_all(b"x").unwrap();
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("completion")
                .expect("event");

            assert_eq!(
                event,
                TransferEvent::Completed {
                    token: t.token(),
                    result: ResultCode::Ok
                }
            );
            assert_eq!(*sizes.borrow(), vec![5]);
            assert_eq!(scheduler.socket_interest(fd), None);
            assert!(
                control
                    .actions()
                    .iter()
                    .any(|(target, events)| *target == spool_common::ActionTarget::Socket(fd)
                        && events.contains(EventMask::IN))
            );
        })
        .await;
}

#[tokio::test]
async fn test_engine_timer_drives_transfer() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (scheduler, control) = setup();
            let _pump = tokio::task::spawn_local(scheduler.run());
            control.set_kick_on_add(true);
            control.script(
                "sim://timer",
                [
                    Step::Timer(Some(Duration::from_millis(10))),
                    Step::Yield,
                    Step::write(3),
                    Step::ok(),
                ],
            );
            let t = transfer(&scheduler, "sim://timer");
            let mut events = t.subscribe();
            t.start().unwrap();

            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("completion")
                .expect("event");

            assert!(event.is_terminal());
            assert_eq!(t.result(), Some(ResultCode::Ok));
            let timeouts = control
                .actions()
                .iter()
                .filter(|(target, _)| *target == spool_common::ActionTarget::Timeout)
                .count();
            assert_eq!(timeouts, 2);
            assert!(scheduler.timer_remaining().is_none());
        })
        .await;
}

#[tokio::test]
async fn test_run_without_local_set() {
    let (scheduler, control) = setup();
    control.set_kick_on_add(true);
    control.script("sim://plain", [Step::write(2), Step::ok()]);
    let t = transfer(&scheduler, "sim://plain");
    let mut events = t.subscribe();

    // The kick timer is armed with nothing running the pump yet
    t.start().unwrap();
    assert!(scheduler.timer_remaining().is_some());

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::select! {
            _ = scheduler.run() => None,
            event = events.recv() => event,
        }
    })
    .await
    .expect("completion")
    .expect("event");

    assert_eq!(
        event,
        TransferEvent::Completed {
            token: t.token(),
            result: ResultCode::Ok
        }
    );
}

#[tokio::test]
async fn test_second_run_returns_immediately() {
    let local = LocalSet::new();
    local
        .run_until(async {
            let (scheduler, _control) = setup();
            let first = tokio::task::spawn_local(scheduler.run());
            tokio::task::yield_now().await;

            tokio::time::timeout(Duration::from_secs(1), scheduler.run())
                .await
                .expect("second run returns");

            drop(scheduler);
            tokio::time::timeout(Duration::from_secs(1), first)
                .await
                .expect("pump stops with the scheduler")
                .unwrap();
        })
        .await;
}
