//! Host-loop side of the scheduler: socket records and the shared timer
//!
//! The reactor holds one record per descriptor the driver asked to watch and
//! at most one timer deadline. Tokio registrations are created lazily from
//! inside the pump, so records can be created and changed outside a runtime
//! (readiness is then injected by hand).
//!
//! Readiness is level-triggered: tokio's edge is only cleared once a
//! zero-timeout `poll(2)` shows the descriptor has nothing left for the
//! direction, so unread data keeps producing driver actions.
//!
//! Removal only marks a record pending-destroy. Records are released by
//! [`Reactor::purge`] at the flush point that ends each driver action; a
//! create for the same descriptor before that revives the record.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use spool_common::{ActionTarget, EventMask, Socket, SocketInterest, SocketToken};
use tokio::io::Interest;
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::time::{Instant, Sleep};
use tracing::{trace, warn};

/// Descriptor owned by the engine, watched but never closed by us
#[derive(Debug)]
pub(crate) struct WatchedSocket(RawFd);

impl AsRawFd for WatchedSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    Active,
    PendingDestroy,
}

/// Per-socket watch record
#[derive(Debug)]
struct SocketRecord {
    token: SocketToken,
    read: bool,
    write: bool,
    state: RecordState,
    registration: Option<AsyncFd<WatchedSocket>>,
    /// Registration failed; reported once as an error event
    failed: bool,
}

impl SocketRecord {
    fn is_watched(&self) -> bool {
        self.state == RecordState::Active && (self.read || self.write)
    }
}

/// Outcome of applying a socket request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SocketChange {
    /// New record; the token must be assigned to the driver
    Created(SocketToken),
    /// A pending-destroy record was reused
    Revived(SocketToken),
    Modified,
    Removed,
    /// Remove for an unknown socket
    Ignored,
}

/// A readiness observed by the pump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) target: ActionTarget,
    pub(crate) events: EventMask,
}

#[derive(Debug, Default)]
pub(crate) struct Reactor {
    sockets: BTreeMap<Socket, SocketRecord>,
    deadline: Option<Instant>,
    sleep: Option<Pin<Box<Sleep>>>,
    driven: bool,
    waker: Option<Waker>,
}

impl Reactor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Apply a socket interest request from the driver
    pub(crate) fn update(
        &mut self,
        socket: Socket,
        interest: SocketInterest,
        new_token: impl FnOnce() -> SocketToken,
    ) -> SocketChange {
        if interest == SocketInterest::Remove {
            return match self.sockets.get_mut(&socket) {
                Some(record) if record.state == RecordState::Active => {
                    record.read = false;
                    record.write = false;
                    record.state = RecordState::PendingDestroy;
                    SocketChange::Removed
                }
                _ => SocketChange::Ignored,
            };
        }

        // Exactly the requested directions stay enabled: read-only turns write
        // interest off and write-only turns read interest off
        let read = interest.wants_read();
        let write = interest.wants_write();

        match self.sockets.get_mut(&socket) {
            Some(record) => {
                let change = if record.state == RecordState::PendingDestroy {
                    // The descriptor may now refer to a new socket
                    record.state = RecordState::Active;
                    record.registration = None;
                    record.failed = false;
                    SocketChange::Revived(record.token)
                } else {
                    SocketChange::Modified
                };
                record.read = read;
                record.write = write;
                change
            }
            None => {
                let token = new_token();
                self.sockets.insert(
                    socket,
                    SocketRecord {
                        token,
                        read,
                        write,
                        state: RecordState::Active,
                        registration: None,
                        failed: false,
                    },
                );
                SocketChange::Created(token)
            }
        }
    }

    /// Arm (`Some`) or disarm (`None`) the shared timer
    pub(crate) fn set_timer(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        if deadline.is_none() {
            self.sleep = None;
        }
    }

    pub(crate) fn timer_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Release pending-destroy records; returns how many were released
    pub(crate) fn purge(&mut self) -> usize {
        let before = self.sockets.len();
        self.sockets
            .retain(|_, record| record.state == RecordState::Active);
        before - self.sockets.len()
    }

    /// Current interest in a socket (`Remove` while pending destroy)
    pub(crate) fn interest(&self, socket: Socket) -> Option<SocketInterest> {
        self.sockets.get(&socket).map(|record| {
            match (record.state, record.read, record.write) {
                (RecordState::PendingDestroy, _, _) => SocketInterest::Remove,
                (_, true, true) => SocketInterest::InOut,
                (_, true, false) => SocketInterest::In,
                (_, false, true) => SocketInterest::Out,
                (_, false, false) => SocketInterest::None,
            }
        })
    }

    pub(crate) fn socket_token(&self, socket: Socket) -> Option<SocketToken> {
        self.sockets.get(&socket).map(|record| record.token)
    }

    pub(crate) fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Whether readiness for this socket should still reach the driver
    pub(crate) fn is_watching(&self, socket: Socket) -> bool {
        self.sockets
            .get(&socket)
            .is_some_and(SocketRecord::is_watched)
    }

    /// Nothing to wait for
    pub(crate) fn is_idle(&self) -> bool {
        self.deadline.is_none() && !self.sockets.values().any(SocketRecord::is_watched)
    }

    /// A pump is polling this reactor
    pub(crate) fn is_driven(&self) -> bool {
        self.driven
    }

    /// Claim the reactor for a pump; false if another one holds it
    pub(crate) fn claim(&mut self) -> bool {
        !std::mem::replace(&mut self.driven, true)
    }

    pub(crate) fn release(&mut self) {
        self.driven = false;
        self.waker = None;
    }

    /// Make the pump re-read records and the timer
    pub(crate) fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    /// Forget every record and the timer, and wake the pump
    pub(crate) fn shutdown(&mut self) {
        self.sockets.clear();
        self.deadline = None;
        self.sleep = None;
        self.wake();
    }

    /// Poll every watched socket and the timer
    ///
    /// Stays pending while there is nothing to wait for; the registered
    /// waker is woken when the driver asks for a socket or the timer.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Vec<Readiness>> {
        self.waker = Some(cx.waker().clone());

        let mut ready = Vec::new();
        for (&socket, record) in self.sockets.iter_mut() {
            if !record.is_watched() || record.failed {
                continue;
            }
            if record.registration.is_none() {
                match AsyncFd::with_interest(
                    WatchedSocket(socket),
                    Interest::READABLE.add(Interest::WRITABLE),
                ) {
                    Ok(registration) => record.registration = Some(registration),
                    Err(e) => {
                        warn!(socket, error = %e, "cannot watch socket");
                        record.failed = true;
                        ready.push(Readiness {
                            target: ActionTarget::Socket(socket),
                            events: EventMask::ERR,
                        });
                        continue;
                    }
                }
            }
            let Some(registration) = record.registration.as_ref() else {
                continue;
            };

            let mut events = EventMask::NONE;
            if record.read {
                events |= poll_level(
                    socket,
                    cx,
                    |cx| registration.poll_read_ready(cx),
                    PollFlags::POLLIN,
                    EventMask::IN,
                );
            }
            if record.write {
                events |= poll_level(
                    socket,
                    cx,
                    |cx| registration.poll_write_ready(cx),
                    PollFlags::POLLOUT,
                    EventMask::OUT,
                );
            }
            if !events.is_empty() {
                ready.push(Readiness {
                    target: ActionTarget::Socket(socket),
                    events,
                });
            }
        }

        if let Some(deadline) = self.deadline {
            let sleep = self
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.deadline() != deadline {
                sleep.as_mut().reset(deadline);
            }
            if sleep.as_mut().poll(cx).is_ready() {
                self.deadline = None;
                self.sleep = None;
                ready.push(Readiness {
                    target: ActionTarget::Timeout,
                    events: EventMask::NONE,
                });
            }
        }

        if ready.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(ready)
        }
    }
}

/// Level-triggered readiness for one direction
///
/// Tokio reports edges; the cached readiness is kept while `poll(2)` still
/// sees the descriptor ready and cleared (re-arming the edge) once it does
/// not. Hangup counts as ready so the engine can read end-of-file; socket
/// errors add [`EventMask::ERR`].
fn poll_level<'a, F>(
    socket: Socket,
    cx: &mut Context<'_>,
    mut poll_edge: F,
    wanted: PollFlags,
    ready: EventMask,
) -> EventMask
where
    F: FnMut(&mut Context<'_>) -> Poll<io::Result<AsyncFdReadyGuard<'a, WatchedSocket>>>,
{
    loop {
        let mut guard = match poll_edge(&mut *cx) {
            Poll::Ready(Ok(guard)) => guard,
            // Only seen while the runtime shuts down
            Poll::Ready(Err(_)) => return EventMask::ERR,
            Poll::Pending => return EventMask::NONE,
        };

        let level = current_level(socket, wanted);
        let mut events = EventMask::NONE;
        if level.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
            events |= EventMask::ERR;
        }
        if level.intersects(wanted | PollFlags::POLLHUP) {
            events |= ready;
        }
        if !events.is_empty() {
            return events;
        }

        // Drained since the edge was seen
        guard.clear_ready();
    }
}

/// Zero-timeout `poll(2)` on a descriptor
fn current_level(socket: Socket, wanted: PollFlags) -> PollFlags {
    // SAFETY: the engine keeps the descriptor open while it is watched; it
    // asks for removal before closing it
    let fd = unsafe { BorrowedFd::borrow_raw(socket) };
    let mut fds = [PollFd::new(fd, wanted)];
    match poll(&mut fds, PollTimeout::ZERO) {
        Ok(0) => PollFlags::empty(),
        Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
        Err(errno) => {
            // Keep the edge; the next poll checks again
            trace!(socket, %errno, "readiness check failed");
            wanted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn counter() -> impl FnMut() -> SocketToken {
        let mut next = 0;
        move || {
            next += 1;
            SocketToken::new(next)
        }
    }

    #[test]
    fn test_create_then_modify() {
        let mut reactor = Reactor::new();
        let mut tokens = counter();

        assert_eq!(
            reactor.update(5, SocketInterest::In, &mut tokens),
            SocketChange::Created(SocketToken::new(1))
        );
        assert_eq!(reactor.interest(5), Some(SocketInterest::In));

        assert_eq!(
            reactor.update(5, SocketInterest::InOut, &mut tokens),
            SocketChange::Modified
        );
        assert_eq!(reactor.interest(5), Some(SocketInterest::InOut));
        assert_eq!(reactor.socket_token(5), Some(SocketToken::new(1)));
    }

    #[test]
    fn test_single_direction_disables_the_other() {
        let mut reactor = Reactor::new();
        let mut tokens = counter();
        reactor.update(5, SocketInterest::InOut, &mut tokens);

        reactor.update(5, SocketInterest::Out, &mut tokens);
        assert_eq!(reactor.interest(5), Some(SocketInterest::Out));

        reactor.update(5, SocketInterest::In, &mut tokens);
        assert_eq!(reactor.interest(5), Some(SocketInterest::In));

        reactor.update(5, SocketInterest::None, &mut tokens);
        assert_eq!(reactor.interest(5), Some(SocketInterest::None));
        assert!(!reactor.is_watching(5));
    }

    #[test]
    fn test_remove_is_deferred_until_purge() {
        let mut reactor = Reactor::new();
        let mut tokens = counter();
        reactor.update(5, SocketInterest::In, &mut tokens);

        assert_eq!(
            reactor.update(5, SocketInterest::Remove, &mut tokens),
            SocketChange::Removed
        );
        assert_eq!(reactor.interest(5), Some(SocketInterest::Remove));
        assert!(!reactor.is_watching(5));
        assert_eq!(reactor.socket_count(), 1);

        assert_eq!(reactor.purge(), 1);
        assert_eq!(reactor.interest(5), None);
    }

    #[test]
    fn test_recreate_before_purge_revives() {
        let mut reactor = Reactor::new();
        let mut tokens = counter();
        reactor.update(5, SocketInterest::In, &mut tokens);
        reactor.update(5, SocketInterest::Remove, &mut tokens);

        assert_eq!(
            reactor.update(5, SocketInterest::Out, &mut tokens),
            SocketChange::Revived(SocketToken::new(1))
        );
        assert_eq!(reactor.purge(), 0);
        assert_eq!(reactor.interest(5), Some(SocketInterest::Out));
    }

    #[test]
    fn test_remove_unknown_is_ignored() {
        let mut reactor = Reactor::new();
        assert_eq!(
            reactor.update(9, SocketInterest::Remove, counter()),
            SocketChange::Ignored
        );
        assert_eq!(reactor.socket_count(), 0);
    }

    #[test]
    fn test_idle_tracking() {
        let mut reactor = Reactor::new();
        assert!(reactor.is_idle());

        reactor.set_timer(Some(Instant::now() + Duration::from_secs(1)));
        assert!(!reactor.is_idle());

        reactor.set_timer(None);
        assert!(reactor.is_idle());
        assert!(reactor.timer_deadline().is_none());
    }

    #[test]
    fn test_single_pump_claim() {
        let mut reactor = Reactor::new();
        assert!(reactor.claim());
        assert!(reactor.is_driven());
        assert!(!reactor.claim());

        reactor.release();
        assert!(!reactor.is_driven());
        assert!(reactor.claim());
    }

    #[test]
    fn test_shutdown_forgets_everything() {
        let mut reactor = Reactor::new();
        reactor.update(5, SocketInterest::In, counter());
        reactor.set_timer(Some(Instant::now()));

        reactor.shutdown();
        assert!(reactor.is_idle());
        assert_eq!(reactor.socket_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires() {
        let mut reactor = Reactor::new();
        reactor.set_timer(Some(Instant::now() + Duration::from_millis(50)));

        let ready = std::future::poll_fn(|cx| reactor.poll_ready(cx)).await;
        assert_eq!(
            ready,
            vec![Readiness {
                target: ActionTarget::Timeout,
                events: EventMask::NONE,
            }]
        );
        assert!(reactor.timer_deadline().is_none());

        // Nothing left to wait for
        let mut cx = Context::from_waker(Waker::noop());
        assert!(reactor.poll_ready(&mut cx).is_pending());
    }

    #[tokio::test]
    async fn test_readable_socket() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let mut reactor = Reactor::new();
        reactor.update(fd, SocketInterest::In, counter());
        b.write_all(b"ping").unwrap();

        let ready = std::future::poll_fn(|cx| reactor.poll_ready(cx)).await;
        assert_eq!(
            ready,
            vec![Readiness {
                target: ActionTarget::Socket(fd),
                events: EventMask::IN,
            }]
        );
        reactor.shutdown();
    }

    #[tokio::test]
    async fn test_unread_data_stays_ready() {
        use std::io::{Read, Write};
        use std::os::unix::net::UnixStream;

        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let mut reactor = Reactor::new();
        reactor.update(fd, SocketInterest::In, counter());
        b.write_all(b"ping").unwrap();

        let readable = vec![Readiness {
            target: ActionTarget::Socket(fd),
            events: EventMask::IN,
        }];
        let first = std::future::poll_fn(|cx| reactor.poll_ready(cx)).await;
        assert_eq!(first, readable);

        // Nothing consumed: still ready
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            std::future::poll_fn(|cx| reactor.poll_ready(cx)),
        )
        .await
        .expect("level-triggered readiness");
        assert_eq!(second, readable);

        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).unwrap(), 4);
        let drained = tokio::time::timeout(
            Duration::from_millis(50),
            std::future::poll_fn(|cx| reactor.poll_ready(cx)),
        )
        .await;
        assert!(drained.is_err());

        // New data raises a fresh edge
        b.write_all(b"pong").unwrap();
        let third = tokio::time::timeout(
            Duration::from_secs(1),
            std::future::poll_fn(|cx| reactor.poll_ready(cx)),
        )
        .await
        .expect("new data");
        assert_eq!(third, readable);
        reactor.shutdown();
    }

    #[tokio::test]
    async fn test_hangup_reads_as_ready() {
        use std::os::unix::net::UnixStream;

        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();

        let mut reactor = Reactor::new();
        reactor.update(fd, SocketInterest::In, counter());
        drop(b);

        let ready = tokio::time::timeout(
            Duration::from_secs(1),
            std::future::poll_fn(|cx| reactor.poll_ready(cx)),
        )
        .await
        .expect("hangup");
        assert_eq!(ready.len(), 1);
        assert!(ready[0].events.contains(EventMask::IN));
        reactor.shutdown();
    }

    #[test]
    fn test_current_level_reports_pending_data() {
        use std::io::Write;
        use std::os::unix::net::UnixStream;

        let (a, mut b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        assert!(!current_level(fd, PollFlags::POLLIN).contains(PollFlags::POLLIN));
        assert!(current_level(fd, PollFlags::POLLOUT).contains(PollFlags::POLLOUT));

        b.write_all(b"x").unwrap();
        assert!(current_level(fd, PollFlags::POLLIN).contains(PollFlags::POLLIN));
    }
}
