//! Shared readiness multiplexer.
//!
//! One `mio::Poll` instance and one monitor thread serve every socket of a mesh
//! node. Endpoints register a file descriptor together with a handler; the monitor
//! looks the handler up under the registry lock and invokes it outside the lock.
//! Registration is edge-triggered, so handlers must drain the socket until
//! `WouldBlock` and must never block.

use crate::error::{Result, TransportError};
use bitflags::bitflags;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);

/// First pause after a failed readiness wait
const POLL_ERROR_BACKOFF: Duration = Duration::from_millis(10);

bitflags! {
    /// Readiness mask used for registration and reported to handlers
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        /// Data can be read, or the peer closed its write half
        const READABLE = 1 << 0;
        /// Socket buffer has space for writing
        const WRITABLE = 1 << 1;
        /// Socket error pending
        const ERROR = 1 << 2;
        /// Peer hung up
        const HANGUP = 1 << 3;
    }
}

impl Readiness {
    fn interest(self) -> Interest {
        match (
            self.contains(Readiness::READABLE),
            self.contains(Readiness::WRITABLE),
        ) {
            (_, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (true, true) => Interest::READABLE | Interest::WRITABLE,
        }
    }

    fn from_event(event: &mio::event::Event) -> Self {
        let mut readiness = Readiness::empty();
        if event.is_readable() {
            readiness |= Readiness::READABLE;
        }
        if event.is_writable() {
            readiness |= Readiness::WRITABLE;
        }
        if event.is_error() {
            readiness |= Readiness::ERROR;
        }
        if event.is_read_closed() || event.is_write_closed() {
            readiness |= Readiness::HANGUP;
        }
        readiness
    }
}

/// Handler invoked on the monitor thread for each readiness event of its fd
pub type ReadinessHandler = Arc<dyn Fn(Readiness) -> Result<()> + Send + Sync>;

struct Registration {
    mask: Readiness,
    handler: ReadinessHandler,
}

type HandlerMap = Arc<Mutex<HashMap<RawFd, Registration>>>;

/// Readiness multiplexer with a single dispatch thread
pub struct EpollMonitor {
    registry: Registry,
    waker: Waker,
    poll: Mutex<Option<Poll>>,
    handlers: HandlerMap,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    poll_timeout: Duration,
}

impl EpollMonitor {
    /// Create the multiplexer; the monitor thread starts with [`start`](Self::start)
    pub fn new(poll_timeout: Duration) -> Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;

        Ok(Self {
            registry,
            waker,
            poll: Mutex::new(Some(poll)),
            handlers: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
            poll_timeout,
        })
    }

    /// Register `fd` with its readiness handler
    pub fn add_fd(&self, fd: RawFd, mask: Readiness, handler: ReadinessHandler) -> Result<()> {
        let mut handlers = self.handlers.lock();
        if handlers.contains_key(&fd) {
            return Err(TransportError::DuplicateFd(fd));
        }

        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), mask.interest())?;
        handlers.insert(fd, Registration { mask, handler });
        debug!("Registered fd {} with mask {:?}", fd, mask);
        Ok(())
    }

    /// Change the readiness mask of a registered fd
    pub fn mod_fd(&self, fd: RawFd, mask: Readiness) -> Result<()> {
        let mut handlers = self.handlers.lock();
        let registration = handlers
            .get_mut(&fd)
            .ok_or(TransportError::UnknownFd(fd))?;

        self.registry
            .reregister(&mut SourceFd(&fd), Token(fd as usize), mask.interest())?;
        registration.mask = mask;
        debug!("Modified fd {} to mask {:?}", fd, mask);
        Ok(())
    }

    /// Deregister `fd`; safe to call after the socket was closed
    ///
    /// Returns whether the fd was registered.
    pub fn remove_fd(&self, fd: RawFd) -> bool {
        let removed = self.handlers.lock().remove(&fd).is_some();
        if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
            trace!("Deregister of fd {} ignored: {}", fd, e);
        }
        if removed {
            debug!("Removed fd {}", fd);
        }
        removed
    }

    /// Whether `fd` is currently registered
    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.handlers.lock().contains_key(&fd)
    }

    /// Number of registered fds
    pub fn registered_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Whether the monitor thread is running
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some() && !self.shutdown.load(Ordering::Acquire)
    }

    /// Spawn the monitor thread
    pub fn start(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let poll = self.poll.lock().take().ok_or(TransportError::AlreadyStarted)?;

        let handlers = self.handlers.clone();
        let shutdown = self.shutdown.clone();
        let poll_timeout = self.poll_timeout;

        let handle = std::thread::Builder::new()
            .name("pdu-epoll".to_string())
            .spawn(move || run_monitor(poll, handlers, shutdown, poll_timeout))?;

        *self.thread.lock() = Some(handle);
        info!("Readiness monitor started (poll timeout {:?})", poll_timeout);
        Ok(())
    }

    /// Stop and join the monitor thread, then drop any registration still present
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!("Failed to wake readiness monitor: {}", e);
        }

        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("Readiness monitor thread panicked");
            }
            info!("Readiness monitor stopped");
        }

        let leftover: Vec<RawFd> = self.handlers.lock().drain().map(|(fd, _)| fd).collect();
        for fd in leftover {
            warn!("fd {} still registered at monitor shutdown, deregistering", fd);
            if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                debug!("Deregister of fd {} failed: {}", fd, e);
            }
        }
    }
}

impl Drop for EpollMonitor {
    fn drop(&mut self) {
        if self.thread.lock().is_some() {
            self.shutdown();
        }
    }
}

fn run_monitor(
    mut poll: Poll,
    handlers: HandlerMap,
    shutdown: Arc<AtomicBool>,
    poll_timeout: Duration,
) {
    let mut events = Events::with_capacity(256);
    let mut errors = PollErrorBackoff::new(poll_timeout);

    while !shutdown.load(Ordering::Acquire) {
        match poll.poll(&mut events, Some(poll_timeout)) {
            Ok(()) => errors.reset(),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let (delay, first) = errors.failed();
                if first {
                    error!("Readiness wait failed: {}; retrying in {:?}", e, delay);
                } else {
                    debug!("Readiness wait still failing: {}; retrying in {:?}", e, delay);
                }
                std::thread::sleep(delay);
                continue;
            }
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            let fd = event.token().0 as RawFd;
            let registration = handlers.lock().get(&fd).map(|r| (r.handler.clone(), r.mask));
            let Some((handler, mask)) = registration else {
                trace!("Readiness for unregistered fd {}", fd);
                continue;
            };

            let readiness =
                Readiness::from_event(event) & (mask | Readiness::ERROR | Readiness::HANGUP);
            if readiness.is_empty() {
                continue;
            }

            match catch_unwind(AssertUnwindSafe(|| handler(readiness))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Handler for fd {} failed: {}", fd, e),
                Err(_) => error!("Handler for fd {} panicked", fd),
            }
        }
    }
}

/// Pause schedule after consecutive readiness wait failures
///
/// Doubles from [`POLL_ERROR_BACKOFF`] up to the poll timeout, so a persistent
/// error neither spins the monitor thread nor delays shutdown past one wait.
struct PollErrorBackoff {
    next: Duration,
    max: Duration,
    failures: u32,
}

impl PollErrorBackoff {
    fn new(poll_timeout: Duration) -> Self {
        Self {
            next: POLL_ERROR_BACKOFF,
            max: poll_timeout.max(POLL_ERROR_BACKOFF),
            failures: 0,
        }
    }

    /// Delay before the next wait and whether this failure starts a streak
    fn failed(&mut self) -> (Duration, bool) {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        self.failures += 1;
        (delay, self.failures == 1)
    }

    fn reset(&mut self) {
        if self.failures > 0 {
            info!("Readiness wait recovered after {} failures", self.failures);
        }
        self.next = POLL_ERROR_BACKOFF;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> ReadinessHandler {
        Arc::new(move |readiness| {
            if readiness.contains(Readiness::READABLE) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    #[test]
    fn test_duplicate_fd_rejected() {
        let monitor = EpollMonitor::new(Duration::from_millis(10)).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let fd = a.as_raw_fd();
        let counter = Arc::new(AtomicUsize::new(0));

        monitor
            .add_fd(fd, Readiness::READABLE, counting_handler(counter.clone()))
            .unwrap();
        match monitor.add_fd(fd, Readiness::READABLE, counting_handler(counter)) {
            Err(TransportError::DuplicateFd(dup)) => assert_eq!(dup, fd),
            other => panic!("expected DuplicateFd, got {:?}", other.err()),
        }

        assert!(monitor.remove_fd(fd));
        assert!(!monitor.remove_fd(fd));
        assert!(matches!(
            monitor.mod_fd(fd, Readiness::WRITABLE),
            Err(TransportError::UnknownFd(_))
        ));
    }

    #[test]
    fn test_dispatches_readable() {
        let monitor = EpollMonitor::new(Duration::from_millis(10)).unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        monitor
            .add_fd(a.as_raw_fd(), Readiness::READABLE, counting_handler(counter.clone()))
            .unwrap();
        monitor.start().unwrap();
        assert!(matches!(monitor.start(), Err(TransportError::AlreadyStarted)));

        b.write_all(b"ping").unwrap();
        assert!(wait_for(Duration::from_secs(2), || counter.load(Ordering::SeqCst) > 0));

        monitor.remove_fd(a.as_raw_fd());
        monitor.shutdown();
        assert!(!monitor.is_running());
    }

    #[test]
    fn test_failing_handler_does_not_stop_monitor() {
        let monitor = EpollMonitor::new(Duration::from_millis(10)).unwrap();
        let (bad, mut bad_peer) = UnixStream::pair().unwrap();
        let (good, mut good_peer) = UnixStream::pair().unwrap();
        bad.set_nonblocking(true).unwrap();
        good.set_nonblocking(true).unwrap();

        let panics = Arc::new(AtomicUsize::new(0));
        let panics_seen = panics.clone();
        monitor
            .add_fd(
                bad.as_raw_fd(),
                Readiness::READABLE,
                Arc::new(move |_| {
                    panics_seen.fetch_add(1, Ordering::SeqCst);
                    panic!("misbehaving peer");
                }),
            )
            .unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        monitor
            .add_fd(good.as_raw_fd(), Readiness::READABLE, counting_handler(counter.clone()))
            .unwrap();
        monitor.start().unwrap();

        bad_peer.write_all(b"boom").unwrap();
        assert!(wait_for(Duration::from_secs(2), || panics.load(Ordering::SeqCst) > 0));

        good_peer.write_all(b"fine").unwrap();
        assert!(wait_for(Duration::from_secs(2), || counter.load(Ordering::SeqCst) > 0));

        monitor.shutdown();
    }

    #[test]
    fn test_shutdown_drops_leftover_registrations() {
        let monitor = EpollMonitor::new(Duration::from_millis(10)).unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        monitor
            .add_fd(
                a.as_raw_fd(),
                Readiness::READABLE,
                counting_handler(Arc::new(AtomicUsize::new(0))),
            )
            .unwrap();
        monitor.start().unwrap();
        monitor.shutdown();
        assert_eq!(monitor.registered_count(), 0);
    }

    #[test]
    fn test_shutdown_is_prompt() {
        let monitor = EpollMonitor::new(Duration::from_secs(5)).unwrap();
        monitor.start().unwrap();
        let start = Instant::now();
        monitor.shutdown();
        // the waker interrupts the bounded wait
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_poll_errors_back_off_until_recovered() {
        let mut backoff = PollErrorBackoff::new(Duration::from_millis(100));
        let delays: Vec<_> = (0..6).map(|_| backoff.failed()).collect();
        assert_eq!(delays[0], (Duration::from_millis(10), true));
        assert_eq!(
            delays[1..].iter().map(|(delay, _)| delay.as_millis()).collect::<Vec<_>>(),
            vec![20, 40, 80, 100, 100]
        );
        assert!(delays[1..].iter().all(|(_, first)| !first));

        backoff.reset();
        assert_eq!(backoff.failed(), (POLL_ERROR_BACKOFF, true));
    }

    #[test]
    fn test_poll_error_pause_never_below_minimum() {
        let mut backoff = PollErrorBackoff::new(Duration::from_millis(1));
        for _ in 0..4 {
            assert_eq!(backoff.failed().0, POLL_ERROR_BACKOFF);
        }
    }
}
