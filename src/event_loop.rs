//! The reactor: one readiness multiplexer, one timer queue, and a queue for
//! work submitted from other threads, all pinned to the thread that created
//! them.
//!
//! `EventLoop` is the owning handle returned by [`EventLoop::new`]; it is the
//! thing whose `run` method blocks the calling thread. [`EventLoopHandle`] is
//! the cheaply-cloned, `!Send` handle that channels, timers and connections
//! hold to call back into the loop — registering interest, scheduling
//! timers, deferring a closure — all on the loop's own thread. A thread that
//! does not own the loop reaches it instead through [`EventLoopProxy`], the
//! `Send + Sync` half of this split; its deferred work re-acquires the full
//! handle via [`EventLoop::current`] once it actually runs. Nothing outside
//! this module ever touches [`Poller`] or the channel registry directly.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use mio::Token;

use crate::channel::{Channel, RegState};
use crate::error::{ReactorError, Result};
use crate::poller::{Interest, Poller};
use crate::time::Timestamp;
use crate::timer::TimerId;
use crate::timer_queue::TimerQueue;

const WAKE_TOKEN: Token = Token(usize::MAX);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EVENTS_CAPACITY: usize = 1024;
const DEFAULT_PENDING_CAPACITY: usize = 16;

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoopHandle>> = const { RefCell::new(None) };
}

/// Ignores `SIGPIPE` process-wide, once, the first time any thread
/// constructs an `EventLoop`. Without this, a write to a socket the peer has
/// already reset can raise `SIGPIPE` instead of surfacing as an `io::Error`,
/// and the default disposition for that signal is to terminate the process —
/// clearly wrong for a server that wants to log the error and move on.
fn ignore_sigpipe() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

/// Tunables for an [`EventLoop`], grounded in the same three knobs `mio`'s
/// own (now-deprecated) `EventLoopBuilder` exposed: how long to block per
/// poll, how many readiness slots to preallocate, and how much headroom to
/// give the pending-task queue up front.
#[derive(Debug, Clone, Copy)]
pub struct EventLoopConfig {
    pub poll_timeout: Duration,
    pub events_capacity: usize,
    pub pending_capacity: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        EventLoopConfig {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

/// Builds an [`EventLoopConfig`] fluently, then constructs the loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventLoopBuilder {
    config: EventLoopConfig,
}

impl EventLoopBuilder {
    pub fn new() -> EventLoopBuilder {
        EventLoopBuilder::default()
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout = timeout;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn pending_capacity(mut self, capacity: usize) -> Self {
        self.config.pending_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<EventLoop> {
        EventLoop::with_config(self.config)
    }
}

/// A boxed closure queued for later execution on the loop's own thread.
///
/// `FnOnce` closures captured by application code routinely hold `Rc`-based
/// connection state, which is not `Send`. But the producer side of this
/// queue (`EventLoopHandle`, cloned onto foreign threads to submit work)
/// must itself be `Send + Sync` unconditionally, since Rust's `Send` bound
/// is a static per-type property and cannot vary by which particular
/// closure happens to be inside the box at a given call site. `LoopTask`
/// closes that gap with an explicit, narrow safety invariant: a `LoopTask`
/// is only ever constructed by `queue_in_loop` and only ever run by the
/// loop's own pending-task drain, both of which execute exclusively on the
/// loop's owning thread. The thread that *enqueues* a task may be foreign;
/// the thread that *builds* and *runs* the boxed closure never is.
struct LoopTask(Box<dyn FnOnce()>);

// SAFETY: see the invariant documented on `LoopTask` above. Soundness rests
// entirely on `EventLoop::run_in_loop`/`queue_in_loop`/the drain loop never
// invoking a task anywhere but the owning thread.
unsafe impl Send for LoopTask {}

impl LoopTask {
    fn run(self) {
        (self.0)()
    }
}

/// State reachable from any thread: the pending-task queue, the wake-up
/// primitive, the quit flag, and the timer sequence counter. Never holds an
/// `Rc`.
struct SharedState {
    thread_id: ThreadId,
    pending: Mutex<VecDeque<LoopTask>>,
    waker: mio::Waker,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    next_timer_seq: AtomicU64,
}

/// Loop-thread-only state: the poller and the live channel registry.
struct EventLoopInner {
    shared: Arc<SharedState>,
    poller: Poller,
    channels: HashMap<Token, Channel>,
    next_token: usize,
    looping: bool,
    event_handling: bool,
    config: EventLoopConfig,
}

/// A cheaply cloned, thread-confined handle to one event loop.
///
/// Clones share the loop's channel registry and poller. Only ever hand this
/// out to code that will use it on the loop's own thread (channels, timers,
/// connections) — it holds `Rc` state and so cannot itself cross a thread
/// boundary. To reach the loop from another thread, use [`EventLoopProxy`]
/// (obtained via [`EventLoopHandle::proxy`] or [`EventLoop::proxy`]).
#[derive(Clone)]
pub struct EventLoopHandle {
    inner: Rc<RefCell<EventLoopInner>>,
    timer_queue: Rc<RefCell<Option<TimerQueue>>>,
}

impl EventLoopHandle {
    fn shared(&self) -> Arc<SharedState> {
        self.inner.borrow().shared.clone()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared().thread_id
    }

    /// Panics if called from any thread but the loop's owner, matching this
    /// design's treatment of thread-affinity violations as fatal.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!("{}", ReactorError::ThreadAffinityViolation);
        }
    }

    /// Runs `f` now if called from the loop's thread, otherwise defers it
    /// via [`EventLoopHandle::queue_in_loop`]. This is the one concurrency
    /// primitive every cross-thread-safe mutation in this crate composes
    /// with.
    pub fn run_in_loop(&self, f: impl FnOnce() + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Appends `f` to the pending-task queue unconditionally, waking the
    /// loop iff the caller is off-thread or the loop is currently inside its
    /// own drain (so a task that enqueues another task is still observed
    /// before the next poll, rather than waiting out a full timeout).
    pub fn queue_in_loop(&self, f: impl FnOnce() + 'static) {
        let shared = self.shared();
        {
            let mut pending = shared.pending.lock().unwrap();
            pending.push_back(LoopTask(Box::new(f)));
        }
        if !self.is_in_loop_thread() || shared.calling_pending.load(Ordering::Acquire) {
            if let Err(e) = shared.waker.wake() {
                log::warn!("wake-up write failed, loop may stall until its poll timeout: {e}");
            }
        }
    }

    pub(crate) fn alloc_token(&self) -> Token {
        let mut inner = self.inner.borrow_mut();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        token
    }

    pub(crate) fn update_channel(&self, channel: &Channel, interest: Interest) {
        self.assert_in_loop_thread();
        let token = channel.token();
        let fd = channel.fd();
        let mut inner = self.inner.borrow_mut();
        match channel.state() {
            RegState::New => {
                if interest != Interest::Idle {
                    if let Err(e) = inner.poller.register(fd, token, interest) {
                        log::warn!("failed to register fd {fd} (token {token:?}): {e}");
                        return;
                    }
                    channel.set_state(RegState::Added);
                    inner.channels.insert(token, channel.clone());
                }
            }
            RegState::Added => {
                if interest == Interest::Idle {
                    if let Err(e) = inner.poller.deregister(fd) {
                        log::warn!("failed to deregister fd {fd}: {e}");
                    }
                    inner.channels.remove(&token);
                    channel.set_state(RegState::Deleted);
                } else if let Err(e) = inner.poller.reregister(fd, token, interest) {
                    log::warn!("failed to reregister fd {fd} (token {token:?}): {e}");
                }
            }
            RegState::Deleted => {
                if interest != Interest::Idle {
                    if let Err(e) = inner.poller.register(fd, token, interest) {
                        log::warn!("failed to re-add fd {fd} (token {token:?}): {e}");
                        return;
                    }
                    channel.set_state(RegState::Added);
                    inner.channels.insert(token, channel.clone());
                }
            }
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        let token = channel.token();
        let mut inner = self.inner.borrow_mut();
        if channel.state() == RegState::Added {
            if let Err(e) = inner.poller.deregister(channel.fd()) {
                log::warn!("failed to deregister fd {} on remove: {e}", channel.fd());
            }
        }
        inner.channels.remove(&token);
        channel.set_state(RegState::New);
    }

    fn timer_queue(&self) -> TimerQueue {
        self.timer_queue
            .borrow()
            .clone()
            .expect("timer queue is initialized before EventLoop::new returns")
    }

    fn next_timer_id(&self) -> TimerId {
        TimerId(self.shared().next_timer_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Schedules `callback` to run once at `at`. `EventLoopHandle` is
    /// thread-confined (it holds `Rc` state), so this is always already
    /// running on the loop thread by construction; the indirection through
    /// `run_in_loop` exists so this composes the same way from inside a
    /// channel callback as it does from a connection's own constructor. A
    /// genuine foreign thread schedules timers through
    /// [`EventLoopProxy::run_at`] instead.
    pub fn run_at(&self, at: Timestamp, mut callback: impl FnMut() + 'static) -> TimerId {
        let id = self.next_timer_id();
        let handle = self.clone();
        self.run_in_loop(move || {
            handle
                .timer_queue()
                .insert(id, at, None, Box::new(move || callback()));
        });
        id
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + 'static) -> TimerId {
        self.run_at(Timestamp::now().add(delay), callback)
    }

    /// Schedules `callback` to run every `interval`, starting `interval`
    /// from now.
    pub fn run_every(&self, interval: Duration, mut callback: impl FnMut() + 'static) -> TimerId {
        let id = self.next_timer_id();
        let handle = self.clone();
        let first = Timestamp::now().add(interval);
        self.run_in_loop(move || {
            handle.timer_queue().insert(
                id,
                first,
                Some(interval),
                Box::new(move || callback()),
            );
        });
        id
    }

    /// Cancels a previously scheduled timer. A no-op if it already fired (and
    /// was not repeating) or was already cancelled. See [`EventLoopProxy::cancel_timer`]
    /// for the foreign-thread equivalent.
    pub fn cancel_timer(&self, id: TimerId) {
        let handle = self.clone();
        self.run_in_loop(move || handle.timer_queue().cancel(id));
    }

    /// Requests loop shutdown. Pending tasks already queued may or may not
    /// run before the loop actually stops.
    pub fn quit(&self) {
        let shared = self.shared();
        shared.quit.store(true, Ordering::Release);
        let _ = shared.waker.wake();
    }

    /// Builds the `Send + Sync` handle that foreign threads use to reach
    /// this loop. See [`EventLoopProxy`].
    pub fn proxy(&self) -> EventLoopProxy {
        EventLoopProxy {
            shared: self.shared(),
        }
    }
}

/// A `Send + Sync` handle to submit work, schedule or cancel timers, or
/// request shutdown from a thread that does not own the loop.
///
/// [`EventLoopHandle`] cannot serve this role: it holds `Rc`-based state
/// confined to the loop's own thread, the same way [`Channel`] and
/// [`TcpConnection`](crate::net::TcpConnection) are. `EventLoopProxy` holds
/// only the `Arc`-shared part of the loop's state (the pending-task queue,
/// the waker, the quit flag, the timer sequence counter) — structurally the
/// same state `EventLoopHandle::queue_in_loop` already goes through, just
/// reachable without a thread-confined `Rc` in the way.
///
/// Deferred closures submitted this way re-acquire the full, `Rc`-based
/// [`EventLoopHandle`] via [`EventLoop::current`] once they actually run,
/// which is guaranteed to happen only on the loop's own thread (pending
/// tasks are drained exclusively from inside [`EventLoop::run`]). No `Rc`
/// ever crosses a thread boundary; only the closure's own captured data
/// does, which is why this proxy's methods require `Send` closures where
/// `EventLoopHandle`'s equivalents do not.
#[derive(Clone)]
pub struct EventLoopProxy {
    shared: Arc<SharedState>,
}

impl EventLoopProxy {
    /// Submits `f` to run on the loop's own thread. Always deferred, since a
    /// proxy is meant for callers that are not presumed to be the loop
    /// thread; woken unconditionally.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push_back(LoopTask(Box::new(f)));
        }
        if let Err(e) = self.shared.waker.wake() {
            log::warn!("wake-up write failed, loop may stall until its poll timeout: {e}");
        }
    }

    fn next_timer_id(&self) -> TimerId {
        TimerId(self.shared.next_timer_seq.fetch_add(1, Ordering::Relaxed))
    }

    /// Schedules `callback` to run once at `at`, from any thread.
    pub fn run_at(&self, at: Timestamp, mut callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.next_timer_id();
        self.queue_in_loop(move || {
            if let Some(handle) = EventLoop::current() {
                handle
                    .timer_queue()
                    .insert(id, at, None, Box::new(move || callback()));
            }
        });
        id
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Timestamp::now().add(delay), callback)
    }

    /// Schedules `callback` to run every `interval`, starting `interval`
    /// from now, from any thread.
    pub fn run_every(&self, interval: Duration, mut callback: impl FnMut() + Send + 'static) -> TimerId {
        let id = self.next_timer_id();
        let first = Timestamp::now().add(interval);
        self.queue_in_loop(move || {
            if let Some(handle) = EventLoop::current() {
                handle
                    .timer_queue()
                    .insert(id, first, Some(interval), Box::new(move || callback()));
            }
        });
        id
    }

    /// Cancels a previously scheduled timer, from any thread.
    pub fn cancel_timer(&self, id: TimerId) {
        self.queue_in_loop(move || {
            if let Some(handle) = EventLoop::current() {
                handle.timer_queue().cancel(id);
            }
        });
    }

    /// Requests loop shutdown, waking it so it observes the flag promptly.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }
}

/// The owning handle for one reactor loop. Not `Clone`: exactly one
/// `EventLoop` exists per underlying poller, so only one piece of code can
/// ever call [`EventLoop::run`] on it. Share [`EventLoopHandle`] instead.
pub struct EventLoop {
    handle: EventLoopHandle,
}

impl EventLoop {
    /// Constructs a loop with [`EventLoopConfig::default`]'s settings.
    ///
    /// Panics with [`ReactorError::DuplicateLoopInThread`] if this thread
    /// already owns an `EventLoop`; a second loop on one thread is a fatal
    /// misuse, not a recoverable condition.
    pub fn new() -> Result<EventLoop> {
        EventLoop::with_config(EventLoopConfig::default())
    }

    pub fn builder() -> EventLoopBuilder {
        EventLoopBuilder::new()
    }

    pub fn with_config(config: EventLoopConfig) -> Result<EventLoop> {
        let already_owns_one = CURRENT_LOOP.with(|cell| cell.borrow().is_some());
        if already_owns_one {
            panic!("{}", ReactorError::DuplicateLoopInThread);
        }

        ignore_sigpipe();

        let poller = Poller::new(config.events_capacity)?;
        let waker = mio::Waker::new(poller.registry(), WAKE_TOKEN)?;
        let shared = Arc::new(SharedState {
            thread_id: thread::current().id(),
            pending: Mutex::new(VecDeque::with_capacity(config.pending_capacity)),
            waker,
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            next_timer_seq: AtomicU64::new(0),
        });
        let inner = Rc::new(RefCell::new(EventLoopInner {
            shared,
            poller,
            channels: HashMap::new(),
            next_token: 0,
            looping: false,
            event_handling: false,
            config,
        }));
        let handle = EventLoopHandle {
            inner,
            timer_queue: Rc::new(RefCell::new(None)),
        };

        let timer_queue = TimerQueue::new(handle.clone())?;
        *handle.timer_queue.borrow_mut() = Some(timer_queue);

        CURRENT_LOOP.with(|cell| *cell.borrow_mut() = Some(handle.clone()));
        log::debug!("event loop created on thread {:?}", handle.shared().thread_id);
        Ok(EventLoop { handle })
    }

    /// The thread-local loop owned by the calling thread, if any.
    pub fn current() -> Option<EventLoopHandle> {
        CURRENT_LOOP.with(|cell| cell.borrow().clone())
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// The `Send + Sync` handle foreign threads use to reach this loop.
    pub fn proxy(&self) -> EventLoopProxy {
        self.handle.proxy()
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    /// Runs the reactor until [`EventLoop::quit`]/[`EventLoopHandle::quit`]
    /// is observed: poll, dispatch active channels in the order the poller
    /// returned them, then drain pending cross-thread tasks.
    pub fn run(&self) -> Result<()> {
        self.handle.assert_in_loop_thread();
        {
            let mut inner = self.handle.inner.borrow_mut();
            assert!(!inner.looping, "EventLoop::run called re-entrantly");
            inner.looping = true;
        }

        let shared = self.handle.shared();
        while !shared.quit.load(Ordering::Acquire) {
            let timeout = self.handle.inner.borrow().config.poll_timeout;
            let (now, active) = {
                let mut inner = self.handle.inner.borrow_mut();
                inner.poller.poll(timeout)?
            };

            let active_channels: Vec<_> = {
                let inner = self.handle.inner.borrow();
                active
                    .into_iter()
                    .filter(|(token, _)| *token != WAKE_TOKEN)
                    .filter_map(|(token, readiness)| {
                        inner.channels.get(&token).map(|ch| (ch.clone(), readiness))
                    })
                    .collect()
            };

            {
                let mut inner = self.handle.inner.borrow_mut();
                inner.event_handling = true;
            }
            for (channel, readiness) in active_channels {
                channel.handle_event(now, readiness);
            }
            {
                let mut inner = self.handle.inner.borrow_mut();
                inner.event_handling = false;
            }

            self.drain_pending();
        }

        {
            let mut inner = self.handle.inner.borrow_mut();
            inner.looping = false;
        }
        log::debug!("event loop stopping");
        Ok(())
    }

    fn drain_pending(&self) {
        let shared = self.handle.shared();
        let tasks: VecDeque<LoopTask> = {
            let mut pending = shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        if tasks.is_empty() {
            return;
        }
        shared.calling_pending.store(true, Ordering::Release);
        for task in tasks {
            task.run();
        }
        shared.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT_LOOP.with(|cell| {
            let owns_current = cell
                .borrow()
                .as_ref()
                .is_some_and(|current| Rc::ptr_eq(&current.inner, &self.handle.inner));
            if owns_current {
                *cell.borrow_mut() = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn a_thread_cannot_own_two_loops_at_once() {
        let first = EventLoop::new().expect("thread starts with no loop");
        let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(EventLoop::new));
        assert!(
            second.is_err(),
            "constructing a second EventLoop on the same thread must panic"
        );
        drop(first);
        // Dropping the first loop frees the thread-local slot for a new one.
        let _third = EventLoop::new().expect("slot should be free again");
    }

    #[test]
    fn builder_settings_reach_the_constructed_loop() {
        let event_loop = EventLoop::builder()
            .poll_timeout(Duration::from_millis(5))
            .events_capacity(4)
            .pending_capacity(2)
            .build()
            .expect("builder should construct a loop");
        let inner = event_loop.handle.inner.borrow();
        assert_eq!(inner.config.poll_timeout, Duration::from_millis(5));
        assert_eq!(inner.config.events_capacity, 4);
    }

    #[test]
    fn run_in_loop_executes_synchronously_on_the_owning_thread() {
        let event_loop = EventLoop::new().expect("thread starts with no loop");
        let handle = event_loop.handle();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        // No `EventLoop::run` is active; this must still execute inline
        // rather than sit in the pending queue forever.
        handle.run_in_loop(move || flag.set(true));
        assert!(ran.get());
    }

    #[test]
    fn current_resolves_to_the_thread_owning_loop() {
        assert!(EventLoop::current().is_none());
        let event_loop = EventLoop::new().expect("thread starts with no loop");
        let current = EventLoop::current().expect("this thread now owns a loop");
        assert!(Rc::ptr_eq(&current.inner, &event_loop.handle.inner));
    }
}
