//! Single-threaded reactor.
//!
//! Each worker thread owns one `EventLoop`. All fd-registry and timer-heap
//! mutations happen on the owning thread; other threads interact through a
//! [`LoopHandle`], which enqueues a task on the loop's queue and wakes the
//! poll. The loop services I/O, the task queue, and due timers every
//! iteration, so tasks and timers make progress even under sustained I/O.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::{debug, error};

use crate::error::Error;
use crate::metrics::TIMERS_FIRED;
use crate::net::fd_event::{Direction, FdEvent};
use crate::net::timer::{Timer, TimerHeap};

/// A closure posted to run on the loop thread.
pub type LoopTask = Box<dyn FnOnce(&EventLoop) + Send>;

const WAKER_TOKEN: Token = Token(0);
// fd tokens are offset by one so fd 0 cannot collide with the waker
const TOKEN_OFFSET: usize = 1;

/// Upper bound on one poll wait, so the loop revisits its task queue and
/// timers at a steady cadence even when idle.
const POLL_BUDGET: Duration = Duration::from_millis(10);

thread_local! {
    static CURRENT: RefCell<Option<Rc<EventLoop>>> = const { RefCell::new(None) };
}

struct FdEntry {
    event: Arc<FdEvent>,
    registered: bool,
}

/// Single-thread reactor: waits on the readiness multiplexer, invokes fd
/// callbacks, drains cross-thread tasks, and fires due timers.
pub struct EventLoop {
    thread_id: ThreadId,
    poll: RefCell<Poll>,
    registry: Registry,
    waker: Arc<Waker>,
    fd_events: RefCell<HashMap<RawFd, FdEntry>>,
    timers: RefCell<TimerHeap>,
    task_tx: Sender<LoopTask>,
    task_rx: Receiver<LoopTask>,
    stop_flag: Arc<AtomicBool>,
    running: Cell<bool>,
}

impl EventLoop {
    fn new() -> Result<Self, Error> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (task_tx, task_rx) = crossbeam_channel::unbounded();
        Ok(EventLoop {
            thread_id: thread::current().id(),
            poll: RefCell::new(poll),
            registry,
            waker,
            fd_events: RefCell::new(HashMap::new()),
            timers: RefCell::new(TimerHeap::new()),
            task_tx,
            task_rx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            running: Cell::new(false),
        })
    }

    /// The loop bound to the calling thread, created on first use.
    pub fn current() -> Result<Rc<EventLoop>, Error> {
        CURRENT.with(|cell| {
            if let Some(el) = cell.borrow().as_ref() {
                return Ok(el.clone());
            }
            let el = Rc::new(EventLoop::new()?);
            *cell.borrow_mut() = Some(el.clone());
            Ok(el)
        })
    }

    /// A cloneable, Send handle for cross-thread operations on this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            task_tx: self.task_tx.clone(),
            waker: self.waker.clone(),
            thread_id: self.thread_id,
            stop_flag: self.stop_flag.clone(),
        }
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// Reconcile kernel interest with the fd-event's mask. From a foreign
    /// thread the operation is enqueued on the loop's task queue.
    pub fn add_event(&self, fd_event: &Arc<FdEvent>) {
        if !self.is_in_loop_thread() {
            let fd_event = fd_event.clone();
            self.handle().post(move |el| el.add_event(&fd_event));
            return;
        }
        let fd = fd_event.fd();
        let interest = interest_of(fd_event);
        let mut map = self.fd_events.borrow_mut();
        let entry = map.entry(fd).or_insert_with(|| FdEntry {
            event: fd_event.clone(),
            registered: false,
        });
        entry.event = fd_event.clone();
        let result = match (entry.registered, interest) {
            (false, Some(i)) => {
                let r = self
                    .registry
                    .register(&mut SourceFd(&fd), Token(fd as usize + TOKEN_OFFSET), i);
                if r.is_ok() {
                    entry.registered = true;
                }
                r
            }
            (true, Some(i)) => {
                self.registry
                    .reregister(&mut SourceFd(&fd), Token(fd as usize + TOKEN_OFFSET), i)
            }
            (true, None) => {
                entry.registered = false;
                self.registry.deregister(&mut SourceFd(&fd))
            }
            (false, None) => Ok(()),
        };
        if let Err(e) = result {
            error!(fd, error = %e, "failed to reconcile poll interest");
        }
    }

    /// Remove the fd-event from the registry and the kernel. Same
    /// thread-affinity rule as [`add_event`](Self::add_event).
    pub fn delete_event(&self, fd_event: &Arc<FdEvent>) {
        if !self.is_in_loop_thread() {
            let fd_event = fd_event.clone();
            self.handle().post(move |el| el.delete_event(&fd_event));
            return;
        }
        let fd = fd_event.fd();
        if let Some(entry) = self.fd_events.borrow_mut().remove(&fd) {
            if entry.registered {
                if let Err(e) = self.registry.deregister(&mut SourceFd(&fd)) {
                    debug!(fd, error = %e, "deregister failed");
                }
            }
        }
    }

    /// Add a timer. Same thread-affinity rule as [`add_event`](Self::add_event).
    pub fn add_timer(&self, timer: Arc<Timer>) {
        if !self.is_in_loop_thread() {
            self.handle().post(move |el| el.add_timer(timer));
            return;
        }
        self.timers.borrow_mut().add(timer);
    }

    /// Enqueue a closure to run on the loop thread and wake the loop.
    pub fn post(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        self.handle().post(task);
    }

    /// Run until [`stop`](Self::stop) is called.
    pub fn run(&self) {
        debug_assert!(self.is_in_loop_thread());
        self.running.set(true);
        let mut events = Events::with_capacity(1024);
        let mut ready: Vec<(RawFd, bool, bool)> = Vec::new();

        while !self.stop_flag.load(Ordering::Acquire) {
            let timeout = self.poll_timeout();
            {
                let mut poll = self.poll.borrow_mut();
                if let Err(e) = poll.poll(&mut events, Some(timeout)) {
                    if e.kind() != io::ErrorKind::Interrupted {
                        error!(error = %e, "poll failed");
                    }
                }
            }

            ready.clear();
            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }
                let fd = (event.token().0 - TOKEN_OFFSET) as RawFd;
                // error conditions (e.g. a refused connect) surface through
                // whichever callback is armed; the I/O call reports the error
                let is_error = event.is_error();
                ready.push((
                    fd,
                    event.is_readable() || event.is_read_closed() || is_error,
                    event.is_writable() || event.is_write_closed() || is_error,
                ));
            }

            for (fd, readable, writable) in ready.drain(..) {
                let fd_event = self.fd_events.borrow().get(&fd).map(|e| e.event.clone());
                let Some(fd_event) = fd_event else { continue };
                if readable && fd_event.wants_read() {
                    fd_event.trigger(Direction::Read);
                }
                if writable && fd_event.wants_write() {
                    fd_event.trigger(Direction::Write);
                }
            }

            self.drain_tasks();
            self.fire_timers();
        }
        self.running.set(false);
    }

    /// Request the loop to stop; asynchronous, wakes the poll.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "wake on stop failed");
        }
    }

    fn poll_timeout(&self) -> Duration {
        match self.timers.borrow().earliest_deadline() {
            Some(deadline) => {
                let now = Instant::now();
                if deadline <= now {
                    Duration::ZERO
                } else {
                    POLL_BUDGET.min(deadline - now)
                }
            }
            None => POLL_BUDGET,
        }
    }

    fn drain_tasks(&self) {
        // bounded to the backlog present at entry so a task that posts more
        // tasks cannot starve I/O or timers
        for _ in 0..self.task_rx.len() {
            match self.task_rx.try_recv() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
    }

    fn fire_timers(&self) {
        let due = self.timers.borrow_mut().fire_due(Instant::now());
        for timer in due {
            TIMERS_FIRED.increment();
            timer.run();
        }
    }
}

fn interest_of(fd_event: &FdEvent) -> Option<Interest> {
    match (fd_event.wants_read(), fd_event.wants_write()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Send + Clone handle to an [`EventLoop`] owned by another thread.
#[derive(Clone)]
pub struct LoopHandle {
    task_tx: Sender<LoopTask>,
    waker: Arc<Waker>,
    thread_id: ThreadId,
    stop_flag: Arc<AtomicBool>,
}

impl LoopHandle {
    /// Enqueue `task` on the loop thread and wake the loop.
    pub fn post(&self, task: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.task_tx.send(Box::new(task)).is_err() {
            debug!("posting to a dropped event loop");
            return;
        }
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "wake failed");
        }
    }

    /// True when the calling thread owns the loop behind this handle.
    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Request the loop to stop.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            debug!(error = %e, "wake on stop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn posted_task_runs_on_loop_thread() {
        let el = EventLoop::current().unwrap();
        let handle = el.handle();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();

        let poster = thread::spawn(move || {
            handle.post(move |el| {
                *seen2.lock().unwrap() = Some(thread::current().id());
                el.stop();
            });
        });
        el.run();
        poster.join().unwrap();

        assert_eq!(seen.lock().unwrap().take(), Some(thread::current().id()));
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let el = EventLoop::current().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let stop = el.handle();
        el.add_timer(Timer::once(
            Duration::from_millis(30),
            Arc::new(move || {
                o.lock().unwrap().push("late");
                stop.stop();
            }),
        ));
        let o = order.clone();
        el.add_timer(Timer::once(
            Duration::from_millis(5),
            Arc::new(move || o.lock().unwrap().push("early")),
        ));

        el.run();
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }

    #[test]
    fn repeating_timer_resists_drift() {
        let el = EventLoop::current().unwrap();
        let interval = Duration::from_millis(10);
        let start = Instant::now();
        let fires = Arc::new(Mutex::new(Vec::new()));

        let f = fires.clone();
        let stop = el.handle();
        el.add_timer(Timer::repeating(
            interval,
            Arc::new(move || {
                let mut f = f.lock().unwrap();
                f.push(Instant::now());
                if f.len() == 5 {
                    stop.stop();
                }
            }),
        ));

        el.run();
        let fires = fires.lock().unwrap();
        assert_eq!(fires.len(), 5);
        for (n, at) in fires.iter().enumerate() {
            let expected = start + interval * (n as u32 + 1);
            let skew = if *at > expected {
                *at - expected
            } else {
                expected - *at
            };
            assert!(
                skew < Duration::from_millis(75),
                "fire {n} skewed by {skew:?}"
            );
        }
    }

    #[test]
    fn cross_thread_add_timer_goes_through_queue() {
        let el = EventLoop::current().unwrap();
        let handle = el.handle();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let stop = el.handle();

        thread::spawn(move || {
            handle.post(move |el| {
                el.add_timer(Timer::once(
                    Duration::from_millis(5),
                    Arc::new(move || {
                        f.store(true, Ordering::SeqCst);
                        stop.stop();
                    }),
                ));
            });
        });

        el.run();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_is_sticky_before_run() {
        let el = EventLoop::current().unwrap();
        el.stop();
        el.run(); // returns immediately
        assert!(!el.is_running());
    }
}
