//! Per-fd interest record.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

/// Readiness direction a callback is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

const IN_BIT: u8 = 0b01;
const OUT_BIT: u8 = 0b10;

/// Shared callback type for readiness events. Captured state holds `Weak`
/// back-references to its connection so the callback never keeps a closed
/// connection alive.
pub type EventCallback = std::sync::Arc<dyn Fn() + Send + Sync>;

/// Binds a file descriptor to callbacks for readable/writable readiness.
///
/// The interest mask is the source of truth; the owning event loop
/// reconciles it with the kernel when [`add_event`](crate::net::EventLoop::add_event)
/// or [`delete_event`](crate::net::EventLoop::delete_event) runs.
pub struct FdEvent {
    fd: RawFd,
    interest: AtomicU8,
    read_cb: Mutex<Option<EventCallback>>,
    write_cb: Mutex<Option<EventCallback>>,
}

impl FdEvent {
    pub fn new(fd: RawFd) -> Self {
        FdEvent {
            fd,
            interest: AtomicU8::new(0),
            read_cb: Mutex::new(None),
            write_cb: Mutex::new(None),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Put the descriptor into non-blocking mode.
    pub fn set_non_blocking(&self) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Bind `callback` to readiness in `direction`, asserting interest.
    pub fn listen(&self, direction: Direction, callback: EventCallback) {
        *self.slot(direction).lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
        self.interest.fetch_or(Self::bit(direction), Ordering::AcqRel);
    }

    /// Clear both the callback and the interest bit for `direction`.
    pub fn cancel(&self, direction: Direction) {
        *self.slot(direction).lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.interest
            .fetch_and(!Self::bit(direction), Ordering::AcqRel);
    }

    /// The callback bound to `direction`, if any.
    pub fn handler_for(&self, direction: Direction) -> Option<EventCallback> {
        self.slot(direction)
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    #[inline]
    pub fn wants_read(&self) -> bool {
        self.interest.load(Ordering::Acquire) & IN_BIT != 0
    }

    #[inline]
    pub fn wants_write(&self) -> bool {
        self.interest.load(Ordering::Acquire) & OUT_BIT != 0
    }

    /// True when no interest remains in either direction.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.interest.load(Ordering::Acquire) == 0
    }

    /// Invoke the callback bound to `direction`, if present. The callback is
    /// cloned out of the slot first so it may re-arm or cancel itself.
    pub fn trigger(&self, direction: Direction) {
        if let Some(cb) = self.handler_for(direction) {
            cb();
        }
    }

    fn slot(&self, direction: Direction) -> &Mutex<Option<EventCallback>> {
        match direction {
            Direction::Read => &self.read_cb,
            Direction::Write => &self.write_cb,
        }
    }

    fn bit(direction: Direction) -> u8 {
        match direction {
            Direction::Read => IN_BIT,
            Direction::Write => OUT_BIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn listen_asserts_interest() {
        let ev = FdEvent::new(0);
        assert!(ev.is_idle());
        ev.listen(Direction::Read, Arc::new(|| {}));
        assert!(ev.wants_read());
        assert!(!ev.wants_write());
        ev.listen(Direction::Write, Arc::new(|| {}));
        assert!(ev.wants_write());
    }

    #[test]
    fn cancel_clears_callback_and_interest() {
        let ev = FdEvent::new(0);
        ev.listen(Direction::Write, Arc::new(|| {}));
        ev.cancel(Direction::Write);
        assert!(!ev.wants_write());
        assert!(ev.handler_for(Direction::Write).is_none());
        assert!(ev.is_idle());
    }

    #[test]
    fn trigger_runs_bound_callback() {
        let ev = FdEvent::new(0);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        ev.listen(
            Direction::Read,
            Arc::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );
        ev.trigger(Direction::Read);
        ev.trigger(Direction::Write); // no write callback bound
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
