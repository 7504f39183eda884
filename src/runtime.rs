//! Per-thread run-time context.
//!
//! The dispatcher records the in-progress (msg-id, method-name) pair here
//! before invoking a handler, so downstream diagnostics on the worker thread
//! can annotate their output without threading the pair through every call.

use std::cell::RefCell;

#[derive(Debug, Clone, Default)]
pub struct RunTime {
    pub msg_id: String,
    pub method_name: String,
}

thread_local! {
    static RUN_TIME: RefCell<RunTime> = RefCell::new(RunTime::default());
}

/// Record the request currently being dispatched on this thread.
pub fn set_current(msg_id: &str, method_name: &str) {
    RUN_TIME.with(|rt| {
        let mut rt = rt.borrow_mut();
        rt.msg_id = msg_id.to_string();
        rt.method_name = method_name.to_string();
    });
}

/// Snapshot of this thread's in-progress request context.
pub fn current() -> RunTime {
    RUN_TIME.with(|rt| rt.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_per_thread() {
        set_current("9", "Echo.say");
        let handle = std::thread::spawn(|| {
            assert_eq!(current().msg_id, "");
            set_current("7", "Other.run");
            assert_eq!(current().method_name, "Other.run");
        });
        handle.join().unwrap();
        assert_eq!(current().msg_id, "9");
        assert_eq!(current().method_name, "Echo.say");
    }
}
