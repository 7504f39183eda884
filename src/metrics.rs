//! Runtime metrics.

use metriken::{metric, Counter, Gauge};

#[metric(
    name = "connections_accepted",
    description = "Total number of connections accepted"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Number of currently active connections"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "requests_dispatched",
    description = "Total RPC requests handed to a service method"
)]
pub static REQUESTS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "dispatch_errors",
    description = "Total requests answered with a framework error reply"
)]
pub static DISPATCH_ERRORS: Counter = Counter::new();

#[metric(
    name = "frame_errors",
    description = "Total malformed frames dropped by the decoder"
)]
pub static FRAME_ERRORS: Counter = Counter::new();

#[metric(
    name = "messages_sent",
    description = "Total RPC messages encoded into an out-buffer"
)]
pub static MESSAGES_SENT: Counter = Counter::new();

#[metric(name = "timers_fired", description = "Total timer callbacks run")]
pub static TIMERS_FIRED: Counter = Counter::new();
