//! Quartz: a virtual-time discrete-event simulation core.
//!
//! Two pieces: an indexed priority event queue ([`EventQueue`]) and a
//! threaded controller ([`Clock`]) that owns one.  The clock advances
//! virtual time by extracting due batches and executing their actions
//! in parallel, while its control loop stays responsive to concurrent
//! scheduling and queries.
//!
//! ```
//! use quartz::{action, Clock, Timing};
//!
//! let clock = Clock::create(0.0);
//! clock.event(Timing::After(1.0), None, action(|_| {})).unwrap();
//! let report = clock.run(5.0).unwrap();
//! assert_eq!(report.events, 1);
//! assert_eq!(report.time, 5.0);
//! clock.shutdown();
//! ```

pub mod clock;
pub mod queue;

pub use clock::{
    Clock, ClockError, ClockReply, ClockSnapshot, ClockState, Pending, Query, RunReport, Timing,
    DEFAULT_TIMEOUT, EMPTY_TIME, RUN_TIMEOUT,
};
pub use queue::{action, Action, Event, EventId, EventQueue, Update, RESOLUTION};
