// Virtual-time clock engine. Runs in its own thread, communicates
// with clients via crossbeam channels. Each due batch executes on a
// spawned worker so the control loop stays responsive to scheduling
// and queries while a simulation step is in flight.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, RecvTimeoutError, Sender};
use thiserror::Error;

use crate::queue::{Action, EventId, EventQueue, Update};

// ─────────────────────────────────────────────────────────────────────────────
//  Public message types
// ─────────────────────────────────────────────────────────────────────────────

/// Default deadline for request-reply cycles.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for `run`, which covers many batches.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(10);

/// Time reported by `step` when the queue has nothing scheduled.  The
/// clock's own time is never moved to this sentinel.
pub const EMPTY_TIME: f64 = -9999.0;

/// When an event should fire.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Timing {
    /// Absolute virtual time.
    At(f64),
    /// Relative to the clock's current time.
    After(f64),
}

/// What to ask the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Now,
    Events,
    State,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    /// Transient: a stop was requested and takes effect at the next
    /// batch boundary.
    Stopped,
}

/// Answer to a state query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSnapshot {
    pub state: ClockState,
    /// Events executed in the current (or last) step/run.
    pub evcount: usize,
    /// End-of-run boundary of the current (or last) run.
    pub tend: f64,
}

/// Outcome of a step, run, or stop: how many events executed and where
/// virtual time ended up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    pub events: usize,
    pub time: f64,
}

/// Replies sent from the clock thread back to clients.
#[derive(Debug, Clone)]
pub enum ClockReply {
    /// Event scheduled or updated.
    Scheduled(EventId),
    Time(f64),
    /// Read-only snapshot of the event queue.
    Events(EventQueue),
    State(ClockSnapshot),
    Stepped(RunReport),
    Done(RunReport),
    Stopped(RunReport),
    Ok,
    Failed(ClockError),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClockError {
    /// The caller gave up waiting; the clock may still complete the work.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// Command refused in the current state; state and queue unchanged.
    #[error("{0}")]
    BadState(&'static str),
    /// Rejected at the API boundary, before any message was sent.
    #[error("bad argument: {0}")]
    BadArgument(String),
    /// The clock thread is gone, or it abandoned this request.
    #[error("clock disconnected")]
    Disconnected,
}

/// Commands sent from clients → clock thread.
enum ClockCmd {
    Schedule {
        timing: Timing,
        cycle: Option<f64>,
        action: Action,
        reply: Sender<ClockReply>,
    },
    Update {
        id: EventId,
        change: Update,
        reply: Sender<ClockReply>,
    },
    Cancel {
        ids: Vec<EventId>,
        reply: Sender<ClockReply>,
    },
    Query {
        query: Query,
        reply: Sender<ClockReply>,
    },
    Step {
        reply: Sender<ClockReply>,
    },
    Run {
        dt: f64,
        reply: Sender<ClockReply>,
    },
    Stop {
        reply: Sender<ClockReply>,
    },
    Reset {
        t0: f64,
        reply: Sender<ClockReply>,
    },
    Quit,
}

// ─────────────────────────────────────────────────────────────────────────────
//  Client handle
// ─────────────────────────────────────────────────────────────────────────────

/// An outstanding request.  Join it with [`Pending::wait`]; dropping it
/// abandons the reply (the clock keeps going either way).
pub struct Pending {
    rx: Receiver<ClockReply>,
}

impl Pending {
    pub fn wait(&self, timeout: Duration) -> Result<ClockReply, ClockError> {
        match self.rx.recv_timeout(timeout) {
            Ok(ClockReply::Failed(e)) => Err(e),
            Ok(reply) => Ok(reply),
            Err(RecvTimeoutError::Timeout) => Err(ClockError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(ClockError::Disconnected),
        }
    }
}

/// Handle to a clock thread.  Cheap to clone; all clones address the
/// same clock.  Actions receive one of these during execution, so they
/// can schedule further events and query virtual time mid-batch.
#[derive(Clone)]
pub struct Clock {
    tx: Sender<ClockCmd>,
}

impl Clock {
    /// Spawn a clock thread with virtual time `t0` and an empty queue.
    /// The thread lives until [`Clock::shutdown`] (or an action panic,
    /// which compromises the clock and tears it down).
    pub fn create(t0: f64) -> Clock {
        let (cmd_tx, cmd_rx) = bounded::<ClockCmd>(64);
        let (done_tx, done_rx) = bounded::<BatchDone>(4);
        let handle = Clock { tx: cmd_tx };
        let worker_handle = handle.clone();
        thread::Builder::new()
            .name("virtual-clock".into())
            .spawn(move || clock_loop(t0, cmd_rx, done_rx, done_tx, worker_handle))
            .expect("Failed to spawn clock thread");
        handle
    }

    fn ask(&self, make: impl FnOnce(Sender<ClockReply>) -> ClockCmd) -> Result<Pending, ClockError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(make(reply_tx))
            .map_err(|_| ClockError::Disconnected)?;
        Ok(Pending { rx: reply_rx })
    }

    // ── Scheduling ─────────────────────────────────────────────

    /// Schedule an event, returning its id.  `cycle`, when given, must
    /// be positive: the event then re-fires every `cycle` time units
    /// until cancelled.
    pub fn event(
        &self,
        timing: Timing,
        cycle: Option<f64>,
        action: Action,
    ) -> Result<EventId, ClockError> {
        if let Some(c) = cycle {
            if !(c > 0.0) {
                return Err(ClockError::BadArgument(format!(
                    "cycle must be positive, got {c}"
                )));
            }
        }
        let pending = self.ask(|reply| ClockCmd::Schedule {
            timing,
            cycle,
            action,
            reply,
        })?;
        match pending.wait(DEFAULT_TIMEOUT)? {
            ClockReply::Scheduled(id) => Ok(id),
            other => unreachable!("schedule reply: {other:?}"),
        }
    }

    /// Mutate a pending event (unknown ids are a silent no-op, echoing
    /// the id back either way).
    pub fn update(&self, id: EventId, change: Update) -> Result<EventId, ClockError> {
        if let Update::Cycle(c) = &change {
            if !(*c > 0.0) {
                return Err(ClockError::BadArgument(format!(
                    "cycle must be positive, got {c}"
                )));
            }
        }
        let pending = self.ask(|reply| ClockCmd::Update { id, change, reply })?;
        match pending.wait(DEFAULT_TIMEOUT)? {
            ClockReply::Scheduled(id) => Ok(id),
            other => unreachable!("update reply: {other:?}"),
        }
    }

    /// Drop pending events.  Cancelled ids may linger in the time index
    /// but their actions will not execute.
    pub fn cancel(&self, ids: &[EventId]) -> Result<(), ClockError> {
        let pending = self.ask(|reply| ClockCmd::Cancel {
            ids: ids.to_vec(),
            reply,
        })?;
        match pending.wait(DEFAULT_TIMEOUT)? {
            ClockReply::Ok => Ok(()),
            other => unreachable!("cancel reply: {other:?}"),
        }
    }

    // ── Control ────────────────────────────────────────────────

    /// Execute the next due batch.  The clock stays idle; the report
    /// carries the batch size and its time.  With nothing scheduled the
    /// report is `{events: 0, time: EMPTY_TIME}`.
    pub fn step(&self) -> Result<RunReport, ClockError> {
        self.step_timeout(DEFAULT_TIMEOUT)
    }

    pub fn step_timeout(&self, timeout: Duration) -> Result<RunReport, ClockError> {
        match self.ask(|reply| ClockCmd::Step { reply })?.wait(timeout)? {
            ClockReply::Stepped(report) => Ok(report),
            other => unreachable!("step reply: {other:?}"),
        }
    }

    /// Drive batches until virtual time reaches `now + dt` or the queue
    /// drains.  The reported time is never below the requested horizon.
    pub fn run(&self, dt: f64) -> Result<RunReport, ClockError> {
        self.run_timeout(dt, RUN_TIMEOUT)
    }

    /// Like [`Clock::run`] with an explicit reply deadline.  Returns
    /// `Disconnected` if a concurrent `stop` superseded the run.
    pub fn run_timeout(&self, dt: f64, timeout: Duration) -> Result<RunReport, ClockError> {
        match self.start_run(dt)?.wait(timeout)? {
            ClockReply::Done(report) => Ok(report),
            other => unreachable!("run reply: {other:?}"),
        }
    }

    /// Begin a run without waiting for it, so the caller can keep
    /// scheduling, query, or stop it from the same thread.
    pub fn start_run(&self, dt: f64) -> Result<Pending, ClockError> {
        self.ask(|reply| ClockCmd::Run { dt, reply })
    }

    /// Request a graceful stop of the current run.  Takes effect at the
    /// next batch boundary; in-flight actions are never preempted.
    pub fn stop(&self) -> Result<RunReport, ClockError> {
        match self
            .ask(|reply| ClockCmd::Stop { reply })?
            .wait(DEFAULT_TIMEOUT)?
        {
            ClockReply::Stopped(report) => Ok(report),
            other => unreachable!("stop reply: {other:?}"),
        }
    }

    /// Wipe the clock back to an empty queue at time `t0`.
    pub fn reset(&self, t0: f64) -> Result<(), ClockError> {
        match self
            .ask(|reply| ClockCmd::Reset { t0, reply })?
            .wait(DEFAULT_TIMEOUT)?
        {
            ClockReply::Ok => Ok(()),
            other => unreachable!("reset reply: {other:?}"),
        }
    }

    /// Terminate the clock thread.  Pending and later requests observe
    /// `Disconnected`.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ClockCmd::Quit);
    }

    // ── Introspection ──────────────────────────────────────────

    pub fn query(&self, query: Query, timeout: Duration) -> Result<ClockReply, ClockError> {
        self.ask(|reply| ClockCmd::Query { query, reply })?.wait(timeout)
    }

    /// Current virtual time.
    pub fn now(&self) -> Result<f64, ClockError> {
        match self.query(Query::Now, DEFAULT_TIMEOUT)? {
            ClockReply::Time(t) => Ok(t),
            other => unreachable!("now reply: {other:?}"),
        }
    }

    /// Read-only copy of the pending event set.
    pub fn events(&self) -> Result<EventQueue, ClockError> {
        match self.query(Query::Events, DEFAULT_TIMEOUT)? {
            ClockReply::Events(eq) => Ok(eq),
            other => unreachable!("events reply: {other:?}"),
        }
    }

    pub fn snapshot(&self) -> Result<ClockSnapshot, ClockError> {
        match self.query(Query::State, DEFAULT_TIMEOUT)? {
            ClockReply::State(snap) => Ok(snap),
            other => unreachable!("state reply: {other:?}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Clock thread
// ─────────────────────────────────────────────────────────────────────────────

/// Completion signal from a batch worker back to the clock loop.
struct BatchDone {
    panicked: bool,
}

/// Sends the completion signal even when an action panics and unwinds
/// the worker; the panic flag then tears the clock down.
struct DoneGuard {
    done: Sender<BatchDone>,
    clean: bool,
}

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.done.send(BatchDone {
            panicked: !self.clean,
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Step,
    Run,
}

struct Core {
    t: f64,
    eq: EventQueue,
    state: ClockState,
    evcount: usize,
    tend: f64,
    /// Reply channel of the last control command; receives the
    /// completion reply.  A `stop` replaces a run's channel, so the
    /// superseded runner observes disconnection.
    client: Option<Sender<ClockReply>>,
    mode: Mode,
    /// A batch worker is in flight.
    busy: bool,
    handle: Clock,
    done_tx: Sender<BatchDone>,
}

fn clock_loop(
    t0: f64,
    cmd_rx: Receiver<ClockCmd>,
    done_rx: Receiver<BatchDone>,
    done_tx: Sender<BatchDone>,
    handle: Clock,
) {
    let mut core = Core {
        t: t0,
        eq: EventQueue::new(),
        state: ClockState::Idle,
        evcount: 0,
        tend: t0,
        client: None,
        mode: Mode::Step,
        busy: false,
        handle,
        done_tx,
    };
    log::debug!("clock up at t={t0}");

    loop {
        select! {
            recv(cmd_rx) -> msg => match msg {
                Ok(ClockCmd::Quit) | Err(_) => break,
                Ok(cmd) => core.handle_cmd(cmd),
            },
            recv(done_rx) -> msg => match msg {
                Ok(done) => {
                    if !core.on_batch_done(done) {
                        return;
                    }
                }
                Err(_) => break,
            },
        }
    }
    log::debug!("clock thread exiting at t={}", core.t);
}

impl Core {
    fn handle_cmd(&mut self, cmd: ClockCmd) {
        match cmd {
            ClockCmd::Schedule {
                timing,
                cycle,
                action,
                reply,
            } => {
                let t = match timing {
                    Timing::At(t) => t,
                    Timing::After(dt) => self.t + dt,
                };
                let id = self.eq.add(action, t, cycle);
                log::trace!("event {id} scheduled at t={t}");
                self.reply(&reply, ClockReply::Scheduled(id));
            }
            ClockCmd::Update { id, change, reply } => {
                self.eq.update(id, change);
                self.reply(&reply, ClockReply::Scheduled(id));
            }
            ClockCmd::Cancel { ids, reply } => {
                self.eq.delete(&ids);
                self.reply(&reply, ClockReply::Ok);
            }
            ClockCmd::Query { query, reply } => {
                let answer = match query {
                    Query::Now => ClockReply::Time(self.t),
                    Query::Events => ClockReply::Events(self.eq.clone()),
                    Query::State => ClockReply::State(self.snapshot()),
                };
                self.reply(&reply, answer);
            }
            ClockCmd::Step { reply } => self.on_step(reply),
            ClockCmd::Run { dt, reply } => self.on_run(dt, reply),
            ClockCmd::Stop { reply } => self.on_stop(reply),
            ClockCmd::Reset { t0, reply } => self.on_reset(t0, reply),
            ClockCmd::Quit => {} // drained by the loop
        }
    }

    fn on_step(&mut self, reply: Sender<ClockReply>) {
        if self.state != ClockState::Idle {
            return self.refuse(reply, "step: clock is not idle");
        }
        if self.busy {
            return self.refuse(reply, "step: a batch is still executing");
        }
        if self.eq.next_time().is_none() {
            let report = RunReport {
                events: 0,
                time: EMPTY_TIME,
            };
            return self.reply(&reply, ClockReply::Stepped(report));
        }
        self.evcount = 0;
        self.mode = Mode::Step;
        self.client = Some(reply);
        self.advance();
    }

    fn on_run(&mut self, dt: f64, reply: Sender<ClockReply>) {
        if self.state != ClockState::Idle {
            return self.refuse(reply, "run: clock is not idle");
        }
        if self.busy {
            return self.refuse(reply, "run: a batch is still executing");
        }
        self.tend = self.t + dt;
        self.evcount = 0;
        self.mode = Mode::Run;
        if self.eq.next_time().is_none() {
            // nothing scheduled: the run is over before it starts, but
            // time still advances to the requested horizon
            self.t = self.t.max(self.tend);
            let report = RunReport {
                events: 0,
                time: self.t,
            };
            return self.reply(&reply, ClockReply::Done(report));
        }
        self.state = ClockState::Running;
        self.client = Some(reply);
        self.advance();
    }

    fn on_stop(&mut self, reply: Sender<ClockReply>) {
        if self.state != ClockState::Running {
            return self.refuse(reply, "stop: clock is not running");
        }
        self.state = ClockState::Stopped;
        self.client = Some(reply);
    }

    fn on_reset(&mut self, t0: f64, reply: Sender<ClockReply>) {
        if self.state != ClockState::Idle || self.busy {
            return self.refuse(reply, "reset: clock is busy");
        }
        self.t = t0;
        self.eq = EventQueue::new();
        self.evcount = 0;
        self.tend = t0;
        log::debug!("clock reset to t={t0}");
        self.reply(&reply, ClockReply::Ok);
    }

    /// Decide what a finished batch means: reply to a step, honour a
    /// pending stop, finish or continue a run.
    ///
    /// Returns `false` when the clock must die (an action panicked).
    fn on_batch_done(&mut self, done: BatchDone) -> bool {
        self.busy = false;
        if done.panicked {
            log::error!("action panicked at t={}; clock is compromised", self.t);
            return false;
        }
        match self.mode {
            Mode::Step => {
                let report = RunReport {
                    events: self.evcount,
                    time: self.t,
                };
                self.finish(ClockReply::Stepped(report));
            }
            Mode::Run => {
                if self.state == ClockState::Stopped {
                    self.state = ClockState::Idle;
                    let report = RunReport {
                        events: self.evcount,
                        time: self.t,
                    };
                    self.finish(ClockReply::Stopped(report));
                } else if self.t >= self.tend || self.eq.next_time().is_none() {
                    // horizon reached or queue drained; report never
                    // falls short of the requested end time
                    self.t = self.t.max(self.tend);
                    self.state = ClockState::Idle;
                    let report = RunReport {
                        events: self.evcount,
                        time: self.t,
                    };
                    self.finish(ClockReply::Done(report));
                } else {
                    self.advance();
                }
            }
        }
        true
    }

    /// Pop the next batch, move time to it, and hand it to a worker.
    /// Callers ensure the time index is non-empty.
    fn advance(&mut self) {
        if let Some((t_due, actions)) = self.eq.next() {
            self.t = t_due;
            self.evcount += actions.len();
            self.dispatch(actions);
        }
    }

    fn dispatch(&mut self, actions: Vec<Action>) {
        self.busy = true;
        log::trace!("batch of {} at t={}", actions.len(), self.t);
        if actions.is_empty() {
            // every event in this bucket had been cancelled; complete
            // immediately without a worker
            let _ = self.done_tx.send(BatchDone { panicked: false });
            return;
        }
        let handle = self.handle.clone();
        let done = self.done_tx.clone();
        thread::Builder::new()
            .name("clock-batch".into())
            .spawn(move || {
                let mut guard = DoneGuard { done, clean: false };
                if actions.len() == 1 {
                    let f = actions[0].as_ref();
                    f(&handle);
                } else {
                    // simultaneous events start in insertion order and
                    // run in parallel; the scope joins them all
                    thread::scope(|scope| {
                        for act in &actions {
                            let handle = &handle;
                            scope.spawn(move || {
                                let f = act.as_ref();
                                f(handle);
                            });
                        }
                    });
                }
                guard.clean = true;
            })
            .expect("Failed to spawn clock batch worker");
    }

    fn snapshot(&self) -> ClockSnapshot {
        ClockSnapshot {
            state: self.state,
            evcount: self.evcount,
            tend: self.tend,
        }
    }

    fn reply(&self, to: &Sender<ClockReply>, reply: ClockReply) {
        // the caller may have timed out and dropped its receiver
        let _ = to.try_send(reply);
    }

    fn finish(&mut self, reply: ClockReply) {
        if let Some(client) = self.client.take() {
            let _ = client.try_send(reply);
        }
    }

    fn refuse(&self, reply: Sender<ClockReply>, why: &'static str) {
        log::warn!("{why} (state {:?})", self.state);
        let _ = reply.try_send(ClockReply::Failed(ClockError::BadState(why)));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────────────────────
