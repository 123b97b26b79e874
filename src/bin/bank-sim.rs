//! Single-teller bank branch on the virtual clock.
//!
//! Customers arrive at random intervals (each arrival schedules the
//! next); a cyclic teller event serves one waiting customer per tick.
//! Run with `RUST_LOG=info` to watch the day unfold.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quartz::{action, Clock, Timing};
use rand::Rng;

const OPENING_HOURS: f64 = 480.0; // minutes

#[derive(Default)]
struct Branch {
    /// Arrival times of customers still in line.
    waiting: VecDeque<f64>,
    served: u32,
    total_wait: f64,
}

fn schedule_arrival(clock: &Clock, branch: Arc<Mutex<Branch>>) {
    let delay = rand::thread_rng().gen_range(0.5..2.5);
    let next = branch.clone();
    clock
        .event(
            Timing::After(delay),
            None,
            action(move |clk| {
                let now = clk.now().unwrap_or_default();
                next.lock().unwrap().waiting.push_back(now);
                log::info!("t={now:.2}: customer arrives");
                schedule_arrival(clk, next.clone());
            }),
        )
        .expect("Failed to schedule arrival");
}

fn main() {
    env_logger::init();

    let branch = Arc::new(Mutex::new(Branch::default()));
    let clock = Clock::create(0.0);

    schedule_arrival(&clock, branch.clone());

    let teller = branch.clone();
    clock
        .event(
            Timing::After(1.0),
            Some(1.0),
            action(move |clk| {
                let now = clk.now().unwrap_or_default();
                let mut branch = teller.lock().unwrap();
                if let Some(arrived) = branch.waiting.pop_front() {
                    branch.served += 1;
                    branch.total_wait += now - arrived;
                    log::info!("t={now:.2}: teller serves (waited {:.2})", now - arrived);
                }
            }),
        )
        .expect("Failed to schedule teller");

    let report = clock
        .run_timeout(OPENING_HOURS, Duration::from_secs(60))
        .expect("Simulation failed");

    let branch = branch.lock().unwrap();
    let avg = if branch.served > 0 {
        branch.total_wait / branch.served as f64
    } else {
        0.0
    };
    println!(
        "closing at t={:.0}: {} events, {} served, {} still in line, avg wait {avg:.2}",
        report.time,
        report.events,
        branch.served,
        branch.waiting.len(),
    );
    clock.shutdown();
}
