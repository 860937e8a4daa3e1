//! The operational-data broker: parks a read that needs provider-served
//! state data, fans provider requests out, and resumes the request when all
//! answers arrive or the wait deadline fires. The deadline is a message like
//! any other; the session only transitions under its own mutex.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::dispatch::RequestEnvelope;
use crate::engine::Engine;
use crate::session::SessionId;

/// A read parked while providers answer. Held inside the session under its
/// mutex; the broker only ever addresses it through the engine.
#[derive(Debug)]
pub struct PendingRead {
    pub envelope: RequestEnvelope,
    pub request_id: u64,
    pub remaining: usize,
    pub deadline: Instant,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Instant,
    session: u32,
    request_id: u64,
}

struct BrokerShared {
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    wake: Condvar,
    stop: AtomicBool,
    engine: Weak<Engine>,
}

/// Owns the wait-deadline timer thread and the provider request ids.
pub struct OperationalBroker {
    shared: Arc<BrokerShared>,
    next_request_id: AtomicU64,
    timer: Mutex<Option<thread::JoinHandle<()>>>,
}

impl OperationalBroker {
    pub fn start(engine: &Arc<Engine>) -> Self {
        let shared = Arc::new(BrokerShared {
            timers: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            stop: AtomicBool::new(false),
            engine: Arc::downgrade(engine),
        });
        let timer_shared = shared.clone();
        let timer = thread::Builder::new()
            .name("constor-provider-timer".into())
            .spawn(move || timer_loop(timer_shared))
            .expect("provider timer spawn");
        Self {
            shared,
            next_request_id: AtomicU64::new(1),
            timer: Mutex::new(Some(timer)),
        }
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Arm the wait deadline for a parked read.
    pub fn arm(&self, session: SessionId, request_id: u64, wait: Duration) {
        let deadline = Instant::now() + wait;
        self.shared.timers.lock().push(Reverse(TimerEntry {
            deadline,
            session: session.0,
            request_id,
        }));
        self.shared.wake.notify_all();
        debug!(
            "event=provider_wait_armed session={session} request_id={request_id} wait_ms={}",
            wait.as_millis()
        );
    }

    /// Signal the timer thread to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
    }

    pub fn shutdown(&self) {
        self.request_stop();
        if let Some(handle) = self.timer.lock().take() {
            if handle.join().is_err() {
                warn!("event=provider_timer_panic");
            }
        }
    }
}

fn timer_loop(shared: Arc<BrokerShared>) {
    loop {
        let due = {
            let mut timers = shared.timers.lock();
            loop {
                if shared.stop.load(Ordering::Acquire) {
                    return;
                }
                let next_deadline = timers.peek().map(|Reverse(entry)| entry.deadline);
                match next_deadline {
                    None => {
                        shared.wake.wait(&mut timers);
                    }
                    Some(deadline) => {
                        let now = Instant::now();
                        if deadline <= now {
                            break timers.pop().map(|Reverse(entry)| entry);
                        }
                        let _ = shared.wake.wait_for(&mut timers, deadline - now);
                    }
                }
            }
        };
        let Some(entry) = due else { continue };
        let Some(engine) = shared.engine.upgrade() else {
            return;
        };
        engine.provider_timeout(SessionId(entry.session), entry.request_id);
    }
}
