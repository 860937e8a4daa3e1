//! The request dispatcher: a bounded circular queue of addressed requests
//! drained by a fixed worker pool. Idle workers spin for an adaptive number
//! of cycles before sleeping on the queue condition, so bursty load avoids
//! wake latency without pinning CPUs when traffic is quiet.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::data::diff::Change;
use crate::data::edit::EditFlags;
use crate::data::tree::MovePosition;
use crate::engine::Engine;
use crate::error::{ErrorCode, SessionError};
use crate::session::SessionId;
use crate::value::{Datastore, Value, ValueData};

/// Queue slots granted per active worker before another worker is woken.
const REQUESTS_PER_WORKER: usize = 2;
/// A wake-up within this window of going idle counts as "bursty" and grows
/// the spin limit.
const SPIN_WINDOW: Duration = Duration::from_micros(500);
const SPIN_MIN: usize = 1_000;
const SPIN_MAX: usize = 1_000_000;
const INITIAL_QUEUE_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub enum Request {
    GetItem { xpath: String },
    GetItems { xpath: String },
    SetItem { xpath: String, value: Option<ValueData>, flags: EditFlags },
    DeleteItem { xpath: String, flags: EditFlags },
    MoveItem { xpath: String, position: MovePosition, relative: Option<String> },
    Validate,
    Commit,
    DiscardChanges,
    Refresh,
    CopyConfig { module: Option<String>, src: Datastore, dst: Datastore },
    LockDatastore,
    UnlockDatastore,
    LockModule { module: String },
    UnlockModule { module: String },
    SwitchDatastore { ds: Datastore },
    Rpc { xpath: String, args: Vec<Value> },
    Action { xpath: String, args: Vec<Value> },
    EventNotification { xpath: String, values: Vec<Value> },
    GetChanges { commit_id: u32, xpath: String },
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub code: ErrorCode,
    pub values: Vec<Value>,
    pub errors: Vec<SessionError>,
    pub commit_id: Option<u32>,
    pub changes: Vec<Change>,
}

impl Response {
    pub fn ok() -> Self {
        Response::default()
    }

    pub fn with_values(values: Vec<Value>) -> Self {
        Response {
            values,
            ..Response::default()
        }
    }

    pub fn failed(code: ErrorCode, errors: Vec<SessionError>) -> Self {
        Response {
            code,
            errors,
            ..Response::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub session: Option<SessionId>,
    pub request: Request,
    pub reply: Sender<Response>,
}

/// Bounded ring that doubles its capacity when full, so enqueue never
/// blocks the caller.
#[derive(Debug)]
pub struct CircularBuffer<T> {
    slots: Vec<Option<T>>,
    head: usize,
    len: usize,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn enqueue(&mut self, item: T) {
        if self.len == self.slots.len() {
            self.grow();
        }
        let tail = (self.head + self.len) % self.slots.len();
        self.slots[tail] = Some(item);
        self.len += 1;
    }

    pub fn dequeue(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.slots[self.head].take();
        self.head = (self.head + 1) % self.slots.len();
        self.len -= 1;
        item
    }

    fn grow(&mut self) {
        let old_capacity = self.slots.len();
        let mut slots: Vec<Option<T>> = (0..old_capacity * 2).map(|_| None).collect();
        for (i, slot) in slots.iter_mut().take(self.len).enumerate() {
            *slot = self.slots[(self.head + i) % old_capacity].take();
        }
        self.slots = slots;
        self.head = 0;
    }
}

struct DispatcherShared {
    queue: Mutex<CircularBuffer<RequestEnvelope>>,
    wake: Condvar,
    queued: AtomicUsize,
    active: AtomicUsize,
    spin_limit: AtomicUsize,
    stop: AtomicBool,
    engine: Weak<Engine>,
}

pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn start(engine: &Arc<Engine>, worker_count: usize) -> Self {
        let shared = Arc::new(DispatcherShared {
            queue: Mutex::new(CircularBuffer::new(INITIAL_QUEUE_CAPACITY)),
            wake: Condvar::new(),
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(worker_count),
            spin_limit: AtomicUsize::new(SPIN_MIN),
            stop: AtomicBool::new(false),
            engine: Arc::downgrade(engine),
        });
        let workers = (0..worker_count.max(1))
            .map(|index| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("constor-worker-{index}"))
                    .spawn(move || worker_loop(shared))
                    .expect("worker thread spawn")
            })
            .collect();
        Self {
            shared,
            workers: Mutex::new(workers),
        }
    }

    pub fn enqueue(&self, envelope: RequestEnvelope) {
        let queued = {
            let mut queue = self.shared.queue.lock();
            queue.enqueue(envelope);
            let queued = queue.len();
            self.shared.queued.store(queued, Ordering::Release);
            queued
        };
        let active = self.shared.active.load(Ordering::Acquire).max(1);
        // Always wake one sleeper; wake another when the backlog per active
        // worker grows beyond the per-worker allowance.
        self.shared.wake.notify_one();
        if queued / active > REQUESTS_PER_WORKER {
            self.shared.wake.notify_one();
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Signal the workers to stop without waiting for them; used when the
    /// caller may itself be a worker.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
    }

    pub fn shutdown(&self) {
        self.request_stop();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                warn!("event=dispatcher_worker_panic");
            }
        }
    }
}

fn worker_loop(shared: Arc<DispatcherShared>) {
    loop {
        let mut dequeued_prev = false;
        loop {
            if shared.stop.load(Ordering::Acquire) {
                shared.active.fetch_sub(1, Ordering::AcqRel);
                return;
            }
            let item = {
                let mut queue = shared.queue.lock();
                let item = queue.dequeue();
                shared.queued.store(queue.len(), Ordering::Release);
                item
            };
            match item {
                Some(envelope) => {
                    dequeued_prev = true;
                    let Some(engine) = shared.engine.upgrade() else {
                        shared.active.fetch_sub(1, Ordering::AcqRel);
                        return;
                    };
                    engine.dispatch(envelope);
                }
                None => {
                    if dequeued_prev {
                        // Just finished a burst: spin briefly before sleeping.
                        let limit = shared.spin_limit.load(Ordering::Relaxed);
                        let mut count = 0usize;
                        while count < limit
                            && shared.queued.load(Ordering::Acquire) == 0
                            && !shared.stop.load(Ordering::Acquire)
                        {
                            std::hint::spin_loop();
                            count += 1;
                        }
                    }
                    if shared.queued.load(Ordering::Acquire) != 0 {
                        dequeued_prev = false;
                        continue;
                    }
                    break;
                }
            }
        }
        // Sleep until a request arrives, adapting the spin limit to how soon
        // the wake-up comes.
        let mut queue = shared.queue.lock();
        if shared.stop.load(Ordering::Acquire) {
            shared.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        shared.active.fetch_sub(1, Ordering::AcqRel);
        let slept_at = Instant::now();
        if queue.is_empty() {
            shared.wake.wait(&mut queue);
        }
        drop(queue);
        shared.active.fetch_add(1, Ordering::AcqRel);
        let napped = slept_at.elapsed();
        let limit = shared.spin_limit.load(Ordering::Relaxed);
        let next = if napped < SPIN_WINDOW {
            (limit.saturating_mul(2)).min(SPIN_MAX)
        } else {
            (limit / 2).max(SPIN_MIN)
        };
        shared.spin_limit.store(next, Ordering::Relaxed);
        debug!(
            "event=worker_wake nap_us={} spin_limit={next}",
            napped.as_micros()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_preserves_fifo_across_growth() {
        let mut buffer = CircularBuffer::new(2);
        for i in 0..10 {
            buffer.enqueue(i);
        }
        // Interleave to exercise wrap-around.
        assert_eq!(buffer.dequeue(), Some(0));
        buffer.enqueue(10);
        let drained: Vec<i32> = std::iter::from_fn(|| buffer.dequeue()).collect();
        assert_eq!(drained, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn ring_buffer_grows_only_when_full() {
        let mut buffer = CircularBuffer::new(4);
        buffer.enqueue(1);
        buffer.dequeue();
        for i in 0..4 {
            buffer.enqueue(i);
        }
        assert_eq!(buffer.len(), 4);
        buffer.enqueue(4);
        assert_eq!(buffer.len(), 5);
        let drained: Vec<i32> = std::iter::from_fn(|| buffer.dequeue()).collect();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
    }
}
