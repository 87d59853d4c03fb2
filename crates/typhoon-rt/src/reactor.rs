use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use polling::{Events, Poller};

/// Work posted for the next dispatch pass.
pub type Callback = Box<dyn FnOnce()>;

/// Completion handler of a one-shot timer.
pub type Handler = Box<dyn FnOnce(WaitStatus)>;

/// How a one-shot timer completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The deadline passed.
    Fired,
    /// The timer was cancelled before its deadline was processed.
    Canceled,
}

/// Opaque handle of an armed one-shot timer. Never reused by a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Pending {
    /// `None` when the delay reaches past what `Instant` can represent; such
    /// a timer never fires but can still be cancelled.
    deadline: Option<Instant>,
    handler: Handler,
}

/// Timer state: BTreeSet for ordered expiry iteration, HashMap for handle lookup.
#[derive(Default)]
struct TimerState {
    /// Armed timers ordered by (deadline, id).
    heap: BTreeSet<(Instant, u64)>,
    /// Timer id → deadline and handler, for cancel and dispatch.
    pending: HashMap<u64, Pending>,
    next_id: u64,
}

/// The part of a reactor other threads may touch.
struct Shared {
    poller: Poller,
    stop: AtomicBool,
}

/// Thread-safe handle that asks a reactor's [`Reactor::run`] to return.
#[derive(Clone)]
pub struct StopHandle {
    shared: Arc<Shared>,
}

impl StopHandle {
    /// Request a stop and wake the poller if the reactor is blocked in it.
    ///
    /// The request is consumed by the next `run` that observes it.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Err(err) = self.shared.poller.notify() {
            tracing::warn!(%err, "failed to wake reactor poller");
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("stop", &self.shared.stop.load(Ordering::Relaxed))
            .finish()
    }
}

/// Single-threaded reactor: posted callbacks, one-shot timers, OS poller.
pub struct Reactor {
    shared: Arc<Shared>,
    posted: ConcurrentQueue<Callback>,
    timers: RefCell<TimerState>,
    events: RefCell<Events>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poller = Poller::new()?;
        Ok(Self {
            shared: Arc::new(Shared {
                poller,
                stop: AtomicBool::new(false),
            }),
            posted: ConcurrentQueue::unbounded(),
            timers: RefCell::new(TimerState::default()),
            events: RefCell::new(Events::new()),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            shared: self.shared.clone(),
        }
    }

    // ── Callbacks ───────────────────────────────────────────────────

    /// Queue a callback for the next dispatch pass. Callbacks run in the
    /// order they were posted.
    pub fn post(&self, callback: Callback) {
        // Unbounded and never closed, so the push cannot fail.
        let _ = self.posted.push(callback);
    }

    /// Number of posted callbacks not yet run.
    pub fn queued(&self) -> usize {
        self.posted.len()
    }

    // ── Timers ──────────────────────────────────────────────────────

    /// Arm a one-shot timer. `handler` receives [`WaitStatus::Fired`] once
    /// `delay` has elapsed, or [`WaitStatus::Canceled`] after [`Reactor::cancel`].
    pub fn arm(&self, delay: Duration, handler: Handler) -> TimerHandle {
        let deadline = Instant::now().checked_add(delay);
        let mut state = self.timers.borrow_mut();
        let id = state.next_id;
        state.next_id += 1;
        if let Some(deadline) = deadline {
            state.heap.insert((deadline, id));
        }
        state.pending.insert(id, Pending { deadline, handler });
        TimerHandle(id)
    }

    /// Disarm a pending timer. Its handler is posted with
    /// [`WaitStatus::Canceled`]. Returns false if the timer already fired or
    /// was cancelled.
    pub fn cancel(&self, handle: TimerHandle) -> bool {
        let pending = {
            let mut state = self.timers.borrow_mut();
            let Some(pending) = state.pending.remove(&handle.0) else {
                return false;
            };
            if let Some(deadline) = pending.deadline {
                state.heap.remove(&(deadline, handle.0));
            }
            pending
        };
        let handler = pending.handler;
        self.post(Box::new(move || handler(WaitStatus::Canceled)));
        true
    }

    /// Number of armed timers.
    pub fn armed(&self) -> usize {
        self.timers.borrow().pending.len()
    }

    /// Drop every posted callback and armed timer without invoking them.
    pub fn clear(&self) {
        let (heap, pending) = {
            let mut state = self.timers.borrow_mut();
            (mem::take(&mut state.heap), mem::take(&mut state.pending))
        };
        // Dropped outside the borrow: captured state may call back in.
        drop(heap);
        drop(pending);
        while let Ok(callback) = self.posted.pop() {
            drop(callback);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.borrow().heap.first().map(|&(deadline, _)| deadline)
    }

    fn due(&self, now: Instant) -> Vec<u64> {
        self.timers
            .borrow()
            .heap
            .iter()
            .take_while(|&&(deadline, _)| deadline <= now)
            .map(|&(_, id)| id)
            .collect()
    }

    fn take(&self, id: u64) -> Option<Handler> {
        let mut state = self.timers.borrow_mut();
        let pending = state.pending.remove(&id)?;
        if let Some(deadline) = pending.deadline {
            state.heap.remove(&(deadline, id));
        }
        Some(pending.handler)
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Request that [`Reactor::run`] return after the current handler.
    pub fn stop(&self) {
        self.stop_handle().request_stop();
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop.load(Ordering::Acquire)
    }

    /// Dispatch posted callbacks and expired timers on the calling thread.
    ///
    /// Each pass runs the callbacks that were queued when it began, then the
    /// timers that were due when the callbacks finished, then waits on the
    /// poller until the next deadline. Returns once a stop is requested, or
    /// with `exit_when_idle` once nothing is queued or armed. Work left over
    /// by a stop is kept for the next call.
    pub fn run(&self, exit_when_idle: bool) -> io::Result<()> {
        loop {
            if self.shared.stop.swap(false, Ordering::AcqRel) {
                return Ok(());
            }

            // Callbacks posted during this pass wait for the next one.
            for _ in 0..self.posted.len() {
                let Ok(callback) = self.posted.pop() else {
                    break;
                };
                callback();
                if self.stop_requested() {
                    break;
                }
            }
            if self.stop_requested() {
                continue;
            }

            // Timers armed by these handlers are not due until the next pass,
            // even with a zero delay.
            for id in self.due(Instant::now()) {
                // Cancelled by an earlier handler in this batch.
                let Some(handler) = self.take(id) else {
                    continue;
                };
                handler(WaitStatus::Fired);
                if self.stop_requested() {
                    break;
                }
            }
            if self.stop_requested() {
                continue;
            }

            let timeout = if !self.posted.is_empty() {
                Some(Duration::ZERO)
            } else {
                match self.next_deadline() {
                    Some(deadline) => Some(deadline.saturating_duration_since(Instant::now())),
                    None if exit_when_idle && self.armed() == 0 => return Ok(()),
                    None => None,
                }
            };
            self.wait(timeout)?;
        }
    }

    fn wait(&self, timeout: Option<Duration>) -> io::Result<()> {
        let mut events = self.events.borrow_mut();
        events.clear();
        match self.shared.poller.wait(&mut events, timeout) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(err) => Err(err),
        }
    }
}
