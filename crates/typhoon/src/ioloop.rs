//! The per-thread event loop.
//!
//! An [`IoLoop`] dispatches three kinds of work on the thread that runs it:
//! deferred callbacks, one-shot timeouts and periodic timers. Timeouts and
//! timers are named by a random [`Key`] and can be cancelled until they fire
//! (timers: at any time, including from their own callback).
//!
//! Callbacks are `'static` closures moved into the loop. Shared state they
//! capture (an `Rc<Cell<_>>`, a clone of the loop itself) is the caller's to
//! keep alive; a callback holding a clone of its own loop keeps the loop
//! alive until the registration is removed or the loop is closed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

use typhoon_rt::{Handler, Reactor, StopHandle, TimerHandle, WaitStatus};

use crate::config::LoopConfig;
use crate::error::{Error, Result};
use crate::key::{Key, KeyGenerator};
use crate::registry;

struct TimeoutEntry {
    native: TimerHandle,
    callback: Box<dyn FnOnce()>,
}

/// Shared with an in-flight expiry so the entry can be removed while its
/// callback runs.
type TimerCallback = Rc<RefCell<dyn FnMut()>>;

struct TimerEntry {
    native: TimerHandle,
    interval: Duration,
    callback: TimerCallback,
}

struct Inner {
    config: LoopConfig,
    /// `None` once closed. `run` holds its own clone, so closing from a
    /// callback frees the reactor when dispatch unwinds.
    reactor: RefCell<Option<Rc<Reactor>>>,
    stop: StopHandle,
    keys: RefCell<KeyGenerator>,
    timeouts: RefCell<HashMap<Key, TimeoutEntry>>,
    timers: RefCell<HashMap<Key, TimerEntry>>,
    running: Cell<bool>,
}

/// Handle to an event loop. Clones refer to the same loop.
///
/// The handle is neither `Send` nor `Sync`: a loop is only ever touched from
/// the thread that created it.
///
/// ```ignore
/// use std::time::Duration;
///
/// let ioloop = typhoon::current()?;
/// ioloop.add_callback(|| println!("later"))?;
/// let lp = ioloop.clone();
/// ioloop.add_timeout(move || lp.stop(), Duration::from_secs(1))?;
/// ioloop.run()?;
/// ```
#[derive(Clone)]
pub struct IoLoop {
    inner: Rc<Inner>,
}

/// Clears the running flag even if a callback panics.
struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl IoLoop {
    /// Create a standalone loop with the default config. It is not
    /// registered for any thread; see [`IoLoop::current`] for that.
    pub fn new() -> Result<Self> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> Result<Self> {
        let reactor = Reactor::new()?;
        let stop = reactor.stop_handle();
        tracing::debug!(?config, "event loop created");
        Ok(Self {
            inner: Rc::new(Inner {
                config,
                reactor: RefCell::new(Some(Rc::new(reactor))),
                stop,
                keys: RefCell::new(KeyGenerator::new()),
                timeouts: RefCell::new(HashMap::new()),
                timers: RefCell::new(HashMap::new()),
                running: Cell::new(false),
            }),
        })
    }

    /// Prepare the process-wide registry. See [`registry::initialize`].
    pub fn initialize() {
        registry::initialize();
    }

    /// The calling thread's loop. See [`registry::current`].
    pub fn current() -> Result<IoLoop> {
        registry::current()
    }

    /// Whether both handles refer to the same loop.
    pub fn ptr_eq(&self, other: &IoLoop) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        self.inner.stop.clone()
    }

    fn reactor(&self) -> Result<Rc<Reactor>> {
        self.inner.reactor.borrow().clone().ok_or(Error::Closed)
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Dispatch callbacks on the calling thread until [`IoLoop::stop`] or
    /// [`IoLoop::close`] is called from one of them (or, with
    /// [`LoopConfig::exit_when_idle`], until no work is left).
    pub fn run(&self) -> Result<()> {
        let reactor = self.reactor()?;
        if self.inner.running.replace(true) {
            return Err(Error::AlreadyRunning);
        }
        let _running = RunningGuard(&self.inner.running);

        tracing::debug!("event loop running");
        let result = reactor.run(self.inner.config.exit_when_idle);
        tracing::debug!(closed = self.is_closed(), "event loop returned");
        result.map_err(Error::from)
    }

    /// Make the blocked [`IoLoop::run`] return once the current callback
    /// finishes. Queued callbacks and armed timeouts and timers are kept and
    /// resume on the next `run`. Has no effect when the loop is not running.
    pub fn stop(&self) {
        if !self.inner.running.get() {
            tracing::trace!("stop ignored, event loop is not running");
            return;
        }
        self.inner.stop.request_stop();
    }

    /// Tear the loop down for good. Pending callbacks, timeouts and timers
    /// are dropped without running; later registrations fail with
    /// [`Error::Closed`].
    pub fn close(&self) {
        let Some(reactor) = self.inner.reactor.borrow_mut().take() else {
            return;
        };
        let timeouts = mem::take(&mut *self.inner.timeouts.borrow_mut());
        let timers = mem::take(&mut *self.inner.timers.borrow_mut());
        tracing::debug!(
            timeouts = timeouts.len(),
            timers = timers.len(),
            callbacks = reactor.queued(),
            "event loop closed"
        );
        reactor.clear();
        // Dropped outside the table borrows: callbacks may capture this loop.
        drop(timeouts);
        drop(timers);
        if self.inner.running.get() {
            reactor.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.reactor.borrow().is_none()
    }

    /// Number of timeouts that have neither fired nor been removed.
    pub fn pending_timeouts(&self) -> usize {
        self.inner.timeouts.borrow().len()
    }

    /// Number of registered periodic timers.
    pub fn active_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    // ── Registration ────────────────────────────────────────────────

    /// Run `callback` on the next iteration, after callbacks added before it.
    pub fn add_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + 'static,
    {
        self.reactor()?.post(Box::new(callback));
        Ok(())
    }

    /// Run `callback` once, `delay` from now.
    pub fn add_timeout<F>(&self, callback: F, delay: Duration) -> Result<Key>
    where
        F: FnOnce() + 'static,
    {
        let reactor = self.reactor()?;
        let key = self.next_key();
        let ioloop = Rc::downgrade(&self.inner);
        let native = reactor.arm(
            delay,
            Box::new(move |status| {
                if status == WaitStatus::Canceled {
                    return;
                }
                if let Some(inner) = ioloop.upgrade() {
                    IoLoop { inner }.fire_timeout(key);
                }
            }),
        );
        self.inner.timeouts.borrow_mut().insert(
            key,
            TimeoutEntry {
                native,
                callback: Box::new(callback),
            },
        );
        tracing::trace!(%key, ?delay, "timeout added");
        Ok(key)
    }

    /// Cancel a timeout that has not fired yet. Returns false if `key` names
    /// no pending timeout (already fired, already removed, or never issued).
    pub fn remove_timeout(&self, key: Key) -> bool {
        let Some(entry) = self.inner.timeouts.borrow_mut().remove(&key) else {
            return false;
        };
        if let Ok(reactor) = self.reactor() {
            reactor.cancel(entry.native);
        }
        tracing::trace!(%key, "timeout removed");
        true
    }

    /// Run `callback` every `interval` until the timer is removed.
    pub fn add_timer<F>(&self, callback: F, interval: Duration) -> Result<Key>
    where
        F: FnMut() + 'static,
    {
        let reactor = self.reactor()?;
        let key = self.next_key();
        let native = reactor.arm(interval, self.timer_handler(key));
        self.inner.timers.borrow_mut().insert(
            key,
            TimerEntry {
                native,
                interval,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        tracing::trace!(%key, ?interval, "timer added");
        Ok(key)
    }

    /// Cancel a periodic timer, suppressing any expiry not yet dispatched.
    /// Safe to call from the timer's own callback. Returns false if `key`
    /// names no registered timer.
    pub fn remove_timer(&self, key: Key) -> bool {
        let Some(entry) = self.inner.timers.borrow_mut().remove(&key) else {
            return false;
        };
        if let Ok(reactor) = self.reactor() {
            reactor.cancel(entry.native);
        }
        tracing::trace!(%key, "timer removed");
        true
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn next_key(&self) -> Key {
        let mut keys = self.inner.keys.borrow_mut();
        let timeouts = self.inner.timeouts.borrow();
        let timers = self.inner.timers.borrow();
        loop {
            let key = keys.next();
            if !timeouts.contains_key(&key) && !timers.contains_key(&key) {
                return key;
            }
        }
    }

    fn fire_timeout(&self, key: Key) {
        // Out of the table before the callback runs.
        let Some(entry) = self.inner.timeouts.borrow_mut().remove(&key) else {
            tracing::trace!(%key, "expired timeout was already removed");
            return;
        };
        tracing::trace!(%key, "timeout fired");
        (entry.callback)();
    }

    fn timer_handler(&self, key: Key) -> Handler {
        let ioloop = Rc::downgrade(&self.inner);
        Box::new(move |status| {
            if status == WaitStatus::Canceled {
                return;
            }
            if let Some(inner) = ioloop.upgrade() {
                IoLoop { inner }.fire_timer(key);
            }
        })
    }

    fn fire_timer(&self, key: Key) {
        // Look up, rearm, then invoke. A timer removed before this expiry is
        // processed neither rearms nor fires.
        let callback = match self.rearm(key) {
            Ok(Some(callback)) => callback,
            Ok(None) => {
                tracing::trace!(%key, "expired timer was already removed");
                return;
            }
            Err(err) => {
                tracing::trace!(%key, %err, "timer rearm failed, skipping this cycle");
                return;
            }
        };
        tracing::trace!(%key, "timer fired");
        (callback.borrow_mut())();
    }

    fn rearm(&self, key: Key) -> Result<Option<TimerCallback>> {
        let reactor = self.reactor()?;
        let mut timers = self.inner.timers.borrow_mut();
        let Some(entry) = timers.get_mut(&key) else {
            return Ok(None);
        };
        entry.native = reactor.arm(entry.interval, self.timer_handler(key));
        Ok(Some(entry.callback.clone()))
    }
}

impl fmt::Debug for IoLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoLoop")
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .field("timeouts", &self.pending_timeouts())
            .field("timers", &self.active_timers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    /// A standalone loop whose `run` returns once nothing is left to do.
    fn idle_exiting() -> IoLoop {
        IoLoop::with_config(LoopConfig::new().exit_when_idle(true)).unwrap()
    }

    #[test]
    fn callbacks_run_in_fifo_order() {
        let ioloop = idle_exiting();
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b", "c"] {
            let log = log.clone();
            ioloop.add_callback(move || log.borrow_mut().push(name)).unwrap();
        }
        ioloop.run().unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn timeout_fires_once_after_delay() {
        let ioloop = idle_exiting();
        let fired = Rc::new(RefCell::new(Vec::new()));
        let f = fired.clone();
        let start = Instant::now();
        ioloop
            .add_timeout(move || f.borrow_mut().push(Instant::now()), Duration::from_millis(30))
            .unwrap();
        assert_eq!(ioloop.pending_timeouts(), 1);

        ioloop.run().unwrap();

        let fired = fired.borrow();
        assert_eq!(fired.len(), 1);
        let elapsed = fired[0] - start;
        assert!(elapsed >= Duration::from_millis(30), "fired too early: {elapsed:?}");
        assert!(elapsed <= Duration::from_millis(500), "fired too late: {elapsed:?}");
        assert_eq!(ioloop.pending_timeouts(), 0);
    }

    #[test]
    fn timeout_entry_is_gone_when_callback_runs() {
        let ioloop = idle_exiting();
        let key = Rc::new(Cell::new(None));
        let seen = Rc::new(Cell::new(None));

        let (lp, k, s) = (ioloop.clone(), key.clone(), seen.clone());
        let id = ioloop
            .add_timeout(
                move || {
                    s.set(Some((lp.pending_timeouts(), lp.remove_timeout(k.get().unwrap()))));
                },
                Duration::ZERO,
            )
            .unwrap();
        key.set(Some(id));

        ioloop.run().unwrap();
        assert_eq!(seen.get(), Some((0, false)));
    }

    #[test]
    fn removed_timeout_never_fires() {
        let ioloop = idle_exiting();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let key = ioloop
            .add_timeout(move || f.set(true), Duration::from_millis(20))
            .unwrap();

        assert!(ioloop.remove_timeout(key));
        assert!(!ioloop.remove_timeout(key), "second removal reports false");
        // Released with the entry, not when the deadline would have passed.
        assert_eq!(Rc::strong_count(&fired), 1);

        ioloop.run().unwrap();
        assert!(!fired.get());
    }

    #[test]
    fn unknown_keys_are_not_found() {
        let ioloop = idle_exiting();
        let key = ioloop.add_timer(|| {}, Duration::from_secs(10)).unwrap();
        // Timeouts and timers live in separate tables.
        assert!(!ioloop.remove_timeout(key));
        assert!(ioloop.remove_timer(key));
        assert!(!ioloop.remove_timer(key));
    }

    #[test]
    fn expired_timeout_cancelled_before_dispatch_does_not_run() {
        let ioloop = idle_exiting();
        let keys: Rc<RefCell<Vec<Key>>> = Rc::default();
        let ran = Rc::new(RefCell::new(Vec::new()));

        for i in 0..2 {
            let (lp, ks, ran) = (ioloop.clone(), keys.clone(), ran.clone());
            let key = ioloop
                .add_timeout(
                    move || {
                        ran.borrow_mut().push(i);
                        // Both are due in the same pass; cancel the other one.
                        let other = ks.borrow()[1 - i];
                        assert!(lp.remove_timeout(other));
                    },
                    Duration::ZERO,
                )
                .unwrap();
            keys.borrow_mut().push(key);
        }
        std::thread::sleep(Duration::from_millis(5));

        ioloop.run().unwrap();
        assert_eq!(ran.borrow().len(), 1);
        assert_eq!(ioloop.pending_timeouts(), 0);
    }

    #[test]
    fn timer_fires_repeatedly_at_interval() {
        let ioloop = idle_exiting();
        let ticks = Rc::new(RefCell::new(Vec::new()));
        let interval = Duration::from_millis(10);

        let (lp, t) = (ioloop.clone(), ticks.clone());
        let start = Instant::now();
        ioloop
            .add_timer(
                move || {
                    t.borrow_mut().push(Instant::now());
                    if t.borrow().len() == 5 {
                        lp.stop();
                    }
                },
                interval,
            )
            .unwrap();

        ioloop.run().unwrap();

        let ticks = ticks.borrow();
        assert_eq!(ticks.len(), 5);
        assert!(ticks[0] - start >= interval);
        for pair in ticks.windows(2) {
            assert!(pair[1] - pair[0] >= interval, "ticks too close: {pair:?}");
        }
        // Stopping does not unregister the timer.
        assert_eq!(ioloop.active_timers(), 1);
    }

    #[test]
    fn timer_can_cancel_itself() {
        let ioloop = idle_exiting();
        let count = Rc::new(Cell::new(0));
        let key = Rc::new(Cell::new(None));

        let (lp, c, k) = (ioloop.clone(), count.clone(), key.clone());
        let id = ioloop
            .add_timer(
                move || {
                    c.set(c.get() + 1);
                    if c.get() == 3 {
                        assert!(lp.remove_timer(k.get().unwrap()));
                    }
                },
                Duration::from_millis(5),
            )
            .unwrap();
        key.set(Some(id));

        // Returns once the cancelled timer leaves nothing armed.
        ioloop.run().unwrap();
        assert_eq!(count.get(), 3);
        assert_eq!(ioloop.active_timers(), 0);
        assert!(!ioloop.remove_timer(id));
    }

    #[test]
    fn timer_removed_before_expiry_never_fires() {
        let ioloop = idle_exiting();
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let key = ioloop
            .add_timer(move || f.set(true), Duration::from_millis(50))
            .unwrap();

        assert!(ioloop.remove_timer(key));
        let start = Instant::now();
        ioloop.run().unwrap();
        assert!(!fired.get());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn timer_removed_by_earlier_expiry_does_not_fire() {
        let ioloop = idle_exiting();
        let fired = Rc::new(Cell::new(0));
        let timer = Rc::new(Cell::new(None));

        // Armed first, so due no later than the timer.
        let (lp, t) = (ioloop.clone(), timer.clone());
        ioloop
            .add_timeout(
                move || assert!(lp.remove_timer(t.get().unwrap())),
                Duration::from_millis(20),
            )
            .unwrap();
        let f = fired.clone();
        let key = ioloop
            .add_timer(move || f.set(f.get() + 1), Duration::from_millis(20))
            .unwrap();
        timer.set(Some(key));

        ioloop.run().unwrap();
        assert_eq!(fired.get(), 0);
    }

    #[test]
    fn maximal_delays_are_accepted_and_removable() {
        let ioloop = idle_exiting();
        let timeout = ioloop.add_timeout(|| {}, Duration::MAX).unwrap();
        let timer = ioloop.add_timer(|| {}, Duration::MAX).unwrap();
        assert_eq!(ioloop.pending_timeouts(), 1);
        assert_eq!(ioloop.active_timers(), 1);

        assert!(ioloop.remove_timeout(timeout));
        assert!(ioloop.remove_timer(timer));
        // Nothing left armed, so the idle-exiting run returns.
        ioloop.run().unwrap();
    }

    #[test]
    fn stop_keeps_pending_timeout() {
        let ioloop = idle_exiting();
        let start = Instant::now();
        let fired_at = Rc::new(Cell::new(None));

        let f = fired_at.clone();
        ioloop
            .add_timeout(move || f.set(Some(Instant::now())), Duration::from_millis(100))
            .unwrap();
        let lp = ioloop.clone();
        ioloop
            .add_timeout(move || lp.stop(), Duration::from_millis(50))
            .unwrap();

        ioloop.run().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(fired_at.get(), None);
        assert_eq!(ioloop.pending_timeouts(), 1);

        std::thread::sleep(Duration::from_millis(60).saturating_sub(start.elapsed()));
        ioloop.run().unwrap();

        let fired_at = fired_at.get().expect("timeout should fire after resuming");
        assert!(fired_at - start >= Duration::from_millis(100));
    }

    #[test]
    fn stop_while_idle_is_ignored() {
        let ioloop = idle_exiting();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        ioloop.add_callback(move || r.set(true)).unwrap();

        ioloop.stop();
        ioloop.run().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn callbacks_can_register_more_work() {
        let ioloop = idle_exiting();
        let log = Rc::new(RefCell::new(Vec::new()));

        let (lp, l) = (ioloop.clone(), log.clone());
        ioloop
            .add_callback(move || {
                l.borrow_mut().push("callback");
                let l = l.clone();
                lp.add_timeout(move || l.borrow_mut().push("timeout"), Duration::ZERO)
                    .unwrap();
            })
            .unwrap();

        ioloop.run().unwrap();
        assert_eq!(*log.borrow(), vec!["callback", "timeout"]);
    }

    #[test]
    fn reentrant_run_is_rejected() {
        let ioloop = idle_exiting();
        let result = Rc::new(RefCell::new(None));

        let (lp, r) = (ioloop.clone(), result.clone());
        ioloop
            .add_callback(move || *r.borrow_mut() = Some(lp.run()))
            .unwrap();

        ioloop.run().unwrap();
        assert!(matches!(*result.borrow(), Some(Err(Error::AlreadyRunning))));
        assert!(!ioloop.is_running());
    }

    #[test]
    fn close_drops_pending_work() {
        let ioloop = idle_exiting();
        let probe = Rc::new(());

        let p = probe.clone();
        ioloop.add_callback(move || drop(p)).unwrap();
        let p = probe.clone();
        let timeout = ioloop
            .add_timeout(move || drop(p), Duration::from_secs(10))
            .unwrap();
        let p = probe.clone();
        let timer = ioloop
            .add_timer(move || drop(p.clone()), Duration::from_secs(10))
            .unwrap();
        assert_eq!(Rc::strong_count(&probe), 4);

        ioloop.close();
        assert!(ioloop.is_closed());
        assert_eq!(Rc::strong_count(&probe), 1);

        assert!(!ioloop.remove_timeout(timeout));
        assert!(!ioloop.remove_timer(timer));
        assert!(matches!(ioloop.add_callback(|| {}), Err(Error::Closed)));
        assert!(matches!(
            ioloop.add_timeout(|| {}, Duration::ZERO),
            Err(Error::Closed)
        ));
        assert!(matches!(
            ioloop.add_timer(|| {}, Duration::ZERO),
            Err(Error::Closed)
        ));
        assert!(matches!(ioloop.run(), Err(Error::Closed)));
        // Closing twice is harmless.
        ioloop.close();
    }

    #[test]
    fn close_from_callback_ends_run() {
        // Would block forever without the close.
        let ioloop = IoLoop::new().unwrap();
        let ticks = Rc::new(Cell::new(0));

        let (lp, t) = (ioloop.clone(), ticks.clone());
        ioloop
            .add_timer(
                move || {
                    t.set(t.get() + 1);
                    lp.close();
                },
                Duration::from_millis(5),
            )
            .unwrap();

        ioloop.run().unwrap();
        assert_eq!(ticks.get(), 1);
        assert!(ioloop.is_closed());
        assert!(!ioloop.is_running());
    }

    #[test]
    fn keys_are_distinct() {
        let ioloop = idle_exiting();
        let a = ioloop.add_timeout(|| {}, Duration::from_secs(10)).unwrap();
        let b = ioloop.add_timer(|| {}, Duration::from_secs(10)).unwrap();
        let c = ioloop.add_timeout(|| {}, Duration::from_secs(10)).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        ioloop.close();
    }
}
