//! Process-wide table of per-thread event loops.
//!
//! Each thread that calls [`current`] gets one loop, created on first use and
//! cached in a thread-local, so lookups never lock. The shared table is only
//! locked to insert or remove a thread's entry. It remembers a [`StopHandle`]
//! per thread, which is what lets [`shutdown`] end every registered loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, ThreadId};

use typhoon_rt::StopHandle;

use crate::config::LoopConfig;
use crate::error::Result;
use crate::ioloop::IoLoop;

struct Registry {
    config: LoopConfig,
    loops: Mutex<HashMap<ThreadId, StopHandle>>,
    /// Bumped by every shutdown, under the `loops` lock. Loops cached under
    /// an older epoch are detached.
    epoch: AtomicU64,
}

impl Registry {
    fn new(config: LoopConfig) -> Self {
        Self {
            config,
            loops: Mutex::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ThreadId, StopHandle>> {
        // Entries are plain handles; a panic mid-update cannot leave them torn.
        self.loops.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// A thread's cached loop. Dropped on thread exit, which unregisters it.
struct Slot {
    ioloop: IoLoop,
    thread: ThreadId,
    epoch: u64,
}

impl Drop for Slot {
    fn drop(&mut self) {
        let Some(registry) = REGISTRY.get() else {
            return;
        };
        let mut loops = registry.lock();
        if registry.epoch() == self.epoch {
            loops.remove(&self.thread);
            tracing::debug!(thread = ?self.thread, "event loop unregistered");
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Slot>> = const { RefCell::new(None) };
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry::new(LoopConfig::default()))
}

/// Prepare the registry with the default [`LoopConfig`]. Safe to call any
/// number of times, or never: [`current`] initializes on first use.
pub fn initialize() {
    registry();
}

/// Prepare the registry with `config`, applied to every loop it creates.
/// Returns false, leaving the existing config in place, if the registry was
/// already initialized.
pub fn initialize_with(config: LoopConfig) -> bool {
    let mut installed = false;
    REGISTRY.get_or_init(|| {
        installed = true;
        Registry::new(config)
    });
    installed
}

/// The calling thread's event loop, created and registered on first call.
///
/// Every call on one thread returns a handle to the same loop until
/// [`shutdown`] detaches it.
pub fn current() -> Result<IoLoop> {
    let registry = registry();
    let epoch = registry.epoch();
    let cached = CURRENT.with(|slot| match slot.borrow().as_ref() {
        Some(slot) if slot.epoch == epoch => Some(slot.ioloop.clone()),
        _ => None,
    });
    if let Some(ioloop) = cached {
        return Ok(ioloop);
    }

    // Drop a loop detached by shutdown before registering its successor.
    let detached = CURRENT.with(|slot| slot.borrow_mut().take());
    drop(detached);

    let ioloop = IoLoop::with_config(registry.config.clone())?;
    let thread = thread::current().id();
    let epoch = {
        let mut loops = registry.lock();
        loops.insert(thread, ioloop.stop_handle());
        registry.epoch()
    };
    tracing::debug!(?thread, "event loop registered");

    CURRENT.with(|slot| {
        *slot.borrow_mut() = Some(Slot {
            ioloop: ioloop.clone(),
            thread,
            epoch,
        });
    });
    Ok(ioloop)
}

/// Detach every registered loop and ask each to stop. Returns the number of
/// loops detached.
///
/// A detached loop keeps its pending work but is no longer returned by
/// [`current`]; the next call on its thread creates a fresh loop. A detached
/// loop that was idle returns from its next `run` immediately.
pub fn shutdown() -> usize {
    let Some(registry) = REGISTRY.get() else {
        return 0;
    };
    let detached: Vec<StopHandle> = {
        let mut loops = registry.lock();
        registry.epoch.fetch_add(1, Ordering::AcqRel);
        loops.drain().map(|(_, stop)| stop).collect()
    };
    for stop in &detached {
        stop.request_stop();
    }
    tracing::debug!(count = detached.len(), "event loop registry shut down");
    detached.len()
}

/// Number of threads with a registered loop.
pub fn registered() -> usize {
    REGISTRY.get().map_or(0, |registry| registry.lock().len())
}
