//! typhoon-rt: timer and callback substrate for typhoon event loops.
//!
//! A [`Reactor`] owns an OS poller, a FIFO of posted callbacks and a table of
//! one-shot timers. [`Reactor::run`] dispatches them on the calling thread until
//! a stop is requested. Everything except [`StopHandle`] is confined to the
//! thread that created the reactor.

mod reactor;

pub use reactor::{Callback, Handler, Reactor, StopHandle, TimerHandle, WaitStatus};
