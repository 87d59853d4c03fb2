//! typhoon: a per-thread event loop.
//!
//! Every thread that asks for one gets a single [`IoLoop`] that runs deferred
//! callbacks, one-shot timeouts and periodic timers on that thread. Waiting is
//! delegated to the `typhoon-rt` reactor.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use std::time::Duration;
//!
//! typhoon::initialize();
//! let ioloop = typhoon::current()?;
//!
//! ioloop.add_callback(|| println!("later"))?;
//! ioloop.add_timeout(|| println!("after 1 second"), Duration::from_secs(1))?;
//!
//! let key = Rc::new(Cell::new(None));
//! let (lp, k) = (ioloop.clone(), key.clone());
//! let id = ioloop.add_timer(move || {
//!     println!("periodic");
//!     lp.remove_timer(k.get().unwrap());
//!     lp.stop();
//! }, Duration::from_millis(500))?;
//! key.set(Some(id));
//!
//! ioloop.run()?;
//! ```

mod config;
mod error;
pub mod ioloop;
pub mod key;
pub mod registry;

// Re-exports for convenience
pub use config::LoopConfig;
pub use error::{Error, Result};
pub use ioloop::IoLoop;
pub use key::Key;
pub use registry::{current, initialize, initialize_with, registered, shutdown};
