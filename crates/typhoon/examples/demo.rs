//! Exercise the current thread's loop: a deferred callback, a one-shot
//! timeout and a timer that cancels itself after a few ticks.
//!
//! Run with `RUST_LOG=typhoon=trace cargo run -p typhoon --example demo` to
//! see the loop's own events.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use typhoon::LoopConfig;

fn main() -> typhoon::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // Return from run() once the timer has cancelled itself.
    typhoon::initialize_with(LoopConfig::new().exit_when_idle(true));
    let ioloop = typhoon::current()?;

    ioloop.add_callback(|| println!("later"))?;
    ioloop.add_timeout(|| println!("after 1 second"), Duration::from_secs(1))?;

    let remaining = Rc::new(Cell::new(5));
    let key = Rc::new(Cell::new(None));
    let (lp, r, k) = (ioloop.clone(), remaining.clone(), key.clone());
    let id = ioloop.add_timer(
        move || {
            println!("periodic {}", r.get());
            if r.get() > 0 {
                r.set(r.get() - 1);
            } else if let Some(key) = k.get() {
                lp.remove_timer(key);
            }
        },
        Duration::from_millis(500),
    )?;
    key.set(Some(id));
    println!("start");

    ioloop.run()
}
