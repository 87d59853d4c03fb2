//! Opaque identifiers for timeout and timer registrations.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Handle naming a pending timeout or timer.
///
/// Keys are random draws over the full 64-bit range rather than a counter,
/// so they reveal nothing about registration order. Two live registrations
/// of one loop never share a key; across loops, or over time, a repeat is
/// possible with probability around n²/2⁶⁵ for n keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(u64);

impl Key {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Per-loop source of [`Key`]s.
pub struct KeyGenerator {
    rng: StdRng,
}

impl KeyGenerator {
    /// Seed from the OS entropy source with the engine's full 256-bit seed.
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Key {
        Key(self.rng.random())
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}
