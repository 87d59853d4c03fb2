use std::io;

/// Errors reported by an [`IoLoop`](crate::IoLoop).
///
/// Cancelling an unknown key is not an error; `remove_timeout` and
/// `remove_timer` report it by returning `false`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("event loop is closed")]
    Closed,

    #[error("event loop is already running")]
    AlreadyRunning,

    #[error("reactor failure: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
