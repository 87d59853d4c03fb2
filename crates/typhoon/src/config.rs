/// Settings applied to an [`IoLoop`](crate::IoLoop) when it is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopConfig {
    /// Return from `run` once no callback is queued and no timeout or timer
    /// is armed, instead of waiting for `stop`.
    pub exit_when_idle: bool,
}

impl LoopConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exit_when_idle(mut self, exit: bool) -> Self {
        self.exit_when_idle = exit;
        self
    }
}
