use std::fmt;

/// Lifecycle of one dev session.
///
/// `Idle → CompilerStarting → CompilerReady → TunnelConnecting →
/// TunnelReady → Registered → Stopped`. Any state may jump to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    CompilerStarting,
    CompilerReady,
    TunnelConnecting,
    TunnelReady,
    /// Registered remotely; heartbeats are running
    Registered,
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::CompilerStarting => "compiler-starting",
            SessionState::CompilerReady => "compiler-ready",
            SessionState::TunnelConnecting => "tunnel-connecting",
            SessionState::TunnelReady => "tunnel-ready",
            SessionState::Registered => "registered",
            SessionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_kebab_case() {
        assert_eq!(SessionState::CompilerStarting.to_string(), "compiler-starting");
        assert_eq!(SessionState::Registered.to_string(), "registered");
        assert_eq!(SessionState::Stopped.to_string(), "stopped");
    }
}
