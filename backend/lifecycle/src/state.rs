use std::fmt;

use anyhow::anyhow;

use usbcage_core::CageError;

/// Orchestrator states in the only order they may be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Idle,
    AwaitingDevice,
    Isolating,
    GuardTransition,
    SandboxStarting,
    Attaching,
    Monitoring,
    Cleanup,
    Terminal,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingDevice => "awaiting_device",
            Self::Isolating => "isolating",
            Self::GuardTransition => "guard_transition",
            Self::SandboxStarting => "sandbox_starting",
            Self::Attaching => "attaching",
            Self::Monitoring => "monitoring",
            Self::Cleanup => "cleanup",
            Self::Terminal => "terminal",
        };
        f.write_str(name)
    }
}

/// Forward-only state tracker. States may be skipped (an interrupt jumps
/// straight to `Terminal`) but never revisited.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: LifecycleState,
    history: Vec<LifecycleState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self { current: LifecycleState::Idle, history: vec![LifecycleState::Idle] }
    }
}

impl StateMachine {
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn advance(&mut self, next: LifecycleState) -> Result<(), CageError> {
        if next <= self.current {
            return Err(CageError::Other(anyhow!(
                "illegal lifecycle transition {} -> {next}",
                self.current
            )));
        }
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_forward_and_skips() {
        let mut sm = StateMachine::default();
        sm.advance(LifecycleState::AwaitingDevice).unwrap();
        sm.advance(LifecycleState::Terminal).unwrap();
        assert_eq!(
            sm.history(),
            &[LifecycleState::Idle, LifecycleState::AwaitingDevice, LifecycleState::Terminal]
        );
    }

    #[test]
    fn refuses_to_regress_or_repeat() {
        let mut sm = StateMachine::default();
        sm.advance(LifecycleState::Isolating).unwrap();
        assert!(sm.advance(LifecycleState::AwaitingDevice).is_err());
        assert!(sm.advance(LifecycleState::Isolating).is_err());
        assert_eq!(sm.history(), &[LifecycleState::Idle, LifecycleState::Isolating]);
    }
}
