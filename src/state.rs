//! Node bootstrap state machine
//!
//! kubeadm is not re-entrant: `init` or `join` on a host that already went
//! through either one fails in confusing ways. The bootstrap sequence
//! therefore resets unconditionally before each attempt. This module makes
//! that rule explicit so it can be checked without running any tooling.
//!
//! ```text
//!                 Reset
//!   ┌─────────────────────────────┐
//!   ▼                             │
//! Uninitialized ──Initialize──► Bootstrapped
//!               ──Join────────►
//! ```
//!
//! A run starts in `Bootstrapped`: nothing is known about what a previous
//! (possibly failed) run left behind, so the first thing allowed is a reset.

use std::fmt;

use tracing::debug;

use crate::{Error, Result};

/// kubeadm-level state of this host
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapState {
    /// No kubeadm state on the host; init or join may run
    Uninitialized,
    /// kubeadm init or join has run (or may have run) on this host
    Bootstrapped,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "Uninitialized"),
            Self::Bootstrapped => write!(f, "Bootstrapped"),
        }
    }
}

/// Operations that move a host between states
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `kubeadm reset`
    Reset,
    /// `kubeadm init`
    Initialize,
    /// `kubeadm join`
    Join,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "reset"),
            Self::Initialize => write!(f, "initialize"),
            Self::Join => write!(f, "join"),
        }
    }
}

impl BootstrapState {
    /// State to assume before anything is known about the host
    pub fn assume_dirty() -> Self {
        Self::Bootstrapped
    }

    /// Compute the state after `transition`
    ///
    /// Reset is valid from anywhere. Initialize and Join are only valid from
    /// `Uninitialized`. The new state is reached as soon as the operation is
    /// attempted: a failed init still leaves state behind that needs a reset.
    pub fn apply(self, transition: Transition) -> Result<Self> {
        match (self, transition) {
            (_, Transition::Reset) => Ok(Self::Uninitialized),
            (Self::Uninitialized, Transition::Initialize | Transition::Join) => {
                Ok(Self::Bootstrapped)
            }
            (Self::Bootstrapped, t) => Err(Error::InvalidTransition {
                from: self.to_string(),
                transition: t.to_string(),
            }),
        }
    }
}

/// Tracks the host state across one bootstrap run
#[derive(Debug)]
pub struct StateMachine {
    state: BootstrapState,
    history: Vec<Transition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start from [`BootstrapState::assume_dirty`]
    pub fn new() -> Self {
        Self {
            state: BootstrapState::assume_dirty(),
            history: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Transitions applied so far, oldest first
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Apply a transition, leaving the state unchanged if it is invalid
    pub fn transition(&mut self, transition: Transition) -> Result<BootstrapState> {
        let next = self.state.apply(transition)?;
        debug!(from = %self.state, to = %next, %transition, "Bootstrap state transition");
        self.state = next;
        self.history.push(transition);
        Ok(next)
    }
}
