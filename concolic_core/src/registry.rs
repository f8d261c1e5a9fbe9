use crate::config::BranchMode;
use crate::handler::{BranchHandler, StepHandler};
use std::sync::Arc;

/// Lifecycle of a bridge. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// No handlers registered; dispatching is a fatal configuration error.
    Uninitialized,
    /// Handlers registered, no instrumented call seen yet.
    Armed,
    /// At least one instrumented call went through the dispatcher.
    Active,
}

/// The two handler slots installed by the controlling engine.
///
/// A registry is built once and never mutated; the dispatcher only reads it.
/// Handlers are shared with the engine, not copied.
#[derive(Clone)]
pub struct CallbackRegistry {
    step: Arc<dyn StepHandler>,
    branch: Arc<dyn BranchHandler>,
    branch_mode: BranchMode,
}

impl CallbackRegistry {
    pub fn new(step: Arc<dyn StepHandler>, branch: Arc<dyn BranchHandler>) -> Self {
        Self::with_mode(step, branch, BranchMode::default())
    }

    pub fn with_mode(
        step: Arc<dyn StepHandler>,
        branch: Arc<dyn BranchHandler>,
        branch_mode: BranchMode,
    ) -> Self {
        Self {
            step,
            branch,
            branch_mode,
        }
    }

    pub fn step_handler(&self) -> &dyn StepHandler {
        self.step.as_ref()
    }

    pub fn branch_handler(&self) -> &dyn BranchHandler {
        self.branch.as_ref()
    }

    pub fn branch_mode(&self) -> BranchMode {
        self.branch_mode
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("branch_mode", &self.branch_mode)
            .finish_non_exhaustive()
    }
}
