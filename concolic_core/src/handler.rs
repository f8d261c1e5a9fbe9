use crate::event::InstructionEvent;
use std::collections::HashSet;

/// A `StepHandler` receives a fire-and-forget notification for every traced
/// instruction executed by the instrumented target.
///
/// Step notifications are high frequency and carry no control-flow meaning:
/// the dispatcher ignores whatever the handler does with the event. Handlers
/// are invoked synchronously on the instrumented thread, in execution order.
///
/// Any closure `Fn(&InstructionEvent) + Send + Sync` is a `StepHandler`.
pub trait StepHandler: Send + Sync {
    fn on_step(&self, event: &InstructionEvent);
}

/// A `BranchHandler` decides, for a branch instruction about to be resolved,
/// whether the controlling engine needs to intervene.
///
/// Returning `true` makes the dispatcher fire the breakpoint trigger on the
/// calling thread before the branch executes. Returning `false` lets the
/// target continue without further side effects.
///
/// Any closure `Fn(&InstructionEvent) -> bool + Send + Sync` is a `BranchHandler`.
pub trait BranchHandler: Send + Sync {
    fn choose_branch(&self, event: &InstructionEvent) -> bool;
}

impl<F> StepHandler for F
where
    F: Fn(&InstructionEvent) + Send + Sync,
{
    fn on_step(&self, event: &InstructionEvent) {
        self(event)
    }
}

impl<F> BranchHandler for F
where
    F: Fn(&InstructionEvent) -> bool + Send + Sync,
{
    fn choose_branch(&self, event: &InstructionEvent) -> bool {
        self(event)
    }
}

/// Step handler that discards every event.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpStepHandler;

impl StepHandler for NoOpStepHandler {
    fn on_step(&self, _event: &InstructionEvent) {}
}

/// Branch handler that never requests intervention.
#[derive(Default, Debug, Clone, Copy)]
pub struct NeverBreak;

impl BranchHandler for NeverBreak {
    fn choose_branch(&self, _event: &InstructionEvent) -> bool {
        false
    }
}

/// Branch handler that requests intervention on every branch.
#[derive(Default, Debug, Clone, Copy)]
pub struct BreakOnEveryBranch;

impl BranchHandler for BreakOnEveryBranch {
    fn choose_branch(&self, _event: &InstructionEvent) -> bool {
        true
    }
}

/// Branch handler that requests intervention only for a fixed set of
/// instruction ids.
#[derive(Default, Debug, Clone)]
pub struct BreakOnIds {
    ids: HashSet<u64>,
}

impl BreakOnIds {
    pub fn new(ids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }
}

impl BranchHandler for BreakOnIds {
    fn choose_branch(&self, event: &InstructionEvent) -> bool {
        self.ids.contains(&event.id())
    }
}
