pub mod breakpoint;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod handler;
pub mod registry;
pub mod trace;

pub use breakpoint::{Breakpoint, HaltController, SuspendController, concolic_bridge_halt};
pub use config::{BranchMode, BreakpointSettings, BridgeConfig, TraceSettings};
pub use dispatcher::{Bridge, BridgeError};
pub use event::{ConcreteArgument, ConcreteValue, EVALUATED_SLOT, InstructionEvent};
pub use handler::{
    BranchHandler, BreakOnEveryBranch, BreakOnIds, NeverBreak, NoOpStepHandler, StepHandler,
};
pub use registry::{BridgeState, CallbackRegistry};
pub use trace::{ConcolicTrace, EntryKind, TraceEntry, TraceError, TraceRecorder};
