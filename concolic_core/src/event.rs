use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Slot under which a probe stores the value the instrumented instruction
/// evaluated to: the condition result of an `if`, the chosen index of a switch.
pub const EVALUATED_SLOT: i32 = -1;

/// A concrete operand value captured at a probe site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum ConcreteValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Null,
    /// Opaque identity of a heap object (address or handle).
    Reference(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct ConcreteArgument {
    pub slot: i32,
    pub value: ConcreteValue,
}

/// One traced program point, as reported by an injected probe.
///
/// The `id` is opaque to the bridge; the probe rewriter decides how it maps
/// to a class, method and instruction offset. Concrete operand values are
/// optional metadata that analysis handlers may use to replay the
/// instruction symbolically.
///
/// Events are immutable once handed to the dispatcher. They are built with
/// [`InstructionEvent::new`] and [`InstructionEvent::with_argument`], then
/// passed by reference; the bridge never retains them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct InstructionEvent {
    id: u64,
    concrete_arguments: Vec<ConcreteArgument>,
}

impl InstructionEvent {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            concrete_arguments: Vec::new(),
        }
    }

    /// Appends a captured operand. Arguments keep the order they were added in.
    pub fn with_argument(mut self, slot: i32, value: ConcreteValue) -> Self {
        self.concrete_arguments.push(ConcreteArgument { slot, value });
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn concrete_arguments(&self) -> &[ConcreteArgument] {
        &self.concrete_arguments
    }

    /// Returns the most recently captured value for `slot`, if any.
    pub fn argument(&self, slot: i32) -> Option<&ConcreteValue> {
        self.concrete_arguments
            .iter()
            .rev()
            .find(|arg| arg.slot == slot)
            .map(|arg| &arg.value)
    }

    /// The value stored under [`EVALUATED_SLOT`].
    pub fn evaluated(&self) -> Option<&ConcreteValue> {
        self.argument(EVALUATED_SLOT)
    }
}
