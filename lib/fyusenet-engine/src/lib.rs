//! The network execution engine: admits sequences, walks the compiled layer set in layer-number
//! order, and dispatches upload/download layers through the async transfer contract when running
//! in async mode.

pub mod async_state;
pub mod dependency;
pub mod engine;

pub use dependency::{ExecState, ExecutionState};
pub use engine::{Callbacks, Engine, SequenceOutcome};
