//! Plain-data types the scheduler uses to track in-flight sequences and the async producers a
//! parked sequence is waiting on. Every reference to "the other side" of a dependency is a layer
//! number rather than a pointer or trait object, so these types carry no lifetime and can be
//! freely cloned, queued and moved between the calling thread, the looper and a completion
//! callback fired from a transfer worker.

use fyusenet_base::StateToken;

/// A run in progress: which sequence it belongs to and where in the compiled layer set it last
/// stopped (either because it finished, or because it parked on an async dependency).
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub sequence_no: u64,
    pub current_layer: i32,
    pub state_token: Option<StateToken>,
}

impl ExecutionState {
    pub fn new(sequence_no: u64, start_layer: i32, state_token: Option<StateToken>) -> Self {
        Self {
            sequence_no,
            current_layer: start_layer,
            state_token,
        }
    }
}

/// Outcome of a call to [`crate::Engine::forward`] or a looper-driven resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    /// Every layer in the graph ran for this sequence.
    Done,
    /// Execution parked on an unresolved async dependency; the engine will resume it from the
    /// looper once that dependency's producer reports completion.
    Deferred,
    /// The engine was stopped (`Engine::stop`) before this sequence could finish.
    Stopped,
}

/// Which event clears a dependency. An early dependency blocks a consumer from reading a
/// transfer's output before it lands; a late dependency blocks the producer itself from being
/// redispatched before every reader of the previous transfer is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Early,
    Late,
}

/// One outstanding "producer owes a completion signal to this dependency layer" record. Cleared
/// in a single shot by the one completion event the producer's transfer ever raises; there is no
/// partial satisfaction to track.
#[derive(Debug, Clone, Copy)]
pub struct Dependency {
    /// Layer number this dependency blocks.
    pub dependency: i32,
    pub sequence_no: u64,
    /// Producer layer number (the async upload/download layer owing the signal).
    pub provider: i32,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn new(dependency: i32, sequence_no: u64, provider: i32, kind: DependencyKind) -> Self {
        Self {
            dependency,
            sequence_no,
            provider,
            kind,
        }
    }
}

/// An [`ExecutionState`] parked at `dependency.dependency`, waiting for `dependency` to clear.
#[derive(Debug, Clone)]
pub struct WaitingState {
    pub dependency: Dependency,
    pub state: ExecutionState,
}
