//! The async upload/download layer contract: the interface the execution engine dispatches
//! transfer layers through instead of a plain synchronous `forward`.

use fyusenet_common::error::Result;

use crate::state::StateToken;

/// State reported to an async layer's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    Success,
    Failed,
}

/// Completion callback an async layer invokes exactly once per dispatched transfer.
pub type AsyncCallback = Box<dyn FnMut(u64, AsyncState) + Send>;

/// A record of one downstream consumer of an async producer's output, as accumulated by
/// `add_consumer`.
#[derive(Debug, Clone, Copy)]
pub struct ConsumerRecord {
    pub consumer_number: i32,
    pub channel_offset: i32,
}

/// Implemented by upload and download layers, the two kinds the engine dispatches through the
/// async path rather than a plain synchronous `forward`.
pub trait AsyncLayer: Send {
    /// Whether this particular instance was built to run asynchronously (an upload/download
    /// layer may also be configured to run synchronously, in which case the engine calls
    /// `forward` directly and never touches this trait's other methods).
    fn is_async(&self) -> bool;

    /// Record a downstream consumer. Duplicate registration of the same `(consumer_number,
    /// channel_offset)` pair is a no-op.
    fn add_consumer(&mut self, consumer_number: i32, channel_offset: i32);

    /// Minimum layer number among registered consumers, or `None` if none are registered.
    fn first_consumer(&self) -> Option<i32>;

    /// Maximum layer number among registered consumers, or `None` if none are registered.
    fn last_consumer(&self) -> Option<i32>;

    /// Begin a transfer in a background worker. Returns `true` on successful dispatch, `false`
    /// if no transfer slot is currently free (the caller must re-try later). On completion the
    /// implementation must invoke `callback` exactly once, regardless of success or failure.
    fn async_forward(&mut self, sequence_no: u64, state: Option<&StateToken>, callback: AsyncCallback) -> Result<bool>;

    /// Synchronous fallback entry point, used when `is_async()` is `false`.
    fn forward(&mut self, sequence_no: u64, state: Option<&StateToken>) -> Result<()>;

    /// Upload producers only: atomically promote a newly populated texture set to be visible on
    /// this layer's output ports. No-op for download layers.
    fn swap_output_textures(&mut self, _sequence_no: u64) {}

    /// Upload producers only: allow this layer to accept a new transfer after its last consumer
    /// in `sequence_no` has been fenced. No-op for download layers.
    fn unlock(&mut self, _sequence_no: u64) {}
}
