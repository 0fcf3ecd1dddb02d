//! The GPU backend plugin surface: the engine and buffer manager never call a graphics API
//! directly, they are generic over this trait, supplied by the embedding application. Mirrors
//! the teacher's backend-plugin traits (`BackendRenderInterface` and friends) in spirit, cut
//! down to the handful of operations this crate actually needs.

pub mod mock;

use std::time::Duration;

use fyusenet_common::error::Result;

/// Opaque handle to a single GPU texture slice, scoped to the `GpuContext` that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Opaque handle to a GPU fence (a point in the command stream a client-wait can block on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// Sized-format descriptor used by the pool's reuse-eligibility matching. Two textures are
/// format-compatible for reuse only if their descriptors are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub dtype: fyusenet_base::DType,
    /// `4` for ShallowGPU/DeepGPU/Sequence slices (RGBA-packed); callers pass the packed
    /// channel count per pixel this slice represents.
    pub channels_per_pixel: u32,
}

/// A GPU backend capable of allocating textures and fencing the command stream. Implemented by
/// the embedding application for its real graphics API; `mock::MockGpuContext` stands in for
/// the crate's own test suite.
pub trait GpuContext: Send + Sync {
    fn create_texture(&self, desc: TextureDescriptor) -> Result<TextureHandle>;
    fn destroy_texture(&self, handle: TextureHandle);

    /// Issue a fence at the current point in the command stream.
    fn issue_fence(&self) -> FenceHandle;

    /// Block until `fence` has been reached by the GPU, or `timeout` elapses. Implementations
    /// must return `Err(FyuseNetError::PipelineTimeout)` on timeout rather than blocking forever.
    fn wait_client_sync(&self, fence: FenceHandle, timeout: Duration) -> Result<()>;

    /// Debug assertion hook: whether this context is current on the calling thread. Used by
    /// `cleanup` preconditions; implementations outside of tests should always return `true`
    /// once properly made current, never silently proceed if `false`.
    fn is_current(&self) -> bool;
}
