//! In-memory `GpuContext` test double. No real graphics driver is touched: textures are tracked
//! in a map for leak assertions and fences resolve (or don't) according to a configurable
//! simulated delay, which is what scenario S6 (fence timeout) exercises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use fyusenet_common::error::{FyuseNetError, Result};

use super::{FenceHandle, GpuContext, TextureDescriptor, TextureHandle};

/// How `MockGpuContext::wait_client_sync` resolves a fence.
#[derive(Debug, Clone, Copy)]
pub enum FenceBehavior {
    /// Fence is already satisfied; the wait returns immediately.
    Immediate,
    /// Fence resolves after `Duration` of simulated work; the wait sleeps that long (capped at
    /// the caller's timeout) and times out if the delay exceeds the requested timeout.
    Delay(Duration),
    /// Fence never resolves; every wait times out after sleeping the full requested timeout.
    Never,
}

pub struct MockGpuContext {
    next_handle: AtomicU64,
    next_fence: AtomicU64,
    live_textures: Mutex<HashMap<TextureHandle, TextureDescriptor>>,
    fence_behavior: Mutex<FenceBehavior>,
    current: std::sync::atomic::AtomicBool,
}

impl MockGpuContext {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            next_fence: AtomicU64::new(1),
            live_textures: Mutex::new(HashMap::new()),
            fence_behavior: Mutex::new(FenceBehavior::Immediate),
            current: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn set_fence_behavior(&self, behavior: FenceBehavior) {
        *self.fence_behavior.lock() = behavior;
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::Release);
    }

    /// Number of textures created but not yet destroyed. Used by `cleanup()`-time leak checks.
    pub fn live_texture_count(&self) -> usize {
        self.live_textures.lock().len()
    }
}

impl Default for MockGpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuContext for MockGpuContext {
    fn create_texture(&self, desc: TextureDescriptor) -> Result<TextureHandle> {
        let handle = TextureHandle(self.next_handle.fetch_add(1, Ordering::AcqRel));
        self.live_textures.lock().insert(handle, desc);
        Ok(handle)
    }

    fn destroy_texture(&self, handle: TextureHandle) {
        if self.live_textures.lock().remove(&handle).is_none() {
            log::warn!("MockGpuContext: double-destroy of texture {handle:?}");
        }
    }

    fn issue_fence(&self) -> FenceHandle {
        FenceHandle(self.next_fence.fetch_add(1, Ordering::AcqRel))
    }

    fn wait_client_sync(&self, _fence: FenceHandle, timeout: Duration) -> Result<()> {
        match *self.fence_behavior.lock() {
            FenceBehavior::Immediate => Ok(()),
            FenceBehavior::Delay(delay) => {
                if delay <= timeout {
                    std::thread::sleep(delay);
                    Ok(())
                } else {
                    std::thread::sleep(timeout);
                    Err(FyuseNetError::PipelineTimeout)
                }
            }
            FenceBehavior::Never => {
                std::thread::sleep(timeout);
                Err(FyuseNetError::PipelineTimeout)
            }
        }
    }

    fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc() -> TextureDescriptor {
        TextureDescriptor {
            width: 4,
            height: 4,
            dtype: fyusenet_base::DType::Float32,
            channels_per_pixel: 4,
        }
    }

    #[test]
    fn destroying_every_created_texture_leaves_no_leak() {
        let ctx = MockGpuContext::new();
        let a = ctx.create_texture(desc()).unwrap();
        let b = ctx.create_texture(desc()).unwrap();
        assert_eq!(ctx.live_texture_count(), 2);
        ctx.destroy_texture(a);
        ctx.destroy_texture(b);
        assert_eq!(ctx.live_texture_count(), 0);
    }

    #[test]
    fn never_resolving_fence_times_out() {
        let ctx = MockGpuContext::new();
        ctx.set_fence_behavior(FenceBehavior::Never);
        let fence = ctx.issue_fence();
        let result = ctx.wait_client_sync(fence, Duration::from_millis(10));
        assert!(matches!(result, Err(FyuseNetError::PipelineTimeout)));
    }

    #[test]
    fn delay_within_timeout_succeeds() {
        let ctx = MockGpuContext::new();
        ctx.set_fence_behavior(FenceBehavior::Delay(Duration::from_millis(1)));
        let fence = ctx.issue_fence();
        assert!(ctx.wait_client_sync(fence, Duration::from_millis(50)).is_ok());
    }
}
