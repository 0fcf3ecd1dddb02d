//! A GPU buffer as an ordered set of texture slices, interpreted according to its data order
//! (ShallowGPU: `ceil(C/4)` slices; DeepGPU/Sequence: exactly one slice).

use fyusenet_base::BufferShape;

use crate::context::{GpuContext, TextureDescriptor, TextureHandle};

/// An allocated (or wrapped) set of texture slices backing one `BufferShape`.
#[derive(Debug, Clone)]
pub struct GpuTextureSet {
    shape: BufferShape,
    slices: Vec<TextureHandle>,
    /// Shadow copies for multi-buffering (`multiplicity > 1`). Always permanently locked by the
    /// pool, never matched by the reuse-eligibility search.
    shadows: Vec<Vec<TextureHandle>>,
}

impl GpuTextureSet {
    /// Allocate a fresh set of slices for `shape` on `ctx`.
    pub fn allocate(ctx: &dyn GpuContext, shape: BufferShape) -> fyusenet_common::error::Result<Self> {
        let desc = descriptor_for(&shape);
        let mut slices = Vec::with_capacity(shape.num_slices() as usize);
        for _ in 0..shape.num_slices() {
            slices.push(ctx.create_texture(desc)?);
        }
        Ok(Self {
            shape,
            slices,
            shadows: Vec::new(),
        })
    }

    /// Wrap pre-existing handles instead of allocating (passthrough aliasing).
    pub fn wrap(shape: BufferShape, slices: Vec<TextureHandle>) -> Self {
        Self {
            shape,
            slices,
            shadows: Vec::new(),
        }
    }

    pub fn shape(&self) -> &BufferShape {
        &self.shape
    }

    pub fn slices(&self) -> &[TextureHandle] {
        &self.slices
    }

    pub fn descriptor(&self) -> TextureDescriptor {
        descriptor_for(&self.shape)
    }

    /// Allocate `count` additional shadow slice-sets for multi-buffering (`multiplicity - 1`
    /// calls to this with `count = 1` each, or one call with the full count).
    pub fn add_shadows(&mut self, ctx: &dyn GpuContext, count: u32) -> fyusenet_common::error::Result<()> {
        let desc = descriptor_for(&self.shape);
        for _ in 0..count {
            let mut shadow = Vec::with_capacity(self.shape.num_slices() as usize);
            for _ in 0..self.shape.num_slices() {
                shadow.push(ctx.create_texture(desc)?);
            }
            self.shadows.push(shadow);
        }
        Ok(())
    }

    pub fn shadow_count(&self) -> usize {
        self.shadows.len()
    }

    pub fn destroy(&self, ctx: &dyn GpuContext) {
        for &handle in &self.slices {
            ctx.destroy_texture(handle);
        }
        for shadow in &self.shadows {
            for &handle in shadow {
                ctx.destroy_texture(handle);
            }
        }
    }
}

fn descriptor_for(shape: &BufferShape) -> TextureDescriptor {
    TextureDescriptor {
        width: shape.width() + 2 * shape.padding(),
        height: shape.height() + 2 * shape.padding(),
        dtype: shape.dtype(),
        channels_per_pixel: 4,
    }
}
