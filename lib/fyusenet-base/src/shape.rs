//! Tensor shape and element-type descriptors. Pure value types: no allocation, no device
//! handles, nothing that needs a `Drop` impl beyond what `derive` gives us for free.

use fyusenet_common::error::{FyuseNetError, Result};

/// Element type stored in a tensor. Mirrors the original's `BufferSpec::dtype` enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Float32,
    Float16,
    Uint32,
    Int32,
    Uint16,
    Int16,
    Uint8,
    Int8,
}

impl DType {
    /// Size in bytes of a single element.
    pub const fn size(self) -> usize {
        match self {
            DType::Float32 | DType::Uint32 | DType::Int32 => 4,
            DType::Float16 | DType::Uint16 | DType::Int16 => 2,
            DType::Uint8 | DType::Int8 => 1,
        }
    }

    /// Whether this type is an integral format, used by the buffer manager's format-adoption
    /// special case (two ShallowGPU formats may only be unified if both are integral or both
    /// are floating-point).
    pub const fn is_integral(self) -> bool {
        !matches!(self, DType::Float32 | DType::Float16)
    }
}

/// General data layout of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataOrder {
    /// Plain channel-major host layout: channels stacked, each a contiguous (H, W) plane.
    Channelwise,
    /// GPU layout: channels packed 4-per-pixel across `ceil(C/4)` texture slices.
    ShallowGpu,
    /// GPU layout: all channels arrayed across tiles of a single texture slice.
    DeepGpu,
    /// GPU layout for sequence-style tensors: one slice of `ceil(W/C) x H`.
    Sequence,
}

/// Result of the deep tiling heuristic: how a channel count is arranged into a tile grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayout {
    pub tiles_x: u32,
    pub tiles_y: u32,
}

/// Compute the `(tilesX, tilesY)` pair for `channels` packed 4-per-pixel into a DeepGPU tile
/// grid: minimizes `|tilesX - tilesY| + tilesX*tilesY - ceil(C/4)` subject to
/// `tilesX*tilesY >= ceil(C/4)`, breaking ties toward squareness (smallest `|tilesX - tilesY|`,
/// then smallest `tilesX`).
pub fn deep_tile_layout(channels: u32) -> TileLayout {
    let quads = channels.div_ceil(4).max(1);
    let mut best: Option<(u32, u32, u32)> = None; // (score, tiles_x, tiles_y)
    for tiles_x in 1..=quads {
        let tiles_y = quads.div_ceil(tiles_x);
        let area = tiles_x * tiles_y;
        let score = tiles_x.abs_diff(tiles_y) + (area - quads);
        let better = match best {
            None => true,
            Some((best_score, best_x, best_y)) => {
                score < best_score
                    || (score == best_score && tiles_x.abs_diff(tiles_y) < best_x.abs_diff(best_y))
            }
        };
        if better {
            best = Some((score, tiles_x, tiles_y));
        }
    }
    let (_, tiles_x, tiles_y) = best.expect("quads is always >= 1, loop runs at least once");
    TileLayout { tiles_x, tiles_y }
}

/// Immutable descriptor of a tensor's spatial shape, element type and data order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferShape {
    width: u32,
    height: u32,
    channels: u32,
    padding: u32,
    dtype: DType,
    order: DataOrder,
    tile_width: u32,
    tile_height: u32,
}

impl BufferShape {
    /// Build a shape for a 2D channel tensor. `width`/`height` are the *net* (unpadded)
    /// spatial extents; `padding` is isotropic border padding applied on every side.
    pub fn new(height: u32, width: u32, channels: u32, padding: u32, dtype: DType, order: DataOrder) -> Self {
        let (tile_width, tile_height) = if order == DataOrder::DeepGpu {
            let layout = deep_tile_layout(channels);
            (layout.tiles_x, layout.tiles_y)
        } else {
            (0, 0)
        };
        Self {
            width,
            height,
            channels,
            padding,
            dtype,
            order,
            tile_width,
            tile_height,
        }
    }

    /// Build a shape for a sequence tensor: `embed_dim` channels, `seq_len` positions, packed
    /// 4 channels per pixel with no padding.
    pub fn new_sequence(embed_dim: u32, seq_len: u32, dtype: DType) -> Self {
        let width = seq_len.div_ceil(4).max(1);
        Self {
            width,
            height: embed_dim,
            channels: embed_dim,
            padding: 0,
            dtype,
            order: DataOrder::Sequence,
            tile_width: 0,
            tile_height: 0,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u32 {
        self.channels
    }

    pub fn padding(&self) -> u32 {
        self.padding
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn order(&self) -> DataOrder {
        self.order
    }

    pub fn tile_layout(&self) -> Option<TileLayout> {
        (self.order == DataOrder::DeepGpu).then_some(TileLayout {
            tiles_x: self.tile_width,
            tiles_y: self.tile_height,
        })
    }

    pub fn same_size(&self, other: &BufferShape) -> bool {
        self.width == other.width && self.height == other.height && self.channels == other.channels
    }

    pub fn same_type(&self, other: &BufferShape) -> bool {
        self.dtype == other.dtype
    }

    pub fn same_order(&self, other: &BufferShape) -> bool {
        self.order == other.order
    }

    /// Number of texture slices a GPU buffer with this shape needs.
    pub fn num_slices(&self) -> u32 {
        match self.order {
            DataOrder::ShallowGpu => self.channels.div_ceil(4).max(1),
            DataOrder::DeepGpu | DataOrder::Sequence => 1,
            DataOrder::Channelwise => self.channels.max(1),
        }
    }

    /// Byte size of the *whole* tensor under its native order.
    pub fn bytes(&self) -> usize {
        self.bytes_as(self.order)
    }

    /// Byte size of the tensor were it stored under `order` instead of its native order.
    pub fn bytes_as(&self, order: DataOrder) -> usize {
        let elem = self.dtype.size();
        match order {
            DataOrder::Channelwise => {
                let w = (self.width + 2 * self.padding) as usize;
                let h = (self.height + 2 * self.padding) as usize;
                w * h * self.channels as usize * elem
            }
            DataOrder::ShallowGpu => {
                let w = (self.width + 2 * self.padding) as usize;
                let h = (self.height + 2 * self.padding) as usize;
                let slices = self.channels.div_ceil(4).max(1) as usize;
                w * h * 4 * elem * slices
            }
            DataOrder::DeepGpu => {
                let layout = deep_tile_layout(self.channels);
                let w = (layout.tiles_x * (self.width + self.padding) + self.padding) as usize;
                let h = (layout.tiles_y * (self.height + self.padding) + self.padding) as usize;
                w * h * 4 * elem
            }
            DataOrder::Sequence => {
                let w = self.width as usize;
                let h = self.height as usize;
                w * h * 4 * elem
            }
        }
    }

    /// Reinterpret this shape as a different data order, recomputing derived tile dimensions.
    /// Fails if the target order cannot represent this shape's channel count (there is no such
    /// restriction today, but kept fallible so a future order-specific constraint has a home).
    pub fn as_order(&self, new_order: DataOrder) -> Result<BufferShape> {
        if new_order == self.order {
            return Ok(*self);
        }
        Ok(BufferShape::new(
            self.height,
            self.width,
            self.channels,
            self.padding,
            self.dtype,
            new_order,
        ))
    }

    pub fn check_compatible(&self, other: &BufferShape) -> Result<()> {
        if self.width != other.width || self.height != other.height {
            return Err(FyuseNetError::InvalidArgument(format!(
                "shape mismatch: {}x{} vs {}x{}",
                self.width, self.height, other.width, other.height
            )));
        }
        Ok(())
    }
}
