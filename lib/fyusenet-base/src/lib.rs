//! Tensor shape/buffer specs, the compiled layer set, state tokens and the `Layer` trait shared
//! by every FyuseNet layer, regardless of which device it executes on.

pub mod async_layer;
pub mod compiled;
pub mod layer;
pub mod param;
pub mod shape;
pub mod spec;
pub mod state;

pub use async_layer::{AsyncCallback, AsyncLayer, AsyncState, ConsumerRecord};
pub use compiled::CompiledLayers;
pub use layer::{ComputeDevice, Layer, LayerBuilder, LayerCommon, LayerFlags, LayerKind};
pub use param::{DataBlob, ParamType, ParameterProvider};
pub use shape::{deep_tile_layout, BufferShape, DType, DataOrder, TileLayout};
pub use spec::{BufferSpec, Device, Interpolation, Usage};
pub use state::StateToken;
