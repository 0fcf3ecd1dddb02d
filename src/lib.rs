//! Thin network facade: builds a layer graph, connects it through the buffer manager, loads
//! parameters, then delegates `forward`/`finish`/`cleanup` to the execution engine. Grounded on
//! `fyusenet/base/neuralnetwork.h`.

pub mod builder;
pub mod network;

pub use builder::{LayerConnection, NetworkBuilder};
pub use network::NeuralNetwork;

pub use fyusenet_base::{
    AsyncCallback, AsyncLayer, BufferSpec, ComputeDevice, DType, DataBlob, DataOrder, Device, Interpolation, Layer,
    LayerBuilder, LayerCommon, LayerFlags, LayerKind, ParamType, ParameterProvider, StateToken, Usage,
};
pub use fyusenet_common::{EngineConfig, FyuseNetError, PerformanceTracker, Result};
pub use fyusenet_cpu::CpuBuffer;
pub use fyusenet_engine::{Callbacks, ExecState, SequenceOutcome};
pub use fyusenet_gpu::{context, GpuContext, GpuTextureSet};
